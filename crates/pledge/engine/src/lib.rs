//! Embedded facade over the staking, escrow, and settlement engine.
//!
//! [`StakingEngine`] wires the in-memory ledger, stores, dispute
//! registry, and distribution engine together behind one surface:
//! create stakes, open escrows, file and decide disputes, settle
//! finished goals, and query balances. Configuration is passed in by
//! the caller; nothing is read from globals.

#![deny(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pledge_dispute::{Dispute, DisputeDecision, DisputeError, DisputeRegistry};
use pledge_distribution::{
    DistributionEngine, DistributionError, DistributionResult, InMemoryOutcomes, InMemoryPlanbook,
};
use pledge_escrow::{Escrow, EscrowError, EscrowStore, InMemoryEscrowStore, Stakeholder};
use pledge_ledger::{InMemoryLedger, LedgerError, LedgerReader, LedgerWriter, TransactionDraft};
use pledge_money::{Currency, Money, MoneyError};
use pledge_stake::{InMemoryStakeStore, Stake, StakeError, StakeRequest, StakeStore};
use pledge_types::{
    AccountId, AccountType, AccrualMethod, AprModel, ConfigError, DisputeId, DistributionPlan,
    GoalId, GoalOutcome, MatchingPolicy, StakeId, StakingConfig, UserId,
};
use thiserror::Error;
use tracing::info;

/// Umbrella error for the facade surface.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no active stakes recorded for goal {0}")]
    NoStakesForGoal(GoalId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error(transparent)]
    Stake(#[from] StakeError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Dispute(#[from] DisputeError),

    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

/// The assembled engine with in-memory infrastructure.
pub struct StakingEngine {
    config: StakingConfig,
    ledger: Arc<InMemoryLedger>,
    stakes: Arc<InMemoryStakeStore>,
    escrows: Arc<InMemoryEscrowStore>,
    disputes: Arc<DisputeRegistry>,
    plans: Arc<InMemoryPlanbook>,
    outcomes: Arc<InMemoryOutcomes>,
    distribution: DistributionEngine,
}

impl StakingEngine {
    /// Assemble an engine over fresh in-memory infrastructure.
    pub fn in_memory(config: StakingConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let ledger = Arc::new(InMemoryLedger::new());
        let stakes = Arc::new(InMemoryStakeStore::new());
        let escrows = Arc::new(InMemoryEscrowStore::new());
        let disputes = Arc::new(DisputeRegistry::new());
        let plans = Arc::new(InMemoryPlanbook::new());
        let outcomes = Arc::new(InMemoryOutcomes::new());
        let distribution = DistributionEngine::new(
            ledger.clone(),
            stakes.clone(),
            escrows.clone(),
            disputes.clone(),
            plans.clone(),
            outcomes.clone(),
            config.clone(),
        );
        info!(
            liquidation_after_days = config.liquidation_after_days,
            "assembled staking engine"
        );
        Ok(Self {
            config,
            ledger,
            stakes,
            escrows,
            disputes,
            plans,
            outcomes,
            distribution,
        })
    }

    pub fn config(&self) -> &StakingConfig {
        &self.config
    }

    /// The backing ledger, for balance audits and operator actions.
    pub fn ledger(&self) -> &InMemoryLedger {
        &self.ledger
    }

    /// A stake request pre-filled with the configured defaults.
    pub fn default_stake_request(
        &self,
        goal_id: GoalId,
        user_id: UserId,
        principal: Money,
    ) -> StakeRequest {
        StakeRequest {
            goal_id,
            user_id,
            principal,
            apr_model: AprModel::Fixed(self.config.default_apr),
            accrual_method: AccrualMethod::Simple,
            fee_rate_on_stake: self.config.default_fee_rate_on_stake,
            fee_rate_on_withdrawal: self.config.default_fee_rate_on_withdrawal,
            early_completion_bonus: None,
            charity_id: None,
            group_id: None,
            corporate_account_id: None,
        }
    }

    pub fn create_stake(
        &self,
        request: StakeRequest,
        now: DateTime<Utc>,
    ) -> Result<Stake, EngineError> {
        let stake = Stake::create(request, now, self.config.liquidation_after_days)?;
        let creation_fee =
            pledge_math::stake_creation_fee(&stake.principal, stake.fee_rate_on_stake)
                .map_err(StakeError::from)?;
        info!(
            stake = %stake.id,
            goal = %stake.goal_id,
            creation_fee = %creation_fee,
            "stake created"
        );
        self.stakes.insert(stake.clone())?;
        Ok(stake)
    }

    pub fn stake(&self, id: &StakeId) -> Result<Stake, EngineError> {
        Ok(self.stakes.get(id)?)
    }

    /// Principal plus accrued interest as of `now`. Reading past the
    /// liquidation horizon liquidates the stake first.
    pub fn current_value(
        &self,
        stake_id: &StakeId,
        now: DateTime<Utc>,
    ) -> Result<Money, EngineError> {
        let stake = self.stakes.update(stake_id, &mut |s| {
            s.apply_liquidation_if_due(now).map(|_| ())
        })?;
        let accrued = stake.accrued_value(now)?;
        Ok(stake.principal.add(&accrued)?)
    }

    /// Open the escrow for a goal over its active stakes and post the
    /// funding transaction from the stakeholders' wallets.
    pub fn open_escrow(&self, goal_id: &GoalId, now: DateTime<Utc>) -> Result<Escrow, EngineError> {
        let stakes = self.stakes.for_goal(goal_id)?;
        let active: Vec<&Stake> = stakes.iter().filter(|s| s.status.can_accrue()).collect();
        if active.is_empty() {
            return Err(EngineError::NoStakesForGoal(goal_id.clone()));
        }

        let stakeholders: Vec<Stakeholder> = active
            .iter()
            .map(|stake| Stakeholder {
                user_id: stake.user_id.clone(),
                stake_id: stake.id.clone(),
                principal: stake.principal.clone(),
            })
            .collect();
        let escrow = Escrow::open(goal_id.clone(), stakeholders, now)?;

        let mut funding = TransactionDraft::new(
            format!("fund:{}", escrow.id),
            format!("fund escrow for goal {goal_id}"),
        );
        for stake in &active {
            funding = funding.debit(
                AccountId::wallet(&stake.user_id),
                AccountType::Liability,
                stake.principal.clone(),
            );
        }
        funding = funding.credit(
            AccountId::escrow(&escrow.id),
            AccountType::Liability,
            escrow.total_principal.clone(),
        );
        self.ledger.post(funding)?;
        self.escrows.insert(escrow.clone())?;
        Ok(escrow)
    }

    pub fn escrow_for_goal(&self, goal_id: &GoalId) -> Result<Escrow, EngineError> {
        Ok(self.escrows.for_goal(goal_id)?)
    }

    pub fn file_dispute(
        &self,
        goal_id: GoalId,
        filed_by: UserId,
        reason: impl Into<String>,
        evidence_refs: Vec<String>,
    ) -> Result<Dispute, EngineError> {
        Ok(self.disputes.file(goal_id, filed_by, reason, evidence_refs)?)
    }

    pub fn resolve_dispute(
        &self,
        id: &DisputeId,
        decision: DisputeDecision,
        decided_by: UserId,
    ) -> Result<Dispute, EngineError> {
        Ok(self.disputes.decide(id, decision, decided_by)?)
    }

    pub fn register_plan(&self, plan: DistributionPlan) -> Result<(), EngineError> {
        Ok(self.plans.register_plan(plan)?)
    }

    pub fn register_matching_policy(
        &self,
        goal_id: GoalId,
        policy: MatchingPolicy,
    ) -> Result<(), EngineError> {
        Ok(self.plans.register_matching_policy(goal_id, policy)?)
    }

    pub fn record_goal_outcome(
        &self,
        goal_id: GoalId,
        outcome: GoalOutcome,
    ) -> Result<(), EngineError> {
        Ok(self.outcomes.record(goal_id, outcome)?)
    }

    pub fn distribute(
        &self,
        goal_id: &GoalId,
        now: DateTime<Utc>,
    ) -> Result<DistributionResult, EngineError> {
        Ok(self.distribution.distribute(goal_id, now)?)
    }

    pub fn reconcile(
        &self,
        goal_id: &GoalId,
        now: DateTime<Utc>,
    ) -> Result<DistributionResult, EngineError> {
        Ok(self.distribution.reconcile(goal_id, now)?)
    }

    pub fn refund(
        &self,
        goal_id: &GoalId,
        now: DateTime<Utc>,
    ) -> Result<DistributionResult, EngineError> {
        Ok(self.distribution.refund(goal_id, now)?)
    }

    pub fn ledger_balance(
        &self,
        account: &AccountId,
        currency: &Currency,
    ) -> Result<Money, EngineError> {
        Ok(self.ledger.account_balance(account, currency)?)
    }
}

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::{EngineError, StakingEngine};
    pub use pledge_dispute::DisputeDecision;
    pub use pledge_distribution::DistributionResult;
    pub use pledge_escrow::{EscrowStatus, SettlementOutcome};
    pub use pledge_money::{Currency, Money};
    pub use pledge_stake::{StakeRequest, StakeStatus};
    pub use pledge_types::{
        AccountId, DistributionPlan, GoalId, GoalOutcome, MatchingPolicy, PlanType, StakingConfig,
        UserId, WinnerShare,
    };
}
