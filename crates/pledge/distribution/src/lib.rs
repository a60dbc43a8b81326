//! Distribution engine: resolves finished goals into ledger postings.
//!
//! `distribute` is the only path that moves money out of an escrow. It
//! serializes per escrow, checkpoints stake accrual, computes the full
//! leg set in memory, and posts leg by leg under per-leg idempotency
//! keys. A leg failure leaves the escrow `Partial`; `reconcile` rebuilds
//! the same deterministic leg set and resumes from the first unposted
//! key. Settled escrows answer repeated calls with the recorded result.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use pledge_dispute::DisputeGate;
use pledge_escrow::{Escrow, EscrowStatus, EscrowStore, Settlement, SettlementOutcome};
use pledge_ledger::Ledger;
use pledge_stake::{Stake, StakeStatus, StakeStore};
use pledge_types::{
    DistributionPlan, EscrowId, GoalId, GoalOutcome, PlanType, StakingConfig, TransactionId,
};
use rust_decimal::Decimal;
use tracing::{info, warn};

pub mod error;
pub mod legs;
pub mod providers;

pub use error::DistributionError;
pub use legs::{build_legs, refund_legs, DistributionLeg, LegPurpose};
pub use providers::{InMemoryOutcomes, InMemoryPlanbook, OutcomeProvider, PlanProvider};

/// The caller-facing record of one settled goal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributionResult {
    pub goal_id: GoalId,
    pub escrow_id: EscrowId,
    pub outcome: SettlementOutcome,
    pub escrow_status: EscrowStatus,
    pub transaction_refs: Vec<TransactionId>,
    pub settled_at: DateTime<Utc>,
}

impl DistributionResult {
    fn from_settlement(escrow: &Escrow, settlement: &Settlement) -> Self {
        Self {
            goal_id: escrow.goal_id.clone(),
            escrow_id: escrow.id.clone(),
            outcome: settlement.outcome,
            escrow_status: escrow.status,
            transaction_refs: settlement.transaction_refs.clone(),
            settled_at: settlement.settled_at,
        }
    }
}

/// State left behind when a leg fails to post.
struct LegFailure {
    completed_refs: Vec<TransactionId>,
    completed_keys: Vec<String>,
    pending_keys: Vec<String>,
    source: DistributionError,
}

fn leg_failure(
    legs: &[DistributionLeg],
    index: usize,
    completed_refs: Vec<TransactionId>,
    completed_keys: Vec<String>,
    source: DistributionError,
) -> Box<LegFailure> {
    Box::new(LegFailure {
        completed_refs,
        completed_keys,
        pending_keys: legs[index..]
            .iter()
            .map(|l| l.idempotency_key.clone())
            .collect(),
        source,
    })
}

/// Orchestrates settlement of finished goals against the ledger.
///
/// Collaborators are injected; the engine owns no business state of its
/// own beyond the per-escrow serialization locks.
pub struct DistributionEngine {
    ledger: Arc<dyn Ledger>,
    stakes: Arc<dyn StakeStore>,
    escrows: Arc<dyn EscrowStore>,
    disputes: Arc<dyn DisputeGate>,
    plans: Arc<dyn PlanProvider>,
    outcomes: Arc<dyn OutcomeProvider>,
    config: StakingConfig,
    locks: Mutex<HashMap<EscrowId, Arc<Mutex<()>>>>,
}

impl DistributionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        stakes: Arc<dyn StakeStore>,
        escrows: Arc<dyn EscrowStore>,
        disputes: Arc<dyn DisputeGate>,
        plans: Arc<dyn PlanProvider>,
        outcomes: Arc<dyn OutcomeProvider>,
        config: StakingConfig,
    ) -> Self {
        Self {
            ledger,
            stakes,
            escrows,
            disputes,
            plans,
            outcomes,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Settle a finished goal. Idempotent: a settled escrow returns its
    /// recorded result unchanged; a partial one demands [`reconcile`].
    ///
    /// [`reconcile`]: DistributionEngine::reconcile
    pub fn distribute(
        &self,
        goal_id: &GoalId,
        now: DateTime<Utc>,
    ) -> Result<DistributionResult, DistributionError> {
        let escrow = self.escrows.for_goal(goal_id)?;
        let lock = self.serialization_lock(&escrow.id)?;
        let _guard = lock.lock().map_err(|_| DistributionError::LockPoisoned)?;

        // Re-read under the lock; a racing call may have settled it.
        let escrow = self.escrows.get(&escrow.id)?;
        if let Some(settlement) = &escrow.settlement {
            info!(goal = %goal_id, escrow = %escrow.id, "distribution already settled");
            return Ok(DistributionResult::from_settlement(&escrow, settlement));
        }
        if escrow.status == EscrowStatus::Partial {
            return Err(DistributionError::PartialDistributionPending(
                goal_id.clone(),
            ));
        }

        let outcome = self
            .outcomes
            .outcome(goal_id)?
            .ok_or_else(|| DistributionError::GoalNotFinished(goal_id.clone()))?;
        if self.disputes.has_open_dispute(goal_id)? {
            return Err(DistributionError::DisputeOpen(goal_id.clone()));
        }
        let plan = self
            .plans
            .plan_for(goal_id)?
            .ok_or_else(|| DistributionError::PlanMissing(goal_id.clone()))?;
        self.validate_plan(&plan, outcome)?;

        // Freeze accrual on every stake, then record the pool total on
        // the escrow before any leg is computed.
        let stakes = self.checkpoint_stakes(&escrow, now)?;
        let mut total_accrued = pledge_money::Money::zero(escrow.currency.clone());
        for stake in &stakes {
            total_accrued = total_accrued.add(&stake.accrued_amount)?;
        }
        let escrow = self.escrows.update(&escrow.id, &mut |e| {
            e.record_accrual(total_accrued.clone())?;
            e.begin_distribution()
        })?;

        let matching = self.plans.matching_policy(goal_id)?;
        let legs = build_legs(&escrow, &stakes, &plan, outcome, matching.as_ref())?;

        let refs = match self.post_legs(&legs) {
            Ok(refs) => refs,
            Err(failure) => return Err(self.record_partial(&escrow, *failure, now)?),
        };

        self.finalize(&escrow.id, outcome, refs, now)
    }

    /// Resume a partial distribution. Rebuilds the same leg set from the
    /// recorded accrual and posts only the legs whose keys are absent
    /// from the ledger.
    pub fn reconcile(
        &self,
        goal_id: &GoalId,
        now: DateTime<Utc>,
    ) -> Result<DistributionResult, DistributionError> {
        let escrow = self.escrows.for_goal(goal_id)?;
        let lock = self.serialization_lock(&escrow.id)?;
        let _guard = lock.lock().map_err(|_| DistributionError::LockPoisoned)?;

        let escrow = self.escrows.get(&escrow.id)?;
        if let Some(settlement) = &escrow.settlement {
            return Ok(DistributionResult::from_settlement(&escrow, settlement));
        }
        escrow.partial_state()?;

        if self.disputes.has_open_dispute(goal_id)? {
            return Err(DistributionError::DisputeOpen(goal_id.clone()));
        }
        let outcome = self
            .outcomes
            .outcome(goal_id)?
            .ok_or_else(|| DistributionError::GoalNotFinished(goal_id.clone()))?;
        let plan = self
            .plans
            .plan_for(goal_id)?
            .ok_or_else(|| DistributionError::PlanMissing(goal_id.clone()))?;
        self.validate_plan(&plan, outcome)?;

        // Stakes were checkpointed by the original attempt; reads here
        // return the frozen amounts, so the rebuilt legs are identical.
        let mut stakes = Vec::with_capacity(escrow.stakeholders.len());
        for stakeholder in &escrow.stakeholders {
            stakes.push(self.stakes.get(&stakeholder.stake_id)?);
        }
        let matching = self.plans.matching_policy(goal_id)?;
        let legs = build_legs(&escrow, &stakes, &plan, outcome, matching.as_ref())?;

        info!(
            goal = %goal_id,
            escrow = %escrow.id,
            legs = legs.len(),
            "reconciling partial distribution"
        );
        let refs = match self.post_legs(&legs) {
            Ok(refs) => refs,
            Err(failure) => return Err(self.record_partial(&escrow, *failure, now)?),
        };

        self.finalize(&escrow.id, outcome, refs, now)
    }

    /// Return every stakeholder's principal. Only reachable while the
    /// escrow is Held and nothing has accrued; stakes move to Cancelled.
    pub fn refund(
        &self,
        goal_id: &GoalId,
        now: DateTime<Utc>,
    ) -> Result<DistributionResult, DistributionError> {
        let escrow = self.escrows.for_goal(goal_id)?;
        let lock = self.serialization_lock(&escrow.id)?;
        let _guard = lock.lock().map_err(|_| DistributionError::LockPoisoned)?;

        let escrow = self.escrows.get(&escrow.id)?;
        if let Some(settlement) = &escrow.settlement {
            return Ok(DistributionResult::from_settlement(&escrow, settlement));
        }
        if escrow.status == EscrowStatus::Partial {
            return Err(DistributionError::PartialDistributionPending(
                goal_id.clone(),
            ));
        }

        // Probe the state machine before posting anything.
        {
            let mut probe = escrow.clone();
            probe.refund(Vec::new(), now)?;
        }
        // The escrow only records accrual at distribution time; interest
        // the stakes have earned lazily still forbids a refund.
        for stakeholder in &escrow.stakeholders {
            let stake = self.stakes.get(&stakeholder.stake_id)?;
            if stake.accrued_value(now)?.is_positive() {
                return Err(pledge_escrow::EscrowError::RefundAfterAccrual.into());
            }
        }

        let legs = refund_legs(&escrow);
        // Leg keys make a retry resume cleanly, so a failure here needs
        // no partial bookkeeping.
        let refs = self.post_legs(&legs).map_err(|failure| failure.source)?;

        let settled = self.escrows.update(&escrow.id, &mut |e| {
            e.refund(refs.clone(), now).map(|_| ())
        })?;
        for stakeholder in &escrow.stakeholders {
            self.stakes.update(&stakeholder.stake_id, &mut |s| {
                if s.status.can_transition(StakeStatus::Cancelled) {
                    s.transition(StakeStatus::Cancelled)
                } else {
                    Ok(())
                }
            })?;
        }

        info!(goal = %goal_id, escrow = %settled.id, "escrow refunded");
        self.release_lock(&settled.id);
        let settlement = settled.settlement.clone().unwrap_or(Settlement {
            outcome: SettlementOutcome::Refunded,
            transaction_refs: refs,
            settled_at: now,
        });
        Ok(DistributionResult::from_settlement(&settled, &settlement))
    }

    fn serialization_lock(&self, id: &EscrowId) -> Result<Arc<Mutex<()>>, DistributionError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| DistributionError::LockPoisoned)?;
        Ok(locks.entry(id.clone()).or_default().clone())
    }

    /// Drop the map entry once the escrow is settled. Safe while the
    /// guard is still held: a racer that minted a fresh lock re-reads
    /// the escrow and finds the recorded settlement.
    fn release_lock(&self, id: &EscrowId) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    /// Group payouts must honor the plan percentages; the other plan
    /// shapes ignore them.
    fn validate_plan(
        &self,
        plan: &DistributionPlan,
        outcome: GoalOutcome,
    ) -> Result<(), DistributionError> {
        if plan.plan_type == PlanType::Group && outcome == GoalOutcome::Completed {
            let total = plan.percent_total();
            if (total - Decimal::ONE_HUNDRED).abs() > self.config.plan_tolerance {
                return Err(DistributionError::InvalidPlan {
                    goal_id: plan.goal_id.clone(),
                    total,
                });
            }
        }
        Ok(())
    }

    /// Apply due liquidations and persist accrual up to `now` on every
    /// stake backing the escrow.
    fn checkpoint_stakes(
        &self,
        escrow: &Escrow,
        now: DateTime<Utc>,
    ) -> Result<Vec<Stake>, DistributionError> {
        let mut stakes = Vec::with_capacity(escrow.stakeholders.len());
        for stakeholder in &escrow.stakeholders {
            let stake = self.stakes.update(&stakeholder.stake_id, &mut |s| {
                s.apply_liquidation_if_due(now)?;
                s.checkpoint_accrual(now)
            })?;
            stakes.push(stake);
        }
        Ok(stakes)
    }

    /// Post legs in order, treating a key already present in the ledger
    /// as that leg's prior success.
    fn post_legs(&self, legs: &[DistributionLeg]) -> Result<Vec<TransactionId>, Box<LegFailure>> {
        let mut refs = Vec::with_capacity(legs.len());
        let mut completed_keys = Vec::with_capacity(legs.len());
        for (index, leg) in legs.iter().enumerate() {
            let existing = match self.ledger.lookup_key(&leg.idempotency_key) {
                Ok(existing) => existing,
                Err(e) => return Err(leg_failure(legs, index, refs, completed_keys, e.into())),
            };
            if let Some(transaction_id) = existing {
                refs.push(transaction_id);
                completed_keys.push(leg.idempotency_key.clone());
                continue;
            }
            match self.ledger.post(leg.draft.clone()) {
                Ok(record) => {
                    refs.push(record.transaction_id);
                    completed_keys.push(leg.idempotency_key.clone());
                }
                Err(e) => return Err(leg_failure(legs, index, refs, completed_keys, e.into())),
            }
        }
        Ok(refs)
    }

    /// Persist the partial state and shape the caller-facing error.
    fn record_partial(
        &self,
        escrow: &Escrow,
        failure: LegFailure,
        now: DateTime<Utc>,
    ) -> Result<DistributionError, DistributionError> {
        warn!(
            escrow = %escrow.id,
            completed = failure.completed_refs.len(),
            pending = failure.pending_keys.len(),
            error = %failure.source,
            "distribution leg failed"
        );
        self.escrows.update(&escrow.id, &mut |e| {
            e.mark_partial(
                failure.completed_refs.clone(),
                failure.completed_keys.clone(),
                failure.pending_keys.clone(),
                now,
            )
        })?;
        Ok(DistributionError::PartialDistribution {
            goal_id: escrow.goal_id.clone(),
            completed: failure.completed_refs.len(),
            pending: failure.pending_keys.len(),
            reason: failure.source.to_string(),
        })
    }

    /// Flip the escrow and its stakes to their terminal states once
    /// every leg is posted.
    fn finalize(
        &self,
        escrow_id: &EscrowId,
        outcome: GoalOutcome,
        refs: Vec<TransactionId>,
        now: DateTime<Utc>,
    ) -> Result<DistributionResult, DistributionError> {
        let settlement_outcome = match outcome {
            GoalOutcome::Completed => SettlementOutcome::Released,
            GoalOutcome::Failed => SettlementOutcome::Forfeited,
        };
        let settled = self.escrows.update(escrow_id, &mut |e| {
            e.complete(settlement_outcome, refs.clone(), now).map(|_| ())
        })?;

        let target = match outcome {
            GoalOutcome::Completed => StakeStatus::Completed,
            GoalOutcome::Failed => StakeStatus::Failed,
        };
        for stakeholder in &settled.stakeholders {
            // Liquidated stakes are already terminal and stay that way.
            self.stakes.update(&stakeholder.stake_id, &mut |s| {
                if s.status.can_transition(target) {
                    s.transition(target)
                } else {
                    Ok(())
                }
            })?;
        }

        info!(
            goal = %settled.goal_id,
            escrow = %settled.id,
            outcome = ?settlement_outcome,
            legs = refs.len(),
            "distribution settled"
        );
        self.release_lock(escrow_id);
        let settlement = settled.settlement.clone().unwrap_or(Settlement {
            outcome: settlement_outcome,
            transaction_refs: refs,
            settled_at: now,
        });
        Ok(DistributionResult::from_settlement(&settled, &settlement))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pledge_dispute::{DisputeDecision, DisputeRegistry};
    use pledge_escrow::{EscrowError, InMemoryEscrowStore, Stakeholder};
    use pledge_ledger::{InMemoryLedger, LedgerReader, LedgerWriter, TransactionDraft};
    use pledge_money::{Currency, Money};
    use pledge_stake::{InMemoryStakeStore, StakeRequest};
    use pledge_types::{
        AccountId, AccountType, AccrualMethod, AprModel, CharityId, CorporateAccountId,
        MatchingPolicy, UserId, WinnerShare,
    };
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        stakes: Arc<InMemoryStakeStore>,
        escrows: Arc<InMemoryEscrowStore>,
        disputes: Arc<DisputeRegistry>,
        plans: Arc<InMemoryPlanbook>,
        outcomes: Arc<InMemoryOutcomes>,
        engine: DistributionEngine,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let stakes = Arc::new(InMemoryStakeStore::new());
        let escrows = Arc::new(InMemoryEscrowStore::new());
        let disputes = Arc::new(DisputeRegistry::new());
        let plans = Arc::new(InMemoryPlanbook::new());
        let outcomes = Arc::new(InMemoryOutcomes::new());
        let engine = DistributionEngine::new(
            ledger.clone(),
            stakes.clone(),
            escrows.clone(),
            disputes.clone(),
            plans.clone(),
            outcomes.clone(),
            StakingConfig::default(),
        );
        Harness {
            ledger,
            stakes,
            escrows,
            disputes,
            plans,
            outcomes,
            engine,
        }
    }

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::usd())
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn stake_request(goal: &str, user: &str, principal: Decimal) -> StakeRequest {
        StakeRequest {
            goal_id: GoalId::new(goal),
            user_id: UserId::new(user),
            principal: usd(principal),
            apr_model: AprModel::Fixed(dec!(0.12)),
            accrual_method: AccrualMethod::Simple,
            fee_rate_on_stake: dec!(0),
            fee_rate_on_withdrawal: dec!(0.02),
            early_completion_bonus: None,
            charity_id: None,
            group_id: None,
            corporate_account_id: None,
        }
    }

    /// Create stakes, open the escrow, and post the funding transaction
    /// from the stakeholders' wallets.
    fn seed_goal(h: &Harness, goal: &str, requests: Vec<StakeRequest>) -> Escrow {
        let mut stakeholders = Vec::new();
        let mut funding =
            TransactionDraft::new(format!("fund:{goal}"), format!("fund escrow for {goal}"));
        for request in requests {
            let stake = Stake::create(request, t0(), 365).unwrap();
            stakeholders.push(Stakeholder {
                user_id: stake.user_id.clone(),
                stake_id: stake.id.clone(),
                principal: stake.principal.clone(),
            });
            funding = funding.debit(
                AccountId::wallet(&stake.user_id),
                AccountType::Liability,
                stake.principal.clone(),
            );
            h.stakes.insert(stake).unwrap();
        }
        let escrow = Escrow::open(GoalId::new(goal), stakeholders, t0()).unwrap();
        funding = funding.credit(
            AccountId::escrow(&escrow.id),
            AccountType::Liability,
            escrow.total_principal.clone(),
        );
        h.ledger.post(funding).unwrap();
        h.escrows.insert(escrow.clone()).unwrap();
        escrow
    }

    fn individual_plan(goal: &str) -> DistributionPlan {
        DistributionPlan {
            goal_id: GoalId::new(goal),
            plan_type: PlanType::Individual,
            charity_percent: Decimal::ZERO,
            app_percent: Decimal::ZERO,
            winners: vec![],
            charity_id: Some(CharityId::new("c1")),
        }
    }

    fn balance(h: &Harness, account: &AccountId) -> Decimal {
        h.ledger
            .account_balance(account, &Currency::usd())
            .unwrap()
            .amount
    }

    #[test]
    fn individual_success_empties_escrow_and_is_idempotent() {
        let h = harness();
        let escrow = seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);
        h.plans.register_plan(individual_plan("g1")).unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();

        let now = t0() + chrono::Duration::days(90);
        let first = h.engine.distribute(&GoalId::new("g1"), now).unwrap();
        assert_eq!(first.outcome, SettlementOutcome::Released);
        assert_eq!(first.escrow_status, EscrowStatus::Released);

        // ~90 days of 12% simple interest on $100 rounds to $2.96; the
        // 2% withdrawal fee on it rounds to $0.06.
        assert_eq!(balance(&h, &AccountId::escrow(&escrow.id)), dec!(0));
        assert_eq!(
            balance(&h, &AccountId::wallet(&UserId::new("u1"))),
            dec!(2.90)
        );
        assert_eq!(balance(&h, &AccountId::platform_revenue()), dec!(0.06));

        // Replays return the recorded result without posting again.
        let count = h.ledger.record_count().unwrap();
        let second = h.engine.distribute(&GoalId::new("g1"), now).unwrap();
        assert_eq!(second.transaction_refs, first.transaction_refs);
        assert_eq!(h.ledger.record_count().unwrap(), count);

        h.ledger.verify_balances().unwrap();
        h.ledger.verify_chain().unwrap();
    }

    #[test]
    fn open_dispute_blocks_until_decided() {
        let h = harness();
        seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);
        h.plans.register_plan(individual_plan("g1")).unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();
        let dispute = h
            .disputes
            .file(GoalId::new("g1"), UserId::new("u1"), "contested", vec![])
            .unwrap();

        assert!(matches!(
            h.engine.distribute(&GoalId::new("g1"), t0()),
            Err(DistributionError::DisputeOpen(_))
        ));

        h.disputes
            .decide(&dispute.id, DisputeDecision::Rejected, UserId::new("admin"))
            .unwrap();
        assert!(h.engine.distribute(&GoalId::new("g1"), t0()).is_ok());
    }

    #[test]
    fn missing_outcome_or_plan_is_an_error() {
        let h = harness();
        seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);

        assert!(matches!(
            h.engine.distribute(&GoalId::new("g1"), t0()),
            Err(DistributionError::GoalNotFinished(_))
        ));

        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();
        assert!(matches!(
            h.engine.distribute(&GoalId::new("g1"), t0()),
            Err(DistributionError::PlanMissing(_))
        ));
    }

    #[test]
    fn group_forfeiture_splits_thirty_twenty_fifty() {
        let h = harness();
        seed_goal(
            &h,
            "g1",
            vec![
                stake_request("g1", "u1", dec!(250)),
                stake_request("g1", "u2", dec!(250)),
            ],
        );
        h.plans
            .register_plan(DistributionPlan {
                goal_id: GoalId::new("g1"),
                plan_type: PlanType::Group,
                charity_percent: Decimal::ZERO,
                app_percent: Decimal::ZERO,
                winners: vec![WinnerShare {
                    user_id: UserId::new("u2"),
                    share_percent: dec!(100),
                }],
                charity_id: Some(CharityId::new("c1")),
            })
            .unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Failed)
            .unwrap();

        // Settle at t0: no accrual, no creation fees, so $500 splits
        // exactly 150 / 100 / 250.
        let result = h.engine.distribute(&GoalId::new("g1"), t0()).unwrap();
        assert_eq!(result.outcome, SettlementOutcome::Forfeited);

        assert_eq!(
            balance(&h, &AccountId::charity(&CharityId::new("c1"))),
            dec!(150)
        );
        assert_eq!(balance(&h, &AccountId::platform_revenue()), dec!(100));
        // u2 staked 250 and won the whole 250 pool back.
        assert_eq!(balance(&h, &AccountId::wallet(&UserId::new("u2"))), dec!(0));
        assert_eq!(
            balance(&h, &AccountId::wallet(&UserId::new("u1"))),
            dec!(-250)
        );
        h.ledger.verify_balances().unwrap();
    }

    #[test]
    fn corporate_match_posts_from_the_corporate_account() {
        let h = harness();
        let mut request = stake_request("g1", "u1", dec!(200));
        request.corporate_account_id = Some(CorporateAccountId::new("acme"));
        seed_goal(&h, "g1", vec![request]);

        let mut plan = individual_plan("g1");
        plan.plan_type = PlanType::Corporate;
        h.plans.register_plan(plan).unwrap();
        h.plans
            .register_matching_policy(
                GoalId::new("g1"),
                MatchingPolicy {
                    corporate_account: CorporateAccountId::new("acme"),
                    match_percent: dec!(0.5),
                    max_match: usd(dec!(50)),
                    match_on_success: true,
                    match_on_failure: false,
                },
            )
            .unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();

        h.engine.distribute(&GoalId::new("g1"), t0()).unwrap();

        // min(200 × 0.5, 50) left the corporate account for the wallet.
        assert_eq!(
            balance(&h, &AccountId::corporate(&CorporateAccountId::new("acme"))),
            dec!(-50)
        );
        assert_eq!(
            balance(&h, &AccountId::wallet(&UserId::new("u1"))),
            dec!(50)
        );
    }

    #[test]
    fn partial_distribution_reconciles_without_double_posting() {
        let h = harness();
        let mut request = stake_request("g1", "u1", dec!(100));
        request.fee_rate_on_stake = dec!(0.01);
        let escrow = seed_goal(&h, "g1", vec![request]);
        h.plans.register_plan(individual_plan("g1")).unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Failed)
            .unwrap();

        let charity = AccountId::charity(&CharityId::new("c1"));
        h.ledger.suspend_account(charity.clone()).unwrap();

        let err = h.engine.distribute(&GoalId::new("g1"), t0()).unwrap_err();
        assert!(matches!(
            err,
            DistributionError::PartialDistribution { .. }
        ));
        assert_eq!(
            h.escrows.get(&escrow.id).unwrap().status,
            EscrowStatus::Partial
        );

        // A plain retry is refused; reconciliation is the only way out.
        assert!(matches!(
            h.engine.distribute(&GoalId::new("g1"), t0()),
            Err(DistributionError::PartialDistributionPending(_))
        ));

        h.ledger.restore_account(&charity).unwrap();
        let result = h.engine.reconcile(&GoalId::new("g1"), t0()).unwrap();
        assert_eq!(result.outcome, SettlementOutcome::Forfeited);

        // Net 99 split 49.50 / 49.50, plus the $1 creation fee.
        assert_eq!(balance(&h, &charity), dec!(49.50));
        assert_eq!(balance(&h, &AccountId::platform_revenue()), dec!(50.50));
        assert_eq!(balance(&h, &AccountId::escrow(&escrow.id)), dec!(0));
        h.ledger.verify_balances().unwrap();

        // Reconciling a settled escrow echoes the result.
        let again = h.engine.reconcile(&GoalId::new("g1"), t0()).unwrap();
        assert_eq!(again.transaction_refs, result.transaction_refs);
    }

    #[test]
    fn refund_returns_principal_and_cancels_stakes() {
        let h = harness();
        let escrow = seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);

        let result = h.engine.refund(&GoalId::new("g1"), t0()).unwrap();
        assert_eq!(result.outcome, SettlementOutcome::Refunded);
        assert_eq!(balance(&h, &AccountId::wallet(&UserId::new("u1"))), dec!(0));
        assert_eq!(balance(&h, &AccountId::escrow(&escrow.id)), dec!(0));

        let stake_id = h.escrows.get(&escrow.id).unwrap().stakeholders[0]
            .stake_id
            .clone();
        assert_eq!(
            h.stakes.get(&stake_id).unwrap().status,
            StakeStatus::Cancelled
        );

        // Refund is idempotent too.
        let again = h.engine.refund(&GoalId::new("g1"), t0()).unwrap();
        assert_eq!(again.transaction_refs, result.transaction_refs);
    }

    #[test]
    fn refund_is_refused_after_settlement_began() {
        let h = harness();
        seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);
        h.plans.register_plan(individual_plan("g1")).unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();

        // Accrual is recorded during distribution, so a later refund of
        // the settled escrow just echoes the settlement.
        let now = t0() + chrono::Duration::days(30);
        let settled = h.engine.distribute(&GoalId::new("g1"), now).unwrap();
        let refund = h.engine.refund(&GoalId::new("g1"), now).unwrap();
        assert_eq!(refund.outcome, SettlementOutcome::Released);
        assert_eq!(refund.transaction_refs, settled.transaction_refs);
    }

    #[test]
    fn group_success_respects_plan_tolerance() {
        let h = harness();
        seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);
        h.plans
            .register_plan(DistributionPlan {
                goal_id: GoalId::new("g1"),
                plan_type: PlanType::Group,
                charity_percent: dec!(10),
                app_percent: dec!(10),
                winners: vec![WinnerShare {
                    user_id: UserId::new("u1"),
                    share_percent: dec!(70),
                }],
                charity_id: Some(CharityId::new("c1")),
            })
            .unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();

        // 10 + 10 + 70 = 90 is far outside the ±0.01 point tolerance.
        assert!(matches!(
            h.engine.distribute(&GoalId::new("g1"), t0()),
            Err(DistributionError::InvalidPlan { .. })
        ));
    }

    #[test]
    fn liquidated_stake_settles_with_deadline_accrual() {
        let h = harness();
        let escrow = seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);
        h.plans.register_plan(individual_plan("g1")).unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();

        // Distribution long after the liquidation horizon freezes
        // accrual at the 365-day deadline, not at the call instant.
        let now = t0() + chrono::Duration::days(500);
        h.engine.distribute(&GoalId::new("g1"), now).unwrap();

        let stake_id = h.escrows.get(&escrow.id).unwrap().stakeholders[0]
            .stake_id
            .clone();
        let stake = h.stakes.get(&stake_id).unwrap();
        assert_eq!(stake.status, StakeStatus::Liquidated);

        let deadline_accrued = pledge_math::simple_interest(
            &usd(dec!(100)),
            dec!(0.12),
            t0(),
            t0() + chrono::Duration::days(365),
        )
        .unwrap();
        assert_eq!(stake.accrued_amount, deadline_accrued);
        assert_eq!(balance(&h, &AccountId::escrow(&escrow.id)), dec!(0));
    }

    #[test]
    fn settled_escrows_leave_no_serialization_lock() {
        let h = harness();
        seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);
        seed_goal(&h, "g2", vec![stake_request("g2", "u2", dec!(100))]);
        h.plans.register_plan(individual_plan("g1")).unwrap();
        h.outcomes
            .record(GoalId::new("g1"), GoalOutcome::Completed)
            .unwrap();

        h.engine.distribute(&GoalId::new("g1"), t0()).unwrap();
        assert_eq!(h.engine.lock_count(), 0);

        h.engine.refund(&GoalId::new("g2"), t0()).unwrap();
        assert_eq!(h.engine.lock_count(), 0);
    }

    #[test]
    fn refund_is_refused_once_interest_has_accrued() {
        let h = harness();
        seed_goal(&h, "g1", vec![stake_request("g1", "u1", dec!(100))]);

        // Nothing is recorded on the escrow yet, but 30 days of lazy
        // stake accrual already rule the cancellation path out.
        assert!(matches!(
            h.engine
                .refund(&GoalId::new("g1"), t0() + chrono::Duration::days(30)),
            Err(DistributionError::Escrow(EscrowError::RefundAfterAccrual))
        ));
    }
}
