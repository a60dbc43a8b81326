//! Stake entity and status machine.
//!
//! A stake is one user's monetary commitment against a goal. Interest is
//! computed lazily on read while the status allows accrual, and a stake
//! that has been Active past the liquidation horizon liquidates
//! automatically the next time it is read — there is no timer.

#![deny(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use pledge_math::MathError;
use pledge_money::{Money, MoneyError};
use pledge_types::{
    AccrualMethod, AprModel, CharityId, CorporateAccountId, GoalId, GroupId, StakeId, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub mod store;

pub use store::{InMemoryStakeStore, StakeStore};

/// Errors raised by stake construction and transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StakeError {
    #[error("principal {amount} must be positive")]
    InvalidPrincipal { amount: Decimal },

    #[error("fee rate {rate} for {field} is outside [0, 1]")]
    InvalidFeeRate { field: &'static str, rate: Decimal },

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: StakeStatus, to: StakeStatus },

    #[error("stake {0} not found")]
    NotFound(StakeId),

    #[error("stake store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Math(#[from] MathError),

    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Lifecycle status of a stake.
///
/// Accrual happens only in `Active`. Everything except `Active` and
/// `Paused` is terminal: no further transitions, no further accrual.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StakeStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Disputed,
    Liquidated,
}

impl StakeStatus {
    pub fn can_accrue(&self) -> bool {
        matches!(self, StakeStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StakeStatus::Active | StakeStatus::Paused)
    }

    /// Whether the status machine permits `self -> to`.
    pub fn can_transition(&self, to: StakeStatus) -> bool {
        use StakeStatus::*;
        match (self, to) {
            (Active, Paused | Completed | Failed | Cancelled | Disputed | Liquidated) => true,
            (Paused, Active | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Inputs for creating a stake.
#[derive(Clone, Debug)]
pub struct StakeRequest {
    pub goal_id: GoalId,
    pub user_id: UserId,
    pub principal: Money,
    pub apr_model: AprModel,
    pub accrual_method: AccrualMethod,
    pub fee_rate_on_stake: Decimal,
    pub fee_rate_on_withdrawal: Decimal,
    pub early_completion_bonus: Option<Money>,
    pub charity_id: Option<CharityId>,
    pub group_id: Option<GroupId>,
    pub corporate_account_id: Option<CorporateAccountId>,
}

/// One user's commitment against a goal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Stake {
    pub id: StakeId,
    pub goal_id: GoalId,
    pub user_id: UserId,
    pub principal: Money,
    pub start_at: DateTime<Utc>,
    pub apr_model: AprModel,
    pub accrual_method: AccrualMethod,
    pub accrued_amount: Money,
    pub fee_rate_on_stake: Decimal,
    pub fee_rate_on_withdrawal: Decimal,
    pub last_accrual_at: DateTime<Utc>,
    pub status: StakeStatus,
    pub early_completion_bonus: Option<Money>,
    pub charity_id: Option<CharityId>,
    pub group_id: Option<GroupId>,
    pub corporate_account_id: Option<CorporateAccountId>,
    /// Days of Active life before automatic liquidation.
    pub liquidation_after_days: i64,
}

impl Stake {
    /// Validate the request and create an Active stake.
    pub fn create(
        request: StakeRequest,
        now: DateTime<Utc>,
        liquidation_after_days: i64,
    ) -> Result<Self, StakeError> {
        if !request.principal.is_positive() {
            return Err(StakeError::InvalidPrincipal {
                amount: request.principal.amount,
            });
        }
        for (field, rate) in [
            ("fee_rate_on_stake", request.fee_rate_on_stake),
            ("fee_rate_on_withdrawal", request.fee_rate_on_withdrawal),
        ] {
            if rate < Decimal::ZERO || rate > Decimal::ONE {
                return Err(StakeError::InvalidFeeRate { field, rate });
            }
        }

        let currency = request.principal.currency.clone();
        let stake = Self {
            id: StakeId::generate(),
            goal_id: request.goal_id,
            user_id: request.user_id,
            principal: request.principal,
            start_at: now,
            apr_model: request.apr_model,
            accrual_method: request.accrual_method,
            accrued_amount: Money::zero(currency),
            fee_rate_on_stake: request.fee_rate_on_stake,
            fee_rate_on_withdrawal: request.fee_rate_on_withdrawal,
            last_accrual_at: now,
            status: StakeStatus::Active,
            early_completion_bonus: request.early_completion_bonus,
            charity_id: request.charity_id,
            group_id: request.group_id,
            corporate_account_id: request.corporate_account_id,
            liquidation_after_days,
        };
        info!(stake = %stake.id, goal = %stake.goal_id, principal = %stake.principal, "created stake");
        Ok(stake)
    }

    /// Instant after which an Active stake liquidates.
    pub fn liquidation_deadline(&self) -> DateTime<Utc> {
        self.start_at + Duration::days(self.liquidation_after_days)
    }

    pub fn liquidation_due(&self, as_of: DateTime<Utc>) -> bool {
        self.status == StakeStatus::Active && as_of > self.liquidation_deadline()
    }

    /// Accrued interest as of `as_of`, computed lazily.
    ///
    /// Returns the stored amount unchanged when the status forbids
    /// accrual; otherwise adds the window since `last_accrual_at`, capped
    /// at the liquidation deadline.
    pub fn accrued_value(&self, as_of: DateTime<Utc>) -> Result<Money, StakeError> {
        if !self.status.can_accrue() {
            return Ok(self.accrued_amount.clone());
        }
        let window_end = as_of.min(self.liquidation_deadline());
        let accrued = pledge_math::accrue(
            &self.accrued_amount,
            &self.principal,
            self.apr_model.annual_rate(),
            self.accrual_method,
            self.last_accrual_at,
            window_end,
        )?;
        Ok(accrued)
    }

    /// Persist the lazily computed accrual and advance `last_accrual_at`.
    pub fn checkpoint_accrual(&mut self, as_of: DateTime<Utc>) -> Result<(), StakeError> {
        if !self.status.can_accrue() {
            return Ok(());
        }
        let window_end = as_of.min(self.liquidation_deadline());
        self.accrued_amount = self.accrued_value(as_of)?;
        if window_end > self.last_accrual_at {
            self.last_accrual_at = window_end;
        }
        Ok(())
    }

    /// Apply the status machine.
    pub fn transition(&mut self, to: StakeStatus) -> Result<(), StakeError> {
        if !self.status.can_transition(to) {
            return Err(StakeError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        debug!(stake = %self.id, from = ?self.status, to = ?to, "stake transition");
        self.status = to;
        Ok(())
    }

    /// Evaluate the automatic time-driven liquidation on a read path.
    /// Accrual up to the deadline is checkpointed before the flip so the
    /// accrued amount freezes at the right value.
    pub fn apply_liquidation_if_due(&mut self, as_of: DateTime<Utc>) -> Result<bool, StakeError> {
        if !self.liquidation_due(as_of) {
            return Ok(false);
        }
        self.checkpoint_accrual(self.liquidation_deadline())?;
        self.transition(StakeStatus::Liquidated)?;
        info!(stake = %self.id, "stake liquidated after exceeding active horizon");
        Ok(true)
    }
}
