//! Escrow: the held pool of principal for a single goal.
//!
//! An escrow aggregates the stakeholders' principal at construction (the
//! total is derived, never set), tracks accrual recorded against the
//! pool, and owns the terminal settlement state machine. Terminal
//! operations are idempotent per escrow: completing a settled escrow
//! returns the previously recorded settlement instead of acting twice —
//! the single most important correctness property of the subsystem.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use pledge_money::{Currency, Money, MoneyError};
use pledge_types::{EscrowId, GoalId, StakeId, TransactionId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub mod store;

pub use store::{EscrowStore, InMemoryEscrowStore};

/// Errors raised by escrow construction and transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EscrowError {
    #[error("escrow requires at least one stakeholder")]
    EmptyStakeholders,

    #[error("stakeholder {user} principal {amount} must be positive")]
    InvalidStakeholderPrincipal { user: UserId, amount: Decimal },

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: EscrowStatus,
        to: EscrowStatus,
    },

    #[error("refund is only possible before any accrual")]
    RefundAfterAccrual,

    #[error("accrued amount may not decrease (recorded {recorded}, new {new})")]
    AccrualNotMonotone { recorded: Decimal, new: Decimal },

    #[error("escrow is not in a partial state")]
    NotPartial,

    #[error("escrow {0} not found")]
    NotFound(EscrowId),

    #[error("no escrow recorded for goal {0}")]
    NotFoundForGoal(GoalId),

    #[error("escrow store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Settlement state of an escrow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    Held,
    PendingDistribution,
    Released,
    Forfeited,
    Refunded,
    /// Some settlement legs posted and some did not. Durable; leaves only
    /// via an explicit reconciliation, never a silent retry.
    Partial,
}

impl EscrowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Released | EscrowStatus::Forfeited | EscrowStatus::Refunded
        )
    }

    pub fn can_transition(&self, to: EscrowStatus) -> bool {
        use EscrowStatus::*;
        match (self, to) {
            (Held, PendingDistribution | Refunded) => true,
            (PendingDistribution, Released | Forfeited | Partial) => true,
            (Partial, Released | Forfeited) => true,
            _ => false,
        }
    }
}

/// One stakeholder's contribution to the pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stakeholder {
    pub user_id: UserId,
    pub stake_id: StakeId,
    pub principal: Money,
}

/// How the escrow finally resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    Released,
    Forfeited,
    Refunded,
}

/// The durable record of a completed settlement. Returned unchanged on
/// repeated terminal calls so callers can recognize duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub outcome: SettlementOutcome,
    pub transaction_refs: Vec<TransactionId>,
    pub settled_at: DateTime<Utc>,
}

/// Legs left behind by a failed multi-leg distribution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialState {
    pub completed_refs: Vec<TransactionId>,
    pub completed_keys: Vec<String>,
    pub pending_keys: Vec<String>,
    pub marked_at: DateTime<Utc>,
}

/// Held pool of principal for one goal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: EscrowId,
    pub goal_id: GoalId,
    pub stakeholders: Vec<Stakeholder>,
    /// Always the recomputed sum of stakeholder principals.
    pub total_principal: Money,
    pub accrued_amount: Money,
    /// Opaque reference to the upstream payment-gateway hold.
    pub hold_ref: String,
    pub currency: Currency,
    pub status: EscrowStatus,
    pub opened_at: DateTime<Utc>,
    pub settlement: Option<Settlement>,
    pub partial: Option<PartialState>,
}

impl Escrow {
    /// Open an escrow over the stakeholders' principal. The total is
    /// derived here and is immutable afterwards.
    pub fn open(
        goal_id: GoalId,
        stakeholders: Vec<Stakeholder>,
        now: DateTime<Utc>,
    ) -> Result<Self, EscrowError> {
        let first = stakeholders.first().ok_or(EscrowError::EmptyStakeholders)?;
        let currency = first.principal.currency.clone();

        let mut total = Money::zero(currency.clone());
        for stakeholder in &stakeholders {
            if !stakeholder.principal.is_positive() {
                return Err(EscrowError::InvalidStakeholderPrincipal {
                    user: stakeholder.user_id.clone(),
                    amount: stakeholder.principal.amount,
                });
            }
            total = total.add(&stakeholder.principal)?;
        }

        let escrow = Self {
            id: EscrowId::generate(),
            goal_id,
            stakeholders,
            total_principal: total,
            accrued_amount: Money::zero(currency.clone()),
            hold_ref: format!("hold-{}", uuid::Uuid::new_v4()),
            currency,
            status: EscrowStatus::Held,
            opened_at: now,
            settlement: None,
            partial: None,
        };
        info!(
            escrow = %escrow.id,
            goal = %escrow.goal_id,
            total = %escrow.total_principal,
            stakeholders = escrow.stakeholders.len(),
            "opened escrow"
        );
        Ok(escrow)
    }

    fn transition(&mut self, to: EscrowStatus) -> Result<(), EscrowError> {
        if !self.status.can_transition(to) {
            return Err(EscrowError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Record the pool's accrued interest. Monotone non-decreasing.
    pub fn record_accrual(&mut self, accrued: Money) -> Result<(), EscrowError> {
        self.accrued_amount.ensure_same_currency(&accrued)?;
        if accrued.amount < self.accrued_amount.amount {
            return Err(EscrowError::AccrualNotMonotone {
                recorded: self.accrued_amount.amount,
                new: accrued.amount,
            });
        }
        self.accrued_amount = accrued;
        Ok(())
    }

    /// Move Held -> PendingDistribution. A no-op when already pending,
    /// so a resumed distribution does not trip over itself.
    pub fn begin_distribution(&mut self) -> Result<(), EscrowError> {
        if self.status == EscrowStatus::PendingDistribution {
            return Ok(());
        }
        self.transition(EscrowStatus::PendingDistribution)
    }

    /// Terminal success/failure flip. Idempotent: when a settlement is
    /// already recorded it is returned unchanged.
    pub fn complete(
        &mut self,
        outcome: SettlementOutcome,
        transaction_refs: Vec<TransactionId>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, EscrowError> {
        if let Some(existing) = &self.settlement {
            return Ok(existing.clone());
        }
        let to = match outcome {
            SettlementOutcome::Released => EscrowStatus::Released,
            SettlementOutcome::Forfeited => EscrowStatus::Forfeited,
            SettlementOutcome::Refunded => EscrowStatus::Refunded,
        };
        self.transition(to)?;
        let settlement = Settlement {
            outcome,
            transaction_refs,
            settled_at: now,
        };
        self.settlement = Some(settlement.clone());
        self.partial = None;
        info!(escrow = %self.id, outcome = ?outcome, "escrow settled");
        Ok(settlement)
    }

    /// Cancellation path: only while Held and before any accrual.
    pub fn refund(
        &mut self,
        transaction_refs: Vec<TransactionId>,
        now: DateTime<Utc>,
    ) -> Result<Settlement, EscrowError> {
        if let Some(existing) = &self.settlement {
            return Ok(existing.clone());
        }
        if !self.accrued_amount.is_zero() {
            return Err(EscrowError::RefundAfterAccrual);
        }
        self.complete(SettlementOutcome::Refunded, transaction_refs, now)
    }

    /// Record a distribution that posted some legs but not all. May be
    /// called again while already Partial to refresh the record after a
    /// failed reconciliation.
    pub fn mark_partial(
        &mut self,
        completed_refs: Vec<TransactionId>,
        completed_keys: Vec<String>,
        pending_keys: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(), EscrowError> {
        if self.status != EscrowStatus::Partial {
            self.transition(EscrowStatus::Partial)?;
        }
        warn!(
            escrow = %self.id,
            completed = completed_refs.len(),
            pending = pending_keys.len(),
            "distribution left escrow partial"
        );
        self.partial = Some(PartialState {
            completed_refs,
            completed_keys,
            pending_keys,
            marked_at: now,
        });
        Ok(())
    }

    /// The recorded partial state, required for reconciliation.
    pub fn partial_state(&self) -> Result<&PartialState, EscrowError> {
        match (&self.status, &self.partial) {
            (EscrowStatus::Partial, Some(partial)) => Ok(partial),
            _ => Err(EscrowError::NotPartial),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn usd(amount: Decimal) -> Money {
        Money::new(amount, Currency::usd())
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn stakeholder(user: &str, amount: Decimal) -> Stakeholder {
        Stakeholder {
            user_id: UserId::new(user),
            stake_id: StakeId::generate(),
            principal: usd(amount),
        }
    }

    fn escrow() -> Escrow {
        Escrow::open(
            GoalId::new("g1"),
            vec![stakeholder("u1", dec!(60)), stakeholder("u2", dec!(40))],
            t0(),
        )
        .unwrap()
    }

    #[test]
    fn total_principal_is_derived_from_stakeholders() {
        let escrow = escrow();
        assert_eq!(escrow.total_principal.amount, dec!(100));
        assert_eq!(escrow.status, EscrowStatus::Held);
    }

    #[test]
    fn open_rejects_empty_and_non_positive() {
        assert!(matches!(
            Escrow::open(GoalId::new("g"), vec![], t0()),
            Err(EscrowError::EmptyStakeholders)
        ));
        assert!(matches!(
            Escrow::open(GoalId::new("g"), vec![stakeholder("u1", dec!(0))], t0()),
            Err(EscrowError::InvalidStakeholderPrincipal { .. })
        ));
    }

    #[test]
    fn open_rejects_mixed_currencies() {
        let mut other = stakeholder("u2", dec!(10));
        other.principal = Money::new(dec!(10), Currency::new("EUR"));
        assert!(matches!(
            Escrow::open(
                GoalId::new("g"),
                vec![stakeholder("u1", dec!(10)), other],
                t0()
            ),
            Err(EscrowError::Money(MoneyError::CurrencyMismatch { .. }))
        ));
    }

    #[test]
    fn complete_is_idempotent_and_returns_prior_settlement() {
        let mut escrow = escrow();
        escrow.begin_distribution().unwrap();
        let refs = vec![TransactionId::new("t1"), TransactionId::new("t2")];
        let first = escrow
            .complete(SettlementOutcome::Released, refs.clone(), t0())
            .unwrap();

        // A second call, even with different refs, returns the original.
        let second = escrow
            .complete(
                SettlementOutcome::Forfeited,
                vec![TransactionId::new("t9")],
                t0(),
            )
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.transaction_refs, refs);
        assert_eq!(escrow.status, EscrowStatus::Released);
    }

    #[test]
    fn refund_requires_zero_accrual() {
        let mut escrow = escrow();
        escrow.record_accrual(usd(dec!(0.50))).unwrap();
        assert!(matches!(
            escrow.refund(vec![], t0()),
            Err(EscrowError::RefundAfterAccrual)
        ));

        let mut fresh = self::escrow();
        let settlement = fresh.refund(vec![TransactionId::new("t1")], t0()).unwrap();
        assert_eq!(settlement.outcome, SettlementOutcome::Refunded);
        assert_eq!(fresh.status, EscrowStatus::Refunded);
    }

    #[test]
    fn accrual_must_not_decrease() {
        let mut escrow = escrow();
        escrow.record_accrual(usd(dec!(2))).unwrap();
        assert!(matches!(
            escrow.record_accrual(usd(dec!(1))),
            Err(EscrowError::AccrualNotMonotone { .. })
        ));
    }

    #[test]
    fn partial_flow_reaches_terminal_via_reconcile_path() {
        let mut escrow = escrow();
        escrow.begin_distribution().unwrap();
        escrow
            .mark_partial(
                vec![TransactionId::new("t1")],
                vec!["leg-1".into()],
                vec!["leg-2".into()],
                t0(),
            )
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Partial);
        assert_eq!(escrow.partial_state().unwrap().pending_keys, vec!["leg-2"]);

        // Held-style operations are refused now.
        assert!(matches!(
            escrow.begin_distribution(),
            Err(EscrowError::InvalidTransition { .. })
        ));

        let settlement = escrow
            .complete(
                SettlementOutcome::Forfeited,
                vec![TransactionId::new("t1"), TransactionId::new("t2")],
                t0(),
            )
            .unwrap();
        assert_eq!(settlement.outcome, SettlementOutcome::Forfeited);
        assert!(escrow.partial.is_none());
    }

    #[test]
    fn held_escrow_cannot_settle_directly() {
        let mut escrow = escrow();
        assert!(matches!(
            escrow.complete(SettlementOutcome::Released, vec![], t0()),
            Err(EscrowError::InvalidTransition { .. })
        ));
    }
}
