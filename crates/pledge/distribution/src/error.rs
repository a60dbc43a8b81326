use pledge_dispute::DisputeError;
use pledge_escrow::EscrowError;
use pledge_ledger::LedgerError;
use pledge_math::MathError;
use pledge_money::MoneyError;
use pledge_stake::StakeError;
use pledge_types::GoalId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors returned by the distribution engine.
#[derive(Debug, Error)]
pub enum DistributionError {
    /// Distribution is forbidden while a dispute is open.
    #[error("distribution blocked: goal {0} has an open dispute")]
    DisputeOpen(GoalId),

    #[error("goal {0} has no recorded terminal outcome")]
    GoalNotFinished(GoalId),

    #[error("no distribution plan registered for goal {0}")]
    PlanMissing(GoalId),

    #[error("invalid plan for goal {goal_id}: percentages sum to {total}, expected 100")]
    InvalidPlan { goal_id: GoalId, total: Decimal },

    #[error(
        "plan for goal {goal_id} pays a single stakeholder but the escrow holds {stakeholders}"
    )]
    PlanStakeholderMismatch {
        goal_id: GoalId,
        stakeholders: usize,
    },

    /// A leg failed to post; the escrow is now Partial and must be
    /// reconciled explicitly.
    #[error(
        "distribution for goal {goal_id} is partial: {completed} legs posted, {pending} pending ({reason})"
    )]
    PartialDistribution {
        goal_id: GoalId,
        completed: usize,
        pending: usize,
        reason: String,
    },

    /// A prior attempt left the escrow Partial; callers must reconcile,
    /// never silently retry.
    #[error("goal {0} has a partial distribution pending reconciliation")]
    PartialDistributionPending(GoalId),

    #[error("per-escrow serialization lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Stake(#[from] StakeError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Dispute(#[from] DisputeError),

    #[error(transparent)]
    Math(#[from] MathError),

    #[error(transparent)]
    Money(#[from] MoneyError),
}
