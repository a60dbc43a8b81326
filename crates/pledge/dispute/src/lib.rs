//! Disputes: user-filed objections that gate distribution.
//!
//! An open dispute on a goal forbids distribution. Both decisions —
//! Resolved and Rejected — unblock it; only Open blocks.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use pledge_types::{DisputeId, GoalId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors raised by the dispute registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisputeError {
    #[error("dispute {0} not found")]
    NotFound(DisputeId),

    #[error("dispute {id} was already decided as {status:?}")]
    AlreadyDecided { id: DisputeId, status: DisputeStatus },

    #[error("dispute registry lock poisoned")]
    LockPoisoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    Open,
    Resolved,
    Rejected,
}

/// The adjudicator's decision on an open dispute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeDecision {
    Resolved,
    Rejected,
}

impl DisputeDecision {
    fn status(&self) -> DisputeStatus {
        match self {
            DisputeDecision::Resolved => DisputeStatus::Resolved,
            DisputeDecision::Rejected => DisputeStatus::Rejected,
        }
    }
}

/// A user-filed objection against a goal's outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub goal_id: GoalId,
    pub filed_by: UserId,
    pub reason: String,
    pub evidence_refs: Vec<String>,
    pub status: DisputeStatus,
    pub filed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub decided_by: Option<UserId>,
}

/// Read seam used by the distribution engine's precondition check.
pub trait DisputeGate: Send + Sync {
    fn has_open_dispute(&self, goal_id: &GoalId) -> Result<bool, DisputeError>;
}

/// In-memory dispute registry with a per-goal index.
pub struct DisputeRegistry {
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    disputes: HashMap<DisputeId, Dispute>,
    goal_index: HashMap<GoalId, Vec<DisputeId>>,
}

impl DisputeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(State::default()),
        }
    }

    pub fn file(
        &self,
        goal_id: GoalId,
        filed_by: UserId,
        reason: impl Into<String>,
        evidence_refs: Vec<String>,
    ) -> Result<Dispute, DisputeError> {
        let dispute = Dispute {
            id: DisputeId::generate(),
            goal_id: goal_id.clone(),
            filed_by,
            reason: reason.into(),
            evidence_refs,
            status: DisputeStatus::Open,
            filed_at: Utc::now(),
            resolved_at: None,
            decided_by: None,
        };

        let mut state = self.inner.write().map_err(|_| DisputeError::LockPoisoned)?;
        state
            .goal_index
            .entry(goal_id)
            .or_default()
            .push(dispute.id.clone());
        state.disputes.insert(dispute.id.clone(), dispute.clone());
        info!(dispute = %dispute.id, goal = %dispute.goal_id, "dispute filed");
        Ok(dispute)
    }

    pub fn get(&self, id: &DisputeId) -> Result<Dispute, DisputeError> {
        let state = self.inner.read().map_err(|_| DisputeError::LockPoisoned)?;
        state
            .disputes
            .get(id)
            .cloned()
            .ok_or_else(|| DisputeError::NotFound(id.clone()))
    }

    /// Decide an open dispute. Decided disputes are immutable.
    pub fn decide(
        &self,
        id: &DisputeId,
        decision: DisputeDecision,
        decided_by: UserId,
    ) -> Result<Dispute, DisputeError> {
        let mut state = self.inner.write().map_err(|_| DisputeError::LockPoisoned)?;
        let dispute = state
            .disputes
            .get_mut(id)
            .ok_or_else(|| DisputeError::NotFound(id.clone()))?;
        if dispute.status != DisputeStatus::Open {
            return Err(DisputeError::AlreadyDecided {
                id: id.clone(),
                status: dispute.status,
            });
        }
        dispute.status = decision.status();
        dispute.resolved_at = Some(Utc::now());
        dispute.decided_by = Some(decided_by);
        info!(dispute = %dispute.id, decision = ?decision, "dispute decided");
        Ok(dispute.clone())
    }

    pub fn for_goal(&self, goal_id: &GoalId) -> Result<Vec<Dispute>, DisputeError> {
        let state = self.inner.read().map_err(|_| DisputeError::LockPoisoned)?;
        Ok(state
            .goal_index
            .get(goal_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.disputes.get(id))
            .cloned()
            .collect())
    }
}

impl Default for DisputeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DisputeGate for DisputeRegistry {
    fn has_open_dispute(&self, goal_id: &GoalId) -> Result<bool, DisputeError> {
        Ok(self
            .for_goal(goal_id)?
            .iter()
            .any(|d| d.status == DisputeStatus::Open))
    }
}
