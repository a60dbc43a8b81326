use std::collections::HashMap;
use std::sync::RwLock;

use pledge_types::{EscrowId, GoalId};

use crate::{Escrow, EscrowError};

/// Persistence seam for escrows. One goal has at most one escrow.
pub trait EscrowStore: Send + Sync {
    fn insert(&self, escrow: Escrow) -> Result<(), EscrowError>;

    fn get(&self, id: &EscrowId) -> Result<Escrow, EscrowError>;

    fn for_goal(&self, goal_id: &GoalId) -> Result<Escrow, EscrowError>;

    /// Load, mutate, and persist one escrow; the mutation commits only
    /// if the closure succeeds.
    fn update(
        &self,
        id: &EscrowId,
        apply: &mut dyn FnMut(&mut Escrow) -> Result<(), EscrowError>,
    ) -> Result<Escrow, EscrowError>;
}

/// In-memory store for tests, local runs, and embedding.
pub struct InMemoryEscrowStore {
    inner: RwLock<State>,
}

#[derive(Default)]
struct State {
    escrows: HashMap<EscrowId, Escrow>,
    goal_index: HashMap<GoalId, EscrowId>,
}

impl InMemoryEscrowStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(State::default()),
        }
    }
}

impl Default for InMemoryEscrowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EscrowStore for InMemoryEscrowStore {
    fn insert(&self, escrow: Escrow) -> Result<(), EscrowError> {
        let mut state = self.inner.write().map_err(|_| EscrowError::LockPoisoned)?;
        state
            .goal_index
            .insert(escrow.goal_id.clone(), escrow.id.clone());
        state.escrows.insert(escrow.id.clone(), escrow);
        Ok(())
    }

    fn get(&self, id: &EscrowId) -> Result<Escrow, EscrowError> {
        let state = self.inner.read().map_err(|_| EscrowError::LockPoisoned)?;
        state
            .escrows
            .get(id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(id.clone()))
    }

    fn for_goal(&self, goal_id: &GoalId) -> Result<Escrow, EscrowError> {
        let state = self.inner.read().map_err(|_| EscrowError::LockPoisoned)?;
        let id = state
            .goal_index
            .get(goal_id)
            .ok_or_else(|| EscrowError::NotFoundForGoal(goal_id.clone()))?;
        state
            .escrows
            .get(id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(id.clone()))
    }

    fn update(
        &self,
        id: &EscrowId,
        apply: &mut dyn FnMut(&mut Escrow) -> Result<(), EscrowError>,
    ) -> Result<Escrow, EscrowError> {
        let mut state = self.inner.write().map_err(|_| EscrowError::LockPoisoned)?;
        let current = state
            .escrows
            .get(id)
            .ok_or_else(|| EscrowError::NotFound(id.clone()))?;
        let mut staged = current.clone();
        apply(&mut staged)?;
        state.escrows.insert(id.clone(), staged.clone());
        Ok(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Stakeholder;
    use chrono::{DateTime, Utc};
    use pledge_money::{Currency, Money};
    use pledge_types::{StakeId, UserId};
    use rust_decimal_macros::dec;

    fn sample(goal: &str) -> Escrow {
        let now: DateTime<Utc> = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Escrow::open(
            GoalId::new(goal),
            vec![Stakeholder {
                user_id: UserId::new("u1"),
                stake_id: StakeId::generate(),
                principal: Money::new(dec!(25), Currency::usd()),
            }],
            now,
        )
        .unwrap()
    }

    #[test]
    fn goal_index_resolves_escrows() {
        let store = InMemoryEscrowStore::new();
        let escrow = sample("g1");
        let id = escrow.id.clone();
        store.insert(escrow).unwrap();

        assert_eq!(store.for_goal(&GoalId::new("g1")).unwrap().id, id);
        assert!(matches!(
            store.for_goal(&GoalId::new("g2")),
            Err(EscrowError::NotFoundForGoal(_))
        ));
    }

    #[test]
    fn update_commits_only_on_success() {
        let store = InMemoryEscrowStore::new();
        let escrow = sample("g1");
        let id = escrow.id.clone();
        store.insert(escrow).unwrap();

        let result = store.update(&id, &mut |e| {
            e.begin_distribution()?;
            // Fails: refund is not reachable from PendingDistribution.
            e.refund(vec![], Utc::now()).map(|_| ())
        });
        assert!(result.is_err());
        assert_eq!(
            store.get(&id).unwrap().status,
            crate::EscrowStatus::Held
        );
    }
}
