use std::collections::HashMap;
use std::sync::RwLock;

use pledge_types::{GoalId, StakeId};

use crate::{Stake, StakeError};

/// Persistence seam for stakes. Implementations must apply `update`
/// atomically with respect to other calls for the same stake.
pub trait StakeStore: Send + Sync {
    fn insert(&self, stake: Stake) -> Result<(), StakeError>;

    fn get(&self, id: &StakeId) -> Result<Stake, StakeError>;

    fn for_goal(&self, goal_id: &GoalId) -> Result<Vec<Stake>, StakeError>;

    /// Load, mutate, and persist one stake under the store lock.
    fn update(
        &self,
        id: &StakeId,
        apply: &mut dyn FnMut(&mut Stake) -> Result<(), StakeError>,
    ) -> Result<Stake, StakeError>;
}

/// In-memory store for tests, local runs, and embedding.
pub struct InMemoryStakeStore {
    inner: RwLock<HashMap<StakeId, Stake>>,
}

impl InMemoryStakeStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StakeStore for InMemoryStakeStore {
    fn insert(&self, stake: Stake) -> Result<(), StakeError> {
        let mut stakes = self.inner.write().map_err(|_| StakeError::LockPoisoned)?;
        stakes.insert(stake.id.clone(), stake);
        Ok(())
    }

    fn get(&self, id: &StakeId) -> Result<Stake, StakeError> {
        let stakes = self.inner.read().map_err(|_| StakeError::LockPoisoned)?;
        stakes
            .get(id)
            .cloned()
            .ok_or_else(|| StakeError::NotFound(id.clone()))
    }

    fn for_goal(&self, goal_id: &GoalId) -> Result<Vec<Stake>, StakeError> {
        let stakes = self.inner.read().map_err(|_| StakeError::LockPoisoned)?;
        Ok(stakes
            .values()
            .filter(|s| s.goal_id == *goal_id)
            .cloned()
            .collect())
    }

    fn update(
        &self,
        id: &StakeId,
        apply: &mut dyn FnMut(&mut Stake) -> Result<(), StakeError>,
    ) -> Result<Stake, StakeError> {
        let mut stakes = self.inner.write().map_err(|_| StakeError::LockPoisoned)?;
        let current = stakes
            .get(id)
            .ok_or_else(|| StakeError::NotFound(id.clone()))?;
        // Mutate a copy; commit only if the closure succeeds.
        let mut staged = current.clone();
        apply(&mut staged)?;
        stakes.insert(id.clone(), staged.clone());
        Ok(staged)
    }
}
