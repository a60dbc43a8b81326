use std::collections::HashMap;
use std::sync::RwLock;

use pledge_types::{DistributionPlan, GoalId, GoalOutcome, MatchingPolicy};

use crate::error::DistributionError;

/// Source of distribution plans and matching policies. Supplied by the
/// out-of-scope goal/corporate services; the engine only consumes it.
pub trait PlanProvider: Send + Sync {
    fn plan_for(&self, goal_id: &GoalId) -> Result<Option<DistributionPlan>, DistributionError>;

    fn matching_policy(&self, goal_id: &GoalId)
        -> Result<Option<MatchingPolicy>, DistributionError>;
}

/// Source of terminal goal outcomes, owned by the goal service.
pub trait OutcomeProvider: Send + Sync {
    fn outcome(&self, goal_id: &GoalId) -> Result<Option<GoalOutcome>, DistributionError>;
}

/// In-memory plan/policy book for tests, local runs, and embedding.
#[derive(Default)]
pub struct InMemoryPlanbook {
    plans: RwLock<HashMap<GoalId, DistributionPlan>>,
    policies: RwLock<HashMap<GoalId, MatchingPolicy>>,
}

impl InMemoryPlanbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_plan(&self, plan: DistributionPlan) -> Result<(), DistributionError> {
        let mut plans = self
            .plans
            .write()
            .map_err(|_| DistributionError::LockPoisoned)?;
        plans.insert(plan.goal_id.clone(), plan);
        Ok(())
    }

    pub fn register_matching_policy(
        &self,
        goal_id: GoalId,
        policy: MatchingPolicy,
    ) -> Result<(), DistributionError> {
        let mut policies = self
            .policies
            .write()
            .map_err(|_| DistributionError::LockPoisoned)?;
        policies.insert(goal_id, policy);
        Ok(())
    }
}

impl PlanProvider for InMemoryPlanbook {
    fn plan_for(&self, goal_id: &GoalId) -> Result<Option<DistributionPlan>, DistributionError> {
        let plans = self
            .plans
            .read()
            .map_err(|_| DistributionError::LockPoisoned)?;
        Ok(plans.get(goal_id).cloned())
    }

    fn matching_policy(
        &self,
        goal_id: &GoalId,
    ) -> Result<Option<MatchingPolicy>, DistributionError> {
        let policies = self
            .policies
            .read()
            .map_err(|_| DistributionError::LockPoisoned)?;
        Ok(policies.get(goal_id).cloned())
    }
}

/// In-memory outcome feed for tests, local runs, and embedding.
#[derive(Default)]
pub struct InMemoryOutcomes {
    outcomes: RwLock<HashMap<GoalId, GoalOutcome>>,
}

impl InMemoryOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, goal_id: GoalId, outcome: GoalOutcome) -> Result<(), DistributionError> {
        let mut outcomes = self
            .outcomes
            .write()
            .map_err(|_| DistributionError::LockPoisoned)?;
        outcomes.insert(goal_id, outcome);
        Ok(())
    }
}

impl OutcomeProvider for InMemoryOutcomes {
    fn outcome(&self, goal_id: &GoalId) -> Result<Option<GoalOutcome>, DistributionError> {
        let outcomes = self
            .outcomes
            .read()
            .map_err(|_| DistributionError::LockPoisoned)?;
        Ok(outcomes.get(goal_id).copied())
    }
}
