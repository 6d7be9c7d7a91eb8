//! Sequencing of several single device plans.

use crate::plan::ExecutionPlan;
use crate::profiler::ProfilerResult;
use crate::ZyxError;

/// Ordered list of execution plans, usually each bound to different device.
/// Plans keep their own allocations, nothing is shared between them
/// except the runtime's memory tracker.
#[derive(Debug, Default)]
pub struct PlanSequence {
    plans: Vec<ExecutionPlan>,
}

impl PlanSequence {
    #[must_use]
    pub fn new() -> PlanSequence {
        PlanSequence { plans: Vec::new() }
    }

    pub fn push(&mut self, plan: ExecutionPlan) -> &mut Self {
        self.plans.push(plan);
        self
    }

    #[must_use]
    pub fn plans(&self) -> &[ExecutionPlan] {
        &self.plans
    }

    pub fn plan_mut(&mut self, index: usize) -> Option<&mut ExecutionPlan> {
        self.plans.get_mut(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plans.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Executes plans in order, stops at first failure.
    pub fn execute(&mut self) -> Result<Vec<ProfilerResult>, ZyxError> {
        let mut results = Vec::with_capacity(self.plans.len());
        for (i, plan) in self.plans.iter_mut().enumerate() {
            let res = plan.execute().inspect_err(|e| log::debug!("Plan {i} in sequence failed, {e}"))?;
            results.push(res.profiler_result().clone());
        }
        Ok(results)
    }

    /// Closes every plan, returns first error.
    pub fn close(&mut self) -> Result<(), ZyxError> {
        let mut res = Ok(());
        for plan in &mut self.plans {
            if let Err(err) = plan.close() {
                if res.is_ok() {
                    res = Err(err);
                }
            }
        }
        res
    }
}

impl FromIterator<ExecutionPlan> for PlanSequence {
    fn from_iter<T: IntoIterator<Item = ExecutionPlan>>(iter: T) -> Self {
        PlanSequence { plans: iter.into_iter().collect() }
    }
}
