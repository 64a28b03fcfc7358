//! Goal decomposition into ordered execution steps.
//!
//! A pure lookup over a static template table. The dispatcher consumes the
//! planner only as descriptive metadata when logging a dispatch; fan-out is
//! driven entirely by the routing table.

use crate::events::Branch;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who a plan step is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanOwner {
    Branch(Branch),
    /// The fallback steps for unknown goals belong to the orchestrator
    /// itself.
    Orchestrator,
}

impl PlanOwner {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanOwner::Branch(branch) => branch.as_str(),
            PlanOwner::Orchestrator => "orchestrator",
        }
    }
}

impl serde::Serialize for PlanOwner {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub step: u32,
    pub action: &'static str,
    pub branch: PlanOwner,
}

const fn step(step: u32, action: &'static str, branch: PlanOwner) -> PlanStep {
    PlanStep {
        step,
        action,
        branch,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Planned,
}

/// A complete plan for a goal, with its originating context attached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    pub goal: String,
    pub context: Map<String, Value>,
    pub steps: Vec<PlanStep>,
    pub total_steps: usize,
    pub status: PlanStatus,
}

const VERIFY_CONTRIBUTION: &[PlanStep] = &[
    step(1, "fetch_metadata", PlanOwner::Branch(Branch::Verification)),
    step(2, "check_duplicates", PlanOwner::Branch(Branch::Verification)),
    step(3, "validate_format", PlanOwner::Branch(Branch::Verification)),
    step(4, "mint_nft", PlanOwner::Branch(Branch::Verification)),
    step(5, "distribute_reward", PlanOwner::Branch(Branch::Governance)),
];

const CREATE_SUCCESS_STORY: &[PlanStep] = &[
    step(1, "anonymize_data", PlanOwner::Branch(Branch::Marketing)),
    step(2, "generate_graphic", PlanOwner::Branch(Branch::Marketing)),
    step(3, "write_caption", PlanOwner::Branch(Branch::Marketing)),
    step(4, "post_to_social", PlanOwner::Branch(Branch::Marketing)),
];

const PORTFOLIO_UPDATE: &[PlanStep] = &[
    step(1, "fetch_nft_value", PlanOwner::Branch(Branch::Wealth)),
    step(2, "calculate_metrics", PlanOwner::Branch(Branch::Wealth)),
    step(3, "update_dashboard", PlanOwner::Branch(Branch::Wealth)),
];

/// Steps returned for goals without a template.
const FALLBACK: &[PlanStep] = &[
    step(1, "analyze_goal", PlanOwner::Orchestrator),
    step(2, "route_to_branch", PlanOwner::Orchestrator),
];

/// Static goal-to-steps lookup. No state, no I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskPlanner;

impl TaskPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Decompose a goal into its ordered template steps, or the generic
    /// two-step fallback for unknown goals.
    pub fn decompose(&self, goal: &str) -> &'static [PlanStep] {
        match goal {
            "verify_contribution" => VERIFY_CONTRIBUTION,
            "create_success_story" => CREATE_SUCCESS_STORY,
            "portfolio_update" => PORTFOLIO_UPDATE,
            _ => FALLBACK,
        }
    }

    /// Wrap `decompose` into a complete plan carrying the goal's context.
    pub fn create_execution_plan(&self, goal: &str, context: Map<String, Value>) -> ExecutionPlan {
        let steps = self.decompose(goal).to_vec();
        ExecutionPlan {
            goal: goal.to_string(),
            context,
            total_steps: steps.len(),
            steps,
            status: PlanStatus::Planned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verify_contribution_is_five_steps_ending_in_governance() {
        let planner = TaskPlanner::new();
        let steps = planner.decompose("verify_contribution");
        assert_eq!(steps.len(), 5);
        assert_eq!(
            steps.iter().map(|s| s.step).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        let last = steps[steps.len() - 1];
        assert_eq!(last.action, "distribute_reward");
        assert_eq!(last.branch, PlanOwner::Branch(Branch::Governance));
    }

    #[test]
    fn unknown_goal_gets_the_two_step_fallback() {
        let planner = TaskPlanner::new();
        let steps = planner.decompose("unknown_goal");
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action, "analyze_goal");
        assert_eq!(steps[1].action, "route_to_branch");
        assert!(steps.iter().all(|s| s.branch == PlanOwner::Orchestrator));
    }

    #[test]
    fn execution_plan_counts_its_steps() {
        let planner = TaskPlanner::new();
        let mut context = Map::new();
        context.insert("contributionId".to_string(), json!(42));
        let plan = planner.create_execution_plan("portfolio_update", context);
        assert_eq!(plan.total_steps, 3);
        assert_eq!(plan.status, PlanStatus::Planned);
        assert_eq!(plan.goal, "portfolio_update");
    }

    #[test]
    fn plans_serialize_with_branch_names() {
        let planner = TaskPlanner::new();
        let plan = planner.create_execution_plan("verify_contribution", Map::new());
        let value = serde_json::to_value(&plan).unwrap();
        assert_eq!(value["steps"][0]["branch"], json!("verification"));
        assert_eq!(value["steps"][4]["branch"], json!("governance"));
    }
}
