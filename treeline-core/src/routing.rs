//! Static routing table: which branches react to which event kinds, and
//! with what task.
//!
//! Routing is a pure function of the event kind, matched exhaustively so a
//! new kind cannot be added without deciding its routes.

use crate::events::{Branch, Event, EventKind, TaskMessage};
use serde_json::{Map, Value};

/// One fan-out target for an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub branch: Branch,
    /// The action name the branch expects for this event.
    pub task: &'static str,
}

/// The branches that must react to an event of the given kind.
///
/// | event kind            | branches notified  |
/// |-----------------------|--------------------|
/// | ContributionSubmitted | verification       |
/// | ContributionVerified  | marketing, wealth  |
/// | RewardDistributed     | governance         |
/// | anything else         | none               |
pub fn routes_for(kind: &EventKind) -> &'static [Route] {
    match kind {
        EventKind::ContributionSubmitted => &[Route {
            branch: Branch::Verification,
            task: "verify_contribution",
        }],
        EventKind::ContributionVerified => &[
            Route {
                branch: Branch::Marketing,
                task: "create_success_story",
            },
            Route {
                branch: Branch::Wealth,
                task: "portfolio_update",
            },
        ],
        EventKind::RewardDistributed => &[Route {
            branch: Branch::Governance,
            task: "update_dao_state",
        }],
        EventKind::Result | EventKind::Unknown(_) => &[],
    }
}

/// Build the task message a branch expects for an event.
///
/// The originating payload travels untouched under `data`; the
/// verification branch additionally gets the external contribution id
/// lifted to a top-level field.
pub fn task_message(route: &Route, event: &Event) -> TaskMessage {
    let mut payload = Map::new();
    if route.branch == Branch::Verification {
        if let Some(contribution_id) = event.contribution_id() {
            payload.insert(
                "contribution_id".to_string(),
                Value::String(contribution_id),
            );
        }
    }
    payload.insert("data".to_string(), Value::Object(event.payload.clone()));

    TaskMessage {
        task: route.task.to_string(),
        correlation_id: event.correlation_id(),
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::OffsetDateTime;

    fn event(kind: EventKind, args: Value) -> Event {
        let mut payload = Map::new();
        payload.insert("source".to_string(), json!("blockchain"));
        payload.insert("event_name".to_string(), json!(kind.as_str()));
        payload.insert("args".to_string(), args);
        Event {
            id: 11,
            source: "blockchain".to_string(),
            kind,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            payload,
        }
    }

    #[test]
    fn submitted_routes_to_verification_only() {
        let routes = routes_for(&EventKind::ContributionSubmitted);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].branch, Branch::Verification);
        assert_eq!(routes[0].task, "verify_contribution");
    }

    #[test]
    fn verified_fans_out_to_marketing_and_wealth() {
        let branches: Vec<Branch> = routes_for(&EventKind::ContributionVerified)
            .iter()
            .map(|r| r.branch)
            .collect();
        assert_eq!(branches, vec![Branch::Marketing, Branch::Wealth]);
    }

    #[test]
    fn reward_routes_to_governance_and_the_rest_nowhere() {
        assert_eq!(
            routes_for(&EventKind::RewardDistributed)[0].branch,
            Branch::Governance
        );
        assert!(routes_for(&EventKind::Result).is_empty());
        assert!(routes_for(&EventKind::Unknown("NodeUpgraded".to_string())).is_empty());
    }

    #[test]
    fn verification_task_lifts_the_contribution_id() {
        let event = event(
            EventKind::ContributionSubmitted,
            json!({"contributionId": 42}),
        );
        let route = &routes_for(&event.kind)[0];
        let message = task_message(route, &event);

        assert_eq!(message.task, "verify_contribution");
        assert_eq!(message.correlation_id, "42");
        assert_eq!(message.payload.get("contribution_id"), Some(&json!("42")));
        assert_eq!(
            message.payload.get("data"),
            Some(&Value::Object(event.payload.clone()))
        );
    }

    #[test]
    fn other_branches_get_the_payload_without_the_lift() {
        let event = event(
            EventKind::ContributionVerified,
            json!({"contributionId": 42}),
        );
        let route = &routes_for(&event.kind)[0];
        let message = task_message(route, &event);

        assert_eq!(message.correlation_id, "42");
        assert!(!message.payload.contains_key("contribution_id"));
        assert_eq!(
            message.payload.get("data"),
            Some(&Value::Object(event.payload.clone()))
        );
    }
}
