//! Approval flow selector.
//!
//! Picks the single enabled flow whose declared level gates a computed
//! maximum sensitivity level, walking down the ordinal (never up) when no
//! flow exists at the exact level, and falling back to a built-in default
//! when configured to do so.
//!
//! When the walk-down exhausts every level with neither an enabled flow
//! nor a default configured, this selector denies rather than silently
//! admitting — see `DESIGN.md`.

#![deny(unsafe_code)]

use approval_core::ids::{FlowId, NodeId, ProjectId};
use approval_core::model::{ApprovalFlow, ApprovalNode, ApprovalType, ApproverType, Level};
use chrono::Utc;

/// A flow chosen to gate an execution: either one already configured in
/// the project, or a synthesized built-in default.
pub enum SelectedFlow<'a> {
    Configured(&'a ApprovalFlow),
    BuiltIn(ApprovalFlow),
}

impl<'a> SelectedFlow<'a> {
    pub fn flow(&self) -> &ApprovalFlow {
        match self {
            SelectedFlow::Configured(f) => f,
            SelectedFlow::BuiltIn(f) => f,
        }
    }
}

/// Outcome of flow selection.
pub enum FlowDecision<'a> {
    /// `maxLevel` was `UNSPECIFIED`; no gating flow is needed.
    NotRequired,
    /// A flow (configured or built-in) will gate the execution.
    Use(SelectedFlow<'a>),
    /// No enabled flow exists at or below the matched level and built-in
    /// defaults are disabled: the change is denied, not silently admitted.
    Denied,
}

/// Select the flow that should gate `max_level` for a project's flow set.
///
/// `flows` must already be scoped to the project (all elements share the
/// same `project`). `allow_builtin_defaults` toggles whether the
/// project-wide built-in fallback applies when no enabled flow is found.
pub fn select_flow<'a>(
    max_level: Level,
    flows: &'a [ApprovalFlow],
    allow_builtin_defaults: bool,
) -> FlowDecision<'a> {
    if max_level == Level::Unspecified {
        return FlowDecision::NotRequired;
    }

    for level in Level::walk_down_from(max_level) {
        if let Some(flow) = flows.iter().find(|f| f.enabled && f.level == *level) {
            return FlowDecision::Use(SelectedFlow::Configured(flow));
        }
    }

    if allow_builtin_defaults {
        return FlowDecision::Use(SelectedFlow::BuiltIn(builtin_default(max_level)));
    }

    FlowDecision::Denied
}

/// Built-in flows used when a project has no enabled flow at or below the
/// matched level:
/// HIGH ⇒ two nodes security-admin THEN dba, both ALL;
/// MEDIUM ⇒ one node dba, ALL;
/// LOW ⇒ one node SELF, ALL.
fn builtin_default(level: Level) -> ApprovalFlow {
    let flow_id = FlowId::new();
    let now = Utc::now();
    let nodes = match level {
        Level::High => vec![
            role_node(flow_id, 1, "Security admin review", "security-admin"),
            role_node(flow_id, 2, "DBA review", "dba"),
        ],
        Level::Medium => vec![role_node(flow_id, 1, "DBA review", "dba")],
        Level::Low | Level::Unspecified => vec![self_node(flow_id, 1)],
    };
    ApprovalFlow {
        id: flow_id,
        project: ProjectId::from("*"),
        title: format!("built-in default ({level})"),
        level,
        enabled: true,
        nodes,
        creator: "system".into(),
        updater: "system".into(),
        create_time: now,
        update_time: now,
    }
}

fn role_node(flow_id: FlowId, position: u32, title: &str, role: &str) -> ApprovalNode {
    ApprovalNode {
        id: NodeId::new(),
        flow_id,
        position,
        title: title.to_string(),
        approver_type: ApproverType::Role,
        approver_ids: vec![role.to_string()],
        approval_type: ApprovalType::All,
        required_approvals: 1,
    }
}

fn self_node(flow_id: FlowId, position: u32) -> ApprovalNode {
    ApprovalNode {
        id: NodeId::new(),
        flow_id,
        position,
        title: "Requester self-approval".to_string(),
        approver_type: ApproverType::SelfRequester,
        approver_ids: vec![],
        approval_type: ApprovalType::All,
        required_approvals: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn flow(project: &str, level: Level, enabled: bool) -> ApprovalFlow {
        let now = Utc::now();
        let flow_id = FlowId::new();
        ApprovalFlow {
            id: flow_id,
            project: ProjectId::from(project),
            title: format!("{level}-flow"),
            level,
            enabled,
            nodes: vec![role_node(flow_id, 1, "n1", "dba")],
            creator: "alice".into(),
            updater: "alice".into(),
            create_time: now,
            update_time: now,
        }
    }

    #[test]
    fn unspecified_level_needs_no_flow() {
        let flows = vec![flow("p", Level::High, true)];
        assert!(matches!(select_flow(Level::Unspecified, &flows, true), FlowDecision::NotRequired));
    }

    #[test]
    fn exact_level_match_is_used() {
        let flows = vec![flow("p", Level::Medium, true)];
        match select_flow(Level::Medium, &flows, true) {
            FlowDecision::Use(sel) => assert_eq!(sel.flow().level, Level::Medium),
            _ => panic!("expected a flow"),
        }
    }

    #[test]
    fn walks_down_never_up() {
        let flows = vec![flow("p", Level::Low, true)];
        // A HIGH change must never be gated by a weaker-than-matched flow
        // found by walking *up*; Low is reachable by walking down from High.
        match select_flow(Level::High, &flows, true) {
            FlowDecision::Use(sel) => assert_eq!(sel.flow().level, Level::Low),
            _ => panic!("expected walk-down to find the LOW flow"),
        }
    }

    #[test]
    fn disabled_flow_is_ignored() {
        let flows = vec![flow("p", Level::High, false)];
        match select_flow(Level::High, &flows, true) {
            FlowDecision::Use(sel) => assert_eq!(sel.flow().project, ProjectId::from("*")),
            _ => panic!("expected built-in fallback"),
        }
    }

    #[test]
    fn no_flow_and_no_defaults_denies() {
        let flows: Vec<ApprovalFlow> = vec![];
        assert!(matches!(select_flow(Level::High, &flows, false), FlowDecision::Denied));
    }

    #[test]
    fn builtin_high_default_is_two_nodes_sequential() {
        let flows: Vec<ApprovalFlow> = vec![];
        match select_flow(Level::High, &flows, true) {
            FlowDecision::Use(SelectedFlow::BuiltIn(flow)) => {
                assert_eq!(flow.nodes.len(), 2);
                assert_eq!(flow.nodes[0].position, 1);
                assert_eq!(flow.nodes[1].position, 2);
            }
            _ => panic!("expected built-in HIGH default"),
        }
    }

    #[test]
    fn builtin_low_default_is_self_approval() {
        let flows: Vec<ApprovalFlow> = vec![];
        match select_flow(Level::Low, &flows, true) {
            FlowDecision::Use(SelectedFlow::BuiltIn(flow)) => {
                assert_eq!(flow.nodes.len(), 1);
                assert_eq!(flow.nodes[0].approver_type, ApproverType::SelfRequester);
            }
            _ => panic!("expected built-in LOW default"),
        }
    }
}
