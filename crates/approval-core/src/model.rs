//! Domain entities for the sensitive-data approval workflow: rules, flows,
//! executions, approvals, and the notifications they raise.

use crate::ids::{
    ApprovalId, ChangeId, ExecutionId, FlowId, IssueId, NodeExecutionId, NodeId, NotificationId,
    ProjectId, RuleId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sensitivity level, ordinal `Unspecified < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Unspecified,
    Low,
    Medium,
    High,
}

impl Level {
    /// Levels ordered from strongest to weakest, for the flow selector's
    /// walk-down search.
    pub fn walk_down_from(start: Level) -> &'static [Level] {
        match start {
            Level::High => &[Level::High, Level::Medium, Level::Low],
            Level::Medium => &[Level::Medium, Level::Low],
            Level::Low => &[Level::Low],
            Level::Unspecified => &[],
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Unspecified => "UNSPECIFIED",
            Level::Low => "LOW",
            Level::Medium => "MEDIUM",
            Level::High => "HIGH",
        };
        write!(f, "{s}")
    }
}

/// One field matcher attached to a rule: a field matches if its name
/// equals `name_or_glob` (`*` expands to `.*`), or if `regex` is present,
/// compiles, and matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPattern {
    pub name_or_glob: String,
    pub regex: Option<String>,
}

/// A sensitive-data classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitiveDataRule {
    pub id: RuleId,
    pub project: ProjectId,
    pub title: String,
    pub level: Level,
    pub enabled: bool,
    /// Literal table name to match (case-insensitive); blank/`None` matches
    /// any table.
    pub table_pattern: Option<String>,
    pub field_patterns: Vec<FieldPattern>,
    pub creator: String,
    pub updater: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Who may approve a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverType {
    User,
    Group,
    Role,
    /// Resolves at decision time to the execution's recorded issue creator.
    SelfRequester,
}

/// Quorum rule for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    All,
    Any,
}

/// One step in a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalNode {
    pub id: NodeId,
    pub flow_id: FlowId,
    /// 1-based, unique and contiguous within a flow.
    pub position: u32,
    pub title: String,
    pub approver_type: ApproverType,
    /// Non-empty unless `approver_type` is `SelfRequester`.
    pub approver_ids: Vec<String>,
    pub approval_type: ApprovalType,
    pub required_approvals: u32,
}

impl ApprovalNode {
    /// The required-approvals count implied by `approval_type` and the
    /// approver list: ALL requires every approver, ANY requires one.
    pub fn effective_required_approvals(&self) -> u32 {
        match self.approval_type {
            ApprovalType::All => self.approver_ids.len().max(1) as u32,
            ApprovalType::Any => 1,
        }
    }
}

/// A named, ordered list of approval nodes tagged with a sensitivity level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalFlow {
    pub id: FlowId,
    pub project: ProjectId,
    pub title: String,
    pub level: Level,
    pub enabled: bool,
    /// Ordered by `ApprovalNode::position`; non-empty.
    pub nodes: Vec<ApprovalNode>,
    pub creator: String,
    pub updater: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

/// Status of a running flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowExecutionStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Cancelled,
}

impl FlowExecutionStatus {
    /// Terminal statuses are immutable: once reached, an execution never
    /// transitions again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowExecutionStatus::Approved
                | FlowExecutionStatus::Rejected
                | FlowExecutionStatus::Cancelled
        )
    }
}

/// Status of one node execution within a flow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Skipped,
}

/// A single approver decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub node_execution_id: NodeExecutionId,
    pub user_id: String,
    pub decision: Decision,
    pub comment: String,
    pub create_time: DateTime<Utc>,
}

/// An approver's decision on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// One node's progress within a running execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalNodeExecution {
    pub id: NodeExecutionId,
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub position: u32,
    pub status: NodeExecutionStatus,
    pub approvals: Vec<Approval>,
}

/// A running instance of a flow attached to a specific issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalFlowExecution {
    pub id: ExecutionId,
    pub flow_id: FlowId,
    pub issue_id: IssueId,
    pub level: Level,
    pub status: FlowExecutionStatus,
    /// Position of the in-progress node execution; undefined (`None`) in
    /// terminal states.
    pub current_position: Option<u32>,
    pub node_executions: Vec<ApprovalNodeExecution>,
    /// The issue's requester, captured at `beginExecution` so that `SELF`
    /// nodes can be resolved later without re-querying the issue.
    pub creator: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl ApprovalFlowExecution {
    /// The node execution currently awaiting a decision, if any.
    pub fn current_node_execution(&self) -> Option<&ApprovalNodeExecution> {
        let pos = self.current_position?;
        self.node_executions.iter().find(|ne| ne.position == pos)
    }
}

/// Derived audit record written on first admission of a sensitive plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensitiveDataChange {
    pub id: ChangeId,
    pub execution_id: Option<ExecutionId>,
    pub issue_id: IssueId,
    pub table: String,
    pub field: String,
    pub level: Level,
    pub rule_id: RuleId,
}

/// Kind of domain event a [`Notification`] was raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    FlowCompleted,
    FlowCancelled,
    NodeReminder,
}

/// An outbound notification record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub recipient: String,
    pub execution_ref: Option<ExecutionId>,
    pub node_ref: Option<NodeExecutionId>,
    pub approval_ref: Option<ApprovalId>,
    pub read: bool,
    pub create_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordinal_comparison() {
        assert!(Level::High > Level::Medium);
        assert!(Level::Medium > Level::Low);
        assert!(Level::Low > Level::Unspecified);
    }

    #[test]
    fn walk_down_never_walks_up() {
        assert_eq!(Level::walk_down_from(Level::Medium), &[Level::Medium, Level::Low]);
        assert_eq!(Level::walk_down_from(Level::Low), &[Level::Low]);
        assert!(Level::walk_down_from(Level::Unspecified).is_empty());
    }

    #[test]
    fn effective_required_approvals() {
        let node = ApprovalNode {
            id: NodeId::new(),
            flow_id: FlowId::new(),
            position: 1,
            title: "t".into(),
            approver_type: ApproverType::User,
            approver_ids: vec!["a".into(), "b".into(), "c".into()],
            approval_type: ApprovalType::Any,
            required_approvals: 0,
        };
        assert_eq!(node.effective_required_approvals(), 1);
        let all_node = ApprovalNode { approval_type: ApprovalType::All, ..node };
        assert_eq!(all_node.effective_required_approvals(), 3);
    }
}
