//! `FromRow` row types and conversions to/from `approval_core::model`.
//!
//! Enums map to native Postgres enum types via `sqlx::Type`; nested
//! collections (`field_patterns`, `nodes`) are stored as JSONB and carried
//! through as `serde_json::Value`, matching the pattern used for
//! `required_approvers`/`conditions` in the grounding example this crate
//! was built from.

use approval_core::ids::{
    ApprovalId, ExecutionId, FlowId, IssueId, NodeExecutionId, NodeId, NotificationId, ProjectId,
    RuleId,
};
use approval_core::model::{
    Approval, ApprovalFlow, ApprovalFlowExecution, ApprovalNode, ApprovalNodeExecution, Decision,
    FieldPattern, FlowExecutionStatus, Level, Notification, NotificationKind, NodeExecutionStatus,
    SensitiveDataRule,
};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::StoreError;

#[derive(Debug, sqlx::Type)]
#[sqlx(type_name = "sensitivity_level", rename_all = "snake_case")]
pub(crate) enum LevelRow {
    Unspecified,
    Low,
    Medium,
    High,
}

impl From<Level> for LevelRow {
    fn from(level: Level) -> Self {
        match level {
            Level::Unspecified => LevelRow::Unspecified,
            Level::Low => LevelRow::Low,
            Level::Medium => LevelRow::Medium,
            Level::High => LevelRow::High,
        }
    }
}

impl From<LevelRow> for Level {
    fn from(row: LevelRow) -> Self {
        match row {
            LevelRow::Unspecified => Level::Unspecified,
            LevelRow::Low => Level::Low,
            LevelRow::Medium => Level::Medium,
            LevelRow::High => Level::High,
        }
    }
}

#[derive(Debug, sqlx::Type)]
#[sqlx(type_name = "flow_execution_status", rename_all = "snake_case")]
pub(crate) enum FlowExecutionStatusRow {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Cancelled,
}

impl From<FlowExecutionStatus> for FlowExecutionStatusRow {
    fn from(s: FlowExecutionStatus) -> Self {
        match s {
            FlowExecutionStatus::Pending => FlowExecutionStatusRow::Pending,
            FlowExecutionStatus::InProgress => FlowExecutionStatusRow::InProgress,
            FlowExecutionStatus::Approved => FlowExecutionStatusRow::Approved,
            FlowExecutionStatus::Rejected => FlowExecutionStatusRow::Rejected,
            FlowExecutionStatus::Cancelled => FlowExecutionStatusRow::Cancelled,
        }
    }
}

impl From<FlowExecutionStatusRow> for FlowExecutionStatus {
    fn from(row: FlowExecutionStatusRow) -> Self {
        match row {
            FlowExecutionStatusRow::Pending => FlowExecutionStatus::Pending,
            FlowExecutionStatusRow::InProgress => FlowExecutionStatus::InProgress,
            FlowExecutionStatusRow::Approved => FlowExecutionStatus::Approved,
            FlowExecutionStatusRow::Rejected => FlowExecutionStatus::Rejected,
            FlowExecutionStatusRow::Cancelled => FlowExecutionStatus::Cancelled,
        }
    }
}

#[derive(Debug, sqlx::Type)]
#[sqlx(type_name = "node_execution_status", rename_all = "snake_case")]
pub(crate) enum NodeExecutionStatusRow {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Skipped,
}

impl From<NodeExecutionStatus> for NodeExecutionStatusRow {
    fn from(s: NodeExecutionStatus) -> Self {
        match s {
            NodeExecutionStatus::Pending => NodeExecutionStatusRow::Pending,
            NodeExecutionStatus::InProgress => NodeExecutionStatusRow::InProgress,
            NodeExecutionStatus::Approved => NodeExecutionStatusRow::Approved,
            NodeExecutionStatus::Rejected => NodeExecutionStatusRow::Rejected,
            NodeExecutionStatus::Skipped => NodeExecutionStatusRow::Skipped,
        }
    }
}

impl From<NodeExecutionStatusRow> for NodeExecutionStatus {
    fn from(row: NodeExecutionStatusRow) -> Self {
        match row {
            NodeExecutionStatusRow::Pending => NodeExecutionStatus::Pending,
            NodeExecutionStatusRow::InProgress => NodeExecutionStatus::InProgress,
            NodeExecutionStatusRow::Approved => NodeExecutionStatus::Approved,
            NodeExecutionStatusRow::Rejected => NodeExecutionStatus::Rejected,
            NodeExecutionStatusRow::Skipped => NodeExecutionStatus::Skipped,
        }
    }
}

#[derive(Debug, sqlx::Type)]
#[sqlx(type_name = "approval_decision", rename_all = "snake_case")]
pub(crate) enum DecisionRow {
    Approved,
    Rejected,
}

impl From<Decision> for DecisionRow {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Approved => DecisionRow::Approved,
            Decision::Rejected => DecisionRow::Rejected,
        }
    }
}

impl From<DecisionRow> for Decision {
    fn from(row: DecisionRow) -> Self {
        match row {
            DecisionRow::Approved => Decision::Approved,
            DecisionRow::Rejected => Decision::Rejected,
        }
    }
}

#[derive(Debug, sqlx::Type)]
#[sqlx(type_name = "notification_kind", rename_all = "kebab-case")]
pub(crate) enum NotificationKindRow {
    ApprovalRequested,
    ApprovalApproved,
    ApprovalRejected,
    FlowCompleted,
    FlowCancelled,
    NodeReminder,
}

impl From<NotificationKind> for NotificationKindRow {
    fn from(k: NotificationKind) -> Self {
        match k {
            NotificationKind::ApprovalRequested => NotificationKindRow::ApprovalRequested,
            NotificationKind::ApprovalApproved => NotificationKindRow::ApprovalApproved,
            NotificationKind::ApprovalRejected => NotificationKindRow::ApprovalRejected,
            NotificationKind::FlowCompleted => NotificationKindRow::FlowCompleted,
            NotificationKind::FlowCancelled => NotificationKindRow::FlowCancelled,
            NotificationKind::NodeReminder => NotificationKindRow::NodeReminder,
        }
    }
}

impl From<NotificationKindRow> for NotificationKind {
    fn from(row: NotificationKindRow) -> Self {
        match row {
            NotificationKindRow::ApprovalRequested => NotificationKind::ApprovalRequested,
            NotificationKindRow::ApprovalApproved => NotificationKind::ApprovalApproved,
            NotificationKindRow::ApprovalRejected => NotificationKind::ApprovalRejected,
            NotificationKindRow::FlowCompleted => NotificationKind::FlowCompleted,
            NotificationKindRow::FlowCancelled => NotificationKind::FlowCancelled,
            NotificationKindRow::NodeReminder => NotificationKind::NodeReminder,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct RuleRow {
    pub id: Uuid,
    pub project: String,
    pub title: String,
    pub level: LevelRow,
    pub enabled: bool,
    pub table_pattern: Option<String>,
    pub field_patterns: serde_json::Value,
    pub creator: String,
    pub updater: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl RuleRow {
    pub(crate) fn into_domain(self) -> Result<SensitiveDataRule, StoreError> {
        let field_patterns: Vec<FieldPattern> = serde_json::from_value(self.field_patterns)
            .map_err(|e| StoreError::Decode { reason: e.to_string() })?;
        Ok(SensitiveDataRule {
            id: RuleId::from(self.id),
            project: ProjectId(self.project),
            title: self.title,
            level: self.level.into(),
            enabled: self.enabled,
            table_pattern: self.table_pattern,
            field_patterns,
            creator: self.creator,
            updater: self.updater,
            create_time: self.create_time,
            update_time: self.update_time,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct FlowRow {
    pub id: Uuid,
    pub project: String,
    pub title: String,
    pub level: LevelRow,
    pub enabled: bool,
    pub nodes: serde_json::Value,
    pub creator: String,
    pub updater: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl FlowRow {
    pub(crate) fn into_domain(self) -> Result<ApprovalFlow, StoreError> {
        let nodes: Vec<ApprovalNode> = serde_json::from_value(self.nodes)
            .map_err(|e| StoreError::Decode { reason: e.to_string() })?;
        Ok(ApprovalFlow {
            id: FlowId::from(self.id),
            project: ProjectId(self.project),
            title: self.title,
            level: self.level.into(),
            enabled: self.enabled,
            nodes,
            creator: self.creator,
            updater: self.updater,
            create_time: self.create_time,
            update_time: self.update_time,
        })
    }
}

pub(crate) fn nodes_to_json(nodes: &[ApprovalNode]) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(nodes).map_err(|e| StoreError::Decode { reason: e.to_string() })
}

pub(crate) fn field_patterns_to_json(
    patterns: &[FieldPattern],
) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(patterns).map_err(|e| StoreError::Decode { reason: e.to_string() })
}

#[derive(Debug, FromRow)]
pub(crate) struct ExecutionRow {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub issue_id: String,
    pub level: LevelRow,
    pub status: FlowExecutionStatusRow,
    pub current_position: Option<i32>,
    pub creator: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl ExecutionRow {
    pub(crate) fn into_domain(
        self,
        node_executions: Vec<ApprovalNodeExecution>,
    ) -> ApprovalFlowExecution {
        ApprovalFlowExecution {
            id: ExecutionId::from(self.id),
            flow_id: FlowId::from(self.flow_id),
            issue_id: IssueId(self.issue_id),
            level: self.level.into(),
            status: self.status.into(),
            current_position: self.current_position.map(|p| p as u32),
            node_executions,
            creator: self.creator,
            create_time: self.create_time,
            update_time: self.update_time,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct NodeExecutionRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: Uuid,
    pub position: i32,
    pub status: NodeExecutionStatusRow,
}

impl NodeExecutionRow {
    pub(crate) fn into_domain(self, approvals: Vec<Approval>) -> ApprovalNodeExecution {
        ApprovalNodeExecution {
            id: NodeExecutionId::from(self.id),
            execution_id: ExecutionId::from(self.execution_id),
            node_id: NodeId::from(self.node_id),
            position: self.position as u32,
            status: self.status.into(),
            approvals,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ApprovalRow {
    pub id: Uuid,
    pub node_execution_id: Uuid,
    pub user_id: String,
    pub decision: DecisionRow,
    pub comment: String,
    pub create_time: DateTime<Utc>,
}

impl ApprovalRow {
    pub(crate) fn into_domain(self) -> Approval {
        Approval {
            id: ApprovalId::from(self.id),
            node_execution_id: NodeExecutionId::from(self.node_execution_id),
            user_id: self.user_id,
            decision: self.decision.into(),
            comment: self.comment,
            create_time: self.create_time,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct NotificationRow {
    pub id: Uuid,
    pub kind: NotificationKindRow,
    pub title: String,
    pub body: String,
    pub recipient: String,
    pub execution_ref: Option<Uuid>,
    pub node_ref: Option<Uuid>,
    pub approval_ref: Option<Uuid>,
    pub read: bool,
    pub create_time: DateTime<Utc>,
}

impl NotificationRow {
    pub(crate) fn into_domain(self) -> Notification {
        Notification {
            id: NotificationId::from(self.id),
            kind: self.kind.into(),
            title: self.title,
            body: self.body,
            recipient: self.recipient,
            execution_ref: self.execution_ref.map(ExecutionId::from),
            node_ref: self.node_ref.map(NodeExecutionId::from),
            approval_ref: self.approval_ref.map(ApprovalId::from),
            read: self.read,
            create_time: self.create_time,
        }
    }
}
