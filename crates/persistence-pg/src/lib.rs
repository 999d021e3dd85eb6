//! PostgreSQL persistence adapter.
//!
//! Defines [`PersistenceAdapter`], the trait the execution engine and gate
//! depend on, and [`PgStore`], its production implementation. A second
//! implementation (`testing::MemStore`, behind the `test-util` feature)
//! backs integration tests without a live database.

#![deny(unsafe_code)]

mod rows;
pub mod store;

#[cfg(feature = "test-util")]
pub mod testing;

use approval_core::ids::{ChangeId, ExecutionId, FlowId, IssueId, NodeExecutionId, ProjectId, RuleId};
use approval_core::model::{
    Approval, ApprovalFlow, ApprovalFlowExecution, ApprovalNode, FieldPattern,
    FlowExecutionStatus, Level, Notification, NodeExecutionStatus, SensitiveDataChange,
    SensitiveDataRule,
};
use async_trait::async_trait;
use thiserror::Error;

pub use store::PgStore;

/// Errors raised by the persistence layer. Kept distinct from
/// [`approval_core::ApprovalError`]: the engine translates these into the
/// shared taxonomy (not-found, conflict, ...) at the call site.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("failed to decode stored JSON: {reason}")]
    Decode { reason: String },

    #[error("an active execution already exists for issue {issue_id}")]
    DuplicateActive { issue_id: String },

    #[error("a rule named {title:?} already exists in project {project}")]
    DuplicateRuleTitle { project: String, title: String },

    #[error("project {project} already has an enabled flow at level {level}")]
    DuplicateEnabledFlowLevel { project: String, level: String },

    #[error("rule not found: {id}")]
    RuleNotFound { id: String },

    #[error("flow not found: {id}")]
    FlowNotFound { id: String },

    #[error("execution not found: {id}")]
    ExecutionNotFound { id: String },
}

/// Fields accepted when creating a rule.
#[derive(Debug, Clone)]
pub struct NewRule {
    pub project: ProjectId,
    pub title: String,
    pub level: Level,
    pub enabled: bool,
    pub table_pattern: Option<String>,
    pub field_patterns: Vec<FieldPattern>,
    pub creator: String,
}

/// Fields accepted when updating a rule; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub title: Option<String>,
    pub level: Option<Level>,
    pub enabled: Option<bool>,
    pub table_pattern: Option<Option<String>>,
    pub field_patterns: Option<Vec<FieldPattern>>,
    pub updater: String,
}

/// Fields accepted when creating a flow.
#[derive(Debug, Clone)]
pub struct NewFlow {
    pub project: ProjectId,
    pub title: String,
    pub level: Level,
    pub enabled: bool,
    pub nodes: Vec<ApprovalNode>,
    pub creator: String,
}

/// Fields accepted when updating a flow.
#[derive(Debug, Clone, Default)]
pub struct FlowUpdate {
    pub title: Option<String>,
    pub enabled: Option<bool>,
    pub nodes: Option<Vec<ApprovalNode>>,
    pub updater: String,
}

/// Arguments to [`PersistenceAdapter::begin_execution`]: the execution row
/// plus its node executions, inserted in one transaction.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub flow_id: FlowId,
    pub issue_id: IssueId,
    pub level: Level,
    pub creator: String,
    /// Node ids and positions copied from the selected flow, in order.
    pub node_ids: Vec<(approval_core::ids::NodeId, u32)>,
    /// `approval-requested` notifications for the first (lowest-position)
    /// node's approvers, inserted in the same transaction as the execution.
    pub notifications: Vec<Notification>,
}

/// Arguments to [`PersistenceAdapter::advance_execution`]: the atomic update
/// applied when a decision is recorded.
#[derive(Debug, Clone)]
pub struct ExecutionAdvance {
    pub execution_id: ExecutionId,
    pub node_execution_id: NodeExecutionId,
    pub node_status: NodeExecutionStatus,
    pub flow_status: FlowExecutionStatus,
    pub new_current_position: Option<u32>,
    pub approval: Approval,
    pub notifications: Vec<Notification>,
}

/// The persistence contract the execution engine and gate depend on.
/// `PgStore` is the production implementation; `testing::MemStore` backs
/// tests without a database.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn list_rules(&self, project: &ProjectId) -> Result<Vec<SensitiveDataRule>, StoreError>;
    async fn get_rule(&self, id: RuleId) -> Result<Option<SensitiveDataRule>, StoreError>;
    async fn create_rule(&self, rule: NewRule) -> Result<SensitiveDataRule, StoreError>;
    async fn update_rule(
        &self,
        id: RuleId,
        update: RuleUpdate,
    ) -> Result<SensitiveDataRule, StoreError>;
    async fn delete_rule(&self, id: RuleId) -> Result<(), StoreError>;

    async fn list_flows(&self, project: &ProjectId) -> Result<Vec<ApprovalFlow>, StoreError>;
    async fn get_flow(&self, id: FlowId) -> Result<Option<ApprovalFlow>, StoreError>;
    async fn create_flow(&self, flow: NewFlow) -> Result<ApprovalFlow, StoreError>;
    async fn update_flow(&self, id: FlowId, update: FlowUpdate) -> Result<ApprovalFlow, StoreError>;
    async fn delete_flow(&self, id: FlowId) -> Result<(), StoreError>;
    /// Whether any execution (in any status) references `id`; used to
    /// enforce that a flow's node structure is immutable once referenced
    /// before accepting a structural update.
    async fn flow_has_executions(&self, id: FlowId) -> Result<bool, StoreError>;

    async fn list_active_execution_for_issue(
        &self,
        issue_id: &IssueId,
    ) -> Result<Option<ApprovalFlowExecution>, StoreError>;
    async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ApprovalFlowExecution>, StoreError>;
    async fn list_executions(
        &self,
        project: &ProjectId,
    ) -> Result<Vec<ApprovalFlowExecution>, StoreError>;
    /// Insert an execution and its node executions transactionally,
    /// enforcing at most one active execution per issue via a database
    /// constraint.
    async fn begin_execution(
        &self,
        execution: NewExecution,
    ) -> Result<ApprovalFlowExecution, StoreError>;
    /// Apply the effects of one recorded decision transactionally: insert
    /// the approval row, update the node execution and flow execution
    /// status/position, and insert any resulting notifications.
    async fn advance_execution(
        &self,
        advance: ExecutionAdvance,
    ) -> Result<ApprovalFlowExecution, StoreError>;
    /// Transition an execution directly to CANCELLED, inserting `notifications`
    /// in the same transaction. Node executions are left untouched: the
    /// current node's frozen state is part of the audit trail.
    async fn cancel_execution(
        &self,
        id: ExecutionId,
        notifications: Vec<Notification>,
    ) -> Result<ApprovalFlowExecution, StoreError>;

    async fn record_changes(&self, changes: Vec<SensitiveDataChange>) -> Result<(), StoreError>;

    async fn list_notifications(
        &self,
        recipient: &str,
    ) -> Result<Vec<Notification>, StoreError>;
    async fn mark_notification_read(
        &self,
        id: approval_core::ids::NotificationId,
    ) -> Result<(), StoreError>;
}
