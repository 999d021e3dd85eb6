//! Execution state machine with execution-scoped concurrency locking.

use std::sync::Arc;

use approval_core::clock::Clock;
use approval_core::error::ApprovalError;
use approval_core::ids::{ExecutionId, IssueId, NodeId};
use approval_core::model::{
    ApprovalFlow, ApprovalFlowExecution, ApprovalNode, ApproverType, Decision, FlowExecutionStatus,
    Level, NodeExecutionStatus, NotificationKind, SensitiveDataChange,
};
use dashmap::DashMap;
use notifier::{build_notifications, dispatch, DomainEvent, EventCorrelation, EventSink};
use persistence_pg::{ExecutionAdvance, NewExecution, PersistenceAdapter, StoreError};
use telemetry::ApprovalMetrics;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::authority::AuthorityResolver;

pub(crate) fn map_store_err(err: StoreError) -> ApprovalError {
    match err {
        StoreError::Database(e) => ApprovalError::Internal { message: e.to_string() },
        StoreError::Migration(e) => ApprovalError::Internal { message: e.to_string() },
        StoreError::Decode { reason } => ApprovalError::Internal { message: reason },
        StoreError::DuplicateActive { issue_id } => ApprovalError::DuplicateActive { issue_id },
        StoreError::DuplicateRuleTitle { project, title } => {
            ApprovalError::DuplicateRuleTitle { project, title }
        }
        StoreError::DuplicateEnabledFlowLevel { project, level } => {
            ApprovalError::DuplicateEnabledFlowLevel { project, level }
        }
        StoreError::RuleNotFound { id } => ApprovalError::RuleNotFound { id },
        StoreError::FlowNotFound { id } => ApprovalError::FlowNotFound { id },
        StoreError::ExecutionNotFound { id } => ApprovalError::ExecutionNotFound { id },
    }
}

/// A per-key mutex table: a `DashMap` of lazily-created `tokio::sync::Mutex`
/// handles, one per issue or execution id, serialising transitions on the
/// same aggregate without locking unrelated ones.
struct KeyedLocks<K> {
    table: DashMap<K, Arc<AsyncMutex<()>>>,
}

impl<K: Eq + std::hash::Hash + Clone> KeyedLocks<K> {
    fn new() -> Self {
        Self { table: DashMap::new() }
    }

    async fn lock(&self, key: K) -> tokio::sync::OwnedMutexGuard<()> {
        let mutex = self.table.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone();
        mutex.lock_owned().await
    }
}

/// The execution state machine, holding the execution-scoped lock table
/// plus the collaborators it drives (persistence, notifications, clock).
pub struct ExecutionEngine {
    store: Arc<dyn PersistenceAdapter>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    metrics: ApprovalMetrics,
    issue_locks: KeyedLocks<IssueId>,
    execution_locks: KeyedLocks<ExecutionId>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn PersistenceAdapter>, sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sink,
            clock,
            metrics: ApprovalMetrics::new(),
            issue_locks: KeyedLocks::new(),
            execution_locks: KeyedLocks::new(),
        }
    }

    /// Current in-process flow terminal-outcome counters.
    pub fn metrics(&self) -> &ApprovalMetrics {
        &self.metrics
    }

    /// Create a new execution for `issue_id` against `flow`, seeding its
    /// node executions and the first approval-requested notification.
    #[instrument(skip(self, flow), fields(flow_id = %flow.id, issue_id = %issue_id))]
    pub async fn begin_execution(
        &self,
        flow: &ApprovalFlow,
        issue_id: IssueId,
        creator: String,
    ) -> Result<ApprovalFlowExecution, ApprovalError> {
        if !flow.enabled {
            return Err(ApprovalError::FlowDisabled { flow_id: flow.id.to_string() });
        }
        let mut nodes = flow.nodes.clone();
        if nodes.is_empty() {
            return Err(ApprovalError::EmptyFlow { flow_id: flow.id.to_string() });
        }
        nodes.sort_by_key(|n| n.position);

        let _guard = self.issue_locks.lock(issue_id.clone()).await;
        if self
            .store
            .list_active_execution_for_issue(&issue_id)
            .await
            .map_err(map_store_err)?
            .is_some()
        {
            return Err(ApprovalError::DuplicateActive { issue_id: issue_id.to_string() });
        }

        let node_ids: Vec<(NodeId, u32)> = nodes.iter().map(|n| (n.id, n.position)).collect();
        let first = &nodes[0];
        let event = approval_requested_event(flow, first, &creator);
        let notifications = build_notifications(&event, self.clock.now());

        let execution = self
            .store
            .begin_execution(NewExecution {
                flow_id: flow.id,
                issue_id,
                level: flow.level,
                creator,
                node_ids,
                notifications,
            })
            .await
            .map_err(map_store_err)?;

        dispatch(self.sink.as_ref(), &event).await;
        Ok(execution)
    }

    /// Record one actor's decision at `position`, returning the resulting
    /// node and flow status.
    #[instrument(skip(self, resolver), fields(execution_id = %execution_id, position))]
    pub async fn record_decision(
        &self,
        execution_id: ExecutionId,
        position: u32,
        actor: &str,
        decision: Decision,
        comment: String,
        resolver: &dyn AuthorityResolver,
    ) -> Result<(NodeExecutionStatus, FlowExecutionStatus), ApprovalError> {
        let _guard = self.execution_locks.lock(execution_id).await;

        let execution = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(map_store_err)?
            .ok_or_else(|| ApprovalError::ExecutionNotFound { id: execution_id.to_string() })?;

        if execution.status.is_terminal() {
            return Err(ApprovalError::NotActive { execution_id: execution_id.to_string() });
        }
        let current_position = execution
            .current_position
            .ok_or_else(|| ApprovalError::NotActive { execution_id: execution_id.to_string() })?;
        if position != current_position {
            return Err(ApprovalError::NotCurrentPosition { got: position, want: current_position });
        }

        let node_execution = execution
            .node_executions
            .iter()
            .find(|ne| ne.position == position)
            .ok_or_else(|| ApprovalError::NodeExecutionNotFound {
                id: format!("{execution_id}:{position}"),
            })?;

        if node_execution.approvals.iter().any(|a| a.user_id == actor) {
            return Err(ApprovalError::DuplicateDecision {
                actor: actor.to_string(),
                node_execution_id: node_execution.id.to_string(),
            });
        }

        let flow = self
            .store
            .get_flow(execution.flow_id)
            .await
            .map_err(map_store_err)?
            .ok_or_else(|| ApprovalError::FlowNotFound { id: execution.flow_id.to_string() })?;
        let node = flow
            .nodes
            .iter()
            .find(|n| n.id == node_execution.node_id)
            .ok_or_else(|| ApprovalError::NodeExecutionNotFound { id: node_execution.id.to_string() })?;

        let authorised = match node.approver_type {
            ApproverType::SelfRequester => actor == execution.creator,
            other => resolver.has_role(actor, other, &node.approver_ids, &flow.project.0).await,
        };
        if !authorised {
            return Err(ApprovalError::Unauthorised { actor: actor.to_string() });
        }

        let now = self.clock.now();
        let approval = approval_core::model::Approval {
            id: approval_core::ids::ApprovalId::new(),
            node_execution_id: node_execution.id,
            user_id: actor.to_string(),
            decision,
            comment,
            create_time: now,
        };

        let approvals_after: Vec<_> =
            node_execution.approvals.iter().cloned().chain(std::iter::once(approval.clone())).collect();

        let mut events: Vec<DomainEvent> = Vec::new();
        let node_status;
        let flow_status;
        let new_current_position;

        if approvals_after.iter().any(|a| a.decision == Decision::Rejected) {
            node_status = NodeExecutionStatus::Rejected;
            flow_status = FlowExecutionStatus::Rejected;
            new_current_position = None;
            events.push(DomainEvent::new(
                NotificationKind::ApprovalRejected,
                format!("Rejected: {}", node.title),
                format!("{} was rejected by {actor}", flow.title),
                vec![execution.creator.clone()],
                EventCorrelation { execution_ref: Some(execution_id), node_ref: Some(node_execution.id), approval_ref: Some(approval.id) },
            ));
            events.push(DomainEvent::new(
                NotificationKind::FlowCompleted,
                format!("{} rejected", flow.title),
                "The approval flow was rejected and will not proceed further".to_string(),
                vec![execution.creator.clone()],
                EventCorrelation { execution_ref: Some(execution_id), ..Default::default() },
            ));
        } else {
            let approved_count =
                approvals_after.iter().filter(|a| a.decision == Decision::Approved).count() as u32;
            if approved_count >= node.effective_required_approvals() {
                node_status = NodeExecutionStatus::Approved;
                events.push(DomainEvent::new(
                    NotificationKind::ApprovalApproved,
                    format!("Approved: {}", node.title),
                    format!("{actor} approved {}", node.title),
                    vec![execution.creator.clone()],
                    EventCorrelation { execution_ref: Some(execution_id), node_ref: Some(node_execution.id), approval_ref: Some(approval.id) },
                ));

                let max_position = flow.nodes.iter().map(|n| n.position).max().unwrap_or(position);
                if position >= max_position {
                    flow_status = FlowExecutionStatus::Approved;
                    new_current_position = None;
                    events.push(DomainEvent::new(
                        NotificationKind::FlowCompleted,
                        format!("{} approved", flow.title),
                        "All required approvals were recorded".to_string(),
                        vec![execution.creator.clone()],
                        EventCorrelation { execution_ref: Some(execution_id), ..Default::default() },
                    ));
                } else {
                    flow_status = FlowExecutionStatus::InProgress;
                    let next_position = position + 1;
                    new_current_position = Some(next_position);
                    if let Some(next_node) = flow.nodes.iter().find(|n| n.position == next_position) {
                        events.push(approval_requested_event(&flow, next_node, &execution.creator));
                    }
                }
            } else {
                node_status = NodeExecutionStatus::InProgress;
                flow_status = FlowExecutionStatus::InProgress;
                new_current_position = Some(position);
            }
        }

        let mut notifications = Vec::new();
        for event in &events {
            notifications.extend(build_notifications(event, now));
        }

        let updated = self
            .store
            .advance_execution(ExecutionAdvance {
                execution_id,
                node_execution_id: node_execution.id,
                node_status,
                flow_status,
                new_current_position,
                approval,
                notifications,
            })
            .await
            .map_err(map_store_err)?;

        for event in &events {
            dispatch(self.sink.as_ref(), event).await;
        }

        match updated.status {
            FlowExecutionStatus::Approved => self.metrics.record_flow_approved(),
            FlowExecutionStatus::Rejected => self.metrics.record_flow_rejected(),
            _ => {}
        }

        Ok((node_status, updated.status))
    }

    /// Cancel a non-terminal execution, permitted only by the issue
    /// creator or a project admin.
    #[instrument(skip(self, resolver), fields(execution_id = %execution_id))]
    pub async fn cancel(
        &self,
        execution_id: ExecutionId,
        actor: &str,
        reason: String,
        resolver: &dyn AuthorityResolver,
    ) -> Result<ApprovalFlowExecution, ApprovalError> {
        let _guard = self.execution_locks.lock(execution_id).await;

        let execution = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(map_store_err)?
            .ok_or_else(|| ApprovalError::ExecutionNotFound { id: execution_id.to_string() })?;
        if execution.status.is_terminal() {
            return Err(ApprovalError::NotActive { execution_id: execution_id.to_string() });
        }

        if actor != execution.creator {
            let flow = self
                .store
                .get_flow(execution.flow_id)
                .await
                .map_err(map_store_err)?
                .ok_or_else(|| ApprovalError::FlowNotFound { id: execution.flow_id.to_string() })?;
            let is_admin = resolver
                .has_role(actor, ApproverType::Role, &["admin".to_string()], &flow.project.0)
                .await;
            if !is_admin {
                return Err(ApprovalError::Unauthorised { actor: actor.to_string() });
            }
        }

        let event = DomainEvent::new(
            NotificationKind::FlowCancelled,
            "Approval flow cancelled".to_string(),
            reason,
            vec![execution.creator.clone()],
            EventCorrelation { execution_ref: Some(execution_id), ..Default::default() },
        );
        let notifications = build_notifications(&event, self.clock.now());

        let updated = self
            .store
            .cancel_execution(execution_id, notifications)
            .await
            .map_err(map_store_err)?;

        dispatch(self.sink.as_ref(), &event).await;
        self.metrics.record_flow_cancelled();
        Ok(updated)
    }

    pub async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ApprovalFlowExecution>, ApprovalError> {
        self.store.get_execution(id).await.map_err(map_store_err)
    }

    pub async fn list_executions(
        &self,
        project: &approval_core::ids::ProjectId,
    ) -> Result<Vec<ApprovalFlowExecution>, ApprovalError> {
        self.store.list_executions(project).await.map_err(map_store_err)
    }

    pub async fn record_changes(
        &self,
        changes: Vec<SensitiveDataChange>,
    ) -> Result<(), ApprovalError> {
        self.store.record_changes(changes).await.map_err(map_store_err)
    }
}

fn approval_requested_event(flow: &ApprovalFlow, node: &ApprovalNode, creator: &str) -> DomainEvent {
    let recipients = match node.approver_type {
        ApproverType::SelfRequester => vec![creator.to_string()],
        _ => node.approver_ids.clone(),
    };
    DomainEvent::new(
        NotificationKind::ApprovalRequested,
        format!("Approval needed: {}", node.title),
        format!("{} requires your decision on \"{}\"", flow.title, node.title),
        recipients,
        EventCorrelation::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::StaticAuthorityResolver;
    use approval_core::clock::FixedClock;
    use approval_core::ids::{FlowId, ProjectId};
    use approval_core::model::ApprovalType;
    use notifier::NullSink;
    use persistence_pg::testing::MemStore;

    fn flow_single_all(project: &str, approver: &str) -> ApprovalFlow {
        let flow_id = FlowId::new();
        let now = chrono::Utc::now();
        ApprovalFlow {
            id: flow_id,
            project: ProjectId::from(project),
            title: "t".into(),
            level: Level::Low,
            enabled: true,
            nodes: vec![ApprovalNode {
                id: NodeId::new(),
                flow_id,
                position: 1,
                title: "n1".into(),
                approver_type: ApproverType::User,
                approver_ids: vec![approver.to_string()],
                approval_type: ApprovalType::All,
                required_approvals: 1,
            }],
            creator: "alice".into(),
            updater: "alice".into(),
            create_time: now,
            update_time: now,
        }
    }

    fn engine() -> ExecutionEngine {
        let store = Arc::new(MemStore::new());
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        ExecutionEngine::new(store, Arc::new(NullSink), clock)
    }

    #[tokio::test]
    async fn begin_then_record_decision_approves_single_node_flow() {
        let engine = engine();
        let flow = flow_single_all("proj", "bob");
        let execution = engine
            .begin_execution(&flow, IssueId::from("issue-1"), "alice".into())
            .await
            .unwrap();
        assert_eq!(execution.current_position, Some(1));

        let resolver = StaticAuthorityResolver::new();
        let (node_status, flow_status) = engine
            .record_decision(execution.id, 1, "bob", Decision::Approved, String::new(), &resolver)
            .await
            .unwrap();
        assert_eq!(node_status, NodeExecutionStatus::Approved);
        assert_eq!(flow_status, FlowExecutionStatus::Approved);
    }

    #[tokio::test]
    async fn rejection_short_circuits_to_rejected() {
        let engine = engine();
        let flow = flow_single_all("proj", "bob");
        let execution = engine
            .begin_execution(&flow, IssueId::from("issue-2"), "alice".into())
            .await
            .unwrap();
        let resolver = StaticAuthorityResolver::new();
        let (node_status, flow_status) = engine
            .record_decision(execution.id, 1, "bob", Decision::Rejected, "no".into(), &resolver)
            .await
            .unwrap();
        assert_eq!(node_status, NodeExecutionStatus::Rejected);
        assert_eq!(flow_status, FlowExecutionStatus::Rejected);
    }

    #[tokio::test]
    async fn second_active_execution_for_same_issue_is_rejected() {
        let engine = engine();
        let flow = flow_single_all("proj", "bob");
        engine.begin_execution(&flow, IssueId::from("issue-3"), "alice".into()).await.unwrap();
        let err = engine
            .begin_execution(&flow, IssueId::from("issue-3"), "alice".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::DuplicateActive { .. }));
    }

    #[tokio::test]
    async fn non_approver_decision_is_unauthorised() {
        let engine = engine();
        let flow = flow_single_all("proj", "bob");
        let execution = engine
            .begin_execution(&flow, IssueId::from("issue-4"), "alice".into())
            .await
            .unwrap();
        let resolver = StaticAuthorityResolver::new();
        let err = engine
            .record_decision(execution.id, 1, "mallory", Decision::Approved, String::new(), &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorised { .. }));
    }

    #[tokio::test]
    async fn cancel_by_creator_transitions_to_cancelled() {
        let engine = engine();
        let flow = flow_single_all("proj", "bob");
        let execution = engine
            .begin_execution(&flow, IssueId::from("issue-5"), "alice".into())
            .await
            .unwrap();
        let resolver = StaticAuthorityResolver::new();
        let updated = engine
            .cancel(execution.id, "alice", "changed my mind".into(), &resolver)
            .await
            .unwrap();
        assert_eq!(updated.status, FlowExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_by_non_creator_non_admin_is_unauthorised() {
        let engine = engine();
        let flow = flow_single_all("proj", "bob");
        let execution = engine
            .begin_execution(&flow, IssueId::from("issue-6"), "alice".into())
            .await
            .unwrap();
        let resolver = StaticAuthorityResolver::new();
        let err = engine.cancel(execution.id, "mallory", "nope".into(), &resolver).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Unauthorised { .. }));
    }
}
