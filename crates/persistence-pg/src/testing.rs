//! In-memory [`PersistenceAdapter`] test double, behind the `test-util`
//! feature. Exercises the same trait the engine depends on without a live
//! database, so integration tests can run as plain `#[tokio::test]`s.

use std::collections::HashMap;
use std::sync::Mutex;

use approval_core::ids::{
    ExecutionId, FlowId, IssueId, NodeExecutionId, NotificationId, ProjectId, RuleId,
};
use approval_core::model::{
    ApprovalFlow, ApprovalFlowExecution, ApprovalNodeExecution, FlowExecutionStatus, Notification,
    SensitiveDataChange, SensitiveDataRule,
};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    ExecutionAdvance, FlowUpdate, NewExecution, NewFlow, NewRule, PersistenceAdapter, RuleUpdate,
    StoreError,
};

#[derive(Default)]
struct Inner {
    rules: HashMap<Uuid, SensitiveDataRule>,
    flows: HashMap<Uuid, ApprovalFlow>,
    executions: HashMap<Uuid, ApprovalFlowExecution>,
    notifications: HashMap<Uuid, Notification>,
    changes: Vec<SensitiveDataChange>,
}

/// In-memory stand-in for [`crate::PgStore`].
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for MemStore {
    async fn list_rules(&self, project: &ProjectId) -> Result<Vec<SensitiveDataRule>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut rules: Vec<_> =
            inner.rules.values().filter(|r| &r.project == project).cloned().collect();
        rules.sort_by_key(|r| r.create_time);
        Ok(rules)
    }

    async fn get_rule(&self, id: RuleId) -> Result<Option<SensitiveDataRule>, StoreError> {
        Ok(self.inner.lock().unwrap().rules.get(&id.0).cloned())
    }

    async fn create_rule(&self, rule: NewRule) -> Result<SensitiveDataRule, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .rules
            .values()
            .any(|r| r.project == rule.project && r.title == rule.title)
        {
            return Err(StoreError::DuplicateRuleTitle {
                project: rule.project.0.clone(),
                title: rule.title.clone(),
            });
        }
        let now = Utc::now();
        let stored = SensitiveDataRule {
            id: RuleId::new(),
            project: rule.project,
            title: rule.title,
            level: rule.level,
            enabled: rule.enabled,
            table_pattern: rule.table_pattern,
            field_patterns: rule.field_patterns,
            creator: rule.creator.clone(),
            updater: rule.creator,
            create_time: now,
            update_time: now,
        };
        inner.rules.insert(stored.id.0, stored.clone());
        Ok(stored)
    }

    async fn update_rule(
        &self,
        id: RuleId,
        update: RuleUpdate,
    ) -> Result<SensitiveDataRule, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .rules
            .get(&id.0)
            .cloned()
            .ok_or_else(|| StoreError::RuleNotFound { id: id.to_string() })?;
        let title = update.title.unwrap_or(current.title.clone());
        if inner
            .rules
            .values()
            .any(|r| r.id != id && r.project == current.project && r.title == title)
        {
            return Err(StoreError::DuplicateRuleTitle { project: current.project.0.clone(), title });
        }
        let updated = SensitiveDataRule {
            title,
            level: update.level.unwrap_or(current.level),
            enabled: update.enabled.unwrap_or(current.enabled),
            table_pattern: update.table_pattern.unwrap_or(current.table_pattern),
            field_patterns: update.field_patterns.unwrap_or(current.field_patterns),
            updater: update.updater,
            update_time: Utc::now(),
            ..current
        };
        inner.rules.insert(id.0, updated.clone());
        Ok(updated)
    }

    async fn delete_rule(&self, id: RuleId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().rules.remove(&id.0);
        Ok(())
    }

    async fn list_flows(&self, project: &ProjectId) -> Result<Vec<ApprovalFlow>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut flows: Vec<_> =
            inner.flows.values().filter(|f| &f.project == project).cloned().collect();
        flows.sort_by_key(|f| f.create_time);
        Ok(flows)
    }

    async fn get_flow(&self, id: FlowId) -> Result<Option<ApprovalFlow>, StoreError> {
        Ok(self.inner.lock().unwrap().flows.get(&id.0).cloned())
    }

    async fn create_flow(&self, flow: NewFlow) -> Result<ApprovalFlow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if flow.enabled
            && inner
                .flows
                .values()
                .any(|f| f.enabled && f.project == flow.project && f.level == flow.level)
        {
            return Err(StoreError::DuplicateEnabledFlowLevel {
                project: flow.project.0.clone(),
                level: flow.level.to_string(),
            });
        }
        let now = Utc::now();
        let stored = ApprovalFlow {
            id: FlowId::new(),
            project: flow.project,
            title: flow.title,
            level: flow.level,
            enabled: flow.enabled,
            nodes: flow.nodes,
            creator: flow.creator.clone(),
            updater: flow.creator,
            create_time: now,
            update_time: now,
        };
        inner.flows.insert(stored.id.0, stored.clone());
        Ok(stored)
    }

    async fn update_flow(&self, id: FlowId, update: FlowUpdate) -> Result<ApprovalFlow, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .flows
            .get(&id.0)
            .cloned()
            .ok_or_else(|| StoreError::FlowNotFound { id: id.to_string() })?;
        let enabled = update.enabled.unwrap_or(current.enabled);
        if enabled
            && inner
                .flows
                .values()
                .any(|f| f.id != id && f.enabled && f.project == current.project && f.level == current.level)
        {
            return Err(StoreError::DuplicateEnabledFlowLevel {
                project: current.project.0.clone(),
                level: current.level.to_string(),
            });
        }
        let updated = ApprovalFlow {
            title: update.title.unwrap_or(current.title.clone()),
            enabled,
            nodes: update.nodes.unwrap_or(current.nodes.clone()),
            updater: update.updater,
            update_time: Utc::now(),
            ..current
        };
        inner.flows.insert(id.0, updated.clone());
        Ok(updated)
    }

    async fn delete_flow(&self, id: FlowId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().flows.remove(&id.0);
        Ok(())
    }

    async fn flow_has_executions(&self, id: FlowId) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().executions.values().any(|e| e.flow_id == id))
    }

    async fn list_active_execution_for_issue(
        &self,
        issue_id: &IssueId,
    ) -> Result<Option<ApprovalFlowExecution>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .executions
            .values()
            .find(|e| &e.issue_id == issue_id && !e.status.is_terminal())
            .cloned())
    }

    async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ApprovalFlowExecution>, StoreError> {
        Ok(self.inner.lock().unwrap().executions.get(&id.0).cloned())
    }

    async fn list_executions(
        &self,
        project: &ProjectId,
    ) -> Result<Vec<ApprovalFlowExecution>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> = inner
            .executions
            .values()
            .filter(|e| inner.flows.get(&e.flow_id.0).map(|f| &f.project) == Some(project))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.create_time);
        Ok(out)
    }

    async fn begin_execution(
        &self,
        execution: NewExecution,
    ) -> Result<ApprovalFlowExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .executions
            .values()
            .any(|e| e.issue_id == execution.issue_id && !e.status.is_terminal())
        {
            return Err(StoreError::DuplicateActive { issue_id: execution.issue_id.0.clone() });
        }
        let now = Utc::now();
        let execution_id = ExecutionId::new();
        let node_executions = execution
            .node_ids
            .iter()
            .map(|(node_id, position)| ApprovalNodeExecution {
                id: NodeExecutionId::new(),
                execution_id,
                node_id: *node_id,
                position: *position,
                status: if *position == 1 {
                    approval_core::model::NodeExecutionStatus::InProgress
                } else {
                    approval_core::model::NodeExecutionStatus::Pending
                },
                approvals: vec![],
            })
            .collect::<Vec<_>>();
        let stored = ApprovalFlowExecution {
            id: execution_id,
            flow_id: execution.flow_id,
            issue_id: execution.issue_id,
            level: execution.level,
            status: FlowExecutionStatus::InProgress,
            current_position: execution.node_ids.first().map(|(_, p)| *p),
            node_executions,
            creator: execution.creator,
            create_time: now,
            update_time: now,
        };
        inner.executions.insert(stored.id.0, stored.clone());
        for notification in execution.notifications {
            inner.notifications.insert(notification.id.0, notification);
        }
        Ok(stored)
    }

    async fn advance_execution(
        &self,
        advance: ExecutionAdvance,
    ) -> Result<ApprovalFlowExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut execution = inner
            .executions
            .get(&advance.execution_id.0)
            .cloned()
            .ok_or_else(|| StoreError::ExecutionNotFound { id: advance.execution_id.to_string() })?;

        for ne in execution.node_executions.iter_mut() {
            if ne.id == advance.node_execution_id {
                ne.approvals.push(advance.approval.clone());
                ne.status = advance.node_status;
            } else if advance.new_current_position == Some(ne.position) {
                ne.status = approval_core::model::NodeExecutionStatus::InProgress;
            }
        }
        execution.status = advance.flow_status;
        execution.current_position = advance.new_current_position;
        execution.update_time = Utc::now();

        inner.executions.insert(execution.id.0, execution.clone());
        for notification in advance.notifications {
            inner.notifications.insert(notification.id.0, notification);
        }
        Ok(execution)
    }

    async fn cancel_execution(
        &self,
        id: ExecutionId,
        notifications: Vec<Notification>,
    ) -> Result<ApprovalFlowExecution, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut execution = inner
            .executions
            .get(&id.0)
            .cloned()
            .ok_or_else(|| StoreError::ExecutionNotFound { id: id.to_string() })?;
        execution.status = FlowExecutionStatus::Cancelled;
        execution.update_time = Utc::now();
        inner.executions.insert(execution.id.0, execution.clone());
        for notification in notifications {
            inner.notifications.insert(notification.id.0, notification);
        }
        Ok(execution)
    }

    async fn record_changes(&self, changes: Vec<SensitiveDataChange>) -> Result<(), StoreError> {
        self.inner.lock().unwrap().changes.extend(changes);
        Ok(())
    }

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<_> =
            inner.notifications.values().filter(|n| n.recipient == recipient).cloned().collect();
        out.sort_by_key(|n| std::cmp::Reverse(n.create_time));
        Ok(out)
    }

    async fn mark_notification_read(&self, id: NotificationId) -> Result<(), StoreError> {
        if let Some(n) = self.inner.lock().unwrap().notifications.get_mut(&id.0) {
            n.read = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_core::ids::NodeId;
    use approval_core::model::{ApprovalId, Decision};

    fn new_rule(project: &str, title: &str) -> NewRule {
        NewRule {
            project: ProjectId::from(project),
            title: title.to_string(),
            level: approval_core::model::Level::High,
            enabled: true,
            table_pattern: Some("users".into()),
            field_patterns: vec![],
            creator: "alice".into(),
        }
    }

    #[tokio::test]
    async fn create_rule_rejects_duplicate_title() {
        let store = MemStore::new();
        store.create_rule(new_rule("p", "ssn")).await.unwrap();
        let err = store.create_rule(new_rule("p", "ssn")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateRuleTitle { .. }));
    }

    #[tokio::test]
    async fn begin_execution_rejects_second_active_for_same_issue() {
        let store = MemStore::new();
        let issue_id = IssueId::from("issue-1");
        let new_exec = |issue: IssueId| NewExecution {
            flow_id: FlowId::new(),
            issue_id: issue,
            level: approval_core::model::Level::High,
            creator: "alice".into(),
            node_ids: vec![(NodeId::new(), 1)],
            notifications: vec![],
        };
        store.begin_execution(new_exec(issue_id.clone())).await.unwrap();
        let err = store.begin_execution(new_exec(issue_id)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateActive { .. }));
    }

    #[tokio::test]
    async fn advance_execution_records_approval_and_status() {
        let store = MemStore::new();
        let exec = store
            .begin_execution(NewExecution {
                flow_id: FlowId::new(),
                issue_id: IssueId::from("issue-2"),
                level: approval_core::model::Level::Low,
                creator: "alice".into(),
                node_ids: vec![(NodeId::new(), 1)],
                notifications: vec![],
            })
            .await
            .unwrap();
        let node_execution_id = exec.node_executions[0].id;

        let updated = store
            .advance_execution(ExecutionAdvance {
                execution_id: exec.id,
                node_execution_id,
                node_status: approval_core::model::NodeExecutionStatus::Approved,
                flow_status: FlowExecutionStatus::Approved,
                new_current_position: None,
                approval: approval_core::model::Approval {
                    id: ApprovalId::new(),
                    node_execution_id,
                    user_id: "alice".into(),
                    decision: Decision::Approved,
                    comment: String::new(),
                    create_time: Utc::now(),
                },
                notifications: vec![],
            })
            .await
            .unwrap();

        assert_eq!(updated.status, FlowExecutionStatus::Approved);
        assert_eq!(updated.node_executions[0].approvals.len(), 1);
    }
}
