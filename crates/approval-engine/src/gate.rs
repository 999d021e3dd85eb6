//! Plan-check entry point.

use std::sync::Arc;

use approval_core::error::ApprovalError;
use approval_core::ids::{IssueId, ProjectId};
use approval_core::model::{FlowExecutionStatus, Level, SensitiveDataChange};
use async_trait::async_trait;
use flow_selector::{select_flow, FlowDecision};
use persistence_pg::PersistenceAdapter;
use rule_matcher::{match_changes, ChangeField};
use telemetry::ApprovalMetrics;
use thiserror::Error;
use tracing::instrument;

use crate::engine::ExecutionEngine;

/// Errors raised extracting `(tables, fields)` from a plan's statement.
/// Opaque to the core: only totality (did extraction complete) matters,
/// not precision.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to extract affected tables/fields: {reason}")]
    Failed { reason: String },
}

/// Extracts the `(table, field)` pairs a proposed change would touch.
/// Implementations may range from a full SQL parser to a caller-supplied
/// static list; the core never inspects `sql` itself.
#[async_trait]
pub trait ChangeExtractor: Send + Sync {
    async fn extract(&self, sql: &str, database: &str) -> Result<Vec<ChangeField>, ExtractError>;
}

/// A `ChangeExtractor` that treats the statement as a newline-separated
/// list of `table.field` pairs. Used where the caller has already
/// resolved affected columns and has no SQL to parse.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreResolvedExtractor;

#[async_trait]
impl ChangeExtractor for PreResolvedExtractor {
    async fn extract(&self, sql: &str, _database: &str) -> Result<Vec<ChangeField>, ExtractError> {
        let mut fields = Vec::new();
        for line in sql.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (table, field) = line.split_once('.').ok_or_else(|| ExtractError::Failed {
                reason: format!("expected `table.field`, got {line:?}"),
            })?;
            fields.push(ChangeField::new(table, field));
        }
        Ok(fields)
    }
}

/// Outcome of a [`check_plan`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Block { execution_id: String },
    Deny { reason: String },
}

/// Wires the rule matcher, flow selector and execution engine together
/// behind the single `check_plan` entry point the plan-check subsystem
/// calls.
pub struct Gate {
    store: Arc<dyn PersistenceAdapter>,
    engine: Arc<ExecutionEngine>,
    extractor: Arc<dyn ChangeExtractor>,
    allow_builtin_defaults: bool,
    metrics: ApprovalMetrics,
}

impl Gate {
    pub fn new(
        store: Arc<dyn PersistenceAdapter>,
        engine: Arc<ExecutionEngine>,
        extractor: Arc<dyn ChangeExtractor>,
        allow_builtin_defaults: bool,
    ) -> Self {
        Self { store, engine, extractor, allow_builtin_defaults, metrics: ApprovalMetrics::new() }
    }

    /// Current in-process gate verdict counters.
    pub fn metrics(&self) -> &ApprovalMetrics {
        &self.metrics
    }

    /// Match `sql` against the project's sensitive-data rules and, if a
    /// gating flow is needed, begin or reuse its execution.
    #[instrument(skip(self, sql), fields(project = %project.0, issue_id = %issue_id))]
    pub async fn check_plan(
        &self,
        project: &ProjectId,
        issue_id: IssueId,
        creator: &str,
        sql: &str,
        database: &str,
    ) -> Result<Verdict, ApprovalError> {
        let result = self.check_plan_inner(project, issue_id, creator, sql, database).await;
        match &result {
            Ok(Verdict::Admit) => self.metrics.record_gate_admit(),
            Ok(Verdict::Block { .. }) => self.metrics.record_gate_block(),
            Ok(Verdict::Deny { .. }) | Err(ApprovalError::NoFlowConfigured) => {
                self.metrics.record_gate_deny();
            }
            Err(_) => {}
        }
        result
    }

    async fn check_plan_inner(
        &self,
        project: &ProjectId,
        issue_id: IssueId,
        creator: &str,
        sql: &str,
        database: &str,
    ) -> Result<Verdict, ApprovalError> {
        if let Some(existing) = self
            .store
            .list_active_execution_for_issue(&issue_id)
            .await
            .map_err(crate::engine::map_store_err)?
        {
            return Ok(verdict_for_status(&existing));
        }

        let changes = self
            .extractor
            .extract(sql, database)
            .await
            .map_err(|err| ApprovalError::Internal { message: err.to_string() })?;

        let rules = self.store.list_rules(project).await.map_err(crate::engine::map_store_err)?;
        let enabled_rules: Vec<_> = rules.into_iter().filter(|r| r.enabled).collect();
        let (matched, max_level) = match_changes(&changes, &enabled_rules);

        if max_level == Level::Unspecified {
            return Ok(Verdict::Admit);
        }

        let flows = self.store.list_flows(project).await.map_err(crate::engine::map_store_err)?;
        let flow = match select_flow(max_level, &flows, self.allow_builtin_defaults) {
            FlowDecision::NotRequired => return Ok(Verdict::Admit),
            FlowDecision::Denied => return Err(ApprovalError::NoFlowConfigured),
            FlowDecision::Use(selected) => selected,
        };

        let execution = match self.engine.begin_execution(flow.flow(), issue_id.clone(), creator.to_string()).await {
            Ok(execution) => execution,
            Err(ApprovalError::DuplicateActive { .. }) => {
                // Lost the race to begin an execution for this issue: fetch the
                // winner's execution and return its verdict instead of erroring.
                let winner = self
                    .store
                    .list_active_execution_for_issue(&issue_id)
                    .await
                    .map_err(crate::engine::map_store_err)?
                    .ok_or_else(|| ApprovalError::ExecutionNotFound { id: issue_id.to_string() })?;
                return Ok(verdict_for_status(&winner));
            }
            Err(err) => return Err(err),
        };

        let audit_rows: Vec<SensitiveDataChange> = matched
            .iter()
            .flat_map(|matched_rule| {
                matched_rule.matched_fields.iter().map(move |field| SensitiveDataChange {
                    id: approval_core::ids::ChangeId::new(),
                    execution_id: Some(execution.id),
                    issue_id: execution.issue_id.clone(),
                    table: field.table.clone(),
                    field: field.field.clone(),
                    level: matched_rule.rule.level,
                    rule_id: matched_rule.rule.id,
                })
            })
            .collect();
        if !audit_rows.is_empty() {
            self.store.record_changes(audit_rows).await.map_err(crate::engine::map_store_err)?;
        }

        Ok(Verdict::Block { execution_id: execution.id.to_string() })
    }
}

fn verdict_for_status(execution: &approval_core::model::ApprovalFlowExecution) -> Verdict {
    match execution.status {
        FlowExecutionStatus::Approved => Verdict::Admit,
        FlowExecutionStatus::Rejected => {
            Verdict::Deny { reason: "the gating approval flow was rejected".into() }
        }
        FlowExecutionStatus::Cancelled => {
            Verdict::Deny { reason: "the gating approval flow was cancelled".into() }
        }
        FlowExecutionStatus::Pending | FlowExecutionStatus::InProgress => {
            Verdict::Block { execution_id: execution.id.to_string() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_core::clock::FixedClock;
    use approval_core::ids::FlowId;
    use approval_core::model::{ApprovalFlow, ApprovalNode, ApprovalType, ApproverType, FieldPattern};
    use notifier::NullSink;
    use persistence_pg::testing::MemStore;
    use persistence_pg::NewFlow;
    use persistence_pg::NewRule;

    fn gate(store: Arc<MemStore>, allow_builtin_defaults: bool) -> Gate {
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let engine = Arc::new(ExecutionEngine::new(store.clone(), Arc::new(NullSink), clock));
        Gate::new(store, engine, Arc::new(PreResolvedExtractor), allow_builtin_defaults)
    }

    async fn seed_rule(store: &MemStore, project: &str) {
        store
            .create_rule(NewRule {
                project: ProjectId::from(project),
                title: "pii".into(),
                level: Level::High,
                enabled: true,
                table_pattern: Some("users".into()),
                field_patterns: vec![FieldPattern { name_or_glob: "ssn".into(), regex: None }],
                creator: "alice".into(),
            })
            .await
            .unwrap();
    }

    async fn seed_flow(store: &MemStore, project: &str, level: Level, approver: &str) -> ApprovalFlow {
        let flow_id = FlowId::new();
        store
            .create_flow(NewFlow {
                project: ProjectId::from(project),
                title: "review".into(),
                level,
                enabled: true,
                nodes: vec![ApprovalNode {
                    id: approval_core::ids::NodeId::new(),
                    flow_id,
                    position: 1,
                    title: "n1".into(),
                    approver_type: ApproverType::User,
                    approver_ids: vec![approver.to_string()],
                    approval_type: ApprovalType::All,
                    required_approvals: 1,
                }],
                creator: "alice".into(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unmatched_change_is_admitted() {
        let store = Arc::new(MemStore::new());
        let gate = gate(store, false);
        let verdict = gate
            .check_plan(&ProjectId::from("proj"), IssueId::from("issue-1"), "alice", "orders.total", "db")
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Admit);
    }

    #[tokio::test]
    async fn matched_change_with_no_flow_and_no_defaults_is_denied() {
        let store = Arc::new(MemStore::new());
        seed_rule(&store, "proj").await;
        let gate = gate(store, false);
        let err = gate
            .check_plan(&ProjectId::from("proj"), IssueId::from("issue-2"), "alice", "users.ssn", "db")
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NoFlowConfigured));
    }

    #[tokio::test]
    async fn matched_change_with_flow_blocks_with_execution_id() {
        let store = Arc::new(MemStore::new());
        seed_rule(&store, "proj").await;
        seed_flow(&store, "proj", Level::High, "bob").await;
        let gate = gate(store, false);
        let verdict = gate
            .check_plan(&ProjectId::from("proj"), IssueId::from("issue-3"), "alice", "users.ssn", "db")
            .await
            .unwrap();
        assert!(matches!(verdict, Verdict::Block { .. }));
    }

    #[tokio::test]
    async fn second_check_for_same_issue_returns_block_without_new_execution() {
        let store = Arc::new(MemStore::new());
        seed_rule(&store, "proj").await;
        seed_flow(&store, "proj", Level::High, "bob").await;
        let gate = gate(store, false);
        let first = gate
            .check_plan(&ProjectId::from("proj"), IssueId::from("issue-4"), "alice", "users.ssn", "db")
            .await
            .unwrap();
        let second = gate
            .check_plan(&ProjectId::from("proj"), IssueId::from("issue-4"), "alice", "users.ssn", "db")
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
