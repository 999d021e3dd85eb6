//! `PgStore`: the production [`crate::PersistenceAdapter`], backed by a
//! `sqlx::PgPool`.

use approval_core::ids::{
    ExecutionId, FlowId, IssueId, NodeExecutionId, NotificationId, ProjectId, RuleId,
};
use approval_core::model::{
    ApprovalFlow, ApprovalFlowExecution, Notification, SensitiveDataChange, SensitiveDataRule,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::rows::{
    field_patterns_to_json, nodes_to_json, ApprovalRow, ExecutionRow, FlowRow, NodeExecutionRow,
    NotificationRow, RuleRow,
};
use crate::{
    ExecutionAdvance, FlowUpdate, NewExecution, NewFlow, NewRule, PersistenceAdapter, RuleUpdate,
    StoreError,
};

/// Postgres connection pool plus embedded migrations.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run embedded migrations. `database_url` is read by the
    /// caller from `APPROVAL_ENGINE_DATABASE_URL`.
    #[tracing::instrument(skip(database_url), name = "store.connect")]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an already-constructed pool (tests, or callers that manage
    /// connection lifecycle themselves).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_execution_aggregate(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ApprovalFlowExecution>, StoreError> {
        let Some(exec_row) = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM approval_flow_executions WHERE id = $1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let node_rows = sqlx::query_as::<_, NodeExecutionRow>(
            "SELECT * FROM approval_node_executions WHERE execution_id = $1 ORDER BY position",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        let mut node_executions = Vec::with_capacity(node_rows.len());
        for node_row in node_rows {
            let approvals = sqlx::query_as::<_, ApprovalRow>(
                "SELECT * FROM approvals WHERE node_execution_id = $1 ORDER BY create_time",
            )
            .bind(node_row.id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(ApprovalRow::into_domain)
            .collect();
            node_executions.push(node_row.into_domain(approvals));
        }

        Ok(Some(exec_row.into_domain(node_executions)))
    }

    async fn fetch_execution_aggregate_tx(
        tx: &mut Transaction<'_, Postgres>,
        execution_id: Uuid,
    ) -> Result<ApprovalFlowExecution, StoreError> {
        let exec_row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM approval_flow_executions WHERE id = $1",
        )
        .bind(execution_id)
        .fetch_one(&mut **tx)
        .await?;

        let node_rows = sqlx::query_as::<_, NodeExecutionRow>(
            "SELECT * FROM approval_node_executions WHERE execution_id = $1 ORDER BY position",
        )
        .bind(execution_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut node_executions = Vec::with_capacity(node_rows.len());
        for node_row in node_rows {
            let approvals = sqlx::query_as::<_, ApprovalRow>(
                "SELECT * FROM approvals WHERE node_execution_id = $1 ORDER BY create_time",
            )
            .bind(node_row.id)
            .fetch_all(&mut **tx)
            .await?
            .into_iter()
            .map(ApprovalRow::into_domain)
            .collect();
            node_executions.push(node_row.into_domain(approvals));
        }

        Ok(exec_row.into_domain(node_executions))
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl PersistenceAdapter for PgStore {
    #[tracing::instrument(skip(self), name = "store.list_rules")]
    async fn list_rules(&self, project: &ProjectId) -> Result<Vec<SensitiveDataRule>, StoreError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM sensitive_data_rules WHERE project = $1 AND deleted_at IS NULL ORDER BY create_time",
        )
        .bind(&project.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RuleRow::into_domain).collect()
    }

    #[tracing::instrument(skip(self), name = "store.get_rule")]
    async fn get_rule(&self, id: RuleId) -> Result<Option<SensitiveDataRule>, StoreError> {
        let row = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM sensitive_data_rules WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RuleRow::into_domain).transpose()
    }

    #[tracing::instrument(skip(self, rule), name = "store.create_rule")]
    async fn create_rule(&self, rule: NewRule) -> Result<SensitiveDataRule, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let field_patterns = field_patterns_to_json(&rule.field_patterns)?;
        let row = sqlx::query_as::<_, RuleRow>(
            r#"
            INSERT INTO sensitive_data_rules
                (id, project, title, level, enabled, table_pattern, field_patterns,
                 creator, updater, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&rule.project.0)
        .bind(&rule.title)
        .bind(crate::rows::LevelRow::from(rule.level))
        .bind(rule.enabled)
        .bind(&rule.table_pattern)
        .bind(field_patterns)
        .bind(&rule.creator)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateRuleTitle { project: rule.project.0.clone(), title: rule.title.clone() }
            } else {
                StoreError::Database(e)
            }
        })?;
        row.into_domain()
    }

    #[tracing::instrument(skip(self, update), name = "store.update_rule")]
    async fn update_rule(
        &self,
        id: RuleId,
        update: RuleUpdate,
    ) -> Result<SensitiveDataRule, StoreError> {
        let current = self
            .get_rule(id)
            .await?
            .ok_or_else(|| StoreError::RuleNotFound { id: id.to_string() })?;

        let title = update.title.unwrap_or(current.title);
        let level = update.level.unwrap_or(current.level);
        let enabled = update.enabled.unwrap_or(current.enabled);
        let table_pattern = update.table_pattern.unwrap_or(current.table_pattern);
        let field_patterns = update.field_patterns.unwrap_or(current.field_patterns);
        let field_patterns_json = field_patterns_to_json(&field_patterns)?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, RuleRow>(
            r#"
            UPDATE sensitive_data_rules
            SET title = $2, level = $3, enabled = $4, table_pattern = $5,
                field_patterns = $6, updater = $7, update_time = $8
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(&title)
        .bind(crate::rows::LevelRow::from(level))
        .bind(enabled)
        .bind(&table_pattern)
        .bind(field_patterns_json)
        .bind(&update.updater)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateRuleTitle { project: current.project.0.clone(), title: title.clone() }
            } else {
                StoreError::Database(e)
            }
        })?;
        row.into_domain()
    }

    #[tracing::instrument(skip(self), name = "store.delete_rule")]
    async fn delete_rule(&self, id: RuleId) -> Result<(), StoreError> {
        sqlx::query("UPDATE sensitive_data_rules SET deleted_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), name = "store.list_flows")]
    async fn list_flows(&self, project: &ProjectId) -> Result<Vec<ApprovalFlow>, StoreError> {
        let rows = sqlx::query_as::<_, FlowRow>(
            "SELECT * FROM approval_flows WHERE project = $1 AND deleted_at IS NULL ORDER BY create_time",
        )
        .bind(&project.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FlowRow::into_domain).collect()
    }

    #[tracing::instrument(skip(self), name = "store.get_flow")]
    async fn get_flow(&self, id: FlowId) -> Result<Option<ApprovalFlow>, StoreError> {
        let row = sqlx::query_as::<_, FlowRow>(
            "SELECT * FROM approval_flows WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FlowRow::into_domain).transpose()
    }

    #[tracing::instrument(skip(self, flow), name = "store.create_flow")]
    async fn create_flow(&self, flow: NewFlow) -> Result<ApprovalFlow, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let nodes_json = nodes_to_json(&flow.nodes)?;
        let row = sqlx::query_as::<_, FlowRow>(
            r#"
            INSERT INTO approval_flows
                (id, project, title, level, enabled, nodes, creator, updater, create_time, update_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $8, $8)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&flow.project.0)
        .bind(&flow.title)
        .bind(crate::rows::LevelRow::from(flow.level))
        .bind(flow.enabled)
        .bind(nodes_json)
        .bind(&flow.creator)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateEnabledFlowLevel {
                    project: flow.project.0.clone(),
                    level: flow.level.to_string(),
                }
            } else {
                StoreError::Database(e)
            }
        })?;
        row.into_domain()
    }

    #[tracing::instrument(skip(self, update), name = "store.update_flow")]
    async fn update_flow(&self, id: FlowId, update: FlowUpdate) -> Result<ApprovalFlow, StoreError> {
        let current = self
            .get_flow(id)
            .await?
            .ok_or_else(|| StoreError::FlowNotFound { id: id.to_string() })?;

        let title = update.title.unwrap_or(current.title);
        let enabled = update.enabled.unwrap_or(current.enabled);
        let nodes = update.nodes.unwrap_or(current.nodes);
        let nodes_json = nodes_to_json(&nodes)?;
        let now = Utc::now();

        let row = sqlx::query_as::<_, FlowRow>(
            r#"
            UPDATE approval_flows
            SET title = $2, enabled = $3, nodes = $4, updater = $5, update_time = $6
            WHERE id = $1 AND deleted_at IS NULL
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(&title)
        .bind(enabled)
        .bind(nodes_json)
        .bind(&update.updater)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateEnabledFlowLevel {
                    project: current.project.0.clone(),
                    level: current.level.to_string(),
                }
            } else {
                StoreError::Database(e)
            }
        })?;
        row.into_domain()
    }

    #[tracing::instrument(skip(self), name = "store.delete_flow")]
    async fn delete_flow(&self, id: FlowId) -> Result<(), StoreError> {
        sqlx::query("UPDATE approval_flows SET deleted_at = $2 WHERE id = $1")
            .bind(id.0)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), name = "store.flow_has_executions")]
    async fn flow_has_executions(&self, id: FlowId) -> Result<bool, StoreError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM approval_flow_executions WHERE flow_id = $1)",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    #[tracing::instrument(skip(self), name = "store.list_active_execution_for_issue")]
    async fn list_active_execution_for_issue(
        &self,
        issue_id: &IssueId,
    ) -> Result<Option<ApprovalFlowExecution>, StoreError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM approval_flow_executions WHERE issue_id = $1 AND status IN ('pending', 'in_progress')",
        )
        .bind(&issue_id.0)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some((id,)) => self.fetch_execution_aggregate(id).await,
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self), name = "store.get_execution")]
    async fn get_execution(
        &self,
        id: ExecutionId,
    ) -> Result<Option<ApprovalFlowExecution>, StoreError> {
        self.fetch_execution_aggregate(id.0).await
    }

    #[tracing::instrument(skip(self), name = "store.list_executions")]
    async fn list_executions(
        &self,
        project: &ProjectId,
    ) -> Result<Vec<ApprovalFlowExecution>, StoreError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT e.id FROM approval_flow_executions e
            JOIN approval_flows f ON f.id = e.flow_id
            WHERE f.project = $1
            ORDER BY e.create_time
            "#,
        )
        .bind(&project.0)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(ids.len());
        for (id,) in ids {
            if let Some(exec) = self.fetch_execution_aggregate(id).await? {
                out.push(exec);
            }
        }
        Ok(out)
    }

    #[tracing::instrument(skip(self, execution), name = "store.tx")]
    async fn begin_execution(
        &self,
        execution: NewExecution,
    ) -> Result<ApprovalFlowExecution, StoreError> {
        let mut tx = self.pool.begin().await?;
        let id = Uuid::new_v4();
        let now = Utc::now();

        let insert = sqlx::query(
            r#"
            INSERT INTO approval_flow_executions
                (id, flow_id, issue_id, level, status, current_position, creator, create_time, update_time)
            VALUES ($1, $2, $3, $4, 'in_progress', $5, $6, $7, $7)
            "#,
        )
        .bind(id)
        .bind(execution.flow_id.0)
        .bind(&execution.issue_id.0)
        .bind(crate::rows::LevelRow::from(execution.level))
        .bind(execution.node_ids.first().map(|(_, pos)| *pos as i32))
        .bind(&execution.creator)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            if is_unique_violation(&e) {
                return Err(StoreError::DuplicateActive { issue_id: execution.issue_id.0 });
            }
            return Err(StoreError::Database(e));
        }

        for (node_id, position) in &execution.node_ids {
            let status = if *position == 1 { "in_progress" } else { "pending" };
            sqlx::query(
                r#"
                INSERT INTO approval_node_executions (id, execution_id, node_id, position, status)
                VALUES ($1, $2, $3, $4, $5::node_execution_status)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(node_id.0)
            .bind(*position as i32)
            .bind(status)
            .execute(&mut *tx)
            .await?;
        }

        for notification in &execution.notifications {
            sqlx::query(
                r#"
                INSERT INTO notifications
                    (id, kind, title, body, recipient, execution_ref, node_ref, approval_ref, read, create_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(notification.id.0)
            .bind(crate::rows::NotificationKindRow::from(notification.kind))
            .bind(&notification.title)
            .bind(&notification.body)
            .bind(&notification.recipient)
            .bind(notification.execution_ref.map(|r| r.0))
            .bind(notification.node_ref.map(|r| r.0))
            .bind(notification.approval_ref.map(|r| r.0))
            .bind(notification.read)
            .bind(notification.create_time)
            .execute(&mut *tx)
            .await?;
        }

        let aggregate = Self::fetch_execution_aggregate_tx(&mut tx, id).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    #[tracing::instrument(skip(self, advance), name = "store.tx")]
    async fn advance_execution(
        &self,
        advance: ExecutionAdvance,
    ) -> Result<ApprovalFlowExecution, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO approvals (id, node_execution_id, user_id, decision, comment, create_time)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(advance.approval.id.0)
        .bind(advance.node_execution_id.0)
        .bind(&advance.approval.user_id)
        .bind(crate::rows::DecisionRow::from(advance.approval.decision))
        .bind(&advance.approval.comment)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE approval_node_executions SET status = $2 WHERE id = $1")
            .bind(advance.node_execution_id.0)
            .bind(crate::rows::NodeExecutionStatusRow::from(advance.node_status))
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE approval_flow_executions SET status = $2, current_position = $3, update_time = $4 WHERE id = $1",
        )
        .bind(advance.execution_id.0)
        .bind(crate::rows::FlowExecutionStatusRow::from(advance.flow_status))
        .bind(advance.new_current_position.map(|p| p as i32))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if advance.new_current_position.is_some() {
            sqlx::query(
                r#"
                UPDATE approval_node_executions
                SET status = 'in_progress'
                WHERE execution_id = $1 AND position = $2 AND status = 'pending'
                "#,
            )
            .bind(advance.execution_id.0)
            .bind(advance.new_current_position.map(|p| p as i32))
            .execute(&mut *tx)
            .await?;
        }

        for notification in &advance.notifications {
            sqlx::query(
                r#"
                INSERT INTO notifications
                    (id, kind, title, body, recipient, execution_ref, node_ref, approval_ref, read, create_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(notification.id.0)
            .bind(crate::rows::NotificationKindRow::from(notification.kind))
            .bind(&notification.title)
            .bind(&notification.body)
            .bind(&notification.recipient)
            .bind(notification.execution_ref.map(|r| r.0))
            .bind(notification.node_ref.map(|r| r.0))
            .bind(notification.approval_ref.map(|r| r.0))
            .bind(notification.read)
            .bind(notification.create_time)
            .execute(&mut *tx)
            .await?;
        }

        let aggregate = Self::fetch_execution_aggregate_tx(&mut tx, advance.execution_id.0).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    #[tracing::instrument(skip(self, notifications), name = "store.tx")]
    async fn cancel_execution(
        &self,
        id: ExecutionId,
        notifications: Vec<Notification>,
    ) -> Result<ApprovalFlowExecution, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE approval_flow_executions SET status = 'cancelled', update_time = $2 WHERE id = $1",
        )
        .bind(id.0)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for notification in &notifications {
            sqlx::query(
                r#"
                INSERT INTO notifications
                    (id, kind, title, body, recipient, execution_ref, node_ref, approval_ref, read, create_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(notification.id.0)
            .bind(crate::rows::NotificationKindRow::from(notification.kind))
            .bind(&notification.title)
            .bind(&notification.body)
            .bind(&notification.recipient)
            .bind(notification.execution_ref.map(|r| r.0))
            .bind(notification.node_ref.map(|r| r.0))
            .bind(notification.approval_ref.map(|r| r.0))
            .bind(notification.read)
            .bind(notification.create_time)
            .execute(&mut *tx)
            .await?;
        }

        let aggregate = Self::fetch_execution_aggregate_tx(&mut tx, id.0).await?;
        tx.commit().await?;
        Ok(aggregate)
    }

    #[tracing::instrument(skip(self, changes), name = "store.record_changes")]
    async fn record_changes(&self, changes: Vec<SensitiveDataChange>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for change in changes {
            sqlx::query(
                r#"
                INSERT INTO sensitive_data_changes
                    (id, execution_id, issue_id, table_name, field_name, level, rule_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(change.id.0)
            .bind(change.execution_id.map(|e| e.0))
            .bind(&change.issue_id.0)
            .bind(&change.table)
            .bind(&change.field)
            .bind(crate::rows::LevelRow::from(change.level))
            .bind(change.rule_id.0)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), name = "store.list_notifications")]
    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            "SELECT * FROM notifications WHERE recipient = $1 ORDER BY create_time DESC",
        )
        .bind(recipient)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(NotificationRow::into_domain).collect())
    }

    #[tracing::instrument(skip(self), name = "store.mark_notification_read")]
    async fn mark_notification_read(&self, id: NotificationId) -> Result<(), StoreError> {
        sqlx::query("UPDATE notifications SET read = TRUE WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

