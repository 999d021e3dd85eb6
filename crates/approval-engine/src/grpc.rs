//! The `approval.v1.ApprovalEngine` gRPC service: CRUD passthroughs to
//! persistence plus the `BeginExecution`/`RecordDecision`/`CancelExecution`/
//! `CheckPlan` entry points wired to the execution engine and gate.

use std::sync::Arc;

use approval_core::error::{ApprovalError, ErrorKind};
use persistence_pg::{FlowUpdate, NewFlow, NewRule, PersistenceAdapter, RuleUpdate};
use tonic::{Request, Response, Status};
use tracing::instrument;

use crate::approval_v1::{
    self as pb,
    approval_engine_server::{ApprovalEngine as ApprovalEngineRpc, ApprovalEngineServer},
};
use crate::authority::AuthorityResolver;
use crate::convert;
use crate::engine::ExecutionEngine;
use crate::gate::{ChangeExtractor, Gate};

pub fn status_for(err: ApprovalError) -> Status {
    let message = err.to_string();
    match err.kind() {
        ErrorKind::Validation => Status::invalid_argument(message),
        ErrorKind::Precondition => Status::failed_precondition(message),
        ErrorKind::NotFound => Status::not_found(message),
        ErrorKind::Permission => Status::permission_denied(message),
        ErrorKind::Conflict => Status::already_exists(message),
        ErrorKind::Internal => Status::internal(message),
    }
}

fn check_auth(md: &tonic::metadata::MetadataMap) -> Result<(), Status> {
    if let Ok(Some(required)) =
        std::env::var("APPROVAL_ENGINE_AUTH_TOKEN").map(|s| if s.is_empty() { None } else { Some(s) })
    {
        match md.get("authorization").and_then(|v| v.to_str().ok()) {
            Some(got) if got == required => Ok(()),
            _ => Err(Status::unauthenticated("invalid authorization")),
        }
    } else {
        Ok(())
    }
}

/// Service state: the persistence adapter plus the engine and gate
/// collaborators built on top of it.
pub struct ApprovalEngineService {
    store: Arc<dyn PersistenceAdapter>,
    engine: Arc<ExecutionEngine>,
    gate: Arc<Gate>,
    resolver: Arc<dyn AuthorityResolver>,
}

impl ApprovalEngineService {
    pub fn new(
        store: Arc<dyn PersistenceAdapter>,
        engine: Arc<ExecutionEngine>,
        extractor: Arc<dyn ChangeExtractor>,
        resolver: Arc<dyn AuthorityResolver>,
        allow_builtin_defaults: bool,
    ) -> Self {
        let gate = Arc::new(Gate::new(store.clone(), engine.clone(), extractor, allow_builtin_defaults));
        Self { store, engine, gate, resolver }
    }

    pub fn into_server(self) -> ApprovalEngineServer<Self> {
        ApprovalEngineServer::new(self)
    }
}

#[tonic::async_trait]
impl ApprovalEngineRpc for ApprovalEngineService {
    #[instrument(skip_all)]
    async fn list_rules(
        &self,
        req: Request<pb::ListRulesRequest>,
    ) -> Result<Response<pb::ListRulesResponse>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let rules = self
            .store
            .list_rules(&convert::project_id(&r.project))
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?;
        Ok(Response::new(pb::ListRulesResponse {
            rules: rules.iter().map(convert::rule_to_proto).collect(),
        }))
    }

    #[instrument(skip_all)]
    async fn get_rule(
        &self,
        req: Request<pb::GetRuleRequest>,
    ) -> Result<Response<pb::SensitiveDataRule>, Status> {
        check_auth(req.metadata())?;
        let id = convert::rule_id(&req.into_inner().id)?;
        let rule = self
            .store
            .get_rule(id)
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?
            .ok_or_else(|| status_for(ApprovalError::RuleNotFound { id: id.to_string() }))?;
        Ok(Response::new(convert::rule_to_proto(&rule)))
    }

    #[instrument(skip_all)]
    async fn create_rule(
        &self,
        req: Request<pb::CreateRuleRequest>,
    ) -> Result<Response<pb::SensitiveDataRule>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        if r.title.is_empty() {
            return Err(Status::invalid_argument("title must not be empty"));
        }
        let rule = self
            .store
            .create_rule(NewRule {
                project: convert::project_id(&r.project),
                title: r.title,
                level: convert::level_from_proto(r.level),
                enabled: r.enabled,
                table_pattern: if r.table_pattern.is_empty() { None } else { Some(r.table_pattern) },
                field_patterns: r.field_patterns.into_iter().map(convert::field_pattern_from_proto).collect(),
                creator: r.creator,
            })
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?;
        Ok(Response::new(convert::rule_to_proto(&rule)))
    }

    #[instrument(skip_all)]
    async fn update_rule(
        &self,
        req: Request<pb::UpdateRuleRequest>,
    ) -> Result<Response<pb::SensitiveDataRule>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let id = convert::rule_id(&r.id)?;
        let rule = self
            .store
            .update_rule(
                id,
                RuleUpdate {
                    title: r.title,
                    level: r.level.map(convert::level_from_proto),
                    enabled: r.enabled,
                    table_pattern: r
                        .table_pattern
                        .map(|p| if p.is_empty() { None } else { Some(p) }),
                    field_patterns: if r.field_patterns.is_empty() {
                        None
                    } else {
                        Some(r.field_patterns.into_iter().map(convert::field_pattern_from_proto).collect())
                    },
                    updater: r.updater,
                },
            )
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?;
        Ok(Response::new(convert::rule_to_proto(&rule)))
    }

    #[instrument(skip_all)]
    async fn delete_rule(
        &self,
        req: Request<pb::DeleteRuleRequest>,
    ) -> Result<Response<pb::DeleteRuleResponse>, Status> {
        check_auth(req.metadata())?;
        let id = convert::rule_id(&req.into_inner().id)?;
        self.store.delete_rule(id).await.map_err(crate::engine::map_store_err).map_err(status_for)?;
        Ok(Response::new(pb::DeleteRuleResponse {}))
    }

    #[instrument(skip_all)]
    async fn list_flows(
        &self,
        req: Request<pb::ListFlowsRequest>,
    ) -> Result<Response<pb::ListFlowsResponse>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let flows = self
            .store
            .list_flows(&convert::project_id(&r.project))
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?;
        Ok(Response::new(pb::ListFlowsResponse {
            flows: flows.iter().map(convert::flow_to_proto).collect(),
        }))
    }

    #[instrument(skip_all)]
    async fn get_flow(
        &self,
        req: Request<pb::GetFlowRequest>,
    ) -> Result<Response<pb::ApprovalFlow>, Status> {
        check_auth(req.metadata())?;
        let id = convert::flow_id(&req.into_inner().id)?;
        let flow = self
            .store
            .get_flow(id)
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?
            .ok_or_else(|| status_for(ApprovalError::FlowNotFound { id: id.to_string() }))?;
        Ok(Response::new(convert::flow_to_proto(&flow)))
    }

    #[instrument(skip_all)]
    async fn create_flow(
        &self,
        req: Request<pb::CreateFlowRequest>,
    ) -> Result<Response<pb::ApprovalFlow>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        if r.nodes.is_empty() {
            return Err(Status::invalid_argument("a flow must have at least one node"));
        }
        let flow_id = approval_core::ids::FlowId::new();
        let mut nodes = Vec::with_capacity(r.nodes.len());
        for (position, node) in r.nodes.into_iter().enumerate() {
            let mut parsed = convert::node_from_proto(node, flow_id)?;
            parsed.position = position as u32 + 1;
            nodes.push(parsed);
        }
        let flow = self
            .store
            .create_flow(NewFlow {
                project: convert::project_id(&r.project),
                title: r.title,
                level: convert::level_from_proto(r.level),
                enabled: r.enabled,
                nodes,
                creator: r.creator,
            })
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?;
        Ok(Response::new(convert::flow_to_proto(&flow)))
    }

    #[instrument(skip_all)]
    async fn update_flow(
        &self,
        req: Request<pb::UpdateFlowRequest>,
    ) -> Result<Response<pb::ApprovalFlow>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let id = convert::flow_id(&r.id)?;
        if self.store.flow_has_executions(id).await.map_err(crate::engine::map_store_err).map_err(status_for)?
            && !r.nodes.is_empty()
        {
            return Err(status_for(ApprovalError::FlowInUse { flow_id: id.to_string() }));
        }
        let nodes = if r.nodes.is_empty() {
            None
        } else {
            let mut nodes = Vec::with_capacity(r.nodes.len());
            for (position, node) in r.nodes.into_iter().enumerate() {
                let mut parsed = convert::node_from_proto(node, id)?;
                parsed.position = position as u32 + 1;
                nodes.push(parsed);
            }
            Some(nodes)
        };
        let flow = self
            .store
            .update_flow(id, FlowUpdate { title: r.title, enabled: r.enabled, nodes, updater: r.updater })
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?;
        Ok(Response::new(convert::flow_to_proto(&flow)))
    }

    #[instrument(skip_all)]
    async fn delete_flow(
        &self,
        req: Request<pb::DeleteFlowRequest>,
    ) -> Result<Response<pb::DeleteFlowResponse>, Status> {
        check_auth(req.metadata())?;
        let id = convert::flow_id(&req.into_inner().id)?;
        self.store.delete_flow(id).await.map_err(crate::engine::map_store_err).map_err(status_for)?;
        Ok(Response::new(pb::DeleteFlowResponse {}))
    }

    #[instrument(skip_all)]
    async fn list_executions(
        &self,
        req: Request<pb::ListExecutionsRequest>,
    ) -> Result<Response<pb::ListExecutionsResponse>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let executions = self
            .store
            .list_executions(&convert::project_id(&r.project))
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?;
        Ok(Response::new(pb::ListExecutionsResponse {
            executions: executions.iter().map(convert::execution_to_proto).collect(),
        }))
    }

    #[instrument(skip_all)]
    async fn get_execution(
        &self,
        req: Request<pb::GetExecutionRequest>,
    ) -> Result<Response<pb::ApprovalFlowExecution>, Status> {
        check_auth(req.metadata())?;
        let id = convert::execution_id(&req.into_inner().id)?;
        let execution = self
            .engine
            .get_execution(id)
            .await
            .map_err(status_for)?
            .ok_or_else(|| status_for(ApprovalError::ExecutionNotFound { id: id.to_string() }))?;
        Ok(Response::new(convert::execution_to_proto(&execution)))
    }

    #[instrument(skip_all)]
    async fn begin_execution(
        &self,
        req: Request<pb::BeginExecutionRequest>,
    ) -> Result<Response<pb::ApprovalFlowExecution>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let flow_id = convert::flow_id(&r.flow_id)?;
        let flow = self
            .store
            .get_flow(flow_id)
            .await
            .map_err(crate::engine::map_store_err)
            .map_err(status_for)?
            .ok_or_else(|| status_for(ApprovalError::FlowNotFound { id: flow_id.to_string() }))?;
        let execution = self
            .engine
            .begin_execution(&flow, approval_core::ids::IssueId::from(r.issue_id.as_str()), r.creator)
            .await
            .map_err(status_for)?;
        Ok(Response::new(convert::execution_to_proto(&execution)))
    }

    #[instrument(skip_all)]
    async fn record_decision(
        &self,
        req: Request<pb::RecordDecisionRequest>,
    ) -> Result<Response<pb::RecordDecisionResponse>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let execution_id = convert::execution_id(&r.execution_id)?;
        let decision = convert::decision_from_proto(r.decision)?;
        let (node_status, flow_status) = self
            .engine
            .record_decision(execution_id, r.position, &r.actor, decision, r.comment, self.resolver.as_ref())
            .await
            .map_err(status_for)?;
        Ok(Response::new(pb::RecordDecisionResponse {
            node_status: convert::node_status_to_proto(node_status) as i32,
            flow_status: convert::flow_status_to_proto(flow_status) as i32,
        }))
    }

    #[instrument(skip_all)]
    async fn cancel_execution(
        &self,
        req: Request<pb::CancelExecutionRequest>,
    ) -> Result<Response<pb::ApprovalFlowExecution>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let execution_id = convert::execution_id(&r.execution_id)?;
        let execution = self
            .engine
            .cancel(execution_id, &r.actor, r.reason, self.resolver.as_ref())
            .await
            .map_err(status_for)?;
        Ok(Response::new(convert::execution_to_proto(&execution)))
    }

    #[instrument(skip_all)]
    async fn check_plan(
        &self,
        req: Request<pb::CheckPlanRequest>,
    ) -> Result<Response<pb::CheckPlanResponse>, Status> {
        check_auth(req.metadata())?;
        let r = req.into_inner();
        let verdict = self
            .gate
            .check_plan(
                &convert::project_id(&r.project),
                approval_core::ids::IssueId::from(r.issue_id.as_str()),
                &r.creator,
                &r.sql,
                &r.database,
            )
            .await
            .map_err(status_for)?;
        Ok(Response::new(match verdict {
            crate::gate::Verdict::Admit => pb::CheckPlanResponse {
                verdict: pb::check_plan_response::Verdict::Admit as i32,
                execution_id: String::new(),
                reason: String::new(),
            },
            crate::gate::Verdict::Block { execution_id } => pb::CheckPlanResponse {
                verdict: pb::check_plan_response::Verdict::Block as i32,
                execution_id,
                reason: String::new(),
            },
            crate::gate::Verdict::Deny { reason } => pb::CheckPlanResponse {
                verdict: pb::check_plan_response::Verdict::Deny as i32,
                execution_id: String::new(),
                reason,
            },
        }))
    }
}
