//! Conversions between the domain model and the generated `approval.v1`
//! protobuf types.

use approval_core::ids::{
    ApprovalId, ExecutionId, FlowId, NodeExecutionId, NodeId, ProjectId, RuleId,
};
use approval_core::model as domain;
use chrono::{DateTime, Utc};
use tonic::Status;
use uuid::Uuid;

use crate::approval_v1 as pb;

pub fn parse_uuid(field: &str, s: &str) -> Result<Uuid, Status> {
    Uuid::parse_str(s).map_err(|_| Status::invalid_argument(format!("invalid {field}: {s:?}")))
}

pub fn ms_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub fn time_to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn level_to_proto(level: domain::Level) -> pb::Level {
    match level {
        domain::Level::Unspecified => pb::Level::Unspecified,
        domain::Level::Low => pb::Level::Low,
        domain::Level::Medium => pb::Level::Medium,
        domain::Level::High => pb::Level::High,
    }
}

pub fn level_from_proto(level: i32) -> domain::Level {
    match pb::Level::try_from(level).unwrap_or(pb::Level::Unspecified) {
        pb::Level::Unspecified => domain::Level::Unspecified,
        pb::Level::Low => domain::Level::Low,
        pb::Level::Medium => domain::Level::Medium,
        pb::Level::High => domain::Level::High,
    }
}

pub fn approver_type_to_proto(t: domain::ApproverType) -> pb::ApproverType {
    match t {
        domain::ApproverType::User => pb::ApproverType::User,
        domain::ApproverType::Group => pb::ApproverType::Group,
        domain::ApproverType::Role => pb::ApproverType::Role,
        domain::ApproverType::SelfRequester => pb::ApproverType::SelfRequester,
    }
}

pub fn approver_type_from_proto(t: i32) -> Result<domain::ApproverType, Status> {
    match pb::ApproverType::try_from(t).unwrap_or(pb::ApproverType::Unspecified) {
        pb::ApproverType::User => Ok(domain::ApproverType::User),
        pb::ApproverType::Group => Ok(domain::ApproverType::Group),
        pb::ApproverType::Role => Ok(domain::ApproverType::Role),
        pb::ApproverType::SelfRequester => Ok(domain::ApproverType::SelfRequester),
        pb::ApproverType::Unspecified => {
            Err(Status::invalid_argument("approver_type must be set"))
        }
    }
}

pub fn approval_type_to_proto(t: domain::ApprovalType) -> pb::ApprovalType {
    match t {
        domain::ApprovalType::All => pb::ApprovalType::All,
        domain::ApprovalType::Any => pb::ApprovalType::Any,
    }
}

pub fn approval_type_from_proto(t: i32) -> Result<domain::ApprovalType, Status> {
    match pb::ApprovalType::try_from(t).unwrap_or(pb::ApprovalType::Unspecified) {
        pb::ApprovalType::All => Ok(domain::ApprovalType::All),
        pb::ApprovalType::Any => Ok(domain::ApprovalType::Any),
        pb::ApprovalType::Unspecified => {
            Err(Status::invalid_argument("approval_type must be set"))
        }
    }
}

pub fn decision_from_proto(d: i32) -> Result<domain::Decision, Status> {
    match pb::Decision::try_from(d).unwrap_or(pb::Decision::Unspecified) {
        pb::Decision::Approved => Ok(domain::Decision::Approved),
        pb::Decision::Rejected => Ok(domain::Decision::Rejected),
        pb::Decision::Unspecified => Err(Status::invalid_argument("decision must be set")),
    }
}

pub fn decision_to_proto(d: domain::Decision) -> pb::Decision {
    match d {
        domain::Decision::Approved => pb::Decision::Approved,
        domain::Decision::Rejected => pb::Decision::Rejected,
    }
}

pub fn flow_status_to_proto(s: domain::FlowExecutionStatus) -> pb::FlowExecutionStatus {
    match s {
        domain::FlowExecutionStatus::Pending => pb::FlowExecutionStatus::Pending,
        domain::FlowExecutionStatus::InProgress => pb::FlowExecutionStatus::InProgress,
        domain::FlowExecutionStatus::Approved => pb::FlowExecutionStatus::Approved,
        domain::FlowExecutionStatus::Rejected => pb::FlowExecutionStatus::Rejected,
        domain::FlowExecutionStatus::Cancelled => pb::FlowExecutionStatus::Cancelled,
    }
}

pub fn node_status_to_proto(s: domain::NodeExecutionStatus) -> pb::NodeExecutionStatus {
    match s {
        domain::NodeExecutionStatus::Pending => pb::NodeExecutionStatus::Pending,
        domain::NodeExecutionStatus::InProgress => pb::NodeExecutionStatus::InProgress,
        domain::NodeExecutionStatus::Approved => pb::NodeExecutionStatus::Approved,
        domain::NodeExecutionStatus::Rejected => pb::NodeExecutionStatus::Rejected,
        domain::NodeExecutionStatus::Skipped => pb::NodeExecutionStatus::Skipped,
    }
}

pub fn field_pattern_to_proto(f: &domain::FieldPattern) -> pb::FieldPattern {
    pb::FieldPattern { name_or_glob: f.name_or_glob.clone(), regex: f.regex.clone().unwrap_or_default() }
}

pub fn field_pattern_from_proto(f: pb::FieldPattern) -> domain::FieldPattern {
    domain::FieldPattern {
        name_or_glob: f.name_or_glob,
        regex: if f.regex.is_empty() { None } else { Some(f.regex) },
    }
}

pub fn rule_to_proto(rule: &domain::SensitiveDataRule) -> pb::SensitiveDataRule {
    pb::SensitiveDataRule {
        id: rule.id.to_string(),
        project: rule.project.0.clone(),
        title: rule.title.clone(),
        level: level_to_proto(rule.level) as i32,
        enabled: rule.enabled,
        table_pattern: rule.table_pattern.clone().unwrap_or_default(),
        field_patterns: rule.field_patterns.iter().map(field_pattern_to_proto).collect(),
        creator: rule.creator.clone(),
        updater: rule.updater.clone(),
        create_time_unix_ms: time_to_ms(rule.create_time),
        update_time_unix_ms: time_to_ms(rule.update_time),
    }
}

pub fn node_to_proto(node: &domain::ApprovalNode) -> pb::ApprovalNode {
    pb::ApprovalNode {
        id: node.id.to_string(),
        flow_id: node.flow_id.to_string(),
        position: node.position,
        title: node.title.clone(),
        approver_type: approver_type_to_proto(node.approver_type) as i32,
        approver_ids: node.approver_ids.clone(),
        approval_type: approval_type_to_proto(node.approval_type) as i32,
        required_approvals: node.required_approvals,
    }
}

/// Parse a request-supplied node. `flow_id` is not trusted from the wire:
/// the caller assigns it, since a node belongs to exactly one flow, fixed
/// at creation.
pub fn node_from_proto(n: pb::ApprovalNode, flow_id: FlowId) -> Result<domain::ApprovalNode, Status> {
    Ok(domain::ApprovalNode {
        id: NodeId::new(),
        flow_id,
        position: n.position,
        title: n.title,
        approver_type: approver_type_from_proto(n.approver_type)?,
        approver_ids: n.approver_ids,
        approval_type: approval_type_from_proto(n.approval_type)?,
        required_approvals: n.required_approvals,
    })
}

pub fn flow_to_proto(flow: &domain::ApprovalFlow) -> pb::ApprovalFlow {
    pb::ApprovalFlow {
        id: flow.id.to_string(),
        project: flow.project.0.clone(),
        title: flow.title.clone(),
        level: level_to_proto(flow.level) as i32,
        enabled: flow.enabled,
        nodes: flow.nodes.iter().map(node_to_proto).collect(),
        creator: flow.creator.clone(),
        updater: flow.updater.clone(),
        create_time_unix_ms: time_to_ms(flow.create_time),
        update_time_unix_ms: time_to_ms(flow.update_time),
    }
}

pub fn approval_to_proto(a: &domain::Approval) -> pb::Approval {
    pb::Approval {
        id: a.id.to_string(),
        node_execution_id: a.node_execution_id.to_string(),
        user_id: a.user_id.clone(),
        decision: decision_to_proto(a.decision) as i32,
        comment: a.comment.clone(),
        create_time_unix_ms: time_to_ms(a.create_time),
    }
}

pub fn node_execution_to_proto(ne: &domain::ApprovalNodeExecution) -> pb::ApprovalNodeExecution {
    pb::ApprovalNodeExecution {
        id: ne.id.to_string(),
        execution_id: ne.execution_id.to_string(),
        node_id: ne.node_id.to_string(),
        position: ne.position,
        status: node_status_to_proto(ne.status) as i32,
        approvals: ne.approvals.iter().map(approval_to_proto).collect(),
    }
}

pub fn execution_to_proto(e: &domain::ApprovalFlowExecution) -> pb::ApprovalFlowExecution {
    pb::ApprovalFlowExecution {
        id: e.id.to_string(),
        flow_id: e.flow_id.to_string(),
        issue_id: e.issue_id.0.clone(),
        level: level_to_proto(e.level) as i32,
        status: flow_status_to_proto(e.status) as i32,
        current_position: e.current_position,
        node_executions: e.node_executions.iter().map(node_execution_to_proto).collect(),
        creator: e.creator.clone(),
        create_time_unix_ms: time_to_ms(e.create_time),
        update_time_unix_ms: time_to_ms(e.update_time),
    }
}

pub fn project_id(s: &str) -> ProjectId {
    ProjectId::from(s)
}

pub fn rule_id(s: &str) -> Result<RuleId, Status> {
    Ok(RuleId(parse_uuid("id", s)?))
}

pub fn flow_id(s: &str) -> Result<FlowId, Status> {
    Ok(FlowId(parse_uuid("flow_id", s)?))
}

pub fn execution_id(s: &str) -> Result<ExecutionId, Status> {
    Ok(ExecutionId(parse_uuid("execution_id", s)?))
}

pub fn node_execution_id(s: &str) -> Result<NodeExecutionId, Status> {
    Ok(NodeExecutionId(parse_uuid("node_execution_id", s)?))
}

pub fn approval_id(s: &str) -> Result<ApprovalId, Status> {
    Ok(ApprovalId(parse_uuid("approval_id", s)?))
}
