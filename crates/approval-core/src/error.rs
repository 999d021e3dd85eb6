//! Error taxonomy for the approval engine.

use thiserror::Error;

/// Errors surfaced by the core's collaborating components.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("flow {flow_id} is disabled")]
    FlowDisabled { flow_id: String },

    #[error("an active execution already exists for issue {issue_id}")]
    DuplicateActive { issue_id: String },

    #[error("flow {flow_id} has no nodes")]
    EmptyFlow { flow_id: String },

    #[error("execution {execution_id} is not active")]
    NotActive { execution_id: String },

    #[error("decision targets position {got} but current position is {want}")]
    NotCurrentPosition { got: u32, want: u32 },

    #[error("flow {flow_id} structure cannot change while executions reference it")]
    FlowInUse { flow_id: String },

    #[error("rule not found: {id}")]
    RuleNotFound { id: String },

    #[error("flow not found: {id}")]
    FlowNotFound { id: String },

    #[error("execution not found: {id}")]
    ExecutionNotFound { id: String },

    #[error("node execution not found: {id}")]
    NodeExecutionNotFound { id: String },

    #[error("actor {actor} is not authorised to decide at this node")]
    Unauthorised { actor: String },

    #[error("actor {actor} already recorded a decision for node execution {node_execution_id}")]
    DuplicateDecision { actor: String, node_execution_id: String },

    #[error("a rule named {title:?} already exists in project {project}")]
    DuplicateRuleTitle { project: String, title: String },

    #[error("project {project} already has an enabled flow at level {level}")]
    DuplicateEnabledFlowLevel { project: String, level: String },

    #[error("no approval flow is configured for the matched sensitivity level")]
    NoFlowConfigured,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ApprovalError {
    /// Broad error category, used by transport layers to map onto
    /// protocol-specific status codes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApprovalError::InvalidArgument { .. } => ErrorKind::Validation,
            ApprovalError::FlowDisabled { .. }
            | ApprovalError::DuplicateActive { .. }
            | ApprovalError::EmptyFlow { .. }
            | ApprovalError::NotActive { .. }
            | ApprovalError::NotCurrentPosition { .. }
            | ApprovalError::FlowInUse { .. } => ErrorKind::Precondition,
            ApprovalError::RuleNotFound { .. }
            | ApprovalError::FlowNotFound { .. }
            | ApprovalError::ExecutionNotFound { .. }
            | ApprovalError::NodeExecutionNotFound { .. } => ErrorKind::NotFound,
            ApprovalError::Unauthorised { .. } => ErrorKind::Permission,
            ApprovalError::DuplicateDecision { .. }
            | ApprovalError::DuplicateRuleTitle { .. }
            | ApprovalError::DuplicateEnabledFlowLevel { .. } => ErrorKind::Conflict,
            ApprovalError::NoFlowConfigured => ErrorKind::Precondition,
            ApprovalError::Internal { .. } => ErrorKind::Internal,
        }
    }
}

/// Coarse error category used for transport-agnostic status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Precondition,
    NotFound,
    Permission,
    Conflict,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_matches_taxonomy() {
        assert_eq!(
            ApprovalError::NotCurrentPosition { got: 2, want: 1 }.kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            ApprovalError::RuleNotFound { id: "r1".into() }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(ApprovalError::NoFlowConfigured.kind(), ErrorKind::Precondition);
    }
}
