//! Approver membership resolution, consumed when a `GROUP`/`ROLE` node
//! needs to check whether an actor is a member.

use approval_core::model::ApproverType;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// `hasRole(userId, approverType, approverIds, context) -> bool`. `context`
/// carries the project the node's flow belongs to, for resolvers that scope
/// membership per project.
#[async_trait]
pub trait AuthorityResolver: Send + Sync {
    async fn has_role(
        &self,
        user_id: &str,
        approver_type: ApproverType,
        approver_ids: &[String],
        project: &str,
    ) -> bool;
}

/// In-memory membership table, keyed by `(project, approver_id)` →
/// member user ids. Used in tests and deployments with no external
/// identity system wired up.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthorityResolver {
    members: HashMap<(String, String), HashSet<String>>,
}

impl StaticAuthorityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `user_id` membership in `approver_id` (a group or role name)
    /// within `project`.
    pub fn grant(mut self, project: impl Into<String>, approver_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.members
            .entry((project.into(), approver_id.into()))
            .or_default()
            .insert(user_id.into());
        self
    }
}

#[async_trait]
impl AuthorityResolver for StaticAuthorityResolver {
    async fn has_role(
        &self,
        user_id: &str,
        approver_type: ApproverType,
        approver_ids: &[String],
        project: &str,
    ) -> bool {
        match approver_type {
            ApproverType::User => approver_ids.iter().any(|id| id == user_id),
            ApproverType::Group | ApproverType::Role => approver_ids.iter().any(|approver_id| {
                self.members
                    .get(&(project.to_string(), approver_id.clone()))
                    .is_some_and(|members| members.contains(user_id))
            }),
            // SELF is resolved against the execution's recorded creator by
            // the engine, not here (it has no approver_ids to check).
            ApproverType::SelfRequester => false,
        }
    }
}
