//! Domain event to notification fan-out.
//!
//! The engine builds a [`DomainEvent`] for each state transition and hands
//! it here to turn into one [`Notification`] row per recipient (persisted
//! by the caller in the same transaction as the state transition) and to
//! dispatch to an injected [`EventSink`] after that transaction commits.
//! Sink failures must never fail the transition: `emit` is fire-and-forget
//! from the engine's point of view.

#![deny(unsafe_code)]

use approval_core::ids::{ApprovalId, ExecutionId, NodeExecutionId, NotificationId};
use approval_core::model::{Notification, NotificationKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Correlation ids a domain event carries, mirrored onto every
/// [`Notification`] it produces.
#[derive(Debug, Clone, Default)]
pub struct EventCorrelation {
    pub execution_ref: Option<ExecutionId>,
    pub node_ref: Option<NodeExecutionId>,
    pub approval_ref: Option<ApprovalId>,
}

/// A domain event raised by the execution engine.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub correlation: EventCorrelation,
}

impl DomainEvent {
    pub fn new(
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
        recipients: Vec<String>,
        correlation: EventCorrelation,
    ) -> Self {
        Self { kind, title: title.into(), body: body.into(), recipients, correlation }
    }
}

/// Errors raised while dispatching to the injected [`EventSink`]. Never
/// surfaced to callers as a transaction failure — only logged.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("event sink delivery failed: {reason}")]
    SinkFailed { reason: String },
}

/// External event delivery (email, IM, webhook). The core only guarantees
/// the `Notification` rows are durable; delivery beyond that is the
/// collaborator's concern.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: &DomainEvent) -> Result<(), NotifierError>;
}

/// An [`EventSink`] that drops every event; useful where no external
/// delivery collaborator is wired up (tests, or deployments that only
/// want the persisted `Notification` rows).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn emit(&self, _event: &DomainEvent) -> Result<(), NotifierError> {
        Ok(())
    }
}

/// Build one [`Notification`] row per recipient in `event`, stamped with
/// `now`. The caller persists these in the same transaction as the state
/// transition that produced the event.
pub fn build_notifications(event: &DomainEvent, now: DateTime<Utc>) -> Vec<Notification> {
    event
        .recipients
        .iter()
        .map(|recipient| Notification {
            id: NotificationId::new(),
            kind: event.kind,
            title: event.title.clone(),
            body: event.body.clone(),
            recipient: recipient.clone(),
            execution_ref: event.correlation.execution_ref,
            node_ref: event.correlation.node_ref,
            approval_ref: event.correlation.approval_ref,
            read: false,
            create_time: now,
        })
        .collect()
}

/// Dispatch `event` to `sink` after the owning transaction has committed.
/// Failures are logged and swallowed — there is no outbox; a stronger
/// delivery guarantee would need one.
pub async fn dispatch(sink: &dyn EventSink, event: &DomainEvent) {
    if let Err(err) = sink.emit(event).await {
        tracing::warn!(kind = ?event.kind, error = %err, "event sink delivery failed; notification rows remain durable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn build_notifications_one_per_recipient() {
        let event = DomainEvent::new(
            NotificationKind::ApprovalRequested,
            "Approval needed",
            "Please review",
            vec!["alice".into(), "bob".into()],
            EventCorrelation { execution_ref: Some(ExecutionId::new()), ..Default::default() },
        );
        let rows = build_notifications(&event, Utc::now());
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].recipient, "alice");
        assert_eq!(rows[1].recipient, "bob");
        assert!(!rows[0].read);
    }

    struct CountingSink {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventSink for CountingSink {
        async fn emit(&self, _event: &DomainEvent) -> Result<(), NotifierError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_calls_sink() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink { count: count.clone() };
        let event = DomainEvent::new(
            NotificationKind::FlowCompleted,
            "t",
            "b",
            vec!["alice".into()],
            EventCorrelation::default(),
        );
        dispatch(&sink, &event).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_swallows_sink_errors() {
        struct FailingSink;
        #[async_trait]
        impl EventSink for FailingSink {
            async fn emit(&self, _event: &DomainEvent) -> Result<(), NotifierError> {
                Err(NotifierError::SinkFailed { reason: "down".into() })
            }
        }
        let event = DomainEvent::new(
            NotificationKind::FlowCancelled,
            "t",
            "b",
            vec!["alice".into()],
            EventCorrelation::default(),
        );
        // Must not panic even though the sink fails.
        dispatch(&FailingSink, &event).await;
    }
}
