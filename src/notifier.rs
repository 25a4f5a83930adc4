//! Notification boundary
//!
//! The engine emits events; delivery and storage are the collaborator's
//! responsibility. Notifier failures never fail the operation that produced
//! the event, so implementations should be fast and non-blocking.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Notification delivery errors
#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    /// The sink could not accept the event
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Result type for notifier operations
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Kinds of events the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// Reminder to a member who has not yet voted
    VoteReminder,
    /// A request's status changed
    StatusChange,
}

/// An event pushed to the notification sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// The user the event is addressed to
    pub user_id: String,
    /// Human-readable message
    pub message: String,
    /// The kind of event
    pub kind: NotificationKind,
    /// The group or request the event relates to
    pub related_id: String,
}

/// A sink for engine events
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Push one event into the sink
    async fn emit(&self, event: NotificationEvent) -> NotifyResult<()>;
}

/// Notifier that discards every event
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn emit(&self, _event: NotificationEvent) -> NotifyResult<()> {
        Ok(())
    }
}

/// Notifier that collects events in memory, for tests
pub struct RecordingNotifier {
    events: RwLock<Vec<NotificationEvent>>,
}

impl RecordingNotifier {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    /// Snapshot of everything emitted so far
    pub async fn events(&self) -> Vec<NotificationEvent> {
        self.events.read().await.clone()
    }

    /// Events of one kind, in emission order
    pub async fn events_of_kind(&self, kind: NotificationKind) -> Vec<NotificationEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn emit(&self, event: NotificationEvent) -> NotifyResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}
