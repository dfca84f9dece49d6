//! Outbound notifications and approval requests
//!
//! The pipeline talks to humans only through the [`Notifier`] trait. Delivery
//! is best-effort: a failed notification is logged and counted, never allowed
//! to stop remediation.

pub mod throttle;

pub use throttle::ThrottledNotifier;

use crate::alerts::{AlertId, Priority};
use crate::error::NotifyError;
use crate::events::Timestamp;
use crate::remediation::ApprovalRequest;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc;

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    AlertOpened,
    AlertEscalated,
    ActionExecuted,
    ActionFailed,
    ActionDenied,
    /// Emitted by `notify_only` actions
    Advisory,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NotificationKind::AlertOpened => "alert opened",
            NotificationKind::AlertEscalated => "alert escalated",
            NotificationKind::ActionExecuted => "action executed",
            NotificationKind::ActionFailed => "action failed",
            NotificationKind::ActionDenied => "action denied",
            NotificationKind::Advisory => "advisory",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub kind: NotificationKind,
    pub alert_id: Option<AlertId>,
    pub service: String,
    pub priority: Priority,
    pub title: String,
    pub body: String,
    pub created_at: Timestamp,
}

impl NotificationRequest {
    pub fn new(
        kind: NotificationKind,
        service: impl Into<String>,
        priority: Priority,
        title: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            alert_id: None,
            service: service.into(),
            priority,
            title: title.into(),
            body: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_alert(mut self, alert_id: AlertId) -> Self {
        self.alert_id = Some(alert_id);
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

/// Delivery channel for notifications and approval requests
pub trait Notifier: Send + Sync {
    /// Deliver a notification
    ///
    /// # Errors
    ///
    /// Returns `NotifyError` if the channel rejected the message.
    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError>;

    /// Ask a human to approve or reject a proposal
    fn request_approval(&self, request: &ApprovalRequest) -> Result<(), NotifyError>;

    /// Deliver anything held back, returning how many messages went out
    fn flush(&self) -> Result<usize, NotifyError> {
        Ok(0)
    }
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        match request.priority {
            Priority::P1 => warn!(
                "[{}] {} ({}): {} {}",
                request.priority, request.kind, request.service, request.title, request.body
            ),
            _ => info!(
                "[{}] {} ({}): {} {}",
                request.priority, request.kind, request.service, request.title, request.body
            ),
        }
        Ok(())
    }

    fn request_approval(&self, request: &ApprovalRequest) -> Result<(), NotifyError> {
        warn!(
            "APPROVAL NEEDED for alert {}: {} on '{}' ({} risk). {} (expires {})",
            request.alert_id,
            request.proposal.kind,
            request.proposal.target,
            request.proposal.risk,
            request.rationale,
            request.expires_at.to_rfc3339()
        );
        Ok(())
    }
}

/// Message delivered by [`ChannelNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub enum NotifierMessage {
    Notification(NotificationRequest),
    Approval(ApprovalRequest),
}

/// Forwards everything to an mpsc channel, for embedding and tests
#[derive(Debug)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<NotifierMessage>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::Receiver<NotifierMessage>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError> {
        self.sender
            .send(NotifierMessage::Notification(request.clone()))
            .map_err(|_| NotifyError::ChannelClosed)
    }

    fn request_approval(&self, request: &ApprovalRequest) -> Result<(), NotifyError> {
        self.sender
            .send(NotifierMessage::Approval(request.clone()))
            .map_err(|_| NotifyError::ChannelClosed)
    }
}
