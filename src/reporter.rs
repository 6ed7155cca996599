//! Message reporter: the invocation's channel for human-readable progress,
//! warnings and errors, plus observer notifications.

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Progress,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub text: String,
}

impl Message {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Info,
            text: text.into(),
        }
    }

    pub fn progress(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Progress,
            text: text.into(),
        }
    }

    pub fn warn(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Warning,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            text: text.into(),
        }
    }
}

/// Structured notifications for UI observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    TransportsAnnounced(Vec<String>),
    TransportClosed(String),
}

pub trait Reporter: Send + Sync {
    fn handle(&self, message: Message);
    fn post(&self, notification: Notification);
}

/// Reporter that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn handle(&self, message: Message) {
        match message.kind {
            MessageKind::Info => info!(target: "bepstream::reporter", "{}", message.text),
            MessageKind::Progress => debug!(target: "bepstream::reporter", "{}", message.text),
            MessageKind::Warning => warn!(target: "bepstream::reporter", "{}", message.text),
            MessageKind::Error => error!(target: "bepstream::reporter", "{}", message.text),
        }
    }

    fn post(&self, notification: Notification) {
        debug!(target: "bepstream::reporter", ?notification, "notification");
    }
}

/// Reporter that records messages in memory. Hosts use it to render a summary
/// after a command; tests use it to assert on what the user would see.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    messages: Mutex<Vec<Message>>,
    notifications: Mutex<Vec<Notification>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }

    pub fn of_kind(&self, kind: MessageKind) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.kind == kind)
            .map(|m| m.text.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.of_kind(MessageKind::Warning)
    }

    pub fn errors(&self) -> Vec<String> {
        self.of_kind(MessageKind::Error)
    }

    pub fn closed_transports(&self) -> Vec<String> {
        self.notifications
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::TransportClosed(name) => Some(name.clone()),
                Notification::TransportsAnnounced(_) => None,
            })
            .collect()
    }
}

impl Reporter for CollectingReporter {
    fn handle(&self, message: Message) {
        if message.kind == MessageKind::Warning {
            warn!(target: "bepstream::reporter", "{}", message.text);
        }
        self.messages.lock().push(message);
    }

    fn post(&self, notification: Notification) {
        self.notifications.lock().push(notification);
    }
}
