//! Build event schema.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One entry of the build event stream.
///
/// `sequence` is zero until the streamer assigns it; sequences start at 1 and
/// are contiguous within an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    #[serde(default)]
    pub sequence: u64,
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    /// Marks the final event of the stream; posting it closes the streamer.
    #[serde(default, skip_serializing_if = "is_false")]
    pub last_message: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl BuildEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            sequence: 0,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: kind.into(),
            payload,
            last_message: false,
        }
    }

    /// The final event of a stream.
    pub fn last(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            last_message: true,
            ..Self::new(kind, payload)
        }
    }

    /// Synthetic event delivered to every sink when the stream is aborted.
    pub fn aborted(reason: AbortReason) -> Self {
        Self::last(
            "aborted",
            json!({ "reason": reason.as_str(), "description": reason.description() }),
        )
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Why a stream was closed before its last event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Internal,
    UserInterrupted,
}

impl AbortReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::Internal => "internal",
            AbortReason::UserInterrupted => "user_interrupted",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            AbortReason::Internal => "aborted due to an internal error",
            AbortReason::UserInterrupted => "aborted by the user",
        }
    }
}
