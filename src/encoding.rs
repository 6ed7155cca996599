//! File encodings for the build event stream.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::BuildEvent;

/// Encoding of a local build event file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventEncoding {
    Text,
    Json,
    Binary,
}

impl EventEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            EventEncoding::Text => "text",
            EventEncoding::Json => "json",
            EventEncoding::Binary => "binary",
        }
    }

    /// Render one event in this encoding.
    pub fn encode(self, event: &BuildEvent) -> Result<Vec<u8>, EncodeError> {
        match self {
            EventEncoding::Text => Ok(encode_text(event).into_bytes()),
            EventEncoding::Json => {
                let mut line = serde_json::to_vec(event)?;
                line.push(b'\n');
                Ok(line)
            }
            EventEncoding::Binary => {
                let record = BinaryRecord::from(event);
                let body = bincode::serialize(&record)?;
                let len = u32::try_from(body.len()).map_err(|_| EncodeError::TooLarge(body.len()))?;
                let mut framed = Vec::with_capacity(body.len() + 4);
                framed.extend_from_slice(&len.to_le_bytes());
                framed.extend_from_slice(&body);
                Ok(framed)
            }
        }
    }
}

impl fmt::Display for EventEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("binary encoding failed: {0}")]
    Binary(#[from] bincode::Error),

    #[error("event record of {0} bytes exceeds the binary frame limit")]
    TooLarge(usize),
}

/// Length-delimited record of the binary encoding. The payload is carried as
/// JSON text because `bincode` cannot round-trip self-describing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRecord {
    pub sequence: u64,
    pub ts: String,
    pub kind: String,
    pub payload_json: String,
    pub last_message: bool,
}

impl From<&BuildEvent> for BinaryRecord {
    fn from(event: &BuildEvent) -> Self {
        Self {
            sequence: event.sequence,
            ts: event.ts.clone(),
            kind: event.kind.clone(),
            payload_json: event.payload.to_string(),
            last_message: event.last_message,
        }
    }
}

/// Split a binary build event file back into records.
pub fn decode_binary(mut bytes: &[u8]) -> Result<Vec<BinaryRecord>, bincode::Error> {
    let mut records = Vec::new();
    while bytes.len() >= 4 {
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let end = (4 + len).min(bytes.len());
        records.push(bincode::deserialize(&bytes[4..end])?);
        bytes = &bytes[end..];
    }
    Ok(records)
}

fn encode_text(event: &BuildEvent) -> String {
    let payload = serde_json::to_string_pretty(&event.payload).unwrap_or_else(|_| "null".into());
    let mut block = format!(
        "sequence: {}\ntype: {}\ntimestamp: {}\n",
        event.sequence, event.kind, event.ts
    );
    if event.last_message {
        block.push_str("last_message: true\n");
    }
    block.push_str("payload: ");
    block.push_str(&payload);
    block.push_str("\n---\n");
    block
}
