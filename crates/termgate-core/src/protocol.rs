//! Control messages carried in text frames.
//!
//! Wire shape: `{"type": "stdin"|"resize"|"stderr", "data": <base64>,
//! "rows": <int>, "cols": <int>}`. `data` uses standard base64 the same way
//! JSON byte arrays are encoded by most web-terminal front ends. Missing
//! fields default to empty/zero; unknown `type` values parse as
//! [`MessageType::Unknown`] so newer clients do not break older gateways.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind of a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Bytes for the backend's input stream.
    Stdin,
    /// New pty dimensions.
    Resize,
    /// Informational text for the client.
    Stderr,
    /// Anything this gateway does not understand.
    #[serde(other)]
    Unknown,
}

/// Structured control envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rows: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cols: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl Message {
    pub fn stdin(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageType::Stdin,
            data: data.into(),
            rows: 0,
            cols: 0,
        }
    }

    pub fn resize(rows: u16, cols: u16) -> Self {
        Self {
            kind: MessageType::Resize,
            data: Vec::new(),
            rows,
            cols,
        }
    }

    pub fn stderr(text: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageType::Stderr,
            data: text.into(),
            rows: 0,
            cols: 0,
        }
    }

    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::MalformedControlMessage {
            message: e.to_string(),
        })
    }

    /// Encode for a text frame.
    pub fn to_json(&self) -> String {
        // Serializing this struct cannot fail: every field is a plain value.
        serde_json::to_string(self).unwrap_or_default()
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
