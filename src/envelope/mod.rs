//! Message envelope - one protocol message and its wire form.
//!
//! A message on the wire is a list of byte parts:
//! ```text
//! ┌──────────────┬───────────┬───────────┬────────┬────────┬──────────┬─────────┬─────────┐
//! │ identities…  │ <IDS|MSG> │ signature │ header │ parent │ metadata │ content │ buffers…│
//! └──────────────┴───────────┴───────────┴────────┴────────┴──────────┴─────────┴─────────┘
//! ```
//! The signature covers header, parent, metadata and content in that order.
//! Routing identities are transport-only and never signed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Error, MessageId, Result, SessionId};

pub mod enums;
mod signer;

pub use enums::*;
pub use signer::Signer;

/// Delimiter separating routing identities from the signed message.
pub const DELIMITER: &[u8] = b"<IDS|MSG>";

/// Protocol version stamped into outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

fn protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

/// Message header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: MessageId,
    pub session: SessionId,
    #[serde(default)]
    pub username: String,
    #[serde(default = "Utc::now")]
    pub date: DateTime<Utc>,
    pub msg_type: MessageType,
    #[serde(default = "protocol_version")]
    pub version: String,
}

impl Header {
    pub fn new(msg_type: MessageType, session: SessionId, username: impl Into<String>) -> Self {
        Self {
            msg_id: MessageId::new(),
            session,
            username: username.into(),
            date: Utc::now(),
            msg_type,
            version: protocol_version(),
        }
    }
}

/// One protocol message. Immutable once built; replies are new messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Transport routing identities (not signed).
    pub identities: Vec<Vec<u8>>,
    pub header: Header,
    /// Header of the request that caused this message.
    pub parent_header: Option<Header>,
    /// Empty when the message carries no metadata.
    pub metadata: Map<String, Value>,
    pub content: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        session: SessionId,
        username: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            identities: Vec::new(),
            header: Header::new(msg_type, session, username),
            parent_header: None,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    /// Reply to this message: same routing identities, parent set to this header.
    pub fn reply(&self, msg_type: MessageType, content: Value) -> Message {
        let mut reply = Message::new(
            msg_type,
            self.header.session.clone(),
            self.header.username.clone(),
            content,
        );
        reply.identities = self.identities.clone();
        reply.parent_header = Some(self.header.clone());
        reply
    }

    /// Broadcast caused by this message, topic-addressed by message type.
    pub fn child(&self, msg_type: MessageType, content: Value) -> Message {
        let mut child = Message::new(
            msg_type,
            self.header.session.clone(),
            self.header.username.clone(),
            content,
        );
        child.identities = vec![child.header.msg_type.as_str().as_bytes().to_vec()];
        child.parent_header = Some(self.header.clone());
        child
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_identities(mut self, identities: Vec<Vec<u8>>) -> Self {
        self.identities = identities;
        self
    }

    pub fn msg_type(&self) -> &MessageType {
        &self.header.msg_type
    }

    /// Required string field of the content object.
    pub fn str_field(&self, key: &str) -> Result<&str> {
        self.content
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::validation(format!(
                    "{}: missing required field: {}",
                    self.header.msg_type, key
                ))
            })
    }

    /// Optional boolean field of the content object.
    pub fn bool_field(&self, key: &str, default: bool) -> bool {
        self.content
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(default)
    }

    /// Serialize to wire parts, signing with `signer`.
    pub fn to_parts(&self, signer: &Signer) -> Result<Vec<Vec<u8>>> {
        let header = serde_json::to_vec(&self.header)?;
        let parent = match &self.parent_header {
            Some(parent) => serde_json::to_vec(parent)?,
            None => b"{}".to_vec(),
        };
        let metadata = serde_json::to_vec(&self.metadata)?;
        let content = serde_json::to_vec(&self.content)?;
        let signature = signer.sign(&[
            header.as_slice(),
            parent.as_slice(),
            metadata.as_slice(),
            content.as_slice(),
        ]);

        let mut parts = Vec::with_capacity(self.identities.len() + 6 + self.buffers.len());
        parts.extend(self.identities.iter().cloned());
        parts.push(DELIMITER.to_vec());
        parts.push(signature.into_bytes());
        parts.push(header);
        parts.push(parent);
        parts.push(metadata);
        parts.push(content);
        parts.extend(self.buffers.iter().cloned());
        Ok(parts)
    }

    /// Parse wire parts, verifying the signature with `signer`.
    ///
    /// Nothing is kept from a message that fails verification or parsing.
    pub fn from_parts(mut parts: Vec<Vec<u8>>, signer: &Signer) -> Result<Message> {
        let delimiter = parts
            .iter()
            .position(|part| part.as_slice() == DELIMITER)
            .ok_or_else(|| Error::protocol("missing <IDS|MSG> delimiter"))?;

        if parts.len() < delimiter + 6 {
            return Err(Error::protocol(format!(
                "expected at least 5 parts after delimiter, got {}",
                parts.len() - delimiter - 1
            )));
        }

        let buffers = parts.split_off(delimiter + 6);
        let signed = parts.split_off(delimiter + 1);
        parts.truncate(delimiter);
        let identities = parts;

        let (signature, header, parent, metadata, content) =
            (&signed[0], &signed[1], &signed[2], &signed[3], &signed[4]);
        signer.verify(
            signature,
            &[
                header.as_slice(),
                parent.as_slice(),
                metadata.as_slice(),
                content.as_slice(),
            ],
        )?;

        let header: Header = serde_json::from_slice(header)
            .map_err(|e| Error::protocol(format!("invalid header: {}", e)))?;
        let parent_header = match serde_json::from_slice::<Value>(parent)
            .map_err(|e| Error::protocol(format!("invalid parent header: {}", e)))?
        {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            other => Some(
                serde_json::from_value(other)
                    .map_err(|e| Error::protocol(format!("invalid parent header: {}", e)))?,
            ),
        };
        let metadata = match serde_json::from_slice::<Value>(metadata)
            .map_err(|e| Error::protocol(format!("invalid metadata: {}", e)))?
        {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(Error::protocol(format!(
                    "metadata must be an object, got {}",
                    other
                )))
            }
        };
        let content: Value = serde_json::from_slice(content)
            .map_err(|e| Error::protocol(format!("invalid content: {}", e)))?;

        Ok(Message {
            identities,
            header,
            parent_header,
            metadata,
            content,
            buffers,
        })
    }
}
