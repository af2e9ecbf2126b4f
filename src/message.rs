//! Jupyter message structures and connection info
//!
//! This module defines the Jupyter messaging protocol structures exchanged
//! between this client and a running kernel.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::codec::SigningAlgorithm;
use crate::error::{CodecError, ConfigError};
use crate::transport::{connection_string, ChannelKind};

/// Protocol version advertised in outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Connection information published by a kernel
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ip: String,
    pub transport: String,
    pub signature_scheme: String,
    pub key: String,
    pub shell_port: u16,
    pub iopub_port: u16,
    pub stdin_port: u16,
    pub control_port: u16,
    pub hb_port: u16,
}

impl ConnectionInfo {
    /// Load connection info from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse connection info from the text of a connection descriptor
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let info: ConnectionInfo = serde_json::from_str(text)?;
        // Reject schemes we cannot sign with before any socket is opened.
        info.signing_algorithm()?;
        Ok(info)
    }

    /// The keyed-hash algorithm named by `signature_scheme`
    pub fn signing_algorithm(&self) -> Result<SigningAlgorithm, CodecError> {
        SigningAlgorithm::from_scheme(&self.signature_scheme)
    }

    /// Port assigned to a channel
    pub fn port(&self, kind: ChannelKind) -> u16 {
        match kind {
            ChannelKind::Shell => self.shell_port,
            ChannelKind::IOPub => self.iopub_port,
            ChannelKind::Heartbeat => self.hb_port,
        }
    }

    /// Get the socket address for a given channel
    pub fn endpoint(&self, kind: ChannelKind) -> String {
        connection_string(&self.transport, &self.ip, self.port(kind))
    }
}

/// A Jupyter protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JupyterMessage {
    pub header: MessageHeader,
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
    #[serde(default)]
    pub buffers: Vec<Vec<u8>>,
}

impl JupyterMessage {
    /// Create a new top-level (non-reply) message with a fresh `msg_id`
    pub fn new(msg_type: &str, content: Value, session: &str, username: &str) -> Self {
        Self {
            header: MessageHeader::new(msg_type, session, username),
            parent_header: json!({}),
            metadata: json!({}),
            content,
            buffers: vec![],
        }
    }

    /// Stamp a protocol version other than [`PROTOCOL_VERSION`] into the header
    pub fn with_protocol_version(mut self, version: &str) -> Self {
        self.header.version = version.to_string();
        self
    }

    /// The `msg_type` from the header
    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The `msg_id` of the message this one replies to, if any
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }
}

/// Message header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    #[serde(default)]
    pub date: String,
    pub msg_type: String,
    #[serde(default)]
    pub version: String,
    /// Header fields this client does not interpret, kept for exact re-encoding
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageHeader {
    /// Build a header stamped with a new UUID and the current time
    pub fn new(msg_type: &str, session: &str, username: &str) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: username.to_string(),
            date: chrono::Utc::now().to_rfc3339(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            extra: Map::new(),
        }
    }
}
