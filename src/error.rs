//! Error types for the Jupyter session client.
//!
//! Decode-time failures ([`CodecError`]) are contained by the session: the
//! offending message is logged and dropped. Connect-time and send-time
//! failures ([`TransportError`]) propagate to whoever issued the operation.

use std::time::Duration;

use thiserror::Error;

use crate::transport::ChannelKind;

/// Errors raised while encoding, decoding or authenticating a message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// One of header, parent_header, metadata or content could not be serialized.
    #[error("failed to encode message: {0}")]
    Encoding(#[source] serde_json::Error),

    /// The received signature does not match the digest of the message frames.
    #[error("message signature verification failed")]
    Authentication,

    /// No `<IDS|MSG>` delimiter frame was found.
    #[error("envelope has no delimiter frame")]
    MissingDelimiter,

    /// Fewer than five frames follow the delimiter.
    #[error("envelope truncated: {found} frames after delimiter, expected at least 5")]
    Truncated { found: usize },

    /// A positional frame is not valid UTF-8 JSON.
    #[error("invalid {frame} frame: {reason}")]
    InvalidFrame { frame: &'static str, reason: String },

    /// The signature scheme names an algorithm we cannot compute.
    #[error("unsupported signature scheme: {0}")]
    UnsupportedScheme(String),
}

/// Errors raised by a channel socket.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect {channel} channel to {endpoint}: {source}")]
    Connect {
        channel: ChannelKind,
        endpoint: String,
        #[source]
        source: zeromq::ZmqError,
    },

    /// No peer accepted the connection within the connect timeout.
    #[error("timed out connecting {channel} channel to {endpoint}")]
    ConnectTimeout { channel: ChannelKind, endpoint: String },

    #[error("failed to send on {channel} channel: {source}")]
    Send {
        channel: ChannelKind,
        #[source]
        source: zeromq::ZmqError,
    },

    #[error("failed to receive on {channel} channel: {source}")]
    Recv {
        channel: ChannelKind,
        #[source]
        source: zeromq::ZmqError,
    },

    /// The IOPub channel is subscribe-only.
    #[error("{0} channel is receive-only")]
    ReceiveOnly(ChannelKind),

    /// The task owning the channel socket has stopped.
    #[error("{0} channel is closed")]
    Closed(ChannelKind),

    /// An empty frame list cannot be sent.
    #[error("refusing to send an empty message on {0} channel")]
    EmptyMessage(ChannelKind),
}

/// Errors raised by [`KernelSession`](crate::session::KernelSession) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The kernel answered the heartbeat with something other than the probe.
    #[error("heartbeat reply mismatch: expected {expected:?}, received {received:?}")]
    HeartbeatMismatch { expected: String, received: String },

    #[error("no heartbeat reply within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("no kernel_info_reply within {0:?}")]
    HandshakeTimeout(Duration),

    /// The session was opened without a shell channel.
    #[error("session has no shell channel")]
    ShellDisabled,
}

/// Errors raised while loading or discovering a connection descriptor.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read connection file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid connection descriptor: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Scheme(#[from] CodecError),

    #[error("failed to watch runtime directory: {0}")]
    Watch(#[from] notify::Error),
}
