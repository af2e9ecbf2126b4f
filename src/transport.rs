//! ZeroMQ channel sockets
//!
//! Each logical channel owns exactly one socket whose pattern is fixed by the
//! channel kind:
//!
//! - shell: DEALER, so many requests may be outstanding at once
//! - iopub: SUB, subscribed to every topic
//! - heartbeat: REQ, strict send/receive alternation
//!
//! Sockets are connected (never bound), each connect is bounded by a timeout,
//! and a failed socket is never reconnected here.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use zeromq::{DealerSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::error::TransportError;
use crate::message::ConnectionInfo;

/// Handler invoked with the frames of every message arriving on a channel
pub type FrameHandler = Box<dyn FnMut(Vec<Bytes>) + Send>;

/// The channels this client opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Shell,
    IOPub,
    Heartbeat,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Shell => "shell",
            Self::IOPub => "iopub",
            Self::Heartbeat => "heartbeat",
        })
    }
}

/// Build `transport://ip<delim>port`.
///
/// TCP separates host and port with `:`; other transports (ipc) name a file,
/// so the port is appended with `-`.
pub fn connection_string(transport: &str, ip: &str, port: u16) -> String {
    let delimiter = if transport == "tcp" { ':' } else { '-' };
    format!("{}://{}{}{}", transport, ip, delimiter, port)
}

enum ChannelSocket {
    Dealer(DealerSocket),
    Sub(SubSocket),
    Req(ReqSocket),
}

/// One connected channel socket plus its (optional) message handler
pub struct Channel {
    kind: ChannelKind,
    endpoint: String,
    socket: ChannelSocket,
    handler: Option<FrameHandler>,
}

impl Channel {
    /// Connect the socket for `kind` using the port from `info`
    pub async fn connect(
        info: &ConnectionInfo,
        kind: ChannelKind,
        limit: Duration,
    ) -> Result<Self, TransportError> {
        Self::connect_to(kind, info.endpoint(kind), limit).await
    }

    /// Connect the socket for `kind` to an explicit endpoint.
    ///
    /// zeromq keeps retrying a refused connection, so the attempt is abandoned
    /// with [`TransportError::ConnectTimeout`] once `limit` has elapsed.
    pub async fn connect_to(
        kind: ChannelKind,
        endpoint: String,
        limit: Duration,
    ) -> Result<Self, TransportError> {
        tracing::info!("Connecting {} socket to {}", kind, endpoint);

        let connecting = async {
            let connect_err = |source| TransportError::Connect {
                channel: kind,
                endpoint: endpoint.clone(),
                source,
            };

            let socket = match kind {
                ChannelKind::Shell => {
                    let mut socket = DealerSocket::new();
                    socket.connect(&endpoint).await.map_err(connect_err)?;
                    ChannelSocket::Dealer(socket)
                }
                ChannelKind::IOPub => {
                    let mut socket = SubSocket::new();
                    socket.connect(&endpoint).await.map_err(connect_err)?;
                    socket.subscribe("").await.map_err(connect_err)?;
                    ChannelSocket::Sub(socket)
                }
                ChannelKind::Heartbeat => {
                    let mut socket = ReqSocket::new();
                    socket.connect(&endpoint).await.map_err(connect_err)?;
                    ChannelSocket::Req(socket)
                }
            };
            Ok::<_, TransportError>(socket)
        };

        let outcome = tokio::time::timeout(limit, connecting).await;
        let socket = match outcome {
            Ok(connected) => connected?,
            Err(_) => {
                tracing::warn!("No {} peer at {} after {:?}", kind, endpoint, limit);
                return Err(TransportError::ConnectTimeout {
                    channel: kind,
                    endpoint,
                });
            }
        };

        Ok(Self {
            kind,
            endpoint,
            socket,
            handler: None,
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send a multipart message. Returns once the socket has accepted it.
    pub async fn send(&mut self, frames: Vec<Bytes>) -> Result<(), TransportError> {
        let mut frames = frames.into_iter();
        let mut msg = match frames.next() {
            Some(first) => ZmqMessage::from(first),
            None => return Err(TransportError::EmptyMessage(self.kind)),
        };
        for frame in frames {
            msg.push_back(frame);
        }

        let result = match &mut self.socket {
            ChannelSocket::Dealer(socket) => socket.send(msg).await,
            ChannelSocket::Req(socket) => socket.send(msg).await,
            ChannelSocket::Sub(_) => return Err(TransportError::ReceiveOnly(self.kind)),
        };

        result.map_err(|source| TransportError::Send {
            channel: self.kind,
            source,
        })
    }

    /// Wait for the next multipart message
    pub async fn recv(&mut self) -> Result<Vec<Bytes>, TransportError> {
        let result = match &mut self.socket {
            ChannelSocket::Dealer(socket) => socket.recv().await,
            ChannelSocket::Sub(socket) => socket.recv().await,
            ChannelSocket::Req(socket) => socket.recv().await,
        };

        let msg = result.map_err(|source| TransportError::Recv {
            channel: self.kind,
            source,
        })?;
        Ok(msg.into_vec())
    }

    /// Register the handler for arriving messages, replacing any previous one
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: FnMut(Vec<Bytes>) + Send + 'static,
    {
        if self.handler.is_some() {
            tracing::debug!("Replacing {} message handler", self.kind);
        }
        self.handler = Some(Box::new(handler));
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Receive one message and hand it to the registered handler.
    ///
    /// Returns `false` when no handler is registered and the message was dropped.
    pub async fn pump(&mut self) -> Result<bool, TransportError> {
        let frames = self.recv().await?;
        match self.handler.as_mut() {
            Some(handler) => {
                handler(frames);
                Ok(true)
            }
            None => {
                tracing::debug!(
                    "Dropping {}-frame message on {}: no handler",
                    frames.len(),
                    self.kind
                );
                Ok(false)
            }
        }
    }
}
