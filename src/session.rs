//! Client session with a running Jupyter kernel
//!
//! A [`KernelSession`] owns three channels: IOPub for kernel output,
//! heartbeat for liveness probes, and (optionally) shell for requests. On
//! connect it sends a signed `kernel_info_request` so the kernel's identity
//! can be confirmed with [`KernelSession::await_kernel_info`].

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::codec::{MessageCodec, Signer};
use crate::error::{CodecError, SessionError, TransportError};
use crate::heartbeat::Heartbeat;
use crate::message::{ConnectionInfo, JupyterMessage, PROTOCOL_VERSION};
use crate::transport::{Channel, ChannelKind};

pub use crate::heartbeat::ProbeState;

/// Username placed in outgoing headers unless overridden
pub const DEFAULT_USERNAME: &str = "username";

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub username: String,
    /// Open the shell channel and send `kernel_info_request` on connect
    pub shell: bool,
    /// How long a heartbeat probe waits for its echo. `None` waits forever.
    pub heartbeat_timeout: Option<Duration>,
    /// How long each channel may take to reach its peer
    pub connect_timeout: Duration,
    /// `version` stamped into the header of every request
    pub protocol_version: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            shell: true,
            heartbeat_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Duration::from_secs(10),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl SessionOptions {
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn without_shell(mut self) -> Self {
        self.shell = false;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }
}

/// Identity reported by the kernel in `kernel_info_reply`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct KernelInfo {
    #[serde(default)]
    pub protocol_version: String,
    #[serde(default)]
    pub implementation: String,
    #[serde(default)]
    pub implementation_version: String,
    #[serde(default)]
    pub language_info: LanguageInfo,
    #[serde(default)]
    pub banner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LanguageInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mimetype: String,
    #[serde(default)]
    pub file_extension: String,
}

/// A connected client session
pub struct KernelSession {
    connection: ConnectionInfo,
    options: SessionOptions,
    codec: MessageCodec,
    session_id: String,
    iopub: Channel,
    heartbeat: Heartbeat,
    shell: Option<Channel>,
    handshake_id: Option<String>,
    kernel_info: Option<KernelInfo>,
}

impl KernelSession {
    /// Connect all channels and, if enabled, send the `kernel_info_request` handshake
    pub async fn connect(
        connection: ConnectionInfo,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let algorithm = connection.signing_algorithm()?;
        let codec = MessageCodec::with_signer(Signer::new(algorithm, connection.key.as_bytes()));
        let session_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            "Opening session {} (signing: {})",
            session_id,
            if codec.signer().is_enabled() {
                algorithm.name()
            } else {
                "disabled"
            }
        );

        let limit = options.connect_timeout;
        let iopub = Channel::connect(&connection, ChannelKind::IOPub, limit).await?;
        let heartbeat = Heartbeat::connect(&connection, &session_id, limit).await?;
        let shell = if options.shell {
            Some(Channel::connect(&connection, ChannelKind::Shell, limit).await?)
        } else {
            None
        };

        let mut session = Self {
            connection,
            options,
            codec,
            session_id,
            iopub,
            heartbeat,
            shell,
            handshake_id: None,
            kernel_info: None,
        };

        if session.shell.is_some() {
            let msg_id = session
                .send_shell_request("kernel_info_request", json!({}))
                .await?;
            session.handshake_id = Some(msg_id);
        }

        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn probe_state(&self) -> ProbeState {
        self.heartbeat.state()
    }

    /// Kernel identity, once the handshake reply has been received
    pub fn kernel_info(&self) -> Option<&KernelInfo> {
        self.kernel_info.as_ref()
    }

    /// `msg_id` of the handshake request, if one was sent
    pub fn handshake_id(&self) -> Option<&str> {
        self.handshake_id.as_deref()
    }

    /// Probe the heartbeat and call `callback(true)` if the kernel echoed it.
    ///
    /// A mismatched or missing echo is logged and the callback is not
    /// invoked. Only transport failures are returned as errors.
    pub async fn check_health<F>(&mut self, callback: F) -> Result<(), SessionError>
    where
        F: FnOnce(bool),
    {
        match self.probe_heartbeat().await {
            Ok(()) => {
                callback(true);
                Ok(())
            }
            Err(e @ SessionError::HeartbeatMismatch { .. }) => {
                tracing::error!("{}", e);
                Ok(())
            }
            Err(e @ SessionError::HeartbeatTimeout(_)) => {
                tracing::warn!("{}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send one heartbeat probe and wait for its echo.
    ///
    /// `&mut self` keeps probes strictly sequential. Echoes of abandoned
    /// probes still arriving on the socket are skipped, so a late echo
    /// cannot answer this probe.
    pub async fn probe_heartbeat(&mut self) -> Result<(), SessionError> {
        self.heartbeat.probe(self.options.heartbeat_timeout).await
    }

    /// Replace the heartbeat socket with a freshly connected one
    pub async fn reset_heartbeat(&mut self) -> Result<(), SessionError> {
        Ok(self.heartbeat.reconnect().await?)
    }

    /// Register the callback receiving every authenticated IOPub message.
    ///
    /// Replaces any previous callback. Messages that fail verification or
    /// parsing are logged and dropped before reaching it.
    pub fn on<F>(&mut self, mut callback: F)
    where
        F: FnMut(JupyterMessage) + Send + 'static,
    {
        let codec = self.codec.clone();
        self.iopub.on_message(move |frames| match codec.decode_frames(frames) {
            Ok((_, msg)) => {
                tracing::debug!("IOPub {} ({})", msg.msg_type(), msg.header.msg_id);
                callback(msg)
            }
            Err(e) => log_rejected(ChannelKind::IOPub, &e),
        });
    }

    /// Receive one IOPub message and deliver it to the registered callback.
    ///
    /// Returns `false` when no callback is registered.
    pub async fn pump_iopub(&mut self) -> Result<bool, SessionError> {
        Ok(self.iopub.pump().await?)
    }

    /// Sign and send a request on the shell channel, returning its `msg_id`
    pub async fn send_shell_request(
        &mut self,
        msg_type: &str,
        content: Value,
    ) -> Result<String, SessionError> {
        let msg = JupyterMessage::new(msg_type, content, &self.session_id, &self.options.username)
            .with_protocol_version(&self.options.protocol_version);
        let envelope = self.codec.encode(&msg)?;

        let shell = self.shell.as_mut().ok_or(SessionError::ShellDisabled)?;
        shell.send(envelope.into_frames()).await?;

        tracing::debug!("Sent {} ({}) on shell", msg_type, msg.header.msg_id);
        Ok(msg.header.msg_id)
    }

    /// Receive the next shell reply.
    ///
    /// Returns `None` when the reply was rejected by the codec.
    pub async fn recv_shell(&mut self) -> Result<Option<JupyterMessage>, SessionError> {
        let shell = self.shell.as_mut().ok_or(SessionError::ShellDisabled)?;
        let frames = shell.recv().await?;
        Ok(self.handle_shell_frames(frames))
    }

    /// Wait until the handshake's `kernel_info_reply` arrives.
    ///
    /// Other shell replies received meanwhile are logged and skipped.
    pub async fn await_kernel_info(&mut self, limit: Duration) -> Result<KernelInfo, SessionError> {
        if let Some(info) = &self.kernel_info {
            return Ok(info.clone());
        }
        if self.shell.is_none() {
            return Err(SessionError::ShellDisabled);
        }

        let wait = async {
            loop {
                self.recv_shell().await?;
                if let Some(info) = &self.kernel_info {
                    return Ok::<_, SessionError>(info.clone());
                }
            }
        };

        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| SessionError::HandshakeTimeout(limit))?
    }

    /// Deliver IOPub messages and record shell replies until Ctrl-C
    pub async fn run(&mut self) -> Result<(), SessionError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::warn!("Received SIGINT, closing session");
        })
        .await
    }

    /// Deliver IOPub messages and record shell replies until `shutdown` completes.
    ///
    /// Pending shell replies and IOPub messages are handled before shutdown.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        enum Event {
            IOPub,
            Shell(Vec<Bytes>),
            Shutdown,
        }

        tracing::info!("Starting session event loop");

        tokio::pin!(shutdown);

        loop {
            let event = tokio::select! {
                biased;
                frames = next_frames(self.shell.as_mut()) => Event::Shell(frames?),
                delivered = self.iopub.pump() => {
                    delivered?;
                    Event::IOPub
                }
                _ = &mut shutdown => Event::Shutdown,
            };

            match event {
                Event::IOPub => {}
                Event::Shell(frames) => {
                    self.handle_shell_frames(frames);
                }
                Event::Shutdown => break,
            }
        }

        Ok(())
    }

    fn handle_shell_frames(&mut self, frames: Vec<Bytes>) -> Option<JupyterMessage> {
        let msg = match self.codec.decode_frames(frames) {
            Ok((_, msg)) => msg,
            Err(e) => {
                log_rejected(ChannelKind::Shell, &e);
                return None;
            }
        };

        let answers_handshake =
            self.handshake_id.is_some() && msg.parent_msg_id() == self.handshake_id.as_deref();

        if msg.msg_type() == "kernel_info_reply" && answers_handshake {
            match KernelInfo::deserialize(&msg.content) {
                Ok(info) => {
                    tracing::info!(
                        "Kernel {} {} (protocol {}, language {})",
                        info.implementation,
                        info.implementation_version,
                        info.protocol_version,
                        info.language_info.name
                    );
                    self.kernel_info = Some(info);
                }
                Err(e) => tracing::warn!("Malformed kernel_info_reply: {}", e),
            }
        } else {
            tracing::debug!("Shell reply {} ({})", msg.msg_type(), msg.header.msg_id);
        }

        Some(msg)
    }
}

async fn next_frames(channel: Option<&mut Channel>) -> Result<Vec<Bytes>, TransportError> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

fn log_rejected(channel: ChannelKind, error: &CodecError) {
    match error {
        CodecError::Authentication => {
            tracing::error!("Dropping {} message: {}", channel, error)
        }
        _ => tracing::warn!("Dropping malformed {} message: {}", channel, error),
    }
}
