//! Heartbeat liveness probes
//!
//! The heartbeat REQ socket is owned by its own task. A probe hands that task
//! a payload and waits for the echo on a queue, so giving up on a probe never
//! cancels the socket's pending receive. The socket stays in step with the
//! kernel and a late echo simply arrives on the queue later.
//!
//! Every probe carries a unique payload. Echoes come back in the order the
//! probes were sent, so a probe knows how many earlier echoes it must skip
//! before the one that answers it.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{SessionError, TransportError};
use crate::message::ConnectionInfo;
use crate::transport::{Channel, ChannelKind};

/// Leading text of every heartbeat payload
pub const HEARTBEAT_PREFIX: &str = "jupyter-session heartbeat";

/// Unanswered probes tolerated before the socket is replaced
pub const STALE_PROBE_LIMIT: usize = 3;

/// Heartbeat probe state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    AwaitingReply,
    /// A probe was abandoned; its echo may still arrive and will be skipped
    Stale,
}

fn probe_payload(tag: &str, sequence: u64) -> String {
    format!("{} {} {}", HEARTBEAT_PREFIX, tag, sequence)
}

type Echo = Result<Vec<Bytes>, TransportError>;

/// Handle to the task that owns the REQ socket
struct EchoTask {
    probes: mpsc::UnboundedSender<Bytes>,
    echoes: mpsc::UnboundedReceiver<Echo>,
    task: JoinHandle<()>,
}

impl EchoTask {
    fn spawn(channel: Channel) -> Self {
        let (probes, probe_rx) = mpsc::unbounded_channel();
        let (echo_tx, echoes) = mpsc::unbounded_channel();
        let task = tokio::spawn(echo_loop(channel, probe_rx, echo_tx));
        Self {
            probes,
            echoes,
            task,
        }
    }
}

impl Drop for EchoTask {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn echo_loop(
    mut channel: Channel,
    mut probes: mpsc::UnboundedReceiver<Bytes>,
    echoes: mpsc::UnboundedSender<Echo>,
) {
    while let Some(payload) = probes.recv().await {
        let echo = match channel.send(vec![payload]).await {
            Ok(()) => channel.recv().await,
            Err(e) => Err(e),
        };
        if echoes.send(echo).is_err() {
            break;
        }
    }
    tracing::debug!("Heartbeat task finished");
}

/// Liveness prober for one kernel
pub struct Heartbeat {
    connection: ConnectionInfo,
    connect_timeout: Duration,
    tag: String,
    task: EchoTask,
    state: ProbeState,
    sequence: u64,
    in_flight: usize,
    broken: bool,
}

impl Heartbeat {
    /// Connect the heartbeat socket. `tag` goes into every payload.
    pub async fn connect(
        connection: &ConnectionInfo,
        tag: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let channel =
            Channel::connect(connection, ChannelKind::Heartbeat, connect_timeout).await?;
        Ok(Self {
            connection: connection.clone(),
            connect_timeout,
            tag: tag.to_string(),
            task: EchoTask::spawn(channel),
            state: ProbeState::Idle,
            sequence: 0,
            in_flight: 0,
            broken: false,
        })
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Probes sent whose echo has not been received yet
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Payload the next probe will carry
    pub fn next_payload(&self) -> String {
        probe_payload(&self.tag, self.sequence + 1)
    }

    /// Send one probe and wait up to `limit` for its echo.
    ///
    /// Echoes of earlier abandoned probes received meanwhile are discarded.
    /// After [`STALE_PROBE_LIMIT`] unanswered probes, or a socket failure,
    /// the socket is replaced before sending.
    pub async fn probe(&mut self, limit: Option<Duration>) -> Result<(), SessionError> {
        if self.broken || self.in_flight >= STALE_PROBE_LIMIT {
            tracing::warn!(
                "Replacing heartbeat socket ({} probes unanswered)",
                self.in_flight
            );
            self.reconnect().await?;
        }

        let payload = self.next_payload();
        self.sequence += 1;
        self.task
            .probes
            .send(Bytes::from(payload.clone()))
            .map_err(|_| TransportError::Closed(ChannelKind::Heartbeat))?;
        self.in_flight += 1;
        self.state = ProbeState::AwaitingReply;

        let Some(limit) = limit else {
            return self.await_echo(&payload).await;
        };
        let outcome = tokio::time::timeout(limit, self.await_echo(&payload)).await;
        outcome.unwrap_or_else(|_| {
            self.state = ProbeState::Stale;
            Err(SessionError::HeartbeatTimeout(limit))
        })
    }

    async fn await_echo(&mut self, payload: &str) -> Result<(), SessionError> {
        loop {
            let Some(echo) = self.task.echoes.recv().await else {
                self.broken = true;
                self.state = ProbeState::Stale;
                return Err(TransportError::Closed(ChannelKind::Heartbeat).into());
            };
            self.in_flight = self.in_flight.saturating_sub(1);

            let frames = match echo {
                Ok(frames) => frames,
                Err(e) => {
                    self.broken = true;
                    self.state = ProbeState::Stale;
                    return Err(e.into());
                }
            };

            if self.in_flight > 0 {
                tracing::debug!("Discarding late heartbeat echo");
                continue;
            }

            self.state = ProbeState::Idle;
            return if frames.len() == 1 && frames[0].as_ref() == payload.as_bytes() {
                Ok(())
            } else {
                let received: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();
                Err(SessionError::HeartbeatMismatch {
                    expected: payload.to_string(),
                    received: String::from_utf8_lossy(&received).into_owned(),
                })
            };
        }
    }

    /// Replace the heartbeat socket with a freshly connected one
    pub async fn reconnect(&mut self) -> Result<(), TransportError> {
        let channel =
            Channel::connect(&self.connection, ChannelKind::Heartbeat, self.connect_timeout)
                .await?;
        self.task = EchoTask::spawn(channel);
        self.state = ProbeState::Idle;
        self.in_flight = 0;
        self.broken = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payloads_are_unique_per_heartbeat() {
        let first = probe_payload("abc", 1);
        let second = probe_payload("abc", 2);

        assert!(first.starts_with(HEARTBEAT_PREFIX));
        assert!(first.contains("abc"));
        assert_ne!(first, second);
        assert_ne!(first, probe_payload("xyz", 1));
    }
}
