//! jupyter-session library
//!
//! Client side of the Jupyter messaging protocol: signed multipart messages
//! over ZeroMQ, a heartbeat liveness probe, and a display dispatcher that
//! turns kernel output into HTML.

pub mod ansi;
pub mod codec;
pub mod content;
pub mod display;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod runtime;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use codec::{MessageCodec, SignedEnvelope, SigningAlgorithm};
pub use display::{DisplayCallbacks, DisplayDispatch, MarkupRenderer, PreformattedMarkup};
pub use error::{CodecError, ConfigError, SessionError, TransportError};
pub use message::{ConnectionInfo, JupyterMessage, MessageHeader};
pub use heartbeat::ProbeState;
pub use session::{KernelSession, SessionOptions};
pub use transport::{Channel, ChannelKind};
