//! Serverless peer-to-peer chat over a WebRTC data channel.
//!
//! There is no signaling server: each side turns its offer or answer and
//! every ICE candidate into a line of text, the humans copy those lines to
//! each other by whatever means they like, and paste the peer's text back in.
//! [`SessionController`] drives one such exchange and reports progress as a
//! stream of [`Notification`]s.

pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod handle;
pub mod relay;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use codec::{DescriptionKind, ExchangeBlob, IceCandidate, SessionDescription};
pub use config::{IceServer, SessionConfig, SessionConfigBuilder};
pub use controller::{Notification, SessionController};
pub use error::{
    CodecError, ConfigError, HandleError, NegotiationError, RelayError, SessionError,
    TelemetryError, TransportError,
};
pub use handle::{SessionHandle, SessionSnapshot};
pub use relay::{ChannelState, MessageRelay, Origin, TranscriptEntry};
pub use session::{NegotiationSession, Role, SessionState};
pub use transport::webrtc::WebRtcFactory;
pub use transport::{TransportCapability, TransportFactory};
