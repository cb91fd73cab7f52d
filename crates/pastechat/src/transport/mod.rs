use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::{IceCandidate, SessionDescription};
use crate::error::TransportError;
use crate::session::Role;

pub mod mock;
pub mod webrtc;

/// Identifies one transport instance over the lifetime of a controller.
/// Every reset moves to the next generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Asynchronous happenings reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    CandidateDiscovered(IceCandidate),
    GatheringComplete,
    ChannelOpened,
    ChannelClosed,
    MessageReceived(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationEvent {
    pub generation: Generation,
    pub event: TransportEvent,
}

/// Handed to a transport when it is allocated. Everything the transport
/// emits is stamped with the generation it was created for, so events from a
/// torn-down instance can be recognised and dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: Generation,
    tx: mpsc::UnboundedSender<GenerationEvent>,
}

impl EventSink {
    pub fn new(generation: Generation, tx: mpsc::UnboundedSender<GenerationEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        let generation = self.generation;
        if self.tx.send(GenerationEvent { generation, event }).is_err() {
            tracing::trace!(
                target = "webrtc",
                generation = generation.value(),
                "event receiver gone; dropping transport event"
            );
        }
    }
}

/// The peer-connection engine the session drives. Implementations report
/// candidates, channel state and inbound messages through the [`EventSink`]
/// they were allocated with.
#[async_trait]
pub trait TransportCapability: Send + Sync {
    /// Generates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Generates an answer to the applied remote offer and installs it as the
    /// local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Allocates one [`TransportCapability`] per session. The offerer side asks
/// for a data channel up front; the answerer side waits for the peer's.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn allocate(
        &self,
        role: Role,
        sink: EventSink,
    ) -> Result<Box<dyn TransportCapability>, TransportError>;
}
