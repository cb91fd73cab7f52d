//! The offer/answer state machine.
//!
//! ```text
//!            create_offer                set_remote(answer)
//!   Idle ─────────────────▶ LocalOfferCreated ─────────────▶ RemoteOfferApplied ─┐
//!    │                                                                           │ channel open
//!    │  create_answer(offer)                                                     ▼
//!    └──────────────────────▶ LocalAnswerCreated ───────────────────────────▶ Connected ──▶ Closed
//!                                                           channel open            channel close
//! ```
//!
//! `reset` returns to `Idle` from anywhere and moves to a new [`Generation`];
//! events still in flight from the old transport are discarded by
//! [`NegotiationSession::apply_event`].

use std::mem;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, DescriptionKind, IceCandidate, SessionDescription};
use crate::error::{CodecError, NegotiationError, SessionError, TransportError};
use crate::transport::{
    EventSink, Generation, GenerationEvent, TransportCapability, TransportEvent, TransportFactory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    LocalOfferCreated,
    /// The offerer has applied the peer's answer and waits for the channel.
    RemoteOfferApplied,
    LocalAnswerCreated,
    Connected,
    Closed,
}

impl SessionState {
    fn accepts_candidates(self) -> bool {
        matches!(
            self,
            SessionState::LocalOfferCreated
                | SessionState::RemoteOfferApplied
                | SessionState::LocalAnswerCreated
                | SessionState::Connected
        )
    }
}

/// A held remote candidate that the transport refused once the answer had
/// been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRejection {
    pub candidate: IceCandidate,
    pub reason: String,
}

/// A transport event that belongs to the live transport and was legal in the
/// current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    ChannelOpened,
    ChannelClosed,
    MessageReceived(String),
}

pub struct NegotiationSession {
    generation: Generation,
    events_tx: mpsc::UnboundedSender<GenerationEvent>,
    role: Option<Role>,
    state: SessionState,
    transport: Option<Box<dyn TransportCapability>>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    local_candidates: Vec<IceCandidate>,
    held_candidates: Vec<IceCandidate>,
}

impl NegotiationSession {
    pub fn new(events_tx: mpsc::UnboundedSender<GenerationEvent>) -> Self {
        Self {
            generation: Generation::default(),
            events_tx,
            role: None,
            state: SessionState::Idle,
            transport: None,
            local_description: None,
            remote_description: None,
            local_candidates: Vec::new(),
            held_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    /// Remote candidates accepted before the answer arrived.
    pub fn held_candidates(&self) -> &[IceCandidate] {
        &self.held_candidates
    }

    pub fn transport(&self) -> Option<&dyn TransportCapability> {
        self.transport.as_deref()
    }

    /// Resets, then starts a new session as the offerer. The returned offer
    /// is also the session's local description from now on.
    pub async fn create_offer(
        &mut self,
        factory: &dyn TransportFactory,
    ) -> Result<SessionDescription, NegotiationError> {
        self.reset().await;
        let transport = self.allocate(factory, Role::Offerer).await?;
        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return Err(self.abandon(transport, "create_offer", err).await),
        };
        self.commit(
            Role::Offerer,
            SessionState::LocalOfferCreated,
            transport,
            offer.clone(),
            None,
        );
        Ok(offer)
    }

    /// Starts a new session as the answerer for the pasted offer. Malformed
    /// input is rejected before the current session is touched.
    pub async fn create_answer(
        &mut self,
        factory: &dyn TransportFactory,
        remote_offer_text: &str,
    ) -> Result<SessionDescription, NegotiationError> {
        let offer = decode_remote(remote_offer_text, DescriptionKind::Offer)?;
        self.reset().await;
        let transport = self.allocate(factory, Role::Answerer).await?;
        if let Err(err) = transport.apply_remote_description(&offer).await {
            return Err(self.abandon(transport, "apply_remote_offer", err).await);
        }
        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(err) => return Err(self.abandon(transport, "create_answer", err).await),
        };
        self.commit(
            Role::Answerer,
            SessionState::LocalAnswerCreated,
            transport,
            answer.clone(),
            Some(offer),
        );
        Ok(answer)
    }

    /// Applies the peer's answer. Candidates pasted while the answer was
    /// outstanding are submitted right after, in the order they arrived.
    pub async fn set_remote(
        &mut self,
        remote_answer_text: &str,
    ) -> Result<Vec<CandidateRejection>, NegotiationError> {
        if self.role != Some(Role::Offerer) || self.state != SessionState::LocalOfferCreated {
            return Err(self.invalid("set_remote"));
        }
        let answer = decode_remote(remote_answer_text, DescriptionKind::Answer)?;
        {
            let transport = self
                .transport
                .as_deref()
                .ok_or_else(|| self.invalid("set_remote"))?;
            transport
                .apply_remote_description(&answer)
                .await
                .map_err(|err| NegotiationError::RejectedByTransport(err.to_string()))?;
        }
        self.remote_description = Some(answer);
        self.transition(SessionState::RemoteOfferApplied);

        let held = mem::take(&mut self.held_candidates);
        let mut rejected = Vec::new();
        if let Some(transport) = self.transport.as_deref() {
            for candidate in held {
                if let Err(err) = transport.add_remote_candidate(&candidate).await {
                    warn!(
                        generation = self.generation.value(),
                        candidate = %candidate.candidate,
                        error = %err,
                        "held remote candidate rejected"
                    );
                    rejected.push(CandidateRejection {
                        candidate,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(rejected)
    }

    /// Accepts one remote candidate. Legal once a local description exists
    /// and until the channel closes.
    pub async fn add_candidate(&mut self, candidate_text: &str) -> Result<(), SessionError> {
        if !self.state.accepts_candidates() {
            return Err(self.invalid("add_candidate").into());
        }
        let candidate = codec::decode_candidate(candidate_text)?;
        if self.remote_description.is_none() {
            debug!(
                generation = self.generation.value(),
                candidate = %candidate.candidate,
                "holding remote candidate until the answer is applied"
            );
            self.held_candidates.push(candidate);
            return Ok(());
        }
        let transport = self
            .transport
            .as_deref()
            .ok_or_else(|| self.invalid("add_candidate"))?;
        transport
            .add_remote_candidate(&candidate)
            .await
            .map_err(|err| NegotiationError::RejectedByTransport(err.to_string()))?;
        trace!(
            generation = self.generation.value(),
            candidate = %candidate.candidate,
            "remote candidate applied"
        );
        Ok(())
    }

    /// Tears down the transport and forgets everything about the session.
    /// The generation moves on before anything is awaited.
    pub async fn reset(&mut self) {
        let previous = self.generation;
        self.generation = self.generation.next();
        self.role = None;
        self.state = SessionState::Idle;
        self.local_description = None;
        self.remote_description = None;
        self.local_candidates.clear();
        self.held_candidates.clear();
        if let Some(transport) = self.transport.take() {
            debug!(
                generation = previous.value(),
                "closing transport on reset"
            );
            transport.close().await;
        }
    }

    /// Filters a transport event through the generation check and the state
    /// machine. Returns `None` for stale or out-of-place events.
    pub fn apply_event(&mut self, tagged: GenerationEvent) -> Option<SessionEvent> {
        if tagged.generation != self.generation {
            trace!(
                event_generation = tagged.generation.value(),
                generation = self.generation.value(),
                event = ?tagged.event,
                "discarding stale transport event"
            );
            return None;
        }
        if self.transport.is_none() {
            return None;
        }
        match tagged.event {
            TransportEvent::CandidateDiscovered(candidate) => {
                self.local_candidates.push(candidate.clone());
                Some(SessionEvent::LocalCandidate(candidate))
            }
            TransportEvent::GatheringComplete => Some(SessionEvent::GatheringComplete),
            TransportEvent::ChannelOpened => match self.state {
                SessionState::RemoteOfferApplied | SessionState::LocalAnswerCreated => {
                    self.transition(SessionState::Connected);
                    Some(SessionEvent::ChannelOpened)
                }
                state => {
                    debug!(?state, "ignoring channel open outside negotiation");
                    None
                }
            },
            TransportEvent::ChannelClosed => match self.state {
                SessionState::Connected => {
                    self.transition(SessionState::Closed);
                    Some(SessionEvent::ChannelClosed)
                }
                state => {
                    debug!(?state, "ignoring channel close before open");
                    None
                }
            },
            TransportEvent::MessageReceived(text) => {
                if self.state == SessionState::Connected {
                    Some(SessionEvent::MessageReceived(text))
                } else {
                    warn!(state = ?self.state, "dropping message received while not connected");
                    None
                }
            }
        }
    }

    async fn allocate(
        &mut self,
        factory: &dyn TransportFactory,
        role: Role,
    ) -> Result<Box<dyn TransportCapability>, NegotiationError> {
        let sink = EventSink::new(self.generation, self.events_tx.clone());
        match factory.allocate(role, sink).await {
            Ok(transport) => Ok(transport),
            Err(err) => {
                warn!(?role, error = %err, "transport allocation failed");
                self.generation = self.generation.next();
                Err(NegotiationError::TransportUnavailable(err.to_string()))
            }
        }
    }

    async fn abandon(
        &mut self,
        transport: Box<dyn TransportCapability>,
        step: &'static str,
        err: TransportError,
    ) -> NegotiationError {
        warn!(
            generation = self.generation.value(),
            step,
            error = %err,
            "negotiation step failed; discarding transport"
        );
        self.generation = self.generation.next();
        transport.close().await;
        NegotiationError::RejectedByTransport(err.to_string())
    }

    fn commit(
        &mut self,
        role: Role,
        state: SessionState,
        transport: Box<dyn TransportCapability>,
        local: SessionDescription,
        remote: Option<SessionDescription>,
    ) {
        self.role = Some(role);
        self.transport = Some(transport);
        self.local_description = Some(local);
        self.remote_description = remote;
        self.transition(state);
    }

    fn transition(&mut self, next: SessionState) {
        info!(
            generation = self.generation.value(),
            role = ?self.role,
            from = ?self.state,
            to = ?next,
            "session state changed"
        );
        self.state = next;
    }

    fn invalid(&self, operation: &'static str) -> NegotiationError {
        NegotiationError::InvalidTransition {
            operation,
            state: self.state,
        }
    }
}

fn decode_remote(
    text: &str,
    expected: DescriptionKind,
) -> Result<SessionDescription, NegotiationError> {
    let description =
        codec::decode_description(text).map_err(NegotiationError::MalformedRemoteDescription)?;
    if description.kind != expected {
        return Err(NegotiationError::MalformedRemoteDescription(
            CodecError::MalformedInput(format!(
                "expected an {}, found an {}",
                expected.as_str(),
                description.kind.as_str()
            )),
        ));
    }
    Ok(description)
}
