use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::{self, IceCandidate, SessionDescription};
use crate::error::SessionError;
use crate::relay::{ChannelState, MessageRelay, TranscriptEntry};
use crate::session::{NegotiationSession, Role, SessionEvent, SessionState};
use crate::transport::{Generation, GenerationEvent, TransportFactory};

/// What the caller hears about, in the order it happened. Every text payload
/// is ready to be shown to the human for copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    LocalDescriptionReady(String),
    LocalCandidateReady(String),
    CandidateGatheringComplete,
    ChannelOpen,
    ChannelClose,
    MessageReceived(String),
    /// A remote candidate pasted before the answer was refused once the
    /// answer had been applied.
    CandidateRejected { candidate: String, reason: String },
}

/// Caller-facing front of one chat session.
///
/// Transport activity is applied whenever the controller runs: at the start
/// of every operation and whenever notifications are pulled.
pub struct SessionController<F> {
    factory: F,
    session: NegotiationSession,
    relay: MessageRelay,
    events_rx: mpsc::UnboundedReceiver<GenerationEvent>,
    outbox: VecDeque<Notification>,
}

impl<F: TransportFactory> SessionController<F> {
    pub fn new(factory: F) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            session: NegotiationSession::new(events_tx),
            relay: MessageRelay::new(),
            events_rx,
            outbox: VecDeque::new(),
        }
    }

    pub async fn create_offer(&mut self) -> Result<(), SessionError> {
        self.pump();
        let before = self.session.generation();
        let result = self.session.create_offer(&self.factory).await;
        self.forget_if_restarted(before);
        let offer = result?;
        self.announce_local(&offer);
        Ok(())
    }

    pub async fn create_answer(&mut self, remote_offer_text: &str) -> Result<(), SessionError> {
        self.pump();
        let before = self.session.generation();
        let result = self
            .session
            .create_answer(&self.factory, remote_offer_text)
            .await;
        self.forget_if_restarted(before);
        let answer = result?;
        self.announce_local(&answer);
        Ok(())
    }

    pub async fn set_remote(&mut self, remote_description_text: &str) -> Result<(), SessionError> {
        self.pump();
        let rejected = self.session.set_remote(remote_description_text).await?;
        for rejection in rejected {
            self.outbox.push_back(Notification::CandidateRejected {
                candidate: codec::encode_candidate(&rejection.candidate),
                reason: rejection.reason,
            });
        }
        Ok(())
    }

    pub async fn add_candidate(&mut self, candidate_text: &str) -> Result<(), SessionError> {
        self.pump();
        self.session.add_candidate(candidate_text).await
    }

    pub async fn send_message(&mut self, text: &str) -> Result<(), SessionError> {
        self.pump();
        self.relay.send(self.session.transport(), text).await?;
        Ok(())
    }

    /// Drops the session, its transport and its transcript. Anything the old
    /// transport reports afterwards is ignored.
    pub async fn reset(&mut self) {
        self.relay.reset();
        self.outbox.clear();
        self.session.reset().await;
    }

    /// Waits for the next notification. Cancel-safe: nothing is lost if the
    /// returned future is dropped before it completes.
    pub async fn next_notification(&mut self) -> Option<Notification> {
        loop {
            if let Some(notification) = self.outbox.pop_front() {
                return Some(notification);
            }
            let tagged = self.events_rx.recv().await?;
            if let Some(notification) = self.absorb(tagged) {
                return Some(notification);
            }
        }
    }

    /// Everything that is ready right now, without waiting.
    pub fn poll_notifications(&mut self) -> Vec<Notification> {
        self.pump();
        self.outbox.drain(..).collect()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn role(&self) -> Option<Role> {
        self.session.role()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.session.local_description()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.session.remote_description()
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        self.session.local_candidates()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.relay.transcript()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.relay.channel_state()
    }

    fn pump(&mut self) {
        while let Ok(tagged) = self.events_rx.try_recv() {
            if let Some(notification) = self.absorb(tagged) {
                self.outbox.push_back(notification);
            }
        }
    }

    fn absorb(&mut self, tagged: GenerationEvent) -> Option<Notification> {
        let notification = match self.session.apply_event(tagged)? {
            SessionEvent::LocalCandidate(candidate) => {
                Notification::LocalCandidateReady(codec::encode_candidate(&candidate))
            }
            SessionEvent::GatheringComplete => Notification::CandidateGatheringComplete,
            SessionEvent::ChannelOpened => {
                self.relay.on_open();
                Notification::ChannelOpen
            }
            SessionEvent::ChannelClosed => {
                self.relay.on_close();
                Notification::ChannelClose
            }
            SessionEvent::MessageReceived(text) => {
                self.relay.on_message(text.clone());
                Notification::MessageReceived(text)
            }
        };
        Some(notification)
    }

    fn announce_local(&mut self, description: &SessionDescription) {
        self.outbox.push_back(Notification::LocalDescriptionReady(
            codec::encode_description(description),
        ));
    }

    /// A create call that got past decoding has reset the session; whatever
    /// the relay and outbox held belongs to the old one.
    fn forget_if_restarted(&mut self, before: Generation) {
        if self.session.generation() != before {
            debug!(
                previous = before.value(),
                generation = self.session.generation().value(),
                "session restarted"
            );
            self.relay.reset();
            self.outbox.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NegotiationError, RelayError};
    use crate::relay::Origin;
    use crate::transport::TransportEvent;
    use crate::transport::mock::MockNetwork;

    fn local_description_text(notifications: &[Notification]) -> String {
        notifications
            .iter()
            .find_map(|n| match n {
                Notification::LocalDescriptionReady(text) => Some(text.clone()),
                _ => None,
            })
            .expect("local description notification")
    }

    async fn connected_pair(
        network: &MockNetwork,
    ) -> (SessionController<MockNetwork>, SessionController<MockNetwork>) {
        let mut alice = SessionController::new(network.clone());
        let mut bob = SessionController::new(network.clone());
        alice.create_offer().await.unwrap();
        let offer = local_description_text(&alice.poll_notifications());
        bob.create_answer(&offer).await.unwrap();
        let answer = local_description_text(&bob.poll_notifications());
        alice.set_remote(&answer).await.unwrap();
        assert!(alice.poll_notifications().contains(&Notification::ChannelOpen));
        assert!(bob.poll_notifications().contains(&Notification::ChannelOpen));
        (alice, bob)
    }

    #[tokio::test]
    async fn offer_notifications_arrive_description_first() {
        let mut controller = SessionController::new(MockNetwork::new());
        controller.create_offer().await.unwrap();
        let notifications = controller.poll_notifications();
        assert!(matches!(
            notifications.first(),
            Some(Notification::LocalDescriptionReady(_))
        ));
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::LocalCandidateReady(_))));
        assert_eq!(
            notifications.last(),
            Some(&Notification::CandidateGatheringComplete)
        );
        assert_eq!(controller.state(), SessionState::LocalOfferCreated);
    }

    #[tokio::test]
    async fn chat_round_trip_updates_both_transcripts() {
        let network = MockNetwork::new();
        let (mut alice, mut bob) = connected_pair(&network).await;

        alice.send_message("hi").await.unwrap();
        assert_eq!(
            bob.poll_notifications(),
            vec![Notification::MessageReceived("hi".into())]
        );
        assert_eq!(
            alice.transcript().last(),
            Some(&TranscriptEntry::Message {
                origin: Origin::Local,
                text: "hi".into()
            })
        );
        assert_eq!(bob.transcript().last(), Some(&TranscriptEntry::peer("hi")));
    }

    #[tokio::test]
    async fn peer_reset_closes_the_channel() {
        let network = MockNetwork::new();
        let (mut alice, mut bob) = connected_pair(&network).await;
        alice.reset().await;
        assert_eq!(alice.state(), SessionState::Idle);
        assert!(alice.transcript().is_empty());
        assert_eq!(bob.poll_notifications(), vec![Notification::ChannelClose]);
        assert_eq!(bob.state(), SessionState::Closed);
        assert_eq!(bob.channel_state(), ChannelState::Closed);
        assert_eq!(
            bob.send_message("anyone?").await,
            Err(SessionError::Relay(RelayError::ChannelNotOpen))
        );
    }

    #[tokio::test]
    async fn malformed_offer_keeps_the_running_session() {
        let network = MockNetwork::new();
        let (_alice, mut bob) = connected_pair(&network).await;
        let err = bob.create_answer("not json").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Negotiation(NegotiationError::MalformedRemoteDescription(_))
        ));
        assert_eq!(bob.state(), SessionState::Connected);
        assert_eq!(bob.channel_state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn stale_notifications_never_reach_the_caller() {
        let network = MockNetwork::new();
        let mut controller = SessionController::new(network.clone());
        controller.create_offer().await.unwrap();
        controller.poll_notifications();
        let stale = network.sink(0).unwrap();

        controller.reset().await;
        stale.emit(TransportEvent::MessageReceived("late".into()));
        stale.emit(TransportEvent::ChannelOpened);
        assert!(controller.poll_notifications().is_empty());
        assert!(controller.transcript().is_empty());
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn held_candidate_rejection_is_notified() {
        let network = MockNetwork::new();
        let mut alice = SessionController::new(network.clone());
        let mut bob = SessionController::new(network.clone());
        alice.create_offer().await.unwrap();
        let offer = local_description_text(&alice.poll_notifications());
        bob.create_answer(&offer).await.unwrap();
        let answer = local_description_text(&bob.poll_notifications());

        let bogus = codec::encode_candidate(&IceCandidate::new("bogus"));
        alice.add_candidate(&bogus).await.unwrap();
        alice.set_remote(&answer).await.unwrap();
        let notifications = alice.poll_notifications();
        assert!(notifications.iter().any(|n| matches!(
            n,
            Notification::CandidateRejected { candidate, .. } if candidate == &bogus
        )));
    }

    #[tokio::test]
    async fn next_notification_waits_for_transport_events() {
        let network = MockNetwork::new();
        let mut controller = SessionController::new(network.clone());
        controller.create_offer().await.unwrap();
        controller.poll_notifications();

        let sink = network.sink(0).unwrap();
        let emitter = tokio::spawn(async move {
            tokio::task::yield_now().await;
            sink.emit(TransportEvent::GatheringComplete);
        });
        let next = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            controller.next_notification(),
        )
        .await
        .unwrap();
        assert_eq!(next, Some(Notification::CandidateGatheringComplete));
        emitter.await.unwrap();
    }

    /// Hands out mock transports whose `close` never finishes.
    struct HangingClose(MockNetwork);

    struct HangingTransport(Box<dyn crate::transport::TransportCapability>);

    #[async_trait::async_trait]
    impl TransportFactory for HangingClose {
        async fn allocate(
            &self,
            role: Role,
            sink: crate::transport::EventSink,
        ) -> Result<Box<dyn crate::transport::TransportCapability>, crate::error::TransportError>
        {
            let inner = self.0.allocate(role, sink).await?;
            Ok(Box::new(HangingTransport(inner)))
        }
    }

    #[async_trait::async_trait]
    impl crate::transport::TransportCapability for HangingTransport {
        async fn create_offer(&self) -> Result<SessionDescription, crate::error::TransportError> {
            self.0.create_offer().await
        }
        async fn create_answer(&self) -> Result<SessionDescription, crate::error::TransportError> {
            self.0.create_answer().await
        }
        async fn apply_remote_description(
            &self,
            description: &SessionDescription,
        ) -> Result<(), crate::error::TransportError> {
            self.0.apply_remote_description(description).await
        }
        async fn add_remote_candidate(
            &self,
            candidate: &IceCandidate,
        ) -> Result<(), crate::error::TransportError> {
            self.0.add_remote_candidate(candidate).await
        }
        async fn send_text(&self, text: &str) -> Result<(), crate::error::TransportError> {
            self.0.send_text(text).await
        }
        async fn close(&self) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn abandoned_reset_still_forgets_transcript_and_pending_notifications() {
        let network = MockNetwork::new();
        let mut alice = SessionController::new(HangingClose(network.clone()));
        let mut bob = SessionController::new(network.clone());
        alice.create_offer().await.unwrap();
        let offer = local_description_text(&alice.poll_notifications());
        bob.create_answer(&offer).await.unwrap();
        let answer = local_description_text(&bob.poll_notifications());
        alice.set_remote(&answer).await.unwrap();
        bob.poll_notifications();

        bob.send_message("queued").await.unwrap();
        alice.send_message("mine").await.unwrap();
        assert_eq!(alice.transcript().len(), 3);

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            alice.reset(),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(alice.state(), SessionState::Idle);
        assert!(alice.transcript().is_empty());
        assert_eq!(alice.channel_state(), ChannelState::Connecting);
        assert!(alice.poll_notifications().is_empty());
    }
}
