use std::time::Duration;

use anyhow::{Context, Result, bail};
use pastechat::codec;
use pastechat::transport::TransportEvent;
use pastechat::transport::mock::MockNetwork;
use pastechat::{
    ChannelState, NegotiationError, Notification, Origin, RelayError, SessionController,
    SessionError, SessionHandle, SessionState, TranscriptEntry,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_matching<F>(
    controller: &mut SessionController<MockNetwork>,
    mut pick: impl FnMut(&Notification) -> Option<F>,
) -> Result<F> {
    timeout(STEP_TIMEOUT, async {
        loop {
            match controller.next_notification().await {
                Some(notification) => {
                    if let Some(found) = pick(&notification) {
                        return Ok(found);
                    }
                }
                None => bail!("notification stream ended"),
            }
        }
    })
    .await
    .context("timed out waiting for notification")?
}

async fn local_description(controller: &mut SessionController<MockNetwork>) -> Result<String> {
    next_matching(controller, |n| match n {
        Notification::LocalDescriptionReady(text) => Some(text.clone()),
        _ => None,
    })
    .await
}

async fn channel_open(controller: &mut SessionController<MockNetwork>) -> Result<()> {
    next_matching(controller, |n| {
        matches!(n, Notification::ChannelOpen).then_some(())
    })
    .await
}

#[tokio::test]
async fn two_peers_negotiate_by_copy_paste_and_chat() -> Result<()> {
    pastechat::telemetry::init_for_tests();
    let network = MockNetwork::new();
    let mut peer_a = SessionController::new(network.clone());
    let mut peer_b = SessionController::new(network.clone());

    peer_a.create_offer().await?;
    let offer_text = local_description(&mut peer_a).await?;
    assert!(!offer_text.contains('\n'));

    peer_b.create_answer(&offer_text).await?;
    let answer_text = local_description(&mut peer_b).await?;
    assert_eq!(peer_b.state(), SessionState::LocalAnswerCreated);

    peer_a.set_remote(&answer_text).await?;
    channel_open(&mut peer_a).await?;
    channel_open(&mut peer_b).await?;
    assert_eq!(peer_a.state(), SessionState::Connected);
    assert_eq!(peer_b.state(), SessionState::Connected);

    peer_a.send_message("hi").await?;
    let received = next_matching(&mut peer_b, |n| match n {
        Notification::MessageReceived(text) => Some(text.clone()),
        _ => None,
    })
    .await?;
    assert_eq!(received, "hi");
    assert!(peer_a.transcript().contains(&TranscriptEntry::Message {
        origin: Origin::Local,
        text: "hi".into(),
    }));
    assert_eq!(
        peer_b.transcript(),
        &[TranscriptEntry::ChannelOpened, TranscriptEntry::peer("hi")]
    );
    Ok(())
}

#[tokio::test]
async fn trickled_candidates_can_be_pasted_in_any_order() -> Result<()> {
    let network = MockNetwork::new();
    let mut peer_a = SessionController::new(network.clone());
    let mut peer_b = SessionController::new(network.clone());

    peer_a.create_offer().await?;
    let mut offer_text = None;
    let mut a_candidates = Vec::new();
    for notification in peer_a.poll_notifications() {
        match notification {
            Notification::LocalDescriptionReady(text) => offer_text = Some(text),
            Notification::LocalCandidateReady(text) => a_candidates.push(text),
            _ => {}
        }
    }
    let offer_text = offer_text.context("offer was not announced")?;
    assert!(!a_candidates.is_empty());

    peer_b.create_answer(&offer_text).await?;
    for candidate in &a_candidates {
        peer_b.add_candidate(candidate).await?;
    }
    let mut answer_text = None;
    let mut b_candidates = Vec::new();
    for notification in peer_b.poll_notifications() {
        match notification {
            Notification::LocalDescriptionReady(text) => answer_text = Some(text),
            Notification::LocalCandidateReady(text) => b_candidates.push(text),
            _ => {}
        }
    }

    // The answerer's candidates reach the offerer before its answer does.
    for candidate in &b_candidates {
        peer_a.add_candidate(candidate).await?;
    }
    peer_a
        .set_remote(&answer_text.context("answer was not announced")?)
        .await?;

    assert_eq!(network.remote_candidates(0).len(), b_candidates.len());
    assert_eq!(network.remote_candidates(1).len(), a_candidates.len());
    channel_open(&mut peer_a).await?;
    Ok(())
}

#[tokio::test]
async fn create_answer_with_garbage_stays_idle() {
    let mut controller = SessionController::new(MockNetwork::new());
    let err = controller.create_answer("not json").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Negotiation(NegotiationError::MalformedRemoteDescription(_))
    ));
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(controller.poll_notifications().is_empty());
}

#[tokio::test]
async fn wrong_blob_kinds_are_refused_without_side_effects() -> Result<()> {
    let network = MockNetwork::new();
    let mut peer_a = SessionController::new(network.clone());
    peer_a.create_offer().await?;
    let offer_text = local_description(&mut peer_a).await?;

    // Pasting one's own offer where the answer belongs.
    let err = peer_a.set_remote(&offer_text).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Negotiation(NegotiationError::MalformedRemoteDescription(_))
    ));
    let err = peer_a.add_candidate(&offer_text).await.unwrap_err();
    assert!(matches!(err, SessionError::Codec(_)));
    assert_eq!(peer_a.state(), SessionState::LocalOfferCreated);
    assert!(peer_a.remote_description().is_none());
    Ok(())
}

#[tokio::test]
async fn send_before_open_is_refused() -> Result<()> {
    let mut controller = SessionController::new(MockNetwork::new());
    controller.create_offer().await?;
    assert_eq!(
        controller.send_message("too soon").await,
        Err(SessionError::Relay(RelayError::ChannelNotOpen))
    );
    assert!(controller.transcript().is_empty());
    Ok(())
}

#[tokio::test]
async fn reset_discards_late_callbacks_from_the_old_transport() -> Result<()> {
    let network = MockNetwork::new();
    let mut peer_a = SessionController::new(network.clone());
    let mut peer_b = SessionController::new(network.clone());
    peer_a.create_offer().await?;
    let offer_text = local_description(&mut peer_a).await?;
    peer_b.create_answer(&offer_text).await?;
    let answer_text = local_description(&mut peer_b).await?;
    peer_a.set_remote(&answer_text).await?;
    channel_open(&mut peer_a).await?;
    peer_a.send_message("before reset").await?;

    let old_sink = network.sink(0).context("first transport sink")?;
    peer_a.reset().await;
    peer_a.create_offer().await?;
    let fresh_offer = local_description(&mut peer_a).await?;
    assert_ne!(fresh_offer, offer_text);

    old_sink.emit(TransportEvent::MessageReceived("ghost".into()));
    old_sink.emit(TransportEvent::ChannelOpened);
    old_sink.emit(TransportEvent::CandidateDiscovered(pastechat::IceCandidate::new(
        "candidate:ghost 1 udp 1 10.9.9.9 9 typ host",
    )));

    let leftovers = peer_a.poll_notifications();
    assert!(leftovers.iter().all(|n| !matches!(
        n,
        Notification::MessageReceived(_) | Notification::ChannelOpen
    )));
    assert!(!leftovers.iter().any(|n| matches!(
        n,
        Notification::LocalCandidateReady(text) if text.contains("ghost")
    )));
    assert_eq!(peer_a.state(), SessionState::LocalOfferCreated);
    assert!(peer_a.transcript().is_empty());
    assert_eq!(peer_a.channel_state(), ChannelState::Connecting);
    Ok(())
}

#[tokio::test]
async fn candidate_blobs_survive_a_round_trip_through_the_codec() -> Result<()> {
    let mut controller = SessionController::new(MockNetwork::new());
    controller.create_offer().await?;
    let candidate_text = next_matching(&mut controller, |n| match n {
        Notification::LocalCandidateReady(text) => Some(text.clone()),
        _ => None,
    })
    .await?;
    let decoded = codec::decode_candidate(&candidate_text)?;
    assert_eq!(controller.local_candidates(), &[decoded]);
    Ok(())
}

async fn handle_description(rx: &mut UnboundedReceiver<Notification>) -> Result<String> {
    timeout(STEP_TIMEOUT, async {
        while let Some(notification) = rx.recv().await {
            if let Notification::LocalDescriptionReady(text) = notification {
                return Ok(text);
            }
        }
        bail!("notification stream ended")
    })
    .await
    .context("timed out waiting for local description")?
}

async fn handle_open(rx: &mut UnboundedReceiver<Notification>) -> Result<()> {
    timeout(STEP_TIMEOUT, async {
        while let Some(notification) = rx.recv().await {
            if notification == Notification::ChannelOpen {
                return Ok(());
            }
        }
        bail!("notification stream ended")
    })
    .await
    .context("timed out waiting for channel open")?
}

#[tokio::test]
async fn handles_drive_sessions_from_separate_tasks() -> Result<()> {
    let network = MockNetwork::new();
    let (peer_a, mut a_rx) = SessionHandle::spawn(network.clone());
    let (peer_b, mut b_rx) = SessionHandle::spawn(network.clone());

    peer_a.create_offer().await?;
    let offer_text = handle_description(&mut a_rx).await?;
    peer_b.create_answer(&offer_text).await?;
    let answer_text = handle_description(&mut b_rx).await?;
    peer_a.set_remote(&answer_text).await?;
    handle_open(&mut a_rx).await?;
    handle_open(&mut b_rx).await?;

    let sender = peer_b.clone();
    tokio::spawn(async move { sender.send_message("from another task").await }).await??;

    let received = timeout(STEP_TIMEOUT, async {
        while let Some(notification) = a_rx.recv().await {
            if let Notification::MessageReceived(text) = notification {
                return Some(text);
            }
        }
        None
    })
    .await?;
    assert_eq!(received.as_deref(), Some("from another task"));

    let snapshot = peer_b.snapshot().await?;
    assert_eq!(snapshot.state, SessionState::Connected);
    assert_eq!(
        snapshot.transcript.last(),
        Some(&TranscriptEntry::local("from another task"))
    );
    Ok(())
}
