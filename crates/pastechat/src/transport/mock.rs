//! In-process transport fabric. Every transport allocated from one
//! [`MockNetwork`] can reach the others, so two controllers in the same test
//! can negotiate and chat without touching the OS network stack.
//!
//! Descriptions carry the allocating peer's index in an `a=mock-peer:` line;
//! the channel opens as soon as two peers have each applied the other's
//! description. Candidates are accepted but not needed to connect.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{EventSink, TransportCapability, TransportEvent, TransportFactory};
use crate::codec::{IceCandidate, SessionDescription};
use crate::error::TransportError;
use crate::session::Role;

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<Mutex<Fabric>>,
}

#[derive(Default)]
struct Fabric {
    fail_allocation: bool,
    peers: Vec<MockPeer>,
}

struct MockPeer {
    role: Role,
    sink: EventSink,
    has_local: bool,
    remote: Option<usize>,
    remote_candidates: Vec<IceCandidate>,
    open: bool,
    closed: bool,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following allocation fail until switched off again.
    pub fn set_allocation_failure(&self, fail: bool) {
        self.inner.lock().fail_allocation = fail;
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// The sink handed to the `index`-th allocated transport. Emitting on it
    /// after that transport was reset simulates a late callback.
    pub fn sink(&self, index: usize) -> Option<EventSink> {
        self.inner.lock().peers.get(index).map(|peer| peer.sink.clone())
    }

    /// Remote candidates the `index`-th transport accepted, in order.
    pub fn remote_candidates(&self, index: usize) -> Vec<IceCandidate> {
        self.inner
            .lock()
            .peers
            .get(index)
            .map(|peer| peer.remote_candidates.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransportFactory for MockNetwork {
    async fn allocate(
        &self,
        role: Role,
        sink: EventSink,
    ) -> Result<Box<dyn TransportCapability>, TransportError> {
        let mut fabric = self.inner.lock();
        if fabric.fail_allocation {
            return Err(TransportError::Setup("mock network refused allocation".into()));
        }
        let id = fabric.peers.len();
        fabric.peers.push(MockPeer {
            role,
            sink,
            has_local: false,
            remote: None,
            remote_candidates: Vec::new(),
            open: false,
            closed: false,
        });
        tracing::trace!(target = "webrtc", peer = id, ?role, "mock transport allocated");
        Ok(Box::new(MockTransport {
            id,
            network: self.clone(),
        }))
    }
}

pub struct MockTransport {
    id: usize,
    network: MockNetwork,
}

impl MockTransport {
    fn local_description(&self, expected: Role) -> Result<SessionDescription, TransportError> {
        let mut fabric = self.network.inner.lock();
        let id = self.id;
        let peer = fabric.peer_mut(id)?;
        if peer.role != expected {
            return Err(TransportError::Rejected(format!(
                "{:?} transport cannot create this description",
                peer.role
            )));
        }
        if expected == Role::Answerer && peer.remote.is_none() {
            return Err(TransportError::Rejected("no remote offer applied".into()));
        }
        peer.has_local = true;
        let sdp = mock_sdp(id, expected);
        peer.sink
            .emit(TransportEvent::CandidateDiscovered(mock_candidate(id)));
        peer.sink.emit(TransportEvent::GatheringComplete);
        fabric.try_open(id);
        Ok(match expected {
            Role::Offerer => SessionDescription::offer(sdp),
            Role::Answerer => SessionDescription::answer(sdp),
        })
    }
}

#[async_trait]
impl TransportCapability for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.local_description(Role::Offerer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.local_description(Role::Answerer)
    }

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = parse_mock_peer(&description.sdp)
            .ok_or_else(|| TransportError::Rejected("not a mock session description".into()))?;
        let mut fabric = self.network.inner.lock();
        if remote == self.id || remote >= fabric.peers.len() {
            return Err(TransportError::Rejected(format!("unknown mock peer {remote}")));
        }
        fabric.peer_mut(self.id)?.remote = Some(remote);
        fabric.try_open(self.id);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut fabric = self.network.inner.lock();
        let peer = fabric.peer_mut(self.id)?;
        if peer.remote.is_none() {
            return Err(TransportError::Rejected("remote description not set".into()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::Rejected(format!(
                "unparseable candidate {:?}",
                candidate.candidate
            )));
        }
        peer.remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let fabric = self.network.inner.lock();
        let me = fabric
            .peers
            .get(self.id)
            .ok_or(TransportError::ChannelClosed)?;
        let remote = match me.remote {
            Some(remote) if me.open && !me.closed => remote,
            _ => return Err(TransportError::ChannelClosed),
        };
        let peer = fabric
            .peers
            .get(remote)
            .filter(|peer| peer.open && !peer.closed)
            .ok_or(TransportError::ChannelClosed)?;
        peer.sink
            .emit(TransportEvent::MessageReceived(text.to_string()));
        Ok(())
    }

    async fn close(&self) {
        let mut fabric = self.network.inner.lock();
        let Some(me) = fabric.peers.get_mut(self.id) else {
            return;
        };
        if me.closed {
            return;
        }
        me.closed = true;
        let was_open = std::mem::replace(&mut me.open, false);
        let remote = me.remote;
        if !was_open {
            return;
        }
        me.sink.emit(TransportEvent::ChannelClosed);
        if let Some(peer) = remote.and_then(|remote| fabric.peers.get_mut(remote)) {
            if peer.open && !peer.closed {
                peer.open = false;
                peer.sink.emit(TransportEvent::ChannelClosed);
            }
        }
    }
}

impl Fabric {
    fn peer_mut(&mut self, id: usize) -> Result<&mut MockPeer, TransportError> {
        match self.peers.get_mut(id) {
            Some(peer) if !peer.closed => Ok(peer),
            _ => Err(TransportError::ChannelClosed),
        }
    }

    fn try_open(&mut self, id: usize) {
        let Some(remote) = self.peers.get(id).and_then(|peer| peer.remote) else {
            return;
        };
        let linked = |a: usize, b: usize| {
            self.peers
                .get(a)
                .is_some_and(|peer| peer.has_local && peer.remote == Some(b) && !peer.closed)
        };
        if !linked(id, remote) || !linked(remote, id) {
            return;
        }
        for index in [id, remote] {
            let peer = &mut self.peers[index];
            if !peer.open {
                peer.open = true;
                peer.sink.emit(TransportEvent::ChannelOpened);
            }
        }
        tracing::trace!(target = "webrtc", peer = id, remote, "mock channel open");
    }
}

fn mock_sdp(id: usize, role: Role) -> String {
    let kind = match role {
        Role::Offerer => "offer",
        Role::Answerer => "answer",
    };
    format!("v=0\r\no=- {id} 0 IN IP4 127.0.0.1\r\ns=-\r\na=mock-peer:{id}\r\na=mock-kind:{kind}\r\n")
}

fn parse_mock_peer(sdp: &str) -> Option<usize> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=mock-peer:"))
        .and_then(|value| value.parse().ok())
}

fn mock_candidate(id: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!(
            "candidate:{id} 1 udp 2130706431 127.0.0.1 {} typ host",
            40_000 + id
        ),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
