//! [`TransportCapability`] backed by the `webrtc` crate.
//!
//! Candidates trickle out through the [`EventSink`] as the ICE agent finds
//! them; nothing waits for gathering to finish before the local description
//! is handed back.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use super::{EventSink, TransportCapability, TransportEvent, TransportFactory};
use crate::codec::{DescriptionKind, IceCandidate, SessionDescription};
use crate::config::{IceServer, SessionConfig};
use crate::error::{TransportError, to_rejected, to_setup_error};
use crate::session::Role;

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub struct WebRtcFactory {
    config: SessionConfig,
    vnet: Option<Arc<Net>>,
}

impl WebRtcFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config, vnet: None }
    }

    /// Routes ICE over a virtual network instead of the host's interfaces.
    pub fn with_vnet(mut self, vnet: Arc<Net>) -> Self {
        self.vnet = Some(vnet);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn allocate(
        &self,
        role: Role,
        sink: EventSink,
    ) -> Result<Box<dyn TransportCapability>, TransportError> {
        let generation = sink.generation().value();
        let mut setting = SettingEngine::default();
        if let Some(vnet) = &self.vnet {
            setting.set_vnet(Some(Arc::clone(vnet)));
        }
        let api = build_api(setting)?;
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };

        tracing::trace!(
            target = "webrtc",
            generation,
            ?role,
            await = "api.new_peer_connection",
            state = "start"
        );
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );
        tracing::trace!(
            target = "webrtc",
            generation,
            ?role,
            await = "api.new_peer_connection",
            state = "end"
        );

        register_candidate_handler(&pc, sink.clone());
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            Box::pin(async move {
                tracing::debug!(target = "webrtc", generation, ?state, "peer connection state changed");
            })
        }));

        let channel: ChannelSlot = Arc::new(Mutex::new(None));
        match role {
            Role::Offerer => {
                let init = RTCDataChannelInit {
                    ordered: Some(self.config.ordered),
                    max_retransmits: self.config.max_retransmits,
                    ..Default::default()
                };
                let dc = match pc
                    .create_data_channel(&self.config.data_channel_label, Some(init))
                    .await
                {
                    Ok(dc) => dc,
                    Err(err) => {
                        if let Err(close_err) = pc.close().await {
                            tracing::warn!(
                                target = "webrtc",
                                generation,
                                error = %close_err,
                                "peer connection close failed after data channel setup error"
                            );
                        }
                        return Err(to_setup_error(err));
                    }
                };
                wire_data_channel(&dc, sink);
                channel.lock().replace(dc);
            }
            Role::Answerer => {
                let slot = Arc::clone(&channel);
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot);
                    let sink = sink.clone();
                    Box::pin(async move {
                        tracing::debug!(
                            target = "webrtc",
                            generation,
                            label = dc.label(),
                            "data channel received"
                        );
                        wire_data_channel(&dc, sink);
                        slot.lock().replace(dc);
                    })
                }));
            }
        }

        Ok(Box::new(WebRtcTransport {
            generation,
            pc,
            channel,
        }))
    }
}

pub struct WebRtcTransport {
    generation: u64,
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl WebRtcTransport {
    async fn installed_local_description(&self) -> Result<SessionDescription, TransportError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("missing local description".into()))?;
        description_from_rtc(&local)
    }
}

#[async_trait]
impl TransportCapability for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        tracing::trace!(
            target = "webrtc",
            generation = self.generation,
            await = "pc.create_offer",
            state = "start"
        );
        let offer = self.pc.create_offer(None).await.map_err(to_rejected)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_rejected)?;
        tracing::trace!(
            target = "webrtc",
            generation = self.generation,
            await = "pc.create_offer",
            state = "end"
        );
        self.installed_local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        tracing::trace!(
            target = "webrtc",
            generation = self.generation,
            await = "pc.create_answer",
            state = "start"
        );
        let answer = self.pc.create_answer(None).await.map_err(to_rejected)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_rejected)?;
        tracing::trace!(
            target = "webrtc",
            generation = self.generation,
            await = "pc.create_answer",
            state = "end"
        );
        self.installed_local_description().await
    }

    async fn apply_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(to_rejected)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(to_rejected)?;
        tracing::debug!(
            target = "webrtc",
            generation = self.generation,
            kind = description.kind.as_str(),
            "remote description applied"
        );
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit::from(candidate.clone()))
            .await
            .map_err(to_rejected)?;
        tracing::trace!(
            target = "webrtc",
            generation = self.generation,
            candidate = %candidate.candidate,
            "remote candidate added"
        );
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        let dc = self
            .channel
            .lock()
            .clone()
            .ok_or(TransportError::ChannelClosed)?;
        let written = dc
            .send_text(text.to_owned())
            .await
            .map_err(|err| TransportError::Rejected(err.to_string()))?;
        tracing::trace!(
            target = "webrtc",
            generation = self.generation,
            bytes_written = written,
            "sent text frame"
        );
        Ok(())
    }

    async fn close(&self) {
        self.channel.lock().take();
        if let Err(err) = self.pc.close().await {
            tracing::warn!(
                target = "webrtc",
                generation = self.generation,
                error = %err,
                "peer connection close failed"
            );
        }
    }
}

/// A virtual LAN for running full negotiations without OS networking.
/// Keep it alive for as long as the peers use it.
pub struct VirtualLan {
    router: Arc<AsyncMutex<Router>>,
    nets: Vec<Arc<Net>>,
}

impl VirtualLan {
    /// Starts a router on `cidr` with one virtual NIC per static address.
    pub async fn start(cidr: &str, addresses: &[&str]) -> Result<Self, TransportError> {
        let router = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: cidr.to_owned(),
                ..Default::default()
            })
            .map_err(to_setup_error)?,
        ));
        let mut nets = Vec::with_capacity(addresses.len());
        for address in addresses {
            let vnet = Arc::new(Net::new(Some(NetConfig {
                static_ips: vec![(*address).to_owned()],
                ..Default::default()
            })));
            attach_vnet_to_router(&vnet, &router).await?;
            nets.push(vnet);
        }
        router.lock().await.start().await.map_err(to_setup_error)?;
        Ok(Self { router, nets })
    }

    pub fn net(&self, index: usize) -> Option<Arc<Net>> {
        self.nets.get(index).cloned()
    }

    pub async fn stop(&self) {
        if let Err(err) = self.router.lock().await.stop().await {
            tracing::warn!(target = "webrtc", error = %err, "virtual router stop failed");
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), TransportError> {
    let nic = vnet.get_nic().map_err(to_setup_error)?;
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard
            .add_net(nic_clone)
            .await
            .map_err(to_setup_error)?;
    }
    {
        let nic_guard = nic.lock().await;
        nic_guard
            .set_router(Arc::clone(router))
            .await
            .map_err(to_setup_error)?;
    }
    Ok(())
}

fn register_candidate_handler(pc: &Arc<RTCPeerConnection>, sink: EventSink) {
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => {
                        tracing::trace!(
                            target = "webrtc",
                            generation = sink.generation().value(),
                            candidate = %init.candidate,
                            "local candidate discovered"
                        );
                        sink.emit(TransportEvent::CandidateDiscovered(init.into()));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            error = %err,
                            "failed to serialise local candidate"
                        );
                    }
                },
                None => sink.emit(TransportEvent::GatheringComplete),
            }
        })
    }));
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, sink: EventSink) {
    let generation = sink.generation().value();

    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!(target = "webrtc", generation, "data channel opened");
            open_sink.emit(TransportEvent::ChannelOpened);
        })
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", generation, "data channel closed");
            sink.emit(TransportEvent::ChannelClosed);
        })
    }));

    dc.on_error(Box::new(move |err: webrtc::Error| {
        Box::pin(async move {
            tracing::warn!(target = "webrtc", generation, error = %err, "data channel error");
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            if !msg.is_string {
                tracing::trace!(
                    target = "webrtc",
                    generation,
                    frame_len = msg.data.len(),
                    "binary frame decoded as text"
                );
            }
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            sink.emit(TransportEvent::MessageReceived(text));
        })
    }));
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

fn description_from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp.clone())),
        other => Err(TransportError::Setup(format!(
            "unsupported local sdp type {other}"
        ))),
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}
