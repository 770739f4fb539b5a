//! Transport sessions backed by the `webrtc` crate.
//!
//! Each [`WebRtcPeer`] wraps one `RTCPeerConnection`. Every callback the
//! connection exposes is turned into a [`PeerEvent`] on the session's
//! channel; the handler never touches `webrtc` types directly.

use std::sync::Arc;

use async_trait::async_trait;
use callcore::{CallError, IceCandidate, SdpKind, SessionDescription};
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use super::{
    LocalMedia, MediaKind, PeerConnectionState, PeerEvent, PeerSignalingState, PeerTransport,
    PeerTransportFactory, RemoteStream,
};

const PEER_EVENT_BUFFER: usize = 256;

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn negotiation(e: webrtc::Error) -> CallError {
    CallError::Negotiation(e.to_string())
}

/// Creates one `RTCPeerConnection` per call session.
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn build_api() -> Result<webrtc::api::API, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        media: &LocalMedia,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), CallError> {
        let api = Self::build_api().map_err(negotiation)?;
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(negotiation)?);

        for track in media.live_tracks() {
            pc.add_track(track.track()).await.map_err(negotiation)?;
            debug!(target: "PeerTransport", "Attached local {:?} track {}", track.kind(), track.id());
        }
        // Always ask for both kinds even when we do not send them.
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if !media.has_kind(kind) {
                pc.add_transceiver_from_kind(
                    kind.codec_type(),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(negotiation)?;
            }
        }

        let (event_tx, event_rx) = mpsc::channel(PEER_EVENT_BUFFER);
        let data_channel: ChannelSlot = Arc::new(Mutex::new(None));
        wire_peer_connection(&pc, &event_tx, &data_channel);

        let peer = WebRtcPeer {
            pc,
            data_channel,
            event_tx,
        };
        Ok((Arc::new(peer), event_rx))
    }
}

fn wire_peer_connection(
    pc: &Arc<RTCPeerConnection>,
    event_tx: &mpsc::Sender<PeerEvent>,
    data_channel: &ChannelSlot,
) {
    let tx = event_tx.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!(target: "PeerTransport", "Candidate gathering finished");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx
                        .send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }))
                        .await;
                }
                Err(e) => warn!(target: "PeerTransport", "Unserializable local candidate: {e}"),
            }
        })
    }));

    let tx = event_tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(kind) = MediaKind::from_codec_type(track.kind()) else {
                return;
            };
            let stream = RemoteStream {
                stream_id: track.stream_id().to_string(),
                track_id: track.id().to_string(),
                kind,
                track: Some(track),
            };
            info!(
                target: "PeerTransport",
                "Remote {:?} track {} on stream {}",
                stream.kind, stream.track_id, stream.stream_id
            );
            let _ = tx.send(PeerEvent::RemoteStream(stream)).await;
        })
    }));

    let tx = event_tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(target: "PeerTransport", "Peer connection state: {s}");
            let state = match s {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                    PeerConnectionState::New
                }
                RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
                RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
                RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
            };
            let _ = tx.send(PeerEvent::ConnectionState(state)).await;
        })
    }));

    let tx = event_tx.clone();
    let slot = data_channel.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        let slot = slot.clone();
        Box::pin(async move {
            info!(target: "PeerTransport", "Data channel '{}' offered by peer", dc.label());
            wire_data_channel(&dc, &tx);
            *slot.lock().await = Some(dc);
        })
    }));
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, event_tx: &mpsc::Sender<PeerEvent>) {
    let tx = event_tx.clone();
    let label = dc.label().to_owned();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            info!(target: "PeerTransport", "Data channel '{label}' open");
            let _ = tx.send(PeerEvent::DataChannelOpen).await;
        })
    }));

    let tx = event_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    let _ = tx.send(PeerEvent::TextReceived(text)).await;
                }
                Err(_) => warn!(target: "PeerTransport", "Dropping non UTF-8 data channel message"),
            }
        })
    }));
}

/// One `RTCPeerConnection` plus its text channel.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    data_channel: ChannelSlot,
    event_tx: mpsc::Sender<PeerEvent>,
}

impl WebRtcPeer {
    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, CallError> {
        match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(negotiation),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(negotiation),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(negotiation),
            SdpKind::Rollback => {
                let mut rollback = RTCSessionDescription::default();
                rollback.sdp_type = RTCSdpType::Rollback;
                rollback.sdp = desc.sdp;
                Ok(rollback)
            }
        }
    }

    fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescription> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            RTCSdpType::Unspecified => return None,
        };
        Some(SessionDescription {
            kind,
            sdp: desc.sdp,
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_local_description(Self::to_rtc(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_remote_description(Self::to_rtc(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(Self::from_rtc)
    }

    async fn rollback(&self) -> Result<(), CallError> {
        let pending = self
            .pc
            .pending_local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_default();
        self.set_local_description(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: pending,
        })
        .await
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| CallError::StaleCandidate(e.to_string()))
    }

    fn signaling_state(&self) -> PeerSignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => PeerSignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => PeerSignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => PeerSignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => PeerSignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => PeerSignalingState::Closed,
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => {
                PeerSignalingState::Stable
            }
        }
    }

    async fn gathering_complete(&self) {
        let mut done = self.pc.gathering_complete_promise().await;
        let _ = done.recv().await;
    }

    async fn open_data_channel(&self, label: &str) -> Result<(), CallError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| CallError::DataChannel(e.to_string()))?;
        wire_data_channel(&dc, &self.event_tx);
        *self.data_channel.lock().await = Some(dc);
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), CallError> {
        let guard = self.data_channel.lock().await;
        let dc = guard
            .as_ref()
            .ok_or_else(|| CallError::DataChannel("no data channel".to_string()))?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(CallError::DataChannel(format!(
                "data channel is {}",
                dc.ready_state()
            )));
        }
        dc.send_text(text.to_owned())
            .await
            .map(|_| ())
            .map_err(|e| CallError::DataChannel(e.to_string()))
    }

    async fn close(&self) {
        if let Some(dc) = self.data_channel.lock().await.take()
            && let Err(e) = dc.close().await
        {
            debug!(target: "PeerTransport", "Data channel close failed: {e}");
        }
        if let Err(e) = self.pc.close().await {
            warn!(target: "PeerTransport", "Peer connection close failed: {e}");
        }
        info!(target: "PeerTransport", "Transport session closed");
    }
}
