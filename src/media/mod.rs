//! Transport sessions: the peer connection that carries one call's media
//! and text channel.
//!
//! The handler only talks to [`PeerTransport`] and [`PeerTransportFactory`].
//! [`webrtc::WebRtcPeerFactory`] is the production implementation; tests
//! substitute an in-memory one.

pub mod webrtc;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use callcore::{CallError, IceCandidate, SessionDescription};
use ::webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_remote::TrackRemote;
use tokio::sync::mpsc;

pub use self::webrtc::WebRtcPeerFactory;

/// Label of the ordered data channel used for text.
pub const TEXT_CHANNEL_LABEL: &str = "text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }

    fn codec_type(self) -> RTPCodecType {
        match self {
            Self::Audio => RTPCodecType::Audio,
            Self::Video => RTPCodecType::Video,
        }
    }
}

/// One locally captured track. Whoever feeds samples into it should stop
/// once [`LocalTrack::is_stopped`] turns true.
#[derive(Clone)]
pub struct LocalTrack {
    track: Arc<dyn TrackLocal + Send + Sync>,
    kind: MediaKind,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Returns `None` for tracks that are neither audio nor video.
    pub fn new(track: Arc<dyn TrackLocal + Send + Sync>) -> Option<Self> {
        let kind = MediaKind::from_codec_type(track.kind())?;
        Some(Self {
            track,
            kind,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// The local media source handed to `initialize`.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Tracks that can still be attached to a new session.
    pub fn live_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(|t| !t.is_stopped())
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.live_tracks().any(|t| t.kind == kind)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

/// A remote stream surfaced by the transport session.
#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A trickled local candidate; `None`-terminated gathering is not reported.
    LocalCandidate(IceCandidate),
    RemoteStream(RemoteStream),
    ConnectionState(PeerConnectionState),
    DataChannelOpen,
    TextReceived(String),
}

/// One peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    /// Current local description, including candidates gathered so far.
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Discards a pending local offer.
    async fn rollback(&self) -> Result<(), CallError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    fn signaling_state(&self) -> PeerSignalingState;

    /// Resolves once candidate gathering has finished.
    async fn gathering_complete(&self);

    async fn open_data_channel(&self, label: &str) -> Result<(), CallError>;

    async fn send_text(&self, text: &str) -> Result<(), CallError>;

    /// Releases every resource; resolves once they are gone.
    async fn close(&self);
}

/// Creates a [`PeerTransport`] with the given local media attached.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        media: &LocalMedia,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), CallError>;
}
