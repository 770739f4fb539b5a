#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use peercall::media::{
    LocalMedia, MediaKind, PeerConnectionState, PeerEvent, PeerSignalingState, PeerTransport,
    PeerTransportFactory, RemoteStream,
};
use peercall::transport::{Transport, TransportEvent, TransportFactory};
use peercall::{
    CallError, CallHandlerHandle, HandlerConfig, HandlerSnapshot, IceCandidate, SdpKind,
    SessionDescription, UserCode, spawn_call_handler,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub fn code(s: &str) -> UserCode {
    s.parse().unwrap()
}

// --- In-memory relay ---

#[derive(Default)]
struct RelayState {
    clients: HashMap<String, mpsc::Sender<TransportEvent>>,
    attempts: Vec<(String, Instant)>,
    /// Every envelope a client sent, as `(sender, envelope)`.
    sent: Vec<(String, Value)>,
}

/// Routes envelopes between registered codes the way the relay server does:
/// `target` is replaced by `from`, and unknown targets get an `error` back.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
    fail_next: Arc<AtomicU32>,
    hang: Arc<AtomicBool>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` dials fail immediately.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// While set, dials never complete.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn attempts_for(&self, identity: &str) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .attempts
            .iter()
            .filter(|(who, _)| who == identity)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn sent_by(&self, identity: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(who, _)| who == identity)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    /// Envelope types sent by `identity`, in order.
    pub fn kinds_sent_by(&self, identity: &str) -> Vec<String> {
        self.sent_by(identity)
            .iter()
            .filter_map(|v| v["type"].as_str().map(str::to_owned))
            .collect()
    }

    pub fn is_registered(&self, identity: &str) -> bool {
        self.state.lock().unwrap().clients.contains_key(identity)
    }

    /// Drops the connection of `identity` as if the network went away.
    pub async fn drop_connection(&self, identity: &str) {
        let client = self.state.lock().unwrap().clients.remove(identity);
        if let Some(client) = client {
            let _ = client.send(TransportEvent::Disconnected).await;
        }
    }

    /// Pushes a raw frame to `identity`.
    pub async fn inject(&self, identity: &str, frame: &str) {
        let client = self.state.lock().unwrap().clients.get(identity).cloned();
        if let Some(client) = client {
            let _ = client.send(TransportEvent::TextReceived(frame.to_owned())).await;
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryRelay {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let identity = url.rsplit('/').next().unwrap_or_default().to_owned();
        self.state
            .lock()
            .unwrap()
            .attempts
            .push((identity.clone(), Instant::now()));

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("connection refused");
        }

        let (tx, rx) = mpsc::channel(64);
        let _ = tx.send(TransportEvent::Connected).await;
        self.state
            .lock()
            .unwrap()
            .clients
            .insert(identity.clone(), tx.clone());

        let transport = RelayTransport {
            identity,
            own: tx,
            relay: self.clone(),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(transport), rx))
    }
}

struct RelayTransport {
    identity: String,
    own: mpsc::Sender<TransportEvent>,
    relay: MemoryRelay,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("socket closed");
        }
        let mut envelope: Value = serde_json::from_str(text)?;
        let target = envelope["target"].as_str().unwrap_or_default().to_owned();

        let recipient = {
            let mut state = self.relay.state.lock().unwrap();
            state.sent.push((self.identity.clone(), envelope.clone()));
            state.clients.get(&target).cloned()
        };

        match recipient {
            Some(recipient) => {
                if let Some(fields) = envelope.as_object_mut() {
                    fields.remove("target");
                    fields.insert("from".to_owned(), json!(self.identity));
                }
                let _ = recipient
                    .send(TransportEvent::TextReceived(envelope.to_string()))
                    .await;
            }
            None => {
                let error = json!({
                    "type": "error",
                    "message": format!("User {target} is not online"),
                });
                let _ = self
                    .own
                    .send(TransportEvent::TextReceived(error.to_string()))
                    .await;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.relay.state.lock().unwrap();
        if state
            .clients
            .get(&self.identity)
            .is_some_and(|c| c.same_channel(&self.own))
        {
            state.clients.remove(&self.identity);
        }
    }
}

// --- In-memory peer connections ---

#[derive(Default)]
struct PeerState {
    signaling: Option<PeerSignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    calls: Vec<String>,
    applied: Vec<String>,
    texts: Vec<String>,
    data_channel: bool,
    connected: bool,
    closed: bool,
    local_offer_at: Option<Instant>,
}

/// A peer connection that follows the offer/answer state rules and reports
/// `Connected` once both descriptions are in place.
pub struct MockPeer {
    events: mpsc::Sender<PeerEvent>,
    state: Mutex<PeerState>,
    ufrag: String,
    hold_gathering: bool,
    fail_rollback: bool,
    reject_remote_answer: bool,
    local_offer_delay: Duration,
    local_candidates: Vec<String>,
}

impl MockPeer {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.state.lock().unwrap().texts.clone()
    }

    /// ICE username fragment written into every description this peer makes.
    pub fn ufrag(&self) -> &str {
        &self.ufrag
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.lock().unwrap().remote.is_some()
    }

    /// Delivers `event` as if the connection raised it.
    pub async fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event).await;
    }

    fn record(state: &mut PeerState, call: impl Into<String>) {
        state.calls.push(call.into());
    }

    fn signaling_of(state: &PeerState) -> PeerSignalingState {
        state.signaling.unwrap_or(PeerSignalingState::Stable)
    }

    fn maybe_connect(&self, state: &mut PeerState) {
        if state.connected
            || state.local.is_none()
            || state.remote.is_none()
            || Self::signaling_of(state) != PeerSignalingState::Stable
        {
            return;
        }
        state.connected = true;
        let stream = |track: &str| RemoteStream {
            stream_id: "remote-stream".to_owned(),
            track_id: track.to_owned(),
            kind: MediaKind::Audio,
            track: None,
        };
        let _ = self
            .events
            .try_send(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        let _ = self.events.try_send(PeerEvent::RemoteStream(stream("audio")));
        let _ = self.events.try_send(PeerEvent::RemoteStream(stream("video")));
        let _ = self.events.try_send(PeerEvent::DataChannelOpen);
    }

    fn rejected(what: &str, state: PeerSignalingState) -> CallError {
        CallError::Negotiation(format!("{what} in state {state:?}"))
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("create_offer(ice_restart={ice_restart})"));
        Ok(SessionDescription::offer(format!(
            "mock-offer restart={ice_restart}\r\na=ice-ufrag:{}\r\n",
            self.ufrag
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "create_answer");
        let current = Self::signaling_of(&state);
        if current != PeerSignalingState::HaveRemoteOffer {
            return Err(Self::rejected("create_answer", current));
        }
        Ok(SessionDescription::answer(format!(
            "mock-answer\r\na=ice-ufrag:{}\r\n",
            self.ufrag
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("set_local({:?})", desc.kind));
        let current = Self::signaling_of(&state);
        let next = match (desc.kind, current) {
            (SdpKind::Offer, PeerSignalingState::Stable | PeerSignalingState::HaveLocalOffer) => {
                PeerSignalingState::HaveLocalOffer
            }
            (SdpKind::Answer, PeerSignalingState::HaveRemoteOffer) => PeerSignalingState::Stable,
            (kind, current) => return Err(Self::rejected(&format!("local {kind:?}"), current)),
        };
        if desc.kind == SdpKind::Offer {
            state.local_offer_at = Some(Instant::now());
        }
        state.signaling = Some(next);
        state.local = Some(desc);
        self.maybe_connect(&mut state);
        drop(state);

        for candidate in &self.local_candidates {
            let _ = self
                .events
                .try_send(PeerEvent::LocalCandidate(IceCandidate::new(candidate.clone())));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("set_remote({:?})", desc.kind));
        if self.reject_remote_answer && desc.kind == SdpKind::Answer {
            return Err(CallError::Negotiation("remote answer rejected".to_owned()));
        }
        let current = Self::signaling_of(&state);
        let next = match (desc.kind, current) {
            (SdpKind::Offer, PeerSignalingState::Stable | PeerSignalingState::HaveRemoteOffer) => {
                PeerSignalingState::HaveRemoteOffer
            }
            (SdpKind::Answer, PeerSignalingState::HaveLocalOffer) => PeerSignalingState::Stable,
            (kind, current) => return Err(Self::rejected(&format!("remote {kind:?}"), current)),
        };
        state.signaling = Some(next);
        state.remote = Some(desc);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    async fn rollback(&self) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "rollback");
        if self.fail_rollback {
            return Err(CallError::Negotiation("rollback unsupported".to_owned()));
        }
        let current = Self::signaling_of(&state);
        if current != PeerSignalingState::HaveLocalOffer {
            return Err(Self::rejected("rollback", current));
        }
        state.signaling = Some(PeerSignalingState::Stable);
        state.local = None;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(CallError::StaleCandidate("no remote description".to_owned()));
        }
        if candidate.candidate.contains("malformed") {
            return Err(CallError::StaleCandidate(candidate.candidate));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    fn signaling_state(&self) -> PeerSignalingState {
        let state = self.state.lock().unwrap();
        if state.closed {
            return PeerSignalingState::Closed;
        }
        let current = Self::signaling_of(&state);
        let settling = state
            .local_offer_at
            .is_some_and(|at| at.elapsed() < self.local_offer_delay);
        if current == PeerSignalingState::HaveLocalOffer && settling {
            PeerSignalingState::Stable
        } else {
            current
        }
    }

    async fn gathering_complete(&self) {
        if self.hold_gathering {
            std::future::pending::<()>().await;
        }
    }

    async fn open_data_channel(&self, label: &str) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, format!("open_data_channel({label})"));
        state.data_channel = true;
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected || state.closed {
            return Err(CallError::DataChannel("not open".to_owned()));
        }
        state.texts.push(text.to_owned());
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, "close");
        state.closed = true;
    }
}

#[derive(Default)]
struct FactoryOptions {
    hold_gathering: bool,
    fail_rollback: bool,
    reject_remote_answer: bool,
    local_offer_delay: Duration,
    local_candidates: Vec<String>,
}

/// Hands out [`MockPeer`]s and keeps every one it created.
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    options: Arc<Mutex<FactoryOptions>>,
    peers: Arc<Mutex<Vec<Arc<MockPeer>>>>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gathering never completes; descriptions go out on the timeout.
    pub fn holding_gathering(self) -> Self {
        self.options.lock().unwrap().hold_gathering = true;
        self
    }

    pub fn failing_rollback(self) -> Self {
        self.options.lock().unwrap().fail_rollback = true;
        self
    }

    /// `set_remote_description` fails for every answer.
    pub fn rejecting_remote_answer(self) -> Self {
        self.options.lock().unwrap().reject_remote_answer = true;
        self
    }

    /// `signaling_state` keeps reporting `Stable` for `delay` after a local
    /// offer is set.
    pub fn reporting_local_offer_after(self, delay: Duration) -> Self {
        self.options.lock().unwrap().local_offer_delay = delay;
        self
    }

    /// Each peer reports these candidates right after a local description.
    pub fn with_local_candidates(self, candidates: &[&str]) -> Self {
        self.options.lock().unwrap().local_candidates =
            candidates.iter().map(|c| (*c).to_owned()).collect();
        self
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MockPeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer created yet")
    }
}

#[async_trait]
impl PeerTransportFactory for MockPeerFactory {
    async fn create(
        &self,
        _media: &LocalMedia,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), CallError> {
        let (tx, rx) = mpsc::channel(64);
        let mut peers = self.peers.lock().unwrap();
        let peer = {
            let options = self.options.lock().unwrap();
            Arc::new(MockPeer {
                events: tx,
                state: Mutex::new(PeerState::default()),
                ufrag: format!("mock{}", peers.len()),
                hold_gathering: options.hold_gathering,
                fail_rollback: options.fail_rollback,
                reject_remote_answer: options.reject_remote_answer,
                local_offer_delay: options.local_offer_delay,
                local_candidates: options.local_candidates.clone(),
            })
        };
        peers.push(peer.clone());
        Ok((peer, rx))
    }
}

// --- Handler helpers ---

pub struct Endpoint {
    pub handle: CallHandlerHandle,
    pub peers: MockPeerFactory,
}

pub fn spawn_endpoint(
    identity: &str,
    relay: &MemoryRelay,
    peers: MockPeerFactory,
    config: HandlerConfig,
) -> Endpoint {
    let handle = spawn_call_handler(
        code(identity),
        config,
        Arc::new(relay.clone()),
        Arc::new(peers.clone()),
    );
    Endpoint { handle, peers }
}

/// Polls the handler until `check` holds, panicking after thirty (virtual)
/// seconds.
pub async fn wait_until(
    handle: &CallHandlerHandle,
    what: &str,
    check: impl Fn(&HandlerSnapshot) -> bool,
) -> HandlerSnapshot {
    for _ in 0..3000 {
        let snapshot = handle.state().await.unwrap();
        if check(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{} never reached: {what}; last state {:?}",
        handle.identity(),
        handle.state().await.unwrap()
    );
}

pub async fn wait_connected(handle: &CallHandlerHandle) -> HandlerSnapshot {
    wait_until(handle, "connected call", HandlerSnapshot::is_connected).await
}

/// Everything currently queued on a broadcast receiver.
pub fn drain<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
