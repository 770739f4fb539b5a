use std::collections::HashSet;
use std::sync::Arc;

use callcore::{
    CallError, CallSession, CallState, CallTransition, EndReason, IceCandidate, InboundMessage,
    OutboundMessage, PendingCandidates, SessionDescription, UserCode,
};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::messages::{Deferred, DescriptionPurpose, HandlerCommand, HandlerSnapshot, LoopEvent};
use crate::config::HandlerConfig;
use crate::error::{HandlerError, Result};
use crate::media::{
    LocalMedia, PeerConnectionState, PeerEvent, PeerSignalingState, PeerTransport,
    PeerTransportFactory, TEXT_CHANNEL_LABEL,
};
use crate::signaling::{SignalingConnection, SignalingError, SignalingEvent};
use crate::types::events::{
    CallEnded, CallReceived, CallRejected, ConnectionState, EventBus, TextReceived,
    TranslationResult,
};

const LOOP_EVENT_BUFFER: usize = 256;

/// The peer connection of the current session plus everything tied to it.
struct TransportSession {
    generation: u64,
    peer: Arc<dyn PeerTransport>,
    pump: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    /// Local candidates found before our offer or answer went out.
    held_candidates: Vec<IceCandidate>,
    description_sent: bool,
    /// Which description the running gathering wait will send.
    expected_description: Option<DescriptionPurpose>,
    /// Fallback when the transport cannot report its local description.
    local_description: Option<SessionDescription>,
    /// ICE username fragment of the applied remote description.
    remote_ufrag: Option<String>,
    seen_streams: HashSet<String>,
    data_channel_open: bool,
    ice_restart_pending: bool,
    /// Our ICE-restart offer is waiting for its answer.
    renegotiating: bool,
}

impl TransportSession {
    /// Candidates stamped with another username fragment belong to a
    /// transport the peer has since replaced.
    fn accepts(&self, candidate: &IceCandidate) -> bool {
        match (&self.remote_ufrag, &candidate.username_fragment) {
            (Some(expected), Some(ufrag)) => expected == ufrag,
            _ => true,
        }
    }

    async fn close(self) {
        self.pump.abort();
        for task in self.tasks {
            task.abort();
        }
        self.peer.close().await;
    }
}

/// Owns every resource of one identity and processes commands, relay
/// envelopes and transport events one at a time.
pub(crate) struct CallHandler {
    identity: UserCode,
    config: HandlerConfig,
    events: Arc<EventBus>,
    peer_factory: Arc<dyn PeerTransportFactory>,

    command_rx: mpsc::Receiver<HandlerCommand>,
    signaling_rx: mpsc::Receiver<SignalingEvent>,
    loop_tx: mpsc::Sender<LoopEvent>,
    loop_rx: mpsc::Receiver<LoopEvent>,

    signaling: SignalingConnection,
    media: LocalMedia,
    session: Option<CallSession>,
    transport: Option<TransportSession>,
    pending: PendingCandidates,
    next_generation: u64,
    /// Last outgoing target; re-dialed by `reconnect`.
    target: Option<UserCode>,
    ringing_offer: Option<SessionDescription>,
    disconnect_published: bool,
    /// Commands waiting for the control channel to open.
    deferred: Vec<Deferred>,
    /// Drain pause before the re-dial of `reconnect`.
    redial: Option<JoinHandle<()>>,
    redial_token: u64,
}

impl CallHandler {
    pub(crate) fn new(
        identity: UserCode,
        config: HandlerConfig,
        events: Arc<EventBus>,
        transport_factory: Arc<dyn crate::transport::TransportFactory>,
        peer_factory: Arc<dyn PeerTransportFactory>,
        command_rx: mpsc::Receiver<HandlerCommand>,
    ) -> Self {
        let (signaling_tx, signaling_rx) = mpsc::channel(config.event_capacity.max(1));
        let (loop_tx, loop_rx) = mpsc::channel(LOOP_EVENT_BUFFER);
        let signaling = SignalingConnection::new(
            identity.clone(),
            config.clone(),
            transport_factory,
            signaling_tx,
        );
        Self {
            identity,
            config,
            events,
            peer_factory,
            command_rx,
            signaling_rx,
            loop_tx,
            loop_rx,
            signaling,
            media: LocalMedia::default(),
            session: None,
            transport: None,
            pending: PendingCandidates::new(),
            next_generation: 0,
            target: None,
            ringing_offer: None,
            disconnect_published: false,
            deferred: Vec::new(),
            redial: None,
            redial_token: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(target: "CallHandler", "Call handler for {} started", self.identity);
        loop {
            tokio::select! {
                biased;
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.end_call().await;
                        break;
                    }
                },
                Some(event) = self.signaling_rx.recv() => self.handle_signaling_event(event).await,
                Some(event) = self.loop_rx.recv() => self.handle_loop_event(event).await,
            }
        }
        info!(target: "CallHandler", "Call handler for {} stopped", self.identity);
    }

    /// Returns false once the handler should stop.
    async fn handle_command(&mut self, command: HandlerCommand) -> bool {
        match command {
            HandlerCommand::Initialize { media, reply } => {
                self.media = media;
                self.when_connected(Deferred::Initialize(reply)).await;
            }
            HandlerCommand::StartCall { target, reply } => {
                if target == self.identity {
                    let _ = reply.send(Err(self.report(CallError::SelfCall(target).into())));
                } else {
                    self.cancel_redial();
                    let work = Deferred::StartCall {
                        target,
                        reply: Some(reply),
                    };
                    self.when_connected(work).await;
                }
            }
            HandlerCommand::AcceptIncoming { reply } => {
                let _ = reply.send(self.accept_incoming().await);
            }
            HandlerCommand::RejectIncoming { caller, reply } => {
                let _ = reply.send(self.reject_incoming(caller).await);
            }
            HandlerCommand::EndCall { reply } => {
                self.end_call().await;
                let _ = reply.send(());
            }
            HandlerCommand::SendText { text, reply } => {
                let _ = reply.send(self.send_text(text).await);
            }
            HandlerCommand::State { reply } => {
                let _ = reply.send(self.snapshot());
            }
            HandlerCommand::Shutdown { reply } => {
                self.end_call().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // --- Commands ---

    /// Runs `work` now when the control channel is open, otherwise once the
    /// connect it starts has finished.
    async fn when_connected(&mut self, work: Deferred) {
        if self.signaling.is_open() {
            self.run_deferred(work).await;
            return;
        }
        self.deferred.push(work);
        self.open_signaling();
    }

    async fn run_deferred(&mut self, work: Deferred) {
        match work {
            Deferred::Initialize(reply) => {
                let _ = reply.send(Ok(()));
            }
            Deferred::StartCall { target, reply } => {
                let result = self.start_call(target).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            debug!(target: "CallHandler", "Re-dial failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Expects an open control channel.
    async fn start_call(&mut self, target: UserCode) -> Result<()> {
        self.target = Some(target.clone());

        if self.has_live_session() {
            info!(target: "CallHandler", "Replacing current call before dialing {target}");
            self.hang_up_current(EndReason::Replaced).await;
        }

        let generation = self.bump_generation();
        let mut session = CallSession::new_outgoing(target.clone(), generation);
        session
            .apply_transition(CallTransition::OfferStarted)
            .map_err(CallError::from)?;
        info!(
            target: "CallHandler",
            "Calling {target} (session {}, generation {generation})",
            session.session_id
        );
        self.session = Some(session);
        self.pending.reset(generation);

        if let Err(e) = self.open_transport(generation).await {
            return Err(self.fail_session(e).await);
        }
        if let Err(e) = self.create_local_offer().await {
            return Err(self.fail_session(e).await);
        }
        Ok(())
    }

    async fn accept_incoming(&mut self) -> Result<()> {
        match &self.session {
            Some(session) if session.state.is_ringing() => {}
            Some(session) if session.is_live() => {
                return Err(CallError::NotRinging(session.peer.clone()).into());
            }
            _ => return Err(CallError::NoActiveCall.into()),
        }
        self.answer_ringing().await
    }

    async fn reject_incoming(&mut self, caller: UserCode) -> Result<()> {
        let ringing = self
            .session
            .as_ref()
            .is_some_and(|s| s.peer == caller && s.state.is_ringing());
        if !ringing {
            return Err(CallError::NotRinging(caller).into());
        }
        info!(target: "CallHandler", "Rejecting call from {caller}");
        self.send_envelope(OutboundMessage::CallReject {
            target: caller.clone(),
        })
        .await;
        self.finish_session(EndReason::Declined).await;
        Ok(())
    }

    /// Releases everything. Safe to call in any state, any number of times.
    async fn end_call(&mut self) {
        self.cancel_redial();
        self.send_hangup().await;
        self.finish_session(EndReason::LocalHangup).await;
        self.media.stop_all();
        self.signaling.close().await;
        for work in std::mem::take(&mut self.deferred) {
            work.fail(SignalingError::Cancelled.into());
        }
        self.pending.clear();
        self.target = None;
        self.signaling.reset_retries();

        if !self.disconnect_published {
            self.disconnect_published = true;
            info!(target: "CallHandler", "Call handler for {} disconnected", self.identity);
            self.events.publish_state(ConnectionState::Disconnected);
        }
    }

    async fn send_text(&mut self, text: String) -> Result<()> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(self.report(CallError::NoActiveCall.into()));
        };
        let peer = transport.peer.clone();
        match peer.send_text(&text).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.report(e.into())),
        }
    }

    fn snapshot(&self) -> HandlerSnapshot {
        let session = self.session.as_ref();
        HandlerSnapshot {
            identity: self.identity.clone(),
            signaling: self.signaling.state(),
            retry_count: self.signaling.retry_count(),
            call_state: session.map(|s| s.state.clone()).unwrap_or_default(),
            peer: session.map(|s| s.peer.clone()),
            role: session.map(|s| s.role),
            session_id: session.map(|s| s.session_id.clone()),
            generation: self.transport.as_ref().map(|t| t.generation),
            pending_candidates: self.pending.len(),
            data_channel_open: self.transport.as_ref().is_some_and(|t| t.data_channel_open),
        }
    }

    // --- Relay envelopes ---

    async fn handle_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Message { epoch, message } => {
                if epoch != self.signaling.epoch() {
                    debug!(target: "CallHandler", "Dropping {} from stale epoch {epoch}", message.kind());
                    return;
                }
                self.handle_message(message).await;
            }
            SignalingEvent::Closed { epoch } => {
                if self.signaling.handle_closed(epoch) {
                    self.events.publish_state(ConnectionState::Reconnecting);
                }
            }
            SignalingEvent::Dialed { attempt, outcome } => {
                match self.signaling.handle_dialed(attempt, outcome) {
                    None => {}
                    Some(Ok(())) => {
                        self.disconnect_published = false;
                        self.events.publish_state(ConnectionState::Connected);
                        for work in std::mem::take(&mut self.deferred) {
                            self.run_deferred(work).await;
                        }
                    }
                    Some(Err(e)) => {
                        error!(target: "CallHandler", "{e}");
                        let error = self.report(e.into());
                        for work in std::mem::take(&mut self.deferred) {
                            work.fail(error.clone());
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::CallOffer { from, offer } => self.handle_call_offer(from, offer).await,
            InboundMessage::CallAnswer { from, answer } => {
                self.handle_call_answer(from, answer).await
            }
            InboundMessage::CallCandidate { from, candidate } => {
                self.handle_remote_candidate(from, candidate).await
            }
            InboundMessage::CallReject { from } => self.handle_call_reject(from).await,
            InboundMessage::CallEnd { from } => self.handle_call_end(from).await,
            InboundMessage::Error { message } => {
                warn!(target: "CallHandler", "Relay error: {message}");
                self.report(CallError::Relay(message).into());
            }
            InboundMessage::TranslationResult { label } => {
                let _ = self
                    .events
                    .translation_result
                    .send(Arc::new(TranslationResult { label }));
            }
        }
    }

    async fn handle_call_offer(&mut self, from: UserCode, offer: SessionDescription) {
        if from == self.identity {
            warn!(target: "CallHandler", "Ignoring offer from own code");
            return;
        }

        if let Some(session) = self.session.as_ref().filter(|s| s.is_live() && s.peer == from) {
            if session.state.is_connected()
                || (session.has_remote_description() && !session.state.is_offering())
            {
                self.renegotiate(offer).await;
                return;
            }
            if session.state.is_offering() {
                self.resolve_glare(from, offer).await;
                return;
            }
            if session.state.is_ringing() {
                debug!(target: "CallHandler", "Repeated offer from {from} while ringing");
                self.ringing_offer = Some(offer);
                return;
            }
            debug!(target: "CallHandler", "Ignoring duplicate offer from {from}");
            return;
        }

        if self.has_live_session() {
            info!(target: "CallHandler", "Offer from {from} replaces the current call");
            self.hang_up_current(EndReason::Replaced).await;
        }

        let generation = self.bump_generation();
        let mut session = CallSession::new_incoming(from.clone(), generation);
        if let Err(e) = session.apply_transition(CallTransition::OfferReceived) {
            error!(target: "CallHandler", "Cannot ring for {from}: {e}");
            return;
        }
        info!(
            target: "CallHandler",
            "Incoming call from {from} (session {}, generation {generation})",
            session.session_id
        );
        self.session = Some(session);
        self.pending.reset(generation);
        self.ringing_offer = Some(offer);
        let _ = self
            .events
            .call_received
            .send(Arc::new(CallReceived { caller: from }));

        if self.config.auto_answer
            && let Err(e) = self.answer_ringing().await
        {
            debug!(target: "CallHandler", "Auto-answer failed: {e}");
        }
    }

    /// Both sides offered to each other. The smaller code yields.
    async fn resolve_glare(&mut self, from: UserCode, offer: SessionDescription) {
        if self.identity > from {
            info!(target: "CallHandler", "Glare with {from}: keeping our offer");
            return;
        }
        info!(target: "CallHandler", "Glare with {from}: rolling back and answering");

        let rolled_back = match self.transport.as_ref() {
            Some(transport) => match transport.peer.rollback().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "CallHandler", "Rollback failed, replacing transport: {e}");
                    false
                }
            },
            None => false,
        };

        if rolled_back {
            if let Some(transport) = self.transport.as_mut() {
                transport.held_candidates.clear();
                transport.description_sent = false;
                transport.expected_description = None;
                transport.local_description = None;
                for task in transport.tasks.drain(..) {
                    task.abort();
                }
            }
        } else {
            self.close_transport().await;
            let generation = self.bump_generation();
            if let Some(session) = self.session.as_mut() {
                session.rebind(generation);
            }
            self.pending.reset(generation);
            if let Err(e) = self.open_transport(generation).await {
                self.fail_session(e).await;
                return;
            }
        }

        if let Some(session) = self.session.as_mut()
            && let Err(e) = session.apply_transition(CallTransition::GlareYield)
        {
            warn!(target: "CallHandler", "{e}");
            return;
        }
        if let Err(e) = self.answer_offer(offer).await {
            self.fail_session(e).await;
        }
    }

    async fn answer_ringing(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::NoActiveCall.into());
        };
        session
            .apply_transition(CallTransition::Accepted)
            .map_err(CallError::from)?;
        let generation = session.generation;
        let peer = session.peer.clone();
        let Some(offer) = self.ringing_offer.take() else {
            let missing = CallError::Negotiation(format!("no offer stored for {peer}"));
            return Err(self.fail_session(missing).await);
        };
        info!(target: "CallHandler", "Answering call from {peer}");

        if let Err(e) = self.open_transport(generation).await {
            return Err(self.fail_session(e).await);
        }
        if let Err(e) = self.answer_offer(offer).await {
            return Err(self.fail_session(e).await);
        }
        Ok(())
    }

    /// Applies the remote offer to the current transport and sends the
    /// answer right away. Local candidates trickle after it.
    async fn answer_offer(&mut self, offer: SessionDescription) -> std::result::Result<(), CallError> {
        let (peer, generation) = self.current_transport()?;
        let remote_ufrag = offer.ice_ufrag().map(str::to_owned);
        peer.set_remote_description(offer).await?;
        if let Some(session) = self.session.as_mut() {
            session.mark_remote_description()?;
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.remote_ufrag = remote_ufrag;
        }
        self.apply_pending(generation).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        if let Some(session) = self.session.as_mut() {
            session.mark_local_description();
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.local_description = Some(answer);
            transport.expected_description = Some(DescriptionPurpose::Answer);
        }
        self.send_local_description(generation, DescriptionPurpose::Answer)
            .await;
        Ok(())
    }

    async fn create_local_offer(&mut self) -> std::result::Result<(), CallError> {
        let (peer, generation) = self.current_transport()?;
        peer.open_data_channel(TEXT_CHANNEL_LABEL).await?;
        let offer = peer.create_offer(false).await?;
        peer.set_local_description(offer.clone()).await?;
        if let Some(session) = self.session.as_mut() {
            session.mark_local_description();
        }
        if let Some(transport) = self.transport.as_mut() {
            transport.local_description = Some(offer);
        }
        self.await_gathering(generation, DescriptionPurpose::Offer);
        Ok(())
    }

    /// A new offer on an established transport, typically an ICE restart.
    async fn renegotiate(&mut self, offer: SessionDescription) {
        let Ok((peer, _)) = self.current_transport() else {
            warn!(target: "CallHandler", "Renegotiation offer without a transport");
            return;
        };
        let Some(to) = self.live_peer() else {
            return;
        };
        info!(target: "CallHandler", "Renegotiating with {to}");

        let remote_ufrag = offer.ice_ufrag().map(str::to_owned);
        let result = async {
            peer.set_remote_description(offer).await?;
            let answer = peer.create_answer().await?;
            peer.set_local_description(answer.clone()).await?;
            Ok::<_, CallError>(answer)
        }
        .await;

        match result {
            Ok(answer) => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.remote_ufrag = remote_ufrag;
                    transport.local_description = Some(answer.clone());
                }
                self.send_envelope(OutboundMessage::CallAnswer { target: to, answer })
                    .await;
            }
            Err(e) => {
                warn!(target: "CallHandler", "Renegotiation failed: {e}");
                self.report(e.into());
            }
        }
    }

    async fn handle_call_answer(&mut self, from: UserCode, answer: SessionDescription) {
        let Some(session) = self.session.as_ref().filter(|s| s.is_live() && s.peer == from) else {
            self.report(
                CallError::UnexpectedAnswer {
                    from,
                    reason: "no call with this peer".to_string(),
                }
                .into(),
            );
            return;
        };
        let awaiting = matches!(session.state, CallState::AwaitingAnswer { .. });
        let state_name = session.state.name();

        let Ok((peer, generation)) = self.current_transport() else {
            warn!(target: "CallHandler", "Answer from {from} without a transport");
            return;
        };

        let renegotiating = self.transport.as_ref().is_some_and(|t| t.renegotiating);
        if !awaiting && !renegotiating {
            self.report(
                CallError::UnexpectedAnswer {
                    from,
                    reason: format!("call is {state_name}"),
                }
                .into(),
            );
            return;
        }

        let remote_ufrag = answer.ice_ufrag().map(str::to_owned);
        if !self.wait_for_local_offer(&peer).await {
            self.report(
                CallError::UnexpectedAnswer {
                    from,
                    reason: format!("transport is {:?}", peer.signaling_state()),
                }
                .into(),
            );
            return;
        }

        if let Err(e) = peer.set_remote_description(answer).await {
            if renegotiating {
                warn!(target: "CallHandler", "Restart answer rejected: {e}");
                self.report(e.into());
            } else {
                self.fail_session(e).await;
            }
            return;
        }

        if let Some(transport) = self.transport.as_mut() {
            transport.remote_ufrag = remote_ufrag;
        }
        if renegotiating {
            if let Some(transport) = self.transport.as_mut() {
                transport.renegotiating = false;
            }
            info!(target: "CallHandler", "Restart answer from {from} applied");
            return;
        }

        if let Some(session) = self.session.as_mut()
            && let Err(e) = session.mark_remote_description()
        {
            warn!(target: "CallHandler", "{e}");
            return;
        }
        self.apply_pending(generation).await;

        if let Some(session) = self.session.as_mut() {
            match session.apply_transition(CallTransition::AnswerApplied) {
                Ok(()) => info!(target: "CallHandler", "Call with {from} connected"),
                Err(e) => warn!(target: "CallHandler", "{e}"),
            }
        }
    }

    async fn wait_for_local_offer(&self, peer: &Arc<dyn PeerTransport>) -> bool {
        for attempt in 0..self.config.answer_poll_attempts.max(1) {
            if peer.signaling_state() == PeerSignalingState::HaveLocalOffer {
                return true;
            }
            debug!(
                target: "CallHandler",
                "Waiting for local offer ({}/{})",
                attempt + 1,
                self.config.answer_poll_attempts
            );
            tokio::time::sleep(self.config.answer_poll_interval).await;
        }
        peer.signaling_state() == PeerSignalingState::HaveLocalOffer
    }

    async fn handle_remote_candidate(&mut self, from: UserCode, candidate: IceCandidate) {
        let Some(session) = self.session.as_ref().filter(|s| s.is_live() && s.peer == from) else {
            debug!(target: "CallHandler", "Dropping candidate from {from}: no call with this peer");
            return;
        };
        let generation = session.generation;

        if !session.has_remote_description() {
            if self.pending.push(generation, candidate) {
                debug!(
                    target: "CallHandler",
                    "Buffered candidate from {from} ({} pending)",
                    self.pending.len()
                );
            }
            return;
        }

        let Some(transport) = self.transport.as_ref().filter(|t| t.generation == generation) else {
            debug!(target: "CallHandler", "Dropping candidate for closed generation {generation}");
            return;
        };
        if !transport.accepts(&candidate) {
            debug!(target: "CallHandler", "Dropping candidate of a replaced transport from {from}");
            return;
        }
        if let Err(e) = transport.peer.add_ice_candidate(candidate).await {
            warn!(target: "CallHandler", "{e}");
        }
    }

    async fn apply_pending(&mut self, generation: u64) {
        let Some(transport) = self.transport.as_ref().filter(|t| t.generation == generation) else {
            return;
        };
        let peer = transport.peer.clone();
        let buffered = self.pending.drain(generation);
        let total = buffered.len();
        let current: Vec<IceCandidate> = buffered
            .into_iter()
            .filter(|c| transport.accepts(c))
            .collect();
        if total > current.len() {
            debug!(
                target: "CallHandler",
                "Dropping {} buffered candidates of a replaced transport",
                total - current.len()
            );
        }
        if !current.is_empty() {
            debug!(target: "CallHandler", "Applying {} buffered candidates", current.len());
        }
        for candidate in current {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!(target: "CallHandler", "{e}");
            }
        }
    }

    async fn handle_call_reject(&mut self, from: UserCode) {
        if self.live_peer().as_ref() != Some(&from) {
            debug!(target: "CallHandler", "Ignoring call-reject from {from}");
            return;
        }
        info!(target: "CallHandler", "{from} rejected the call");
        self.target = None;
        self.finish_session(EndReason::Rejected).await;
        let _ = self
            .events
            .call_rejected
            .send(Arc::new(CallRejected { peer: from }));
    }

    async fn handle_call_end(&mut self, from: UserCode) {
        if self.live_peer().as_ref() != Some(&from) {
            debug!(target: "CallHandler", "Ignoring call-end from {from}");
            return;
        }
        info!(target: "CallHandler", "{from} hung up");
        self.target = None;
        self.finish_session(EndReason::RemoteHangup).await;
    }

    // --- Transport events and completions ---

    async fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Peer { generation, event } => {
                if self.transport.as_ref().map(|t| t.generation) != Some(generation) {
                    debug!(target: "CallHandler", "Dropping peer event of generation {generation}");
                    return;
                }
                self.handle_peer_event(event).await;
            }
            LoopEvent::LocalDescriptionReady {
                generation,
                purpose,
            } => self.send_local_description(generation, purpose).await,
            LoopEvent::IceRestartExpired { generation } => {
                let expired = self
                    .transport
                    .as_ref()
                    .is_some_and(|t| t.generation == generation && t.ice_restart_pending);
                if !expired {
                    return;
                }
                if self.session.as_ref().is_some_and(CallSession::is_caller) {
                    warn!(target: "CallHandler", "ICE restart did not recover the call");
                    self.reconnect().await;
                } else {
                    warn!(target: "CallHandler", "Transport did not recover, ending the call");
                    self.send_hangup().await;
                    self.finish_session(EndReason::TransportFailed).await;
                }
            }
            LoopEvent::RedialDue { token, target } => {
                if token != self.redial_token || self.redial.take().is_none() {
                    debug!(target: "CallHandler", "Dropping cancelled re-dial");
                    return;
                }
                match target {
                    Some(target) => {
                        info!(target: "CallHandler", "Calling {target} again");
                        let work = Deferred::StartCall {
                            target,
                            reply: None,
                        };
                        self.when_connected(work).await;
                    }
                    None => self.open_signaling(),
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(mut candidate) => {
                let Some(to) = self.live_peer() else {
                    return;
                };
                let Some(transport) = self.transport.as_mut() else {
                    return;
                };
                if candidate.username_fragment.is_none() {
                    candidate.username_fragment = transport
                        .local_description
                        .as_ref()
                        .and_then(SessionDescription::ice_ufrag)
                        .map(str::to_owned);
                }
                if !transport.description_sent {
                    transport.held_candidates.push(candidate);
                    return;
                }
                self.send_envelope(OutboundMessage::CallCandidate {
                    target: to,
                    candidate,
                })
                .await;
            }
            PeerEvent::RemoteStream(stream) => {
                let Some(transport) = self.transport.as_mut() else {
                    return;
                };
                if transport.seen_streams.insert(stream.stream_id.clone()) {
                    info!(target: "CallHandler", "Remote stream {} available", stream.stream_id);
                    let _ = self.events.remote_stream.send(Arc::new(stream));
                }
            }
            PeerEvent::ConnectionState(state) => self.handle_connection_state(state).await,
            PeerEvent::DataChannelOpen => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.data_channel_open = true;
                }
            }
            PeerEvent::TextReceived(text) => {
                let peer = self.session.as_ref().map(|s| s.peer.clone());
                let _ = self
                    .events
                    .text_received
                    .send(Arc::new(TextReceived { peer, text }));
            }
        }
    }

    async fn handle_connection_state(&mut self, state: PeerConnectionState) {
        debug!(target: "CallHandler", "Transport state {state:?}");
        match state {
            PeerConnectionState::Connected => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.ice_restart_pending = false;
                }
                if let Some(session) = self.session.as_mut()
                    && matches!(session.state, CallState::AnsweringOffer { .. })
                {
                    match session.apply_transition(CallTransition::MediaConnected) {
                        Ok(()) => {
                            info!(target: "CallHandler", "Call with {} connected", session.peer)
                        }
                        Err(e) => warn!(target: "CallHandler", "{e}"),
                    }
                }
                self.events.publish_state(ConnectionState::MediaConnected);
            }
            PeerConnectionState::Disconnected => {
                self.events.publish_state(ConnectionState::MediaDisconnected);
            }
            PeerConnectionState::Failed => {
                self.events.publish_state(ConnectionState::MediaFailed);
                self.report(CallError::TransportFailed.into());
                self.recover_transport().await;
            }
            PeerConnectionState::New
            | PeerConnectionState::Connecting
            | PeerConnectionState::Closed => {}
        }
    }

    /// The caller re-offers with an ICE restart. A transport still down after
    /// `ice_restart_timeout` makes the caller `reconnect` and the callee hang
    /// up.
    async fn recover_transport(&mut self) {
        let Some(session) = self.session.as_ref().filter(|s| s.is_live()) else {
            return;
        };
        let is_caller = session.is_caller();
        let to = session.peer.clone();
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if transport.ice_restart_pending {
            return;
        }
        transport.ice_restart_pending = true;
        let generation = transport.generation;
        let peer = transport.peer.clone();

        let loop_tx = self.loop_tx.clone();
        let timeout = self.config.ice_restart_timeout;
        transport.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = loop_tx.send(LoopEvent::IceRestartExpired { generation }).await;
        }));

        if !is_caller {
            info!(target: "CallHandler", "Transport failed, waiting for {to} to restart ICE");
            return;
        }

        info!(target: "CallHandler", "Transport failed, restarting ICE with {to}");
        let restart = async {
            let offer = peer.create_offer(true).await?;
            peer.set_local_description(offer.clone()).await?;
            Ok::<_, CallError>(offer)
        }
        .await;
        match restart {
            Ok(offer) => {
                if let Some(transport) = self.transport.as_mut() {
                    transport.renegotiating = true;
                    transport.local_description = Some(offer.clone());
                }
                self.send_envelope(OutboundMessage::CallOffer { target: to, offer })
                    .await;
            }
            Err(e) => warn!(target: "CallHandler", "ICE restart offer failed: {e}"),
        }
    }

    /// Tears everything down and, after `reconnect_drain`, re-opens the
    /// control channel and calls the last target again. Neither the pause
    /// nor the dial runs on the handler task.
    async fn reconnect(&mut self) {
        let target = self.target.clone();
        self.send_hangup().await;
        self.finish_session(EndReason::TransportFailed).await;
        self.signaling.close().await;

        self.cancel_redial();
        let token = self.redial_token;
        let loop_tx = self.loop_tx.clone();
        let drain = self.config.reconnect_drain;
        self.redial = Some(tokio::spawn(async move {
            tokio::time::sleep(drain).await;
            let _ = loop_tx.send(LoopEvent::RedialDue { token, target }).await;
        }));
    }

    fn cancel_redial(&mut self) {
        self.redial_token += 1;
        if let Some(task) = self.redial.take() {
            task.abort();
        }
    }

    async fn send_local_description(&mut self, generation: u64, purpose: DescriptionPurpose) {
        let Some(to) = self
            .session
            .as_ref()
            .filter(|s| s.is_live() && s.generation == generation)
            .map(|s| s.peer.clone())
        else {
            return;
        };
        let Some(transport) = self.transport.as_ref().filter(|t| t.generation == generation) else {
            return;
        };
        if transport.description_sent || transport.expected_description != Some(purpose) {
            debug!(target: "CallHandler", "Dropping stale {purpose:?} gathering result");
            return;
        }
        let peer = transport.peer.clone();
        let fallback = transport.local_description.clone();

        let Some(description) = peer.local_description().await.or(fallback) else {
            self.fail_session(CallError::Negotiation("no local description".to_string()))
                .await;
            return;
        };

        let message = match purpose {
            DescriptionPurpose::Offer => OutboundMessage::CallOffer {
                target: to.clone(),
                offer: description,
            },
            DescriptionPurpose::Answer => OutboundMessage::CallAnswer {
                target: to.clone(),
                answer: description,
            },
        };
        if !self.send_envelope(message).await {
            self.fail_session(CallError::Negotiation(format!(
                "{purpose:?} for {to} not delivered"
            )))
            .await;
            return;
        }

        if purpose == DescriptionPurpose::Offer
            && let Some(session) = self.session.as_mut()
            && let Err(e) = session.apply_transition(CallTransition::OfferSent)
        {
            warn!(target: "CallHandler", "{e}");
        }

        let held = match self.transport.as_mut() {
            Some(transport) => {
                transport.description_sent = true;
                std::mem::take(&mut transport.held_candidates)
            }
            None => Vec::new(),
        };
        if !held.is_empty() {
            debug!(target: "CallHandler", "Flushing {} held candidates to {to}", held.len());
        }
        for candidate in held {
            self.send_envelope(OutboundMessage::CallCandidate {
                target: to.clone(),
                candidate,
            })
            .await;
        }
    }

    // --- Helpers ---

    /// Starts a bounded connect unless the channel is open or one is
    /// already running. The outcome arrives as `SignalingEvent::Dialed`.
    fn open_signaling(&mut self) {
        if self.signaling.is_open() || self.signaling.is_connecting() {
            return;
        }
        self.events.publish_state(ConnectionState::Connecting);
        self.signaling.start_connect();
    }

    /// Best-effort `call-end` to the live peer.
    async fn send_hangup(&mut self) {
        let Some(peer) = self.live_peer() else {
            return;
        };
        if !self.signaling.is_open() {
            return;
        }
        if let Err(e) = self.signaling.send(&OutboundMessage::CallEnd { target: peer }).await {
            debug!(target: "CallHandler", "call-end not delivered: {e}");
        }
    }

    /// Sends an envelope; failures are published, never returned.
    async fn send_envelope(&mut self, message: OutboundMessage) -> bool {
        match self.signaling.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "CallHandler", "{} to {} not sent: {e}", message.kind(), message.target());
                self.report(e.into());
                false
            }
        }
    }

    async fn open_transport(&mut self, generation: u64) -> std::result::Result<(), CallError> {
        self.close_transport().await;
        let (peer, mut peer_events) = self.peer_factory.create(&self.media).await?;

        let loop_tx = self.loop_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                if loop_tx
                    .send(LoopEvent::Peer { generation, event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        debug!(target: "CallHandler", "Transport session {generation} created");
        self.transport = Some(TransportSession {
            generation,
            peer,
            pump,
            tasks: Vec::new(),
            held_candidates: Vec::new(),
            description_sent: false,
            expected_description: None,
            local_description: None,
            remote_ufrag: None,
            seen_streams: HashSet::new(),
            data_channel_open: false,
            ice_restart_pending: false,
            renegotiating: false,
        });
        Ok(())
    }

    async fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            let generation = transport.generation;
            transport.close().await;
            debug!(target: "CallHandler", "Transport session {generation} closed");
        }
    }

    /// Waits for gathering off the handler task and posts the result back.
    fn await_gathering(&mut self, generation: u64, purpose: DescriptionPurpose) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        transport.expected_description = Some(purpose);
        let peer = transport.peer.clone();
        let loop_tx = self.loop_tx.clone();
        let ceiling = self.config.gathering_timeout;
        transport.tasks.push(tokio::spawn(async move {
            if tokio::time::timeout(ceiling, peer.gathering_complete())
                .await
                .is_err()
            {
                debug!(target: "CallHandler", "Gathering still running after {ceiling:?}, sending what we have");
            }
            let _ = loop_tx
                .send(LoopEvent::LocalDescriptionReady {
                    generation,
                    purpose,
                })
                .await;
        }));
    }

    fn current_transport(&self) -> std::result::Result<(Arc<dyn PeerTransport>, u64), CallError> {
        self.transport
            .as_ref()
            .map(|t| (t.peer.clone(), t.generation))
            .ok_or(CallError::NoActiveCall)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn has_live_session(&self) -> bool {
        self.session.as_ref().is_some_and(CallSession::is_live)
    }

    fn live_peer(&self) -> Option<UserCode> {
        self.session
            .as_ref()
            .filter(|s| s.is_live())
            .map(|s| s.peer.clone())
    }

    /// Ends the live session after telling its peer.
    async fn hang_up_current(&mut self, reason: EndReason) {
        if let Some(peer) = self.live_peer() {
            self.send_envelope(OutboundMessage::CallEnd { target: peer })
                .await;
        }
        self.finish_session(reason).await;
    }

    /// Releases the transport session and buffers and moves the live
    /// session, if any, to `Ended`.
    async fn finish_session(&mut self, reason: EndReason) {
        self.close_transport().await;
        self.pending.clear();
        self.ringing_offer = None;

        let Some(session) = self.session.as_mut().filter(|s| s.is_live()) else {
            return;
        };
        let peer = session.peer.clone();
        if let Err(e) = session.apply_transition(CallTransition::Terminated { reason }) {
            warn!(target: "CallHandler", "{e}");
            return;
        }
        info!(target: "CallHandler", "Call with {peer} ended: {reason:?}");
        let _ = self
            .events
            .call_ended
            .send(Arc::new(CallEnded { peer, reason }));
    }

    async fn fail_session(&mut self, error: CallError) -> HandlerError {
        error!(target: "CallHandler", "{error}");
        let error = self.report(error.into());
        self.finish_session(EndReason::NegotiationFailed).await;
        error
    }

    /// Publishes `error` and hands it back for the command reply.
    fn report(&self, error: HandlerError) -> HandlerError {
        self.events.publish_error(error.clone());
        error
    }
}
