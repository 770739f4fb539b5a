//! One-call-at-a-time call handling.
//!
//! [`spawn_call_handler`] starts the handler task for an identity and returns
//! a [`CallHandlerHandle`]. The task owns the control channel, the current
//! call session and its transport session; the handle only sends commands
//! and exposes the [`EventBus`] observers subscribe to.
//!
//! # Call flow
//!
//! - Caller: `start_call` creates a transport session, an offer and the text
//!   channel, then sends `call-offer` once gathering settles (or after
//!   `gathering_timeout`). The `call-answer` moves the call to `Connected`.
//! - Callee: a `call-offer` publishes `call_received`. With `auto_answer`
//!   the offer is answered at once, otherwise on `accept_incoming`. The
//!   `call-answer` goes out right after the local description is set and
//!   candidates trickle after it.
//! - Connecting the control channel never blocks the handler task. Commands
//!   that need it wait until the background connect finishes, and
//!   `end_call` cancels that connect.
//! - Remote candidates that arrive before the remote description are
//!   buffered and applied in arrival order right after it.
//! - When both sides offer to each other, the smaller user code yields.

mod handler;
mod messages;

pub use messages::HandlerSnapshot;

use std::sync::Arc;

use callcore::UserCode;
use log::debug;
use tokio::sync::{mpsc, oneshot};

use crate::config::HandlerConfig;
use crate::error::{HandlerError, Result};
use crate::media::{LocalMedia, PeerTransportFactory};
use crate::transport::TransportFactory;
use crate::types::events::EventBus;
use handler::CallHandler;
use messages::HandlerCommand;

/// Cheap, cloneable front end of a running call handler.
#[derive(Clone)]
pub struct CallHandlerHandle {
    identity: UserCode,
    command_tx: mpsc::Sender<HandlerCommand>,
    events: Arc<EventBus>,
}

/// Spawns the handler task for `identity` on the current tokio runtime.
pub fn spawn_call_handler(
    identity: UserCode,
    config: HandlerConfig,
    transport_factory: Arc<dyn TransportFactory>,
    peer_factory: Arc<dyn PeerTransportFactory>,
) -> CallHandlerHandle {
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
    let events = Arc::new(EventBus::with_capacity(config.event_capacity));
    let handler = CallHandler::new(
        identity.clone(),
        config,
        events.clone(),
        transport_factory,
        peer_factory,
        command_rx,
    );
    tokio::spawn(handler.run());

    CallHandlerHandle {
        identity,
        command_tx,
        events,
    }
}

impl CallHandlerHandle {
    pub fn identity(&self) -> &UserCode {
        &self.identity
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Stores the local media and opens the control channel.
    pub async fn initialize(&self, media: LocalMedia) -> Result<()> {
        self.request(|reply| HandlerCommand::Initialize { media, reply })
            .await?
    }

    /// Calls `target`, replacing any current call.
    ///
    /// Returns once the offer is prepared; it is sent to the relay after
    /// candidate gathering.
    pub async fn start_call(&self, target: UserCode) -> Result<()> {
        self.request(|reply| HandlerCommand::StartCall { target, reply })
            .await?
    }

    pub async fn accept_incoming(&self) -> Result<()> {
        self.request(|reply| HandlerCommand::AcceptIncoming { reply })
            .await?
    }

    pub async fn reject_incoming(&self, caller: UserCode) -> Result<()> {
        self.request(|reply| HandlerCommand::RejectIncoming { caller, reply })
            .await?
    }

    /// Hangs up, stops local media and closes the control channel. Never
    /// fails; calling it again is a no-op.
    pub async fn end_call(&self) {
        if let Err(e) = self.request(|reply| HandlerCommand::EndCall { reply }).await {
            debug!(target: "CallHandler", "end_call on stopped handler: {e}");
        }
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| HandlerCommand::SendText { text, reply })
            .await?
    }

    pub async fn state(&self) -> Result<HandlerSnapshot> {
        self.request(|reply| HandlerCommand::State { reply }).await
    }

    /// Ends the call and stops the handler task.
    pub async fn shutdown(&self) {
        let _ = self
            .request(|reply| HandlerCommand::Shutdown { reply })
            .await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> HandlerCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| HandlerError::Closed)?;
        response.await.map_err(|_| HandlerError::Closed)
    }
}
