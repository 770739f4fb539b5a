use std::sync::Arc;
use std::time::Duration;

use callcore::{InboundMessage, OutboundMessage, UserCode};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::SignalingError;
use crate::config::HandlerConfig;
use crate::transport::{Transport, TransportEvent, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// A freshly dialed transport and its event stream.
pub type Dialed = (Arc<dyn Transport>, mpsc::Receiver<TransportEvent>);

/// Produced by the tasks a [`SignalingConnection`] spawns and consumed by
/// its owner, which feeds them back through the `handle_*` methods.
pub enum SignalingEvent {
    Message {
        epoch: u64,
        message: InboundMessage,
    },
    Closed {
        epoch: u64,
    },
    /// A background dial finished. Only the bounded connect reports
    /// failures; the reconnect loop keeps trying until it succeeds.
    Dialed {
        attempt: u64,
        outcome: Result<Dialed, SignalingError>,
    },
}

impl std::fmt::Debug for SignalingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message { epoch, message } => f
                .debug_struct("Message")
                .field("epoch", epoch)
                .field("message", message)
                .finish(),
            Self::Closed { epoch } => f.debug_struct("Closed").field("epoch", epoch).finish(),
            Self::Dialed { attempt, outcome } => f
                .debug_struct("Dialed")
                .field("attempt", attempt)
                .field("ok", &outcome.is_ok())
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialMode {
    /// `start_connect`: at most `max_retries` tries.
    Bounded,
    /// After an unclean close: tries until the relay is back.
    Unbounded,
}

/// The control channel of one identity.
///
/// Dialing never happens on the owner's task. `start_connect` runs a
/// bounded dial in the background; an unclean close of an open channel
/// starts an unbounded one instead. Both report through
/// [`SignalingEvent::Dialed`]. Every installed transport gets a fresh epoch
/// so late events of a replaced transport can be told apart.
pub struct SignalingConnection {
    identity: UserCode,
    config: HandlerConfig,
    factory: Arc<dyn TransportFactory>,
    event_tx: mpsc::Sender<SignalingEvent>,

    state: SignalingState,
    transport: Option<Arc<dyn Transport>>,
    epoch: u64,
    retry_count: u32,
    pump: Option<JoinHandle<()>>,
    dialer: Option<(DialMode, JoinHandle<()>)>,
    dial_attempt: u64,
}

impl SignalingConnection {
    pub fn new(
        identity: UserCode,
        config: HandlerConfig,
        factory: Arc<dyn TransportFactory>,
        event_tx: mpsc::Sender<SignalingEvent>,
    ) -> Self {
        Self {
            identity,
            config,
            factory,
            event_tx,
            state: SignalingState::Disconnected,
            transport: None,
            epoch: 0,
            retry_count: 0,
            pump: None,
            dialer: None,
            dial_attempt: 0,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SignalingState::Open
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reset_retries(&mut self) {
        self.retry_count = 0;
    }

    /// A bounded connect is in flight.
    pub fn is_connecting(&self) -> bool {
        matches!(self.dialer, Some((DialMode::Bounded, _)))
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self.dialer, Some((DialMode::Unbounded, _)))
    }

    pub fn endpoint(&self) -> String {
        self.config.endpoint_for(self.identity.as_str())
    }

    /// Starts opening the channel, trying at most `max_retries` times. A
    /// running reconnect loop is replaced. Does nothing when the channel is
    /// open or a bounded connect is already running.
    pub fn start_connect(&mut self) {
        if self.is_open() || self.is_connecting() {
            return;
        }
        self.cancel_dial();
        self.dial_attempt += 1;
        self.state = SignalingState::Connecting;
        self.retry_count = 0;

        let attempt = self.dial_attempt;
        let factory = self.factory.clone();
        let url = self.endpoint();
        let max_attempts = self.config.max_retries.max(1);
        let timeout = self.config.connect_timeout;
        let delay = self.config.retry_delay;
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            let outcome = dial_bounded(factory.as_ref(), &url, max_attempts, timeout, delay).await;
            let _ = event_tx
                .send(SignalingEvent::Dialed { attempt, outcome })
                .await;
        });
        self.dialer = Some((DialMode::Bounded, task));
    }

    /// Serializes and sends one envelope.
    pub async fn send(&self, message: &OutboundMessage) -> Result<(), SignalingError> {
        let transport = match (&self.transport, self.state) {
            (Some(transport), SignalingState::Open) => transport,
            _ => return Err(SignalingError::NotConnected),
        };
        let json = message
            .to_json()
            .map_err(|e| SignalingError::Encode(e.to_string()))?;
        debug!(target: "Signaling", "--> {} to {}", message.kind(), message.target());
        transport
            .send_text(&json)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    /// Returns true when `epoch` was the live channel and a reconnect loop
    /// was started.
    pub fn handle_closed(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || self.state != SignalingState::Open {
            debug!(target: "Signaling", "Ignoring close of stale epoch {epoch}");
            return false;
        }
        warn!(target: "Signaling", "{}", SignalingError::Dropped);
        self.transport = None;
        self.pump = None;
        self.start_reconnect_loop();
        true
    }

    /// Applies the outcome of a background dial. Returns `None` when the
    /// dial was cancelled in the meantime; its transport is discarded.
    pub fn handle_dialed(
        &mut self,
        attempt: u64,
        outcome: Result<Dialed, SignalingError>,
    ) -> Option<Result<(), SignalingError>> {
        let mode = match &self.dialer {
            Some((mode, _)) if attempt == self.dial_attempt => *mode,
            _ => {
                debug!(target: "Signaling", "Discarding result of cancelled dial {attempt}");
                if let Ok((transport, _)) = outcome {
                    tokio::spawn(async move { transport.disconnect().await });
                }
                return None;
            }
        };
        self.dialer = None;

        match outcome {
            Ok((transport, events)) => {
                self.install(transport, events);
                match mode {
                    DialMode::Bounded => info!(target: "Signaling", "Connected to {}", self.endpoint()),
                    DialMode::Unbounded => info!(target: "Signaling", "Control channel restored"),
                }
                Some(Ok(()))
            }
            Err(e) => {
                if let SignalingError::Unreachable { attempts } = &e {
                    self.retry_count = *attempts;
                }
                self.state = SignalingState::Disconnected;
                Some(Err(e))
            }
        }
    }

    /// Closes the channel on purpose and cancels any dial in flight. The
    /// close is never treated as a drop.
    pub async fn close(&mut self) {
        self.cancel_dial();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        // Invalidates anything still queued from the old transport.
        self.epoch += 1;
        if let Some(transport) = self.transport.take() {
            self.state = SignalingState::Closing;
            transport.disconnect().await;
            info!(target: "Signaling", "Control channel closed");
        }
        self.state = SignalingState::Disconnected;
        self.retry_count = 0;
    }

    fn install(&mut self, transport: Arc<dyn Transport>, events: mpsc::Receiver<TransportEvent>) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.epoch += 1;
        self.transport = Some(transport);
        self.state = SignalingState::Open;
        self.retry_count = 0;
        self.pump = Some(tokio::spawn(pump_events(
            self.epoch,
            events,
            self.event_tx.clone(),
        )));
    }

    fn start_reconnect_loop(&mut self) {
        self.cancel_dial();
        self.dial_attempt += 1;
        self.state = SignalingState::Connecting;

        let attempt = self.dial_attempt;
        let factory = self.factory.clone();
        let url = self.endpoint();
        let timeout = self.config.connect_timeout;
        let delay = self.config.reconnect_delay;
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            let mut tries: u64 = 0;
            loop {
                tries += 1;
                match dial(factory.as_ref(), &url, timeout).await {
                    Ok(dialed) => {
                        let _ = event_tx
                            .send(SignalingEvent::Dialed {
                                attempt,
                                outcome: Ok(dialed),
                            })
                            .await;
                        return;
                    }
                    Err(e) => {
                        warn!(
                            target: "Signaling",
                            "Reconnect try {tries} failed: {e}; next in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
        self.dialer = Some((DialMode::Unbounded, task));
    }

    fn cancel_dial(&mut self) {
        if let Some((_, handle)) = self.dialer.take() {
            handle.abort();
            self.dial_attempt += 1;
        }
    }
}

impl Drop for SignalingConnection {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.dialer.take() {
            handle.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn dial_bounded(
    factory: &dyn TransportFactory,
    url: &str,
    max_attempts: u32,
    timeout: Duration,
    delay: Duration,
) -> Result<Dialed, SignalingError> {
    for attempt in 1..=max_attempts {
        debug!(target: "Signaling", "Connect attempt {attempt}/{max_attempts} to {url}");
        match dial(factory, url, timeout).await {
            Ok(dialed) => return Ok(dialed),
            Err(e) => {
                warn!(
                    target: "Signaling",
                    "Connect attempt {attempt}/{max_attempts} failed: {e}"
                );
                if attempt < max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    Err(SignalingError::Unreachable {
        attempts: max_attempts,
    })
}

async fn dial(
    factory: &dyn TransportFactory,
    url: &str,
    timeout: Duration,
) -> Result<Dialed, SignalingError> {
    match tokio::time::timeout(timeout, factory.create_transport(url)).await {
        Ok(Ok(dialed)) => Ok(dialed),
        Ok(Err(e)) => Err(SignalingError::Transport(e.to_string())),
        Err(_) => Err(SignalingError::Timeout),
    }
}

async fn pump_events(
    epoch: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    event_tx: mpsc::Sender<SignalingEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {
                debug!(target: "Signaling", "Transport of epoch {epoch} connected");
            }
            TransportEvent::TextReceived(text) => match InboundMessage::parse(&text) {
                Ok(message) => {
                    debug!(target: "Signaling", "<-- {}", message.kind());
                    if event_tx
                        .send(SignalingEvent::Message { epoch, message })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(target: "Signaling", "Dropping unreadable envelope: {e}");
                }
            },
            TransportEvent::Disconnected => break,
        }
    }
    let _ = event_tx.send(SignalingEvent::Closed { epoch }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedTransportFactory;

    fn connection(
        factory: Arc<ScriptedTransportFactory>,
    ) -> (SignalingConnection, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = SignalingConnection::new(
            "AB12CD".parse().unwrap(),
            HandlerConfig::default(),
            factory,
            tx,
        );
        (conn, rx)
    }

    /// Feeds the next dial outcome back into `conn`.
    async fn settle(
        conn: &mut SignalingConnection,
        rx: &mut mpsc::Receiver<SignalingEvent>,
    ) -> Option<Result<(), SignalingError>> {
        match rx.recv().await.unwrap() {
            SignalingEvent::Dialed { attempt, outcome } => conn.handle_dialed(attempt, outcome),
            other => panic!("unexpected event {other:?}"),
        }
    }

    async fn open(conn: &mut SignalingConnection, rx: &mut mpsc::Receiver<SignalingEvent>) {
        conn.start_connect();
        settle(conn, rx).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_connect_gives_up_after_max_retries() {
        let factory = Arc::new(ScriptedTransportFactory::failing(u32::MAX));
        let (mut conn, mut rx) = connection(factory.clone());

        conn.start_connect();
        assert!(conn.is_connecting());
        assert_eq!(conn.state(), SignalingState::Connecting);

        let err = settle(&mut conn, &mut rx).await.unwrap().unwrap_err();
        assert!(matches!(err, SignalingError::Unreachable { attempts: 3 }));
        assert_eq!(conn.retry_count(), 3);
        assert_eq!(conn.state(), SignalingState::Disconnected);
        assert!(!conn.is_connecting());

        let attempts = factory.attempts();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1].1 - pair[0].1, Duration::from_millis(2000));
        }
        assert_eq!(attempts[0].0, "ws://localhost:8765/ws/AB12CD");
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_retry_count() {
        let factory = Arc::new(ScriptedTransportFactory::failing(2));
        let (mut conn, mut rx) = connection(factory.clone());

        open(&mut conn, &mut rx).await;
        assert!(conn.is_open());
        assert_eq!(conn.retry_count(), 0);
        assert_eq!(factory.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_connect_in_flight() {
        let factory = Arc::new(ScriptedTransportFactory::failing(u32::MAX));
        let (mut conn, mut rx) = connection(factory.clone());

        conn.start_connect();
        conn.close().await;
        assert!(!conn.is_connecting());
        assert_eq!(conn.state(), SignalingState::Disconnected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(factory.attempts().len() <= 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_dial_is_discarded() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let (mut conn, _rx) = connection(factory.clone());
        let (transport, events) = factory.create_transport("ws://stale").await.unwrap();

        assert!(conn.handle_dialed(7, Ok((transport, events))).is_none());
        assert!(!conn.is_open());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(factory.last_transport().unwrap().is_closed());
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let (mut conn, mut rx) = connection(factory.clone());
        let reject = OutboundMessage::CallReject {
            target: "ZZ99XX".parse().unwrap(),
        };

        assert!(matches!(
            conn.send(&reject).await,
            Err(SignalingError::NotConnected)
        ));

        open(&mut conn, &mut rx).await;
        conn.send(&reject).await.unwrap();
        let sent = factory.last_transport().unwrap().sent();
        assert_eq!(sent, [r#"{"type":"call-reject","target":"ZZ99XX"}"#]);
    }

    #[tokio::test]
    async fn unreadable_envelopes_are_dropped() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let (mut conn, mut rx) = connection(factory.clone());
        open(&mut conn, &mut rx).await;

        factory.inject("not json").await;
        factory.inject(r#"{"type":"presence","from":"ZZ99XX"}"#).await;
        factory
            .inject(r#"{"type":"call-end","from":"ZZ99XX"}"#)
            .await;

        match rx.recv().await.unwrap() {
            SignalingEvent::Message { epoch, message } => {
                assert_eq!(epoch, conn.epoch());
                assert!(matches!(message, InboundMessage::CallEnd { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unclean_close_reconnects_without_bound() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let (mut conn, mut rx) = connection(factory.clone());
        open(&mut conn, &mut rx).await;
        let first_epoch = conn.epoch();

        factory.fail_next(5);
        factory.drop_connection().await;

        let epoch = match rx.recv().await.unwrap() {
            SignalingEvent::Closed { epoch } => epoch,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(conn.handle_closed(epoch));
        assert!(conn.is_reconnecting());
        assert!(!conn.is_connecting());

        settle(&mut conn, &mut rx).await.unwrap().unwrap();
        assert!(conn.is_open());
        assert!(!conn.is_reconnecting());
        assert!(conn.epoch() > first_epoch);

        // One initial dial, five failed reconnects, one success.
        let attempts = factory.attempts();
        assert_eq!(attempts.len(), 7);
        assert_eq!(attempts[1].1 - attempts[0].1, Duration::ZERO);
        assert_eq!(attempts[2].1 - attempts[1].1, Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn local_close_is_not_a_drop() {
        let factory = Arc::new(ScriptedTransportFactory::new());
        let (mut conn, mut rx) = connection(factory.clone());
        open(&mut conn, &mut rx).await;
        let epoch = conn.epoch();

        conn.close().await;
        assert_eq!(conn.state(), SignalingState::Disconnected);
        assert!(factory.last_transport().unwrap().is_closed());
        assert!(!conn.handle_closed(epoch));
        assert!(!conn.is_reconnecting());
    }
}
