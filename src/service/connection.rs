//! # Connection
//!
//! One logical session to a daemon at `host:port`.
//!
//! ## Background activities
//! Each open socket gets a receive loop and a disconnect prober. A third,
//! longer lived task (the dispatch worker) drains the callback queue; it
//! survives socket loss so it can run the reconnect loop and keep event
//! order intact across reconnects.
//!
//! ## Coordination
//! - `link` (async mutex) guards socket lifecycle: connect, disconnect and
//!   teardown after loss never race on the same socket.
//! - `writer` (async mutex) is the single send path shared by calls, the
//!   prober and `enumerate`, so packets never interleave on the wire.
//! - Each device handle's correlator holds its one pending request.
//! - The callback queue is the only thing the receive loop shares with the
//!   dispatch worker, and pushing to it never takes `link`.
//!
//! ## Loss detection
//! The receive loop, the prober and the send path can all notice a dead
//! socket. Each session carries a `lost` flag; whoever flips it first queues
//! the single `Disconnected` notice. Teardown itself happens on the dispatch
//! worker, which then decides whether to reconnect.

use crate::config::{ClientConfig, NetworkConfig};
use crate::core::codec::PacketCodec;
use crate::core::packet::{ErrorCode, Packet};
use crate::core::payload::{Format, Value};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::correlator::{Delivery, SequenceCounter};
use crate::protocol::device::{DeviceHandle, ResponseExpected};
use crate::protocol::dispatcher::{
    ConnectionEvent, ConnectionEventKind, DispatchQueue, Dispatcher, MetaEvent, QueueItem,
};
use crate::protocol::handshake::{validate_secret, AuthenticationRequest, NonceSequence, NONCE_SIZE};
use crate::protocol::message::{
    ConnectReason, ConnectionState, DisconnectReason, EnumerateEvent, Identity,
    BRICK_DAEMON_UID, FUNCTION_AUTHENTICATE, FUNCTION_DISCONNECT_PROBE, FUNCTION_ENUMERATE,
    FUNCTION_GET_AUTHENTICATION_NONCE, FUNCTION_GET_IDENTITY,
};
use crate::protocol::registry::DeviceRegistry;
use crate::transport::tcp::open_stream;
use crate::utils::metrics::Metrics;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Per-socket state shared by the tasks serving that socket.
struct SessionSignal {
    id: u64,
    lost: AtomicBool,
    queue: DispatchQueue,
    last_send: Mutex<Instant>,
}

impl SessionSignal {
    fn touch(&self) {
        *self.last_send.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_send
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

struct Session {
    signal: Arc<SessionSignal>,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<()>,
    prober: JoinHandle<()>,
}

struct Writer {
    sink: FramedWrite<OwnedWriteHalf, PacketCodec>,
    signal: Arc<SessionSignal>,
}

struct DispatchWorker {
    queue: DispatchQueue,
    task: JoinHandle<()>,
}

struct Link {
    host: String,
    port: u16,
    session: Option<Session>,
    worker: Option<DispatchWorker>,
}

struct Inner {
    link: tokio::sync::Mutex<Link>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    state: AtomicU8,
    auto_reconnect: AtomicBool,
    /// Set when the peer dropped us, cleared by connect and disconnect.
    auto_reconnect_allowed: AtomicBool,
    auto_reconnect_pending: AtomicBool,
    /// Token of the current reconnect episode.
    reconnect_cancel: Mutex<CancellationToken>,
    response_timeout_ms: AtomicU64,
    connect_timeout: Duration,
    probe_interval: Duration,
    reconnect_interval: Duration,
    next_session: AtomicU64,
    sequence: SequenceCounter,
    registry: DeviceRegistry,
    dispatcher: Dispatcher,
    metrics: Metrics,
    brick_daemon: DeviceHandle,
    nonces: tokio::sync::Mutex<NonceSequence>,
}

/// Client connection to a daemon.
///
/// Cloning is cheap and yields another handle to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// Connection with default timing.
    pub fn new() -> Self {
        Self::with_config(&ClientConfig::default())
    }

    /// Connection using the timing and reconnect settings of `config`. The
    /// configured host and port are the defaults for [`connect_configured`].
    ///
    /// [`connect_configured`]: Connection::connect_configured
    pub fn with_config(config: &ClientConfig) -> Self {
        let brick_daemon = DeviceHandle::with_functions(
            "2",
            BRICK_DAEMON_UID,
            &[
                (FUNCTION_GET_AUTHENTICATION_NONCE, ResponseExpected::AlwaysTrue),
                (FUNCTION_AUTHENTICATE, ResponseExpected::Toggle(true)),
            ],
        );
        let registry = DeviceRegistry::new();
        if let Err(e) = registry.register(brick_daemon.clone()) {
            warn!(error = %e, "Could not register daemon handle");
        }

        Self {
            inner: Arc::new(Inner {
                link: tokio::sync::Mutex::new(Link {
                    host: config.host.clone(),
                    port: config.port,
                    session: None,
                    worker: None,
                }),
                writer: tokio::sync::Mutex::new(None),
                state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                auto_reconnect_allowed: AtomicBool::new(false),
                auto_reconnect_pending: AtomicBool::new(false),
                reconnect_cancel: Mutex::new(CancellationToken::new()),
                response_timeout_ms: AtomicU64::new(config.response_timeout.as_millis() as u64),
                connect_timeout: config.connect_timeout,
                probe_interval: config.disconnect_probe_interval,
                reconnect_interval: config.reconnect_interval,
                next_session: AtomicU64::new(0),
                sequence: SequenceCounter::new(),
                registry,
                dispatcher: Dispatcher::new(),
                metrics: Metrics::new(),
                brick_daemon,
                nonces: tokio::sync::Mutex::new(NonceSequence::new()),
            }),
        }
    }

    /// Connection built from the client section of a full configuration.
    pub fn from_config(config: &NetworkConfig) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self::with_config(&config.client))
    }

    /// Open a socket to `host:port`.
    ///
    /// Fails with `AlreadyConnected` while connected or connecting. On
    /// success a `Connected(Requested)` event is queued.
    #[instrument(skip(self))]
    pub async fn connect(&self, host: &str, port: u16) -> Result<()> {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Err(ProtocolError::AlreadyConnected);
        }

        let inner = &self.inner;
        let mut link = inner.link.lock().await;
        if link.session.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        link.host = host.to_string();
        link.port = port;

        let fresh_worker = link.worker.is_none();
        inner.ensure_worker(&mut link);

        match inner.connect_unlocked(&mut link, ConnectReason::Requested).await {
            Ok(()) => {
                // A reconnect loop parked in its backoff can stop now.
                inner.cancel_reconnect();
                Ok(())
            }
            Err(e) => {
                if fresh_worker {
                    if let Some(worker) = link.worker.take() {
                        worker.queue.push(QueueItem::Exit);
                    }
                }
                Err(e)
            }
        }
    }

    /// Connect to the host and port the connection was configured with.
    pub async fn connect_configured(&self) -> Result<()> {
        let (host, port) = {
            let link = self.inner.link.lock().await;
            (link.host.clone(), link.port)
        };
        self.connect(&host, port).await
    }

    /// Close the connection, or cancel a pending auto-reconnect.
    ///
    /// Returns once the socket tasks and the dispatch worker have stopped, so
    /// no handler runs after this returns. Fails with `NotConnected` if there
    /// was neither a socket nor a pending reconnect; a dispatch worker left
    /// over from an earlier peer-side loss is still stopped in that case.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;

        let (worker, closed_socket) = {
            let mut link = inner.link.lock().await;
            inner.auto_reconnect_allowed.store(false, Ordering::SeqCst);

            let closed_socket = if inner.auto_reconnect_pending.swap(false, Ordering::SeqCst) {
                inner.cancel_reconnect();
                debug!("Cancelled pending auto-reconnect");
                Ok(false)
            } else if let Some(session) = link.session.take() {
                inner.teardown(session).await;
                Ok(true)
            } else {
                Err(ProtocolError::NotConnected)
            };

            if closed_socket.is_ok() {
                inner.set_state(ConnectionState::Disconnected);
            }

            let worker = link.worker.take();
            if let Some(worker) = &worker {
                if matches!(closed_socket, Ok(true)) {
                    worker.queue.push(QueueItem::Meta(MetaEvent::Disconnected {
                        reason: DisconnectReason::Requested,
                        session: 0,
                    }));
                }
                worker.queue.push(QueueItem::Exit);
            }
            (worker, closed_socket)
        };

        if let Some(worker) = worker {
            if let Err(e) = worker.task.await {
                warn!(error = %e, "Dispatch worker ended abnormally");
            }
        }

        closed_socket?;
        info!("Disconnected");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Per-call response timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.inner.response_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner
            .response_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.auto_reconnect.load(Ordering::SeqCst)
    }

    /// Enable or disable auto-reconnect. Disabling cancels a pending
    /// reconnect loop.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.inner.auto_reconnect_allowed.store(false, Ordering::SeqCst);
            self.inner.cancel_reconnect();
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Create a handle for `uid` and register it.
    pub fn add_device(&self, uid: &str) -> Result<DeviceHandle> {
        let device = DeviceHandle::new(uid)?;
        self.register_device(&device)?;
        Ok(device)
    }

    /// Register `device`. A previously registered handle with the same peer
    /// id is marked replaced.
    ///
    /// The daemon's own peer id is reserved for the connection and rejected
    /// with `InvalidArgument`.
    pub fn register_device(&self, device: &DeviceHandle) -> Result<()> {
        if device.peer_id() == BRICK_DAEMON_UID {
            return Err(ProtocolError::InvalidArgument(format!(
                "{} {}",
                constants::ERR_RESERVED_PEER_ID,
                device.uid()
            )));
        }
        self.inner.registry.register(device.clone())
    }

    /// Install a callback handler for one of `device`'s events.
    pub fn register_callback<F>(
        &self,
        device: &DeviceHandle,
        callback_id: u8,
        format: Format,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.inner.check_device(device)?;
        device.register_callback(callback_id, format, handler)
    }

    /// Install a handler for connected or disconnected events.
    pub fn register_connection_event<F>(&self, kind: ConnectionEventKind, handler: F) -> Result<()>
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_connection_event(kind, handler)
    }

    /// Install a handler for enumerate announcements. Enumerate events are
    /// only queued while at least one such handler exists.
    pub fn register_enumerate_callback<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&EnumerateEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_enumerate(handler)
    }

    /// Ask every device to announce itself.
    pub async fn enumerate(&self) -> Result<()> {
        let seq = self.inner.sequence.next();
        let packet = Packet::request(0, FUNCTION_ENUMERATE, seq, false, Bytes::new())?;
        self.inner.send_packet(packet).await
    }

    /// Synchronous call: send a request and, if the function answers, wait
    /// for the matching response.
    ///
    /// `expected_length` is the expected response payload size. Functions
    /// that currently send no response return an empty payload immediately.
    pub async fn call(
        &self,
        device: &DeviceHandle,
        function_id: u8,
        payload: impl Into<Bytes>,
        expected_length: usize,
    ) -> Result<Bytes> {
        self.inner
            .call(device, function_id, payload.into(), expected_length)
            .await
    }

    /// Send a request without asking for a response.
    pub async fn send(
        &self,
        device: &DeviceHandle,
        function_id: u8,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.check_device(device)?;
        if device.response_expected_state(function_id) == ResponseExpected::Unknown {
            return Err(unknown_function(function_id));
        }

        let packet = Packet::request(
            device.peer_id(),
            function_id,
            inner.sequence.next(),
            false,
            payload.into(),
        )?;
        inner.send_packet(packet).await
    }

    /// Read the identity block every device answers with.
    pub async fn get_identity(&self, device: &DeviceHandle) -> Result<Identity> {
        let payload = self
            .call(device, FUNCTION_GET_IDENTITY, Bytes::new(), Identity::size())
            .await?;
        Identity::decode(&payload)
    }

    /// Authenticate the connection with a shared secret.
    ///
    /// A wrong secret makes the daemon close the socket, which shows up as an
    /// ordinary `Disconnected` event.
    #[instrument(skip(self, secret))]
    pub async fn authenticate(&self, secret: &str) -> Result<()> {
        validate_secret(secret)?;

        let inner = &self.inner;
        let daemon = &inner.brick_daemon;
        let mut nonces = inner.nonces.lock().await;
        inner.metrics.auth_attempt();

        let result = async {
            let server_nonce = self
                .call(daemon, FUNCTION_GET_AUTHENTICATION_NONCE, Bytes::new(), NONCE_SIZE)
                .await?;
            let mut nonce = [0u8; NONCE_SIZE];
            nonce.copy_from_slice(&server_nonce);

            let request = AuthenticationRequest::build(secret, &nonce, &mut nonces)?;
            self.call(daemon, FUNCTION_AUTHENTICATE, request.to_payload(), 0)
                .await?;
            Ok::<(), ProtocolError>(())
        }
        .await;

        inner.metrics.auth_result(result.is_ok());
        match &result {
            Ok(()) => info!("Authenticated"),
            Err(e) => warn!(error = %e, "Authentication failed"),
        }
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("devices", &self.inner.registry.len())
            .finish()
    }
}

fn unknown_function(function_id: u8) -> ProtocolError {
    ProtocolError::InvalidArgument(format!("{} {function_id}", constants::ERR_UNKNOWN_FUNCTION))
}

/// Open the pending slot for `(function_id, seq)`.
///
/// A replacement landing after the caller's `check_active` has already reset
/// the correlator, so nothing would ever complete this slot.
fn begin_request(
    device: &DeviceHandle,
    function_id: u8,
    seq: u8,
) -> Result<oneshot::Receiver<Packet>> {
    let correlator = device.correlator();
    let rx = correlator.begin(function_id, seq);
    if device.is_replaced() {
        correlator.cancel(function_id, seq);
        return Err(ProtocolError::DeviceReplaced);
    }
    Ok(rx)
}

/// Map a response packet to the call's outcome.
fn check_response(response: Packet, function_id: u8, expected_length: usize) -> Result<Bytes> {
    match response.header.error_code {
        ErrorCode::Ok => {
            if response.payload.len() != expected_length {
                return Err(ProtocolError::WrongResponseLength {
                    function_id: Some(function_id),
                    expected: expected_length,
                    actual: response.payload.len(),
                });
            }
            Ok(response.payload)
        }
        ErrorCode::InvalidParameter => Err(ProtocolError::InvalidParameter { function_id }),
        ErrorCode::FunctionNotSupported => {
            Err(ProtocolError::FunctionNotSupported { function_id })
        }
        ErrorCode::Unknown => Err(ProtocolError::UnknownError {
            function_id,
            code: ErrorCode::Unknown.bits(),
        }),
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn reconnect_wanted(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
            && self.auto_reconnect_allowed.load(Ordering::SeqCst)
    }

    /// Start a reconnect episode with a token nothing has cancelled yet.
    fn begin_reconnect(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .reconnect_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    fn cancel_reconnect(&self) {
        self.reconnect_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.load(Ordering::Relaxed))
    }

    fn check_device(&self, device: &DeviceHandle) -> Result<()> {
        device.check_active()?;
        if self.registry.contains(device) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidArgument(
                constants::ERR_FOREIGN_DEVICE.to_string(),
            ))
        }
    }

    /// Start the dispatch worker if none is running.
    fn ensure_worker(self: &Arc<Self>, link: &mut Link) {
        if link.worker.is_some() {
            return;
        }
        let (queue, rx) = DispatchQueue::new();
        let task = tokio::spawn(dispatch_loop(Arc::downgrade(self), rx));
        link.worker = Some(DispatchWorker { queue, task });
    }

    /// Open a socket and start its tasks. The caller holds `link` and has
    /// made sure a dispatch worker exists.
    async fn connect_unlocked(self: &Arc<Self>, link: &mut Link, reason: ConnectReason) -> Result<()> {
        let queue = link
            .worker
            .as_ref()
            .map(|w| w.queue.clone())
            .ok_or(ProtocolError::NotConnected)?;

        self.set_state(ConnectionState::Connecting);

        let stream = match open_stream(&link.host, link.port, self.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.set_state(if self.auto_reconnect_pending.load(Ordering::SeqCst) {
                    ConnectionState::ReconnectPending
                } else {
                    ConnectionState::Disconnected
                });
                return Err(e);
            }
        };

        let (read_half, write_half) = stream.into_split();
        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let signal = Arc::new(SessionSignal {
            id,
            lost: AtomicBool::new(false),
            queue: queue.clone(),
            last_send: Mutex::new(Instant::now()),
        });

        *self.writer.lock().await = Some(Writer {
            sink: FramedWrite::new(write_half, PacketCodec),
            signal: signal.clone(),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let receiver = tokio::spawn(receive_loop(
            Arc::downgrade(self),
            FramedRead::new(read_half, PacketCodec),
            signal.clone(),
            shutdown_rx.clone(),
        ));
        let prober = tokio::spawn(probe_loop(
            Arc::downgrade(self),
            signal.clone(),
            self.probe_interval,
            shutdown_rx,
        ));

        link.session = Some(Session {
            signal,
            shutdown,
            receiver,
            prober,
        });

        self.auto_reconnect_allowed.store(false, Ordering::SeqCst);
        self.auto_reconnect_pending.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.metrics
            .connected(reason == ConnectReason::AutoReconnect);

        info!(host = %link.host, port = link.port, session = id, ?reason, "Connected");
        queue.push(QueueItem::Meta(MetaEvent::Connected(reason)));
        Ok(())
    }

    /// Stop a session's tasks and close its socket. Pending calls on every
    /// device are released and fail with `NotConnected`.
    async fn teardown(&self, session: Session) {
        let id = session.signal.id;
        session.signal.lost.store(true, Ordering::SeqCst);
        let _ = session.shutdown.send(true);

        {
            let mut writer = self.writer.lock().await;
            if writer.as_ref().is_some_and(|w| w.signal.id == id) {
                // Dropping the write half shuts down our direction of the socket.
                writer.take();
            }
        }

        if let Err(e) = session.prober.await {
            debug!(session = id, error = %e, "Prober ended abnormally");
        }
        if let Err(e) = session.receiver.await {
            debug!(session = id, error = %e, "Receiver ended abnormally");
        }

        for device in self.registry.handles() {
            device.correlator().reset();
        }
        debug!(session = id, "Session torn down");
    }

    /// Called by whichever task first notices the socket is dead.
    fn report_lost(&self, signal: &SessionSignal, reason: DisconnectReason) {
        if signal.lost.swap(true, Ordering::SeqCst) {
            return;
        }

        self.auto_reconnect_allowed.store(true, Ordering::SeqCst);
        self.set_state(if self.auto_reconnect.load(Ordering::SeqCst) {
            ConnectionState::ReconnectPending
        } else {
            ConnectionState::Disconnected
        });

        warn!(session = signal.id, ?reason, "Connection lost");
        signal.queue.push(QueueItem::Meta(MetaEvent::Disconnected {
            reason,
            session: signal.id,
        }));
    }

    /// Write one packet through the single send path.
    async fn send_packet(&self, packet: Packet) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        if writer.signal.lost.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }

        let length = packet.header.length;
        match writer.sink.send(packet).await {
            Ok(()) => {
                writer.signal.touch();
                self.metrics.packet_sent(u64::from(length));
                Ok(())
            }
            Err(ProtocolError::Io(e)) => {
                let signal = writer.signal.clone();
                drop(guard);
                debug!(session = signal.id, error = %e, "Send failed");
                self.report_lost(&signal, DisconnectReason::Error);
                Err(ProtocolError::NotConnected)
            }
            Err(e) => Err(e),
        }
    }

    async fn call(
        &self,
        device: &DeviceHandle,
        function_id: u8,
        payload: Bytes,
        expected_length: usize,
    ) -> Result<Bytes> {
        self.check_device(device)?;
        let response_expected = device
            .response_expected_state(function_id)
            .expects_response()
            .ok_or_else(|| unknown_function(function_id))?;

        let correlator = device.correlator();
        let _request = correlator.lock_request().await;
        device.check_active()?;

        let seq = match self
            .sequence
            .next_excluding(|seq| correlator.is_abandoned(seq))
        {
            Some(seq) => seq,
            None => {
                warn!(peer_id = device.peer_id(), "All sequence numbers abandoned, forgetting late responses");
                correlator.forget_abandoned();
                self.sequence.next()
            }
        };

        let packet = Packet::request(device.peer_id(), function_id, seq, response_expected, payload)?;

        if !response_expected {
            self.send_packet(packet).await?;
            return Ok(Bytes::new());
        }

        let mut rx = begin_request(device, function_id, seq)?;
        if let Err(e) = self.send_packet(packet).await {
            correlator.cancel(function_id, seq);
            return Err(e);
        }

        trace!(peer_id = device.peer_id(), function_id, seq, "Waiting for response");

        let response = match tokio::time::timeout(self.response_timeout(), &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(if device.is_replaced() {
                    ProtocolError::DeviceReplaced
                } else {
                    ProtocolError::NotConnected
                });
            }
            Err(_) => {
                if correlator.abandon(function_id, seq) {
                    self.metrics.request_timeout();
                    debug!(peer_id = device.peer_id(), function_id, seq, "Call timed out");
                    return Err(ProtocolError::Timeout { function_id });
                }
                // The response raced the deadline and is already in the channel.
                rx.try_recv()
                    .map_err(|_| ProtocolError::Timeout { function_id })?
            }
        };

        check_response(response, function_id, expected_length)
    }

    /// Classify one inbound packet.
    fn route(&self, packet: Packet, signal: &SessionSignal) {
        self.metrics
            .packet_received(u64::from(packet.header.length));

        if packet.header.is_event() {
            if self.dispatcher.wants(&packet, &self.registry) {
                signal.queue.push(QueueItem::Packet(packet));
            } else {
                self.metrics.callback_dropped();
            }
            return;
        }

        let Some(device) = self.registry.lookup(packet.peer_id()) else {
            trace!(peer_id = packet.peer_id(), "Response for unknown device");
            self.metrics.response_discarded();
            return;
        };

        match device.correlator().deliver(packet) {
            Delivery::Matched => self.metrics.response_matched(),
            Delivery::Stale | Delivery::Unexpected => self.metrics.response_discarded(),
        }
    }

    /// Handle a `Disconnected` notice on the dispatch worker. Returns the
    /// episode token if the reconnect loop should run.
    async fn handle_disconnected(
        &self,
        reason: DisconnectReason,
        session: u64,
    ) -> Option<CancellationToken> {
        if reason != DisconnectReason::Requested {
            let mut link = self.link.lock().await;
            let current = link
                .session
                .as_ref()
                .is_some_and(|s| s.signal.id == session);
            if !current {
                debug!(session, "Ignoring loss notice for a closed session");
                return None;
            }
            if let Some(old) = link.session.take() {
                self.teardown(old).await;
            }

            if self.reconnect_wanted() {
                self.auto_reconnect_pending.store(true, Ordering::SeqCst);
                self.set_state(ConnectionState::ReconnectPending);
            } else {
                self.set_state(ConnectionState::Disconnected);
            }
        }

        let episode = (reason != DisconnectReason::Requested
            && self.auto_reconnect_pending.load(Ordering::SeqCst))
        .then(|| self.begin_reconnect());

        self.dispatcher
            .fire(&ConnectionEvent::Disconnected(reason));
        episode
    }
}

async fn dispatch_loop(weak: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
    while let Some(item) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };

        match item {
            QueueItem::Exit => break,
            QueueItem::Packet(packet) => {
                if inner.dispatcher.dispatch_packet(&packet, &inner.registry) {
                    inner.metrics.callback_dispatched();
                } else {
                    inner.metrics.callback_dropped();
                }
            }
            QueueItem::Meta(MetaEvent::Connected(reason)) => {
                inner.dispatcher.fire(&ConnectionEvent::Connected(reason));
            }
            QueueItem::Meta(MetaEvent::Disconnected { reason, session }) => {
                if let Some(cancel) = inner.handle_disconnected(reason, session).await {
                    drop(inner);
                    reconnect_loop(weak.clone(), cancel).await;
                }
            }
        }
    }
    debug!("Dispatch worker stopped");
}

/// Retry the last host and port until connected, cancelled by
/// `disconnect()`, or auto-reconnect is switched off.
#[instrument(skip(weak, cancel))]
async fn reconnect_loop(weak: Weak<Inner>, cancel: CancellationToken) {
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let interval = inner.reconnect_interval;

        {
            let mut link = inner.link.lock().await;
            if cancel.is_cancelled() || link.session.is_some() || !inner.reconnect_wanted() {
                inner.auto_reconnect_pending.store(false, Ordering::SeqCst);
                if link.session.is_none() {
                    inner.set_state(ConnectionState::Disconnected);
                }
                debug!("Reconnect loop finished");
                return;
            }

            match inner
                .connect_unlocked(&mut link, ConnectReason::AutoReconnect)
                .await
            {
                Ok(()) => return,
                Err(e) => debug!(error = %e, "Reconnect attempt failed"),
            }
        }

        drop(inner);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

async fn receive_loop(
    weak: Weak<Inner>,
    mut frames: FramedRead<OwnedReadHalf, PacketCodec>,
    signal: Arc<SessionSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            frame = frames.next() => match frame {
                Some(Ok(packet)) => {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    inner.route(packet, &signal);
                }
                Some(Err(e)) => {
                    debug!(session = signal.id, error = %e, "Receive failed");
                    break DisconnectReason::Error;
                }
                None => break DisconnectReason::Shutdown,
            }
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.report_lost(&signal, reason);
    }
}

/// Send a disconnect probe whenever nothing went out for `interval`.
async fn probe_loop(
    weak: Weak<Inner>,
    signal: Arc<SessionSignal>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let wait = interval.saturating_sub(signal.idle());
        if !wait.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(wait) => continue,
                _ = shutdown.changed() => return,
            }
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let Ok(probe) = Packet::request(
            0,
            FUNCTION_DISCONNECT_PROBE,
            inner.sequence.next(),
            false,
            Bytes::new(),
        ) else {
            return;
        };

        tokio::select! {
            sent = inner.send_packet(probe) => match sent {
                Ok(()) => {
                    inner.metrics.probe_sent();
                    trace!(session = signal.id, "Disconnect probe sent");
                }
                // The send path already reported the loss.
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        }
    }
}
