//! In-process stand-in for the daemon, speaking just enough of the protocol
//! to drive a `Connection` through its paths.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use futures::{SinkExt, StreamExt};
use ipcon_protocol::core::base58;
use ipcon_protocol::core::codec::PacketCodec;
use ipcon_protocol::core::packet::{ErrorCode, Packet};
use ipcon_protocol::protocol::handshake::verify_authentication;
use ipcon_protocol::protocol::message::{
    encode_enumerate, BRICK_DAEMON_UID, CALLBACK_ENUMERATE, FUNCTION_AUTHENTICATE,
    FUNCTION_DISCONNECT_PROBE, FUNCTION_ENUMERATE, FUNCTION_GET_AUTHENTICATION_NONCE,
    FUNCTION_GET_IDENTITY,
};
use ipcon_protocol::{
    ClientConfig, Connection, ConnectionEvent, ConnectionEventKind, EnumerateEvent,
    EnumerationType, Identity,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

/// Device the stub announces on enumerate.
pub const DEVICE_UID: &str = "abc";

/// Answers with a 1-byte payload.
pub const FID_BYTE: u8 = 1;
/// Answers with a 1-byte payload after `slow_delay`.
pub const FID_SLOW: u8 = 2;
/// Never answers.
pub const FID_SILENT: u8 = 3;
/// Setter: answers with an empty payload if asked to.
pub const FID_SETTER: u8 = 4;
/// Answers with error code "function not supported".
pub const FID_UNSUPPORTED: u8 = 5;
/// Emits three `CALLBACK_VALUE` events carrying 1, 2 and 3.
pub const FID_TRIGGER: u8 = 6;
/// Callback id used by `FID_TRIGGER`, payload format `"H"`.
pub const CALLBACK_VALUE: u8 = 40;
/// Low-level write of a streamed message: `H H 8B` (length, offset, chunk),
/// answers with the number of bytes taken as `B`.
pub const FID_STREAM_WRITE: u8 = 7;
/// Low-level read of the stored message, answers `H H 8B`.
pub const FID_STREAM_READ: u8 = 8;
/// Chunk size of the streamed functions.
pub const STREAM_CHUNK: usize = 8;

pub const SERVER_NONCE: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

pub fn identity() -> Identity {
    Identity {
        uid: DEVICE_UID.to_string(),
        connected_uid: "6qzRzc".to_string(),
        position: 'a',
        hardware_version: [2, 1, 0],
        firmware_version: [2, 1, 1],
        device_identifier: 250,
    }
}

#[derive(Default)]
struct StreamBuffer {
    data: Vec<u8>,
    read_offset: usize,
    skip_next: bool,
}

struct StubState {
    secret: Option<String>,
    stream: Mutex<StreamBuffer>,
    slow_delay: Duration,
    received: Mutex<Vec<Packet>>,
    accepted: Mutex<usize>,
    kill: watch::Sender<u64>,
}

pub struct StubDaemon {
    pub addr: SocketAddr,
    state: Arc<StubState>,
    accept_task: Option<JoinHandle<()>>,
}

impl StubDaemon {
    pub async fn start() -> Self {
        Self::start_with(None, Duration::from_millis(300)).await
    }

    pub async fn with_secret(secret: &str) -> Self {
        Self::start_with(Some(secret.to_string()), Duration::from_millis(300)).await
    }

    pub async fn start_with(secret: Option<String>, slow_delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (kill, _) = watch::channel(0u64);
        let state = Arc::new(StubState {
            secret,
            stream: Mutex::new(StreamBuffer::default()),
            slow_delay,
            received: Mutex::new(Vec::new()),
            accepted: Mutex::new(0),
            kill,
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                *accept_state.accepted.lock().unwrap() += 1;
                let kill = accept_state.kill.subscribe();
                tokio::spawn(serve(socket, accept_state.clone(), kill));
            }
        });

        Self {
            addr,
            state,
            accept_task: Some(accept_task),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Reset every open connection. New connections are still accepted.
    pub fn kill_connections(&self) {
        self.state.kill.send_modify(|generation| *generation += 1);
    }

    /// Stop listening and reset every open connection.
    pub async fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.kill_connections();
    }

    pub fn accepted(&self) -> usize {
        *self.state.accepted.lock().unwrap()
    }

    pub fn received(&self) -> Vec<Packet> {
        self.state.received.lock().unwrap().clone()
    }

    /// Make the next streamed read skip one chunk after the one it sends.
    pub fn skip_stream_chunk(&self) {
        self.state.stream.lock().unwrap().skip_next = true;
    }

    pub fn probes(&self) -> Vec<Packet> {
        self.received()
            .into_iter()
            .filter(|p| p.function_id() == FUNCTION_DISCONNECT_PROBE)
            .collect()
    }
}

impl Drop for StubDaemon {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.kill_connections();
    }
}

/// Drop the socket with an RST instead of a FIN, like a crashed peer.
#[allow(deprecated)]
fn reset(socket: TcpStream) {
    let _ = socket.set_linger(Some(Duration::ZERO));
    drop(socket);
}

fn reply(request: &Packet, payload: Vec<u8>) -> Packet {
    Packet::request(
        request.peer_id(),
        request.function_id(),
        request.sequence_number(),
        true,
        payload,
    )
    .unwrap()
}

fn stream_write(stream: &mut StreamBuffer, payload: &[u8]) -> u8 {
    let length = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
    let offset = usize::from(u16::from_le_bytes([payload[2], payload[3]]));
    if offset == 0 {
        stream.data = vec![0; length];
        stream.read_offset = 0;
    }
    if offset >= stream.data.len() {
        return 0;
    }
    let taken = (length - offset).min(STREAM_CHUNK);
    stream.data[offset..offset + taken].copy_from_slice(&payload[4..4 + taken]);
    taken as u8
}

fn stream_read(stream: &mut StreamBuffer) -> Vec<u8> {
    let length = stream.data.len();
    let offset = stream.read_offset;
    let mut payload = Vec::with_capacity(4 + STREAM_CHUNK);
    payload.extend_from_slice(&(length as u16).to_le_bytes());
    payload.extend_from_slice(&(offset as u16).to_le_bytes());
    let end = (offset + STREAM_CHUNK).min(length);
    payload.extend_from_slice(&stream.data[offset.min(end)..end]);
    payload.resize(4 + STREAM_CHUNK, 0);

    let step = if std::mem::take(&mut stream.skip_next) {
        2 * STREAM_CHUNK
    } else {
        STREAM_CHUNK
    };
    stream.read_offset = offset + step;
    if stream.read_offset >= length {
        stream.read_offset = 0;
    }
    payload
}

fn event(peer_id: u32, callback_id: u8, payload: Vec<u8>) -> Packet {
    Packet::request(peer_id, callback_id, 0, false, payload).unwrap()
}

async fn serve(socket: TcpStream, state: Arc<StubState>, mut kill: watch::Receiver<u64>) {
    let mut framed = Framed::new(socket, PacketCodec);
    // With a secret set, only the daemon itself answers before authentication.
    let mut authenticated = state.secret.is_none();

    loop {
        let request = tokio::select! {
            _ = kill.changed() => {
                reset(framed.into_inner());
                return;
            }
            frame = framed.next() => match frame {
                Some(Ok(packet)) => packet,
                _ => return,
            },
        };

        state.received.lock().unwrap().push(request.clone());

        let mut outgoing = Vec::new();
        let answer = request.header.response_expected;

        if request.peer_id() == BRICK_DAEMON_UID {
            match request.function_id() {
                FUNCTION_GET_AUTHENTICATION_NONCE => {
                    outgoing.push(reply(&request, SERVER_NONCE.to_vec()));
                }
                FUNCTION_AUTHENTICATE => {
                    let secret = state.secret.clone().unwrap_or_default();
                    if !verify_authentication(&secret, &SERVER_NONCE, &request.payload) {
                        reset(framed.into_inner());
                        return;
                    }
                    authenticated = true;
                    if answer {
                        outgoing.push(reply(&request, Vec::new()));
                    }
                }
                _ => {}
            }
        } else if !authenticated {
            // Dropped, like the daemon does for unauthenticated clients.
        } else if request.peer_id() == 0 {
            if request.function_id() == FUNCTION_ENUMERATE {
                let payload = encode_enumerate(&EnumerateEvent {
                    identity: identity(),
                    enumeration_type: EnumerationType::Available,
                })
                .unwrap();
                let peer_id = base58::parse_uid(DEVICE_UID).unwrap();
                outgoing.push(event(peer_id, CALLBACK_ENUMERATE, payload));
            }
        } else {
            match request.function_id() {
                FID_BYTE => outgoing.push(reply(&request, vec![0x2A])),
                FID_SLOW => {
                    tokio::time::sleep(state.slow_delay).await;
                    outgoing.push(reply(&request, vec![0x2B]));
                }
                FID_SETTER if answer => outgoing.push(reply(&request, Vec::new())),
                FID_UNSUPPORTED => {
                    let mut packet = reply(&request, Vec::new());
                    packet.header.error_code = ErrorCode::FunctionNotSupported;
                    outgoing.push(packet);
                }
                FID_TRIGGER => {
                    for value in 1u16..=3 {
                        outgoing.push(event(
                            request.peer_id(),
                            CALLBACK_VALUE,
                            value.to_le_bytes().to_vec(),
                        ));
                    }
                    if answer {
                        outgoing.push(reply(&request, Vec::new()));
                    }
                }
                FID_STREAM_WRITE => {
                    let taken = stream_write(&mut state.stream.lock().unwrap(), &request.payload);
                    outgoing.push(reply(&request, vec![taken]));
                }
                FID_STREAM_READ => {
                    let payload = stream_read(&mut state.stream.lock().unwrap());
                    outgoing.push(reply(&request, payload));
                }
                FUNCTION_GET_IDENTITY => {
                    let mut payload = encode_enumerate(&EnumerateEvent {
                        identity: identity(),
                        enumeration_type: EnumerationType::Available,
                    })
                    .unwrap();
                    payload.pop();
                    outgoing.push(reply(&request, payload));
                }
                _ => {}
            }
        }

        for packet in outgoing {
            if framed.send(packet).await.is_err() {
                return;
            }
        }
    }
}

/// Client settings tuned for tests: short timeouts, fast reconnects.
pub fn fast_config(port: u16) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout: Duration::from_secs(2),
        response_timeout: Duration::from_millis(500),
        disconnect_probe_interval: Duration::from_secs(5),
        auto_reconnect: true,
        reconnect_interval: Duration::from_millis(100),
    }
}

/// Forward every connection event into a channel.
pub fn connection_events(connection: &Connection) -> mpsc::UnboundedReceiver<ConnectionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [ConnectionEventKind::Connected, ConnectionEventKind::Disconnected] {
        let tx = tx.clone();
        connection
            .register_connection_event(kind, move |event| {
                let _ = tx.send(*event);
            })
            .unwrap();
    }
    rx
}

pub async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert that nothing arrives on `rx` for a little while.
pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    if let Ok(extra) = rx.try_recv() {
        panic!("unexpected event: {extra:?}");
    }
}

/// Poll `f` until it holds or a few seconds pass.
pub async fn wait_until(mut f: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
