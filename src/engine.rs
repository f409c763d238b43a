//! tunnel-proxy/src/engine.rs
//! Proxy Engine: the listener + per-connection state machine. This is
//! the heart of the crate — connection multiplexing, lifecycle, and
//! teardown.
//!
//! Implemented as a single actor task: all mutation of the
//! `ClientRegistry` and `ProxyState` happens on one logical execution
//! context (a `tokio::select!` loop over commands, newly accepted
//! sockets, and per-client events), so no locking is needed.
//! `TunnelProxy` is a cheap, cloneable handle that only talks to that
//! actor over channels — the same shape as the accept-loop/connection
//! split a listener-based server uses, generalized away from global
//! statics into state owned by one instance.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::codec::{TunnelEvent, TunnelMessage, encode};
use crate::registry::ClientRegistry;
use crate::transport::Transport;
use crate::types::{ByteCounters, ClientId, ProxyState, TunnelId};

/// Constructor configuration for one proxy instance.
///
/// `serde`-deserializable so a hosting process can build it from
/// whatever outer configuration format it prefers; this crate
/// prescribes none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub tunnel_id: TunnelId,
    pub local_port: u16,
    pub remote_port: u16,
    pub use_ipv4: bool,
}

/// The only error surfaced directly to a proxy's creator; everything
/// else is reflected outward via the event stream instead of a
/// `Result`.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind local listener: {0}")]
    BindFailed(#[from] std::io::Error),
}

/// Broadcast to `TunnelProxy::subscribe_errors` whenever a per-client
/// socket errors, for host-side logging or supervision.
#[derive(Debug, Clone)]
pub struct ClientError {
    pub client_id: ClientId,
    pub message: String,
}

/// A handle to a running Proxy Engine instance. Cloning shares the
/// same underlying actor; dropping every clone does not close the
/// proxy (call `close()` explicitly) but does eventually let the actor
/// task notice and shut down once all command senders are gone.
#[derive(Clone)]
pub struct TunnelProxy {
    tunnel_id: TunnelId,
    cmd_tx: mpsc::Sender<Command>,
    error_tx: broadcast::Sender<ClientError>,
}

enum Command {
    StartListening(oneshot::Sender<Result<(), ProxyError>>),
    Receive(TunnelMessage),
    Close(oneshot::Sender<()>),
    ClientStats(ClientId, oneshot::Sender<Option<ByteCounters>>),
}

impl TunnelProxy {
    /// Constructs, but does not yet bind, a proxy instance. The
    /// returned handle is usable immediately; the
    /// actual local listener only comes up once `start_listening` is
    /// awaited.
    pub fn create(config: ProxyConfig, transport: Arc<dyn Transport>) -> Self {
        let tunnel_id = config.tunnel_id.clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (error_tx, _) = broadcast::channel(64);

        tokio::spawn(run_actor(config, transport, cmd_rx, error_tx.clone()));

        Self {
            tunnel_id,
            cmd_tx,
            error_tx,
        }
    }

    /// Returns the proxy's `tunnelId`. Always answerable, even after
    /// `close()`, since it's carried on the handle itself.
    pub fn id(&self) -> &str {
        &self.tunnel_id
    }

    /// Binds the local listener and announces `proxyCreated` to the
    /// peer. A no-op if the proxy isn't in `Initializing` state
    /// (already listening, or already closed).
    pub async fn start_listening(&self) -> Result<(), ProxyError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::StartListening(resp_tx)).await.is_err() {
            return Ok(()); // proxy already closed; no-op.
        }
        resp_rx.await.unwrap_or(Ok(()))
    }

    /// Dispatches an inbound message from the transport. Silently
    /// dropped if the proxy is closed, the `tunnelId` doesn't match, or
    /// (for `data`) the `clientId` is unknown.
    pub async fn receive(&self, msg: TunnelMessage) {
        let _ = self.cmd_tx.send(Command::Receive(msg)).await;
    }

    /// Idempotent teardown: ends every live client socket, releases the
    /// listener, and announces `proxyClosed` exactly once. Safe to call
    /// more than once or concurrently.
    pub async fn close(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(resp_tx)).await.is_ok() {
            let _ = resp_rx.await;
        }
    }

    /// Subscribes to the "a per-client socket errored" signal.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ClientError> {
        self.error_tx.subscribe()
    }

    /// Point-in-time byte counters for one live client, or `None` if
    /// `client_id` isn't currently registered. Pure observability; does
    /// not affect wire behavior.
    pub async fn client_stats(&self, client_id: ClientId) -> Option<ByteCounters> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::ClientStats(client_id, resp_tx)).await.is_err() {
            return None;
        }
        resp_rx.await.ok().flatten()
    }
}

/// Per-client events a connection task reports back to the actor.
enum ClientSocketEvent {
    Data(Bytes),
    End,
    Error(String),
    Close,
}

#[derive(Default)]
struct ClientMetrics {
    bytes_sent: AtomicU64, // socket -> peer, i.e. outbound `data` frames
    bytes_recv: AtomicU64, // peer -> socket, i.e. applied inbound `data` frames
}

impl ClientMetrics {
    fn snapshot(&self) -> ByteCounters {
        ByteCounters {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
        }
    }
}

struct ClientEntry {
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    abort: tokio::task::AbortHandle,
    #[allow(dead_code)] // carried for diagnostics only
    remote_port: u16,
    metrics: Arc<ClientMetrics>,
}

fn bind_host(use_ipv4: bool) -> &'static str {
    if use_ipv4 { "0.0.0.0" } else { "::" }
}

/// Sends one framed event outward. Returns `false` if the transport
/// send failed, which is fatal to the proxy.
async fn emit(transport: &Arc<dyn Transport>, tunnel_id: &str, event: TunnelEvent) -> bool {
    let msg = TunnelMessage::new(tunnel_id, event);
    match transport.send(encode(&msg)).await {
        Ok(()) => true,
        Err(e) => {
            error!(tunnel = tunnel_id, "transport send failed, closing proxy: {}", e);
            false
        }
    }
}

async fn run_actor(
    config: ProxyConfig,
    transport: Arc<dyn Transport>,
    mut cmd_rx: mpsc::Receiver<Command>,
    error_tx: broadcast::Sender<ClientError>,
) {
    let tunnel_id = config.tunnel_id.clone();
    let mut state = ProxyState::Initializing;
    let mut listener: Option<TcpListener> = None;
    let mut registry: ClientRegistry<ClientEntry> = ClientRegistry::new();
    let mut next_client_id: ClientId = 1;
    // Bounded, not unbounded: once this fills (the actor is stuck behind
    // a slow transport.send), a client's read loop naturally pauses on
    // its own `evt_tx.send(...).await` instead of buffering without limit.
    let (evt_tx, mut evt_rx) = mpsc::channel::<(ClientId, ClientSocketEvent)>(64);

    'actor: loop {
        let accept_fut = async {
            match &listener {
                Some(l) => l.accept().await,
                None => std::future::pending::<std::io::Result<(TcpStream, SocketAddr)>>().await,
            }
        };

        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else {
                    break 'actor; // every TunnelProxy handle was dropped
                };
                match cmd {
                    Command::StartListening(resp) => {
                        if state != ProxyState::Initializing {
                            let _ = resp.send(Ok(()));
                            continue 'actor;
                        }
                        let bind_addr = format!("{}:{}", bind_host(config.use_ipv4), config.local_port);
                        match TcpListener::bind(&bind_addr).await {
                            Ok(bound) => {
                                let bound_port = bound.local_addr().map(|a| a.port()).unwrap_or(config.local_port);
                                listener = Some(bound);
                                state = ProxyState::Listening;
                                info!(tunnel = %tunnel_id, port = bound_port, "tunnel proxy listening");
                                let ok = emit(&transport, &tunnel_id, TunnelEvent::ProxyCreated {
                                    port: bound_port,
                                    use_ipv4: config.use_ipv4,
                                    remote_port: config.remote_port,
                                }).await;
                                let _ = resp.send(Ok(()));
                                if !ok {
                                    state = ProxyState::Closed;
                                    break 'actor;
                                }
                            }
                            Err(e) => {
                                error!(tunnel = %tunnel_id, "failed to bind {}: {}", bind_addr, e);
                                let _ = emit(&transport, &tunnel_id, TunnelEvent::ProxyError {
                                    port: config.local_port,
                                    use_ipv4: config.use_ipv4,
                                    remote_port: config.remote_port,
                                    error: e.to_string(),
                                }).await;
                                state = ProxyState::Closed;
                                let _ = resp.send(Err(ProxyError::BindFailed(e)));
                                break 'actor;
                            }
                        }
                    }
                    Command::Receive(msg) => {
                        if state.is_closed() || msg.tunnel_id != tunnel_id {
                            continue 'actor;
                        }
                        // Only `data` is recognised inbound; other kinds are
                        // ignored for forward compatibility.
                        if let TunnelEvent::Data { client_id, arg } = msg.event {
                            match registry.get(client_id) {
                                Some(entry) => {
                                    if entry.inbound_tx.send(Bytes::from(arg)).is_err() {
                                        debug!(tunnel = %tunnel_id, client = client_id, "client task already gone, dropping inbound data");
                                    }
                                }
                                None => {
                                    debug!(tunnel = %tunnel_id, client = client_id, "dropping data for unknown client");
                                }
                            }
                        }
                    }
                    Command::Close(resp) => {
                        if state.is_closed() {
                            let _ = resp.send(());
                            continue 'actor;
                        }
                        state = ProxyState::Closing;
                        listener = None; // stop accepting immediately
                        let mut fatal = false;
                        for (client_id, entry) in registry.drain() {
                            entry.abort.abort();
                            if !fatal && !emit(&transport, &tunnel_id, TunnelEvent::Close { client_id }).await {
                                fatal = true;
                            }
                        }
                        if !fatal {
                            emit(&transport, &tunnel_id, TunnelEvent::ProxyClosed).await;
                        }
                        state = ProxyState::Closed;
                        info!(tunnel = %tunnel_id, "tunnel proxy closed");
                        let _ = resp.send(());
                        break 'actor;
                    }
                    Command::ClientStats(client_id, resp) => {
                        let snapshot = registry.get(client_id).map(|entry| entry.metrics.snapshot());
                        let _ = resp.send(snapshot);
                    }
                }
            }

            accept_result = accept_fut => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if state != ProxyState::Listening {
                            // close() raced an in-flight accept: reject
                            // without forwarding.
                            drop(stream);
                            continue 'actor;
                        }
                        let client_id = next_client_id;
                        next_client_id += 1;
                        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
                        let metrics = Arc::new(ClientMetrics::default());
                        let handle = tokio::spawn(run_client(
                            client_id,
                            stream,
                            inbound_rx,
                            evt_tx.clone(),
                            metrics.clone(),
                        ));
                        registry
                            .insert(client_id, ClientEntry {
                                inbound_tx,
                                abort: handle.abort_handle(),
                                remote_port: peer_addr.port(),
                                metrics,
                            })
                            .expect("monotonic client id is always fresh");
                        debug!(tunnel = %tunnel_id, client = client_id, remote_port = peer_addr.port(), "accepted connection");
                        if !emit(&transport, &tunnel_id, TunnelEvent::Connection { client_id }).await {
                            state = ProxyState::Closed;
                            break 'actor;
                        }
                    }
                    Err(e) => {
                        warn!(tunnel = %tunnel_id, "accept error: {}", e);
                    }
                }
            }

            Some((client_id, event)) = evt_rx.recv() => {
                match event {
                    ClientSocketEvent::Data(bytes) => {
                        if let Some(entry) = registry.get(client_id) {
                            entry.metrics.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            if !emit(&transport, &tunnel_id, TunnelEvent::Data { client_id, arg: bytes.to_vec() }).await {
                                state = ProxyState::Closed;
                                break 'actor;
                            }
                        }
                    }
                    ClientSocketEvent::End => {
                        if registry.contains(client_id)
                            && !emit(&transport, &tunnel_id, TunnelEvent::End { client_id }).await {
                            state = ProxyState::Closed;
                            break 'actor;
                        }
                    }
                    ClientSocketEvent::Error(message) => {
                        if registry.contains(client_id) {
                            let _ = error_tx.send(ClientError { client_id, message: message.clone() });
                            if !emit(&transport, &tunnel_id, TunnelEvent::Error { client_id, arg: message }).await {
                                state = ProxyState::Closed;
                                break 'actor;
                            }
                        }
                    }
                    ClientSocketEvent::Close => {
                        // Unique removal point for organically-terminated
                        // clients: `HashMap::remove` already guards against
                        // a double removal if this somehow fired twice.
                        if registry.remove(client_id).is_some()
                            && !emit(&transport, &tunnel_id, TunnelEvent::Close { client_id }).await {
                            state = ProxyState::Closed;
                            break 'actor;
                        }
                    }
                }
            }
        }
    }

    // Whether we exited via a clean Close or a fatal transport error,
    // release every remaining client.
    for (_, entry) in registry.drain() {
        entry.abort.abort();
    }
}

/// Pumps one accepted TCP socket: forwards reads outward as
/// `ClientSocketEvent`s and applies inbound bytes pushed on
/// `inbound_rx` as raw writes. Always finishes by reporting `Close`,
/// after an `End`/`Error` if the termination had one (both are
/// forwarded when a socket both errors and closes).
async fn run_client(
    client_id: ClientId,
    mut stream: TcpStream,
    mut inbound_rx: mpsc::UnboundedReceiver<Bytes>,
    evt_tx: mpsc::Sender<(ClientId, ClientSocketEvent)>,
    metrics: Arc<ClientMetrics>,
) {
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            biased;

            maybe_bytes = inbound_rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => {
                        if let Err(e) = stream.write_all(&bytes).await {
                            let _ = evt_tx.send((client_id, ClientSocketEvent::Error(e.to_string()))).await;
                            break;
                        }
                        metrics.bytes_recv.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                    }
                    None => break, // registry entry gone; engine is tearing us down
                }
            }

            read_result = stream.read(&mut buf) => {
                match read_result {
                    Ok(0) => {
                        let _ = evt_tx.send((client_id, ClientSocketEvent::End)).await;
                        break;
                    }
                    Ok(n) => {
                        let _ = evt_tx.send((client_id, ClientSocketEvent::Data(Bytes::copy_from_slice(&buf[..n])))).await;
                    }
                    Err(e) => {
                        let _ = evt_tx.send((client_id, ClientSocketEvent::Error(e.to_string()))).await;
                        break;
                    }
                }
            }
        }
    }
    let _ = evt_tx.send((client_id, ClientSocketEvent::Close)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpStream as ClientTcpStream;

    fn config(tunnel_id: &str, local_port: u16) -> ProxyConfig {
        ProxyConfig {
            tunnel_id: tunnel_id.to_string(),
            local_port,
            remote_port: 9000,
            use_ipv4: true,
        }
    }

    async fn next_message(rx: &mut broadcast::Receiver<Bytes>) -> TunnelMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("message arrives in time")
            .expect("transport not closed");
        crate::codec::decode(&frame).expect("well-formed frame")
    }

    #[tokio::test]
    async fn happy_path_single_client() {
        let (engine_side, peer_side) = MemoryTransport::pair();
        let engine_side = Arc::new(engine_side);
        let mut peer_rx = peer_side.subscribe();

        let proxy = TunnelProxy::create(config("t1", 0), engine_side);
        proxy.start_listening().await.unwrap();

        let created = next_message(&mut peer_rx).await;
        let port = match created.event {
            TunnelEvent::ProxyCreated { port, use_ipv4, remote_port } => {
                assert!(use_ipv4);
                assert_eq!(remote_port, 9000);
                port
            }
            other => panic!("expected proxyCreated, got {other:?}"),
        };

        let mut client = ClientTcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let connected = next_message(&mut peer_rx).await;
        let client_id = match connected.event {
            TunnelEvent::Connection { client_id } => client_id,
            other => panic!("expected connection, got {other:?}"),
        };

        client.write_all(b"hello").await.unwrap();
        let data = next_message(&mut peer_rx).await;
        match data.event {
            TunnelEvent::Data { client_id: id, arg } => {
                assert_eq!(id, client_id);
                assert_eq!(arg, b"hello");
            }
            other => panic!("expected data, got {other:?}"),
        }

        proxy
            .receive(TunnelMessage::new(
                "t1",
                TunnelEvent::Data {
                    client_id,
                    arg: b"world".to_vec(),
                },
            ))
            .await;

        let mut readback = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut readback))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&readback, b"world");

        drop(client);

        let ended = next_message(&mut peer_rx).await;
        assert!(matches!(ended.event, TunnelEvent::End { client_id: id } if id == client_id));
        let closed = next_message(&mut peer_rx).await;
        assert!(matches!(closed.event, TunnelEvent::Close { client_id: id } if id == client_id));
    }

    #[tokio::test]
    async fn bind_failure_reports_and_announces_proxy_error() {
        let (engine_side, peer_side) = MemoryTransport::pair();
        let engine_side = Arc::new(engine_side);
        let mut peer_rx = peer_side.subscribe();

        // Occupy a port first so the second bind fails.
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        let proxy = TunnelProxy::create(config("t1", port), engine_side);
        let result = proxy.start_listening().await;
        assert!(matches!(result, Err(ProxyError::BindFailed(_))));

        let announced = next_message(&mut peer_rx).await;
        assert!(matches!(announced.event, TunnelEvent::ProxyError { .. }));
    }

    #[tokio::test]
    async fn receive_with_unknown_client_id_is_a_no_op() {
        let (engine_side, peer_side) = MemoryTransport::pair();
        let engine_side = Arc::new(engine_side);
        let mut peer_rx = peer_side.subscribe();

        let proxy = TunnelProxy::create(config("t1", 0), engine_side);
        proxy.start_listening().await.unwrap();
        let _ = next_message(&mut peer_rx).await; // proxyCreated

        proxy
            .receive(TunnelMessage::new(
                "t1",
                TunnelEvent::Data {
                    client_id: 999,
                    arg: b"nobody home".to_vec(),
                },
            ))
            .await;

        // No outbound event should follow; give it a short window to prove
        // the absence rather than assuming an immediate return means safe.
        let nothing = tokio::time::timeout(Duration::from_millis(100), peer_rx.recv()).await;
        assert!(nothing.is_err(), "no event expected for an unknown clientId");
    }

    #[tokio::test]
    async fn close_during_activity_ends_clients_and_emits_proxy_closed_once() {
        let (engine_side, peer_side) = MemoryTransport::pair();
        let engine_side = Arc::new(engine_side);
        let mut peer_rx = peer_side.subscribe();

        let proxy = TunnelProxy::create(config("t1", 0), engine_side);
        proxy.start_listening().await.unwrap();
        let created = next_message(&mut peer_rx).await;
        let port = match created.event {
            TunnelEvent::ProxyCreated { port, .. } => port,
            _ => unreachable!(),
        };

        let _client_a = ClientTcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _client_b = ClientTcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _ = next_message(&mut peer_rx).await; // connection A
        let _ = next_message(&mut peer_rx).await; // connection B

        proxy.close().await;

        let mut saw_proxy_closed = false;
        for _ in 0..3 {
            let msg = next_message(&mut peer_rx).await;
            if matches!(msg.event, TunnelEvent::ProxyClosed) {
                saw_proxy_closed = true;
                break;
            }
            assert!(matches!(msg.event, TunnelEvent::Close { .. }));
        }
        assert!(saw_proxy_closed, "expected exactly one proxyClosed frame");

        // Idempotent: a second close() must not emit another proxyClosed.
        proxy.close().await;
        let nothing = tokio::time::timeout(Duration::from_millis(100), peer_rx.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn two_concurrent_clients_keep_per_client_fifo_order() {
        let (engine_side, peer_side) = MemoryTransport::pair();
        let engine_side = Arc::new(engine_side);
        let mut peer_rx = peer_side.subscribe();

        let proxy = TunnelProxy::create(config("t1", 0), engine_side);
        proxy.start_listening().await.unwrap();
        let created = next_message(&mut peer_rx).await;
        let port = match created.event {
            TunnelEvent::ProxyCreated { port, .. } => port,
            _ => unreachable!(),
        };

        let mut a = ClientTcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let conn_a = next_message(&mut peer_rx).await;
        let id_a = match conn_a.event {
            TunnelEvent::Connection { client_id } => client_id,
            _ => unreachable!(),
        };

        let mut b = ClientTcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let conn_b = next_message(&mut peer_rx).await;
        let id_b = match conn_b.event {
            TunnelEvent::Connection { client_id } => client_id,
            _ => unreachable!(),
        };

        a.write_all(b"A1").await.unwrap();
        a.write_all(b"A2").await.unwrap();
        b.write_all(b"B1").await.unwrap();

        let mut seen_a = Vec::new();
        let mut seen_b = Vec::new();
        while seen_a.len() < 2 || seen_b.len() < 1 {
            let msg = next_message(&mut peer_rx).await;
            if let TunnelEvent::Data { client_id, arg } = msg.event {
                if client_id == id_a {
                    seen_a.push(arg);
                } else if client_id == id_b {
                    seen_b.push(arg);
                }
            }
        }
        assert_eq!(seen_a, vec![b"A1".to_vec(), b"A2".to_vec()]);
        assert_eq!(seen_b, vec![b"B1".to_vec()]);
    }
}
