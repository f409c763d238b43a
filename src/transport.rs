//! tunnel-proxy/src/transport.rs
//! Transport Adapter: the external collaborator abstracting the
//! duplex message channel to the remote peer.
//!
//! Modeled the way `tunnel-transport`'s `TransportConnection` /
//! `TransportStream` traits model a multiplexed duplex channel:
//! polymorphic over the concrete transport (WebSocket, SSH channel,
//! local pipe, ...) behind an `async_trait`, so the Proxy Engine never
//! depends on a specific wire technology. Multiple tunnels may share
//! one `Transport`; each filters inbound frames by its own `tunnelId`.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors the Transport Adapter surfaces to the Proxy Engine. Any of
/// these observed on a `send` is fatal to the proxy that made the call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// The duplex message channel contract consumed by the Proxy Engine.
///
/// `send` enqueues a frame for delivery and preserves program-order
/// delivery to the remote peer. `subscribe` hands back an independent
/// ordered view of every inbound frame on this transport; a proxy
/// filters the frames addressed to its own `tunnelId`. `is_closed` /
/// `closed` expose the transport's close signal so the engine can
/// release resources.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueues `frame` for delivery, in program order relative to
    /// other `send` calls on this handle. Fails only once the
    /// transport is closed.
    async fn send(&self, frame: Bytes) -> TransportResult<()>;

    /// Subscribes to the ordered stream of inbound frames. Each
    /// subscriber gets every frame sent on this transport after the
    /// call to `subscribe`; late frames are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;

    /// True once the transport has closed and will accept no further
    /// `send` calls.
    fn is_closed(&self) -> bool;

    /// Resolves once the transport closes. A proxy holding this future
    /// treats its resolution as the close signal for the whole channel.
    async fn closed(&self);
}

/// An in-process, loopback `Transport` backed by `tokio::sync` channels.
///
/// Exists purely as test/demo scaffolding so the engine's scenarios
/// can run without a real WebSocket/SSH peer, mirroring the
/// mock transport used by `tunnel-transport`'s own test module. Not
/// part of the public wire-compatible surface.
#[cfg(any(test, feature = "test-util"))]
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    /// One endpoint of an in-memory transport pair. `a.send()` frames
    /// arrive on `b`'s `subscribe()` stream and vice versa.
    pub struct MemoryTransport {
        outgoing: broadcast::Sender<Bytes>,
        incoming: broadcast::Sender<Bytes>,
        closed: Arc<AtomicBool>,
        close_signal: Arc<Notify>,
    }

    impl MemoryTransport {
        /// Builds a connected pair: frames sent on the first are
        /// observed by the second's `subscribe`, and vice versa.
        pub fn pair() -> (Self, Self) {
            let (tx_a, rx_a) = broadcast::channel(256);
            let (tx_b, rx_b) = broadcast::channel(256);
            drop(rx_a);
            drop(rx_b);
            let closed = Arc::new(AtomicBool::new(false));
            let close_signal = Arc::new(Notify::new());
            let a = Self {
                outgoing: tx_a.clone(),
                incoming: tx_b.clone(),
                closed: closed.clone(),
                close_signal: close_signal.clone(),
            };
            let b = Self {
                outgoing: tx_b,
                incoming: tx_a,
                closed,
                close_signal,
            };
            (a, b)
        }

        /// Simulates the remote peer or the session closing.
        pub fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.close_signal.notify_waiters();
            }
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, frame: Bytes) -> TransportResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            // No receivers subscribed yet is not an error: frames are
            // only guaranteed to reach subscribers registered before
            // they were sent, matching a lossy multicast bus.
            let _ = self.outgoing.send(frame);
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<Bytes> {
            self.incoming.subscribe()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn closed(&self) {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            self.close_signal.notified().await;
        }
    }

}
