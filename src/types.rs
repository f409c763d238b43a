//! tunnel-proxy/src/types.rs
//! Shared identifiers and small value types used across the crate.

use serde::{Deserialize, Serialize};

/// Identifies a tunnel among the set of tunnels sharing one transport.
///
/// Opaque from this crate's point of view; assigned once at proxy
/// construction and carried verbatim on every outbound message.
pub type TunnelId = String;

/// Identifies one accepted TCP connection within a single proxy instance.
///
/// Allocated by the Proxy Engine on `accept` from a monotonic counter —
/// chosen over reusing the peer's TCP port, which collides under port
/// reuse once a connection closes.
pub type ClientId = u32;

/// Lifecycle state of a [`crate::engine::TunnelProxy`].
///
/// Monotonically advances left to right; no transition ever moves
/// backwards, and any operation on `Closed` other than `id()` is a
/// no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Initializing,
    Listening,
    Closing,
    Closed,
}

impl ProxyState {
    pub fn is_closed(self) -> bool {
        matches!(self, ProxyState::Closed)
    }
}

/// Point-in-time byte counters for one client connection or for a whole
/// proxy instance. Pure observability; does not affect wire behavior or
/// any invariant.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy)]
pub struct ByteCounters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}
