//! tunnel-proxy/src/lib.rs
//! A TCP tunnel proxy endpoint: accepts inbound connections on a local
//! port, assigns each a `ClientId`, and forwards its socket lifecycle
//! as framed messages over an abstract duplex transport to a remote
//! peer. Inbound `data` frames from that peer are applied back onto
//! the owning socket.

pub mod codec;
pub mod engine;
pub mod logging;
pub mod registry;
pub mod transport;
pub mod types;

pub use codec::{CodecError, TunnelEvent, TunnelMessage};
pub use engine::{ClientError, ProxyConfig, ProxyError, TunnelProxy};
pub use registry::{ClientRegistry, RegistryError};
pub use transport::{Transport, TransportError};
pub use types::{ByteCounters, ClientId, ProxyState, TunnelId};
