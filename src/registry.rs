//! tunnel-proxy/src/registry.rs
//! Client Registry: maps a per-tunnel `ClientId` to its owning
//! `ClientSocket` and enforces uniqueness and lifetime.
//!
//! Accessed only from the Proxy Engine's single actor task; that
//! single-writer discipline makes a plain `HashMap` correct here,
//! with no internal locking required.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::ClientId;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("client {0} is already registered")]
    DuplicateClient(ClientId),
}

/// Owns every live `ClientSocket` for one proxy instance.
pub struct ClientRegistry<S> {
    sockets: HashMap<ClientId, S>,
}

impl<S> ClientRegistry<S> {
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
        }
    }

    /// Inserts `socket` under `client_id`. Fails with
    /// `DuplicateClient` if the id is already present; otherwise a
    /// subsequent `lookup` returns the inserted socket.
    pub fn insert(&mut self, client_id: ClientId, socket: S) -> Result<(), RegistryError> {
        if self.sockets.contains_key(&client_id) {
            return Err(RegistryError::DuplicateClient(client_id));
        }
        self.sockets.insert(client_id, socket);
        Ok(())
    }

    /// Total: returns the socket for `client_id`, if any.
    pub fn get(&self, client_id: ClientId) -> Option<&S> {
        self.sockets.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut S> {
        self.sockets.get_mut(&client_id)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.sockets.contains_key(&client_id)
    }

    /// Detaches and returns the socket for `client_id`, if present.
    /// Idempotent: removing an absent id is a no-op that returns
    /// `None`.
    pub fn remove(&mut self, client_id: ClientId) -> Option<S> {
        self.sockets.remove(&client_id)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Yields every live socket exactly once and empties the registry.
    /// Used only during proxy shutdown.
    pub fn drain(&mut self) -> impl Iterator<Item = (ClientId, S)> + '_ {
        self.sockets.drain()
    }
}

impl<S> Default for ClientRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
