//! Connection registry for the hub
//!
//! This module tracks every registered viewer connection, including:
//! - Connection identity and peer address
//! - The bounded outbound mailbox drained by the connection's writer pump
//! - Camera position and subscribed zones
//!
//! The registry is owned by the hub loop and never shared, so it needs no
//! locking. Delivery into a mailbox never waits: a full mailbox is reported
//! back to the caller, which decides to drop the connection.

use log::info;
use shared::{Coordinate, Message, ServerEvent, ZoneId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

pub type Mailbox = mpsc::Sender<Message<ServerEvent>>;

/// Server-assigned identifier of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("mailbox is full")]
    Full,
    #[error("mailbox is closed")]
    Closed,
}

/// A registered viewer connection
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    /// Peer address, absent for in-process connections
    pub addr: Option<SocketAddr>,
    mailbox: Mailbox,
    /// Center of the last subscribed region
    pub camera: Option<Coordinate>,
    pub zones: HashSet<ZoneId>,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, addr: Option<SocketAddr>, mailbox: Mailbox) -> Self {
        Self {
            id,
            addr,
            mailbox,
            camera: None,
            zones: HashSet::new(),
        }
    }

    /// Queues a message without waiting for mailbox space
    pub fn deliver(&self, message: Message<ServerEvent>) -> Result<(), DeliveryError> {
        self.mailbox.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// All registered connections, keyed by id
pub struct ClientManager {
    clients: HashMap<ConnectionId, ClientConnection>,
    /// Maximum number of concurrent connections allowed
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_clients,
        }
    }

    /// Registers a connection
    ///
    /// Returns the connection back when the registry is at capacity or the
    /// id is already taken, so the caller can still reach its mailbox.
    pub fn add_client(&mut self, client: ClientConnection) -> Result<(), ClientConnection> {
        if self.clients.len() >= self.max_clients || self.clients.contains_key(&client.id) {
            return Err(client);
        }

        match client.addr {
            Some(addr) => info!("{} registered from {}", client.id, addr),
            None => info!("{} registered", client.id),
        }
        self.clients.insert(client.id, client);
        Ok(())
    }

    /// Removes a connection; removing an unknown id is a no-op
    ///
    /// Dropping the returned connection drops its mailbox sender, which lets
    /// the writer pump drain and close the socket.
    pub fn remove_client(&mut self, id: &ConnectionId) -> Option<ClientConnection> {
        let client = self.clients.remove(id)?;
        info!("{} unregistered", client.id);
        Some(client)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ClientConnection> {
        self.clients.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
