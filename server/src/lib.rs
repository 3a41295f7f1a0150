//! # Board Hub Library
//!
//! This library provides the authoritative side of the board grid: a sparse
//! store holding one Go board per coordinate on a 1000×1000 grid, and a hub
//! that routes viewer requests against it and fans updates out to the
//! viewers watching each area.
//!
//! ## Architecture Design
//!
//! ### Single Serialized Hub Loop
//! One task owns the connection registry and the zone index and handles one
//! event at a time. Connections talk to it only through bounded queues, so
//! registry state is never touched from two places at once.
//!
//! ### Lazily Populated Store
//! Boards are created on first touch and never evicted. The store is shared
//! behind an `Arc`; its map and each board carry their own lock, and no code
//! path holds more than one of them at a time.
//!
//! ### Backpressure
//! The hub never waits on a slow viewer. Every reply is a non-blocking push
//! into a bounded mailbox, and a viewer whose mailbox is full is dropped.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! Get-or-create of boards, move application and the pluggable rules
//! engine that judges each move.
//!
//! ### Client Manager Module (`client_manager`)
//! Registered connections with their mailboxes and zone sets.
//!
//! ### Zones Module (`zones`)
//! Zone to subscriber index used for `BOARD_UPDATE` fan-out.
//!
//! ### Hub Module (`hub`)
//! The routing loop, its handle, configuration and statistics.
//!
//! ### Network Module (`network`)
//! WebSocket listener plus the reader and writer pump of each connection.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::hub::{Hub, HubConfig};
//! use server::network::{ConnectionConfig, Server};
//! use server::store::BoardStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HubConfig::default();
//!     let store = Arc::new(BoardStore::new(config.board_size));
//!     let (hub, handle) = Hub::new(config, store);
//!     tokio::spawn(hub.run());
//!
//!     let server = Server::bind("127.0.0.1:8080", handle, ConnectionConfig::default()).await?;
//!     server.run().await.map_err(|e| e as Box<dyn std::error::Error>)?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod hub;
pub mod network;
pub mod store;
pub mod zones;

pub use client_manager::{ClientConnection, ClientManager, ConnectionId};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use network::{ConnectionConfig, Server};
pub use store::{AcceptAll, BoardStore, RulesEngine, StoreError, Verdict};
