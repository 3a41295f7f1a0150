//! # Board Viewer Library
//!
//! This library provides the viewing side of the board grid. A viewer only
//! ever looks at a small window of the 1000×1000 grid, so it keeps a fixed
//! budget of board slots around its camera, caches what scrolls out of view
//! and asks the hub for whatever it has never seen.
//!
//! ## Architecture Overview
//!
//! ### Prioritized Window
//! Boards near the camera are split into an active window that is always
//! materialized and a buffer ring that is filled ahead of time, so panning
//! promotes boards that are already present instead of waiting on the hub.
//!
//! ### Write-Back Pooling
//! Slots are reused, never dropped. Whenever a slot is evicted or released
//! its board is written to the state cache first, so scrolling back to a
//! board restores it without a round trip.
//!
//! ### Stale Reply Detection
//! Every fetch is tied to the slot generation it was issued for. A reply
//! that arrives after its slot was rebound to another board is cached but
//! never shown in the wrong place.
//!
//! ## Module Organization
//!
//! ### Viewport Module (`viewport`)
//! Camera clamping and the ordered list of boards around it.
//!
//! ### Cache Module (`cache`)
//! Serialized board snapshots and decaying activity levels, each with its
//! own capacity.
//!
//! ### Pool Module (`pool`)
//! Active, buffer and free slots with promotion, demotion and eviction.
//!
//! ### Viewer Module (`viewer`)
//! Wires the three together and turns camera moves and hub events into
//! requests and board changes.
//!
//! ### Network Module (`network`)
//! WebSocket session with the hub and reconnection with bounded backoff.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{ClientConfig, ViewerClient};
//! use client::viewer::Viewer;
//! use client::{CacheConfig, PoolConfig, ViewportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let viewer = Viewer::new(
//!         ViewportConfig::default(),
//!         PoolConfig::default(),
//!         CacheConfig::default(),
//!         500.0,
//!         500.0,
//!     )?;
//!     let mut client = ViewerClient::new(ClientConfig::default(), viewer);
//!
//!     let (_shutdown, signal) = tokio::sync::watch::channel(false);
//!     client.run(signal).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod network;
pub mod pool;
pub mod viewer;
pub mod viewport;

pub use cache::{CacheConfig, CacheError, StateCache};
pub use network::{Backoff, ClientConfig, ClientError, ConnectionState, ViewerClient};
pub use pool::{Acquired, BoardPool, FetchTicket, PoolConfig, PoolError, SlotTier};
pub use viewer::Viewer;
pub use viewport::{Tier, Viewport, ViewportConfig, VisibleBoard};
