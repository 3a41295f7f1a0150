//! Viewer state: camera, pool and cache driven by camera moves and hub events
//!
//! Nothing here touches the network. Camera changes produce the requests to
//! send, and incoming events are fed back through [`Viewer::handle_event`].
//! Fetches are tracked per coordinate, so a board is requested at most once
//! while a reply is outstanding, and a reply is checked against the newest
//! ticket for its coordinate before it is applied.

use crate::cache::{CacheConfig, StateCache};
use crate::pool::{BoardPool, FetchTicket, PoolConfig, PoolError};
use crate::viewport::{Viewport, ViewportConfig, VisibleBoard};
use log::{debug, info, warn};
use shared::{
    BoardRef, BoardState, Coordinate, GridRect, Message, MoveRequest, Player, Request,
    ServerEvent, SubscribeRequest, ViewportSize, ZoneId,
};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
pub struct Viewer {
    viewport: Viewport,
    pool: BoardPool,
    cache: StateCache,
    visible: Vec<VisibleBoard>,
    /// Request id -> coordinate of an outstanding `FETCH_BOARD`
    pending: HashMap<String, Coordinate>,
    /// Newest ticket per coordinate with a fetch in flight
    in_flight: HashMap<Coordinate, FetchTicket>,
    subscription: Option<(SubscribeRequest, Vec<ZoneId>)>,
    client_id: Option<String>,
}

impl Viewer {
    pub fn new(
        viewport: ViewportConfig,
        pool: PoolConfig,
        cache: CacheConfig,
        x: f32,
        y: f32,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            viewport: Viewport::new(viewport, x, y),
            pool: BoardPool::new(pool)?,
            cache: StateCache::new(cache),
            visible: Vec::new(),
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            subscription: None,
            client_id: None,
        })
    }

    /// Recomputes the visible list and reconciles the pool against it
    ///
    /// Returns subscription changes followed by fetches for boards neither
    /// the pool nor the cache could supply.
    pub fn refresh(&mut self) -> Result<Vec<Message<Request>>, PoolError> {
        self.visible = self.viewport.visible_boards();
        let tickets = self.pool.reconcile(&self.visible, &mut self.cache)?;

        let mut requests = self.subscription_changes();
        for ticket in tickets {
            if self.in_flight.insert(ticket.coord, ticket).is_some() {
                continue;
            }
            let id = Uuid::new_v4().to_string();
            self.pending.insert(id.clone(), ticket.coord);
            requests.push(Message::new(
                id,
                Request::FetchBoard(BoardRef::of(ticket.coord)),
            ));
        }

        debug!(
            "Camera at {}: {} active, {} buffered, {} fetches outstanding",
            self.viewport.cell(),
            self.pool.active_len(),
            self.pool.buffer_len(),
            self.pending.len()
        );
        Ok(requests)
    }

    /// Moves the camera; work happens only when the board under it changes
    pub fn set_camera(&mut self, x: f32, y: f32) -> Result<Vec<Message<Request>>, PoolError> {
        if self.viewport.set_camera(x, y) {
            self.refresh()
        } else {
            Ok(Vec::new())
        }
    }

    pub fn pan(&mut self, dx: f32, dy: f32) -> Result<Vec<Message<Request>>, PoolError> {
        if self.viewport.pan(dx, dy) {
            self.refresh()
        } else {
            Ok(Vec::new())
        }
    }

    /// Forgets everything tied to the previous connection and starts over
    ///
    /// Active boards that were already hydrated may have missed updates
    /// while disconnected, so they are fetched again and updated in place.
    pub fn resync(&mut self) -> Result<Vec<Message<Request>>, PoolError> {
        self.pending.clear();
        self.in_flight.clear();
        self.subscription = None;
        let mut requests = self.refresh()?;

        let stale: Vec<Coordinate> = self
            .pool
            .active_coords()
            .filter(|coord| !self.in_flight.contains_key(coord))
            .collect();
        for coord in stale {
            let id = Uuid::new_v4().to_string();
            self.pending.insert(id.clone(), coord);
            requests.push(Message::new(id, Request::FetchBoard(BoardRef::of(coord))));
        }
        Ok(requests)
    }

    fn subscription_changes(&mut self) -> Vec<Message<Request>> {
        let radius = self.viewport.config().buffer_radius;
        let cell = self.viewport.cell();
        let zones = GridRect::around(cell, u32::from(radius), u32::from(radius)).zones();
        if matches!(&self.subscription, Some((_, current)) if *current == zones) {
            return Vec::new();
        }

        let side = 2 * radius + 1;
        let request = SubscribeRequest {
            center_x: cell.x(),
            center_y: cell.y(),
            viewport: Some(ViewportSize {
                viewport_width: side,
                viewport_height: side,
            }),
        };

        let mut messages = Vec::with_capacity(2);
        if let Some((previous, _)) = self.subscription.take() {
            messages.push(Message::new(
                Uuid::new_v4().to_string(),
                Request::UnsubscribeRegion(previous),
            ));
        }
        messages.push(Message::new(
            Uuid::new_v4().to_string(),
            Request::SubscribeRegion(request),
        ));
        self.subscription = Some((request, zones));
        messages
    }

    /// Applies one hub event; returns whether any pooled board changed
    pub fn handle_event(
        &mut self,
        message: Message<ServerEvent>,
        now: Instant,
    ) -> Result<bool, PoolError> {
        match message.body {
            ServerEvent::BoardState(snapshot) => {
                let Some(coord) = Coordinate::new(snapshot.board_x, snapshot.board_y) else {
                    warn!("Board state for off-grid ({},{})", snapshot.board_x, snapshot.board_y);
                    return Ok(false);
                };
                let ticket = self
                    .pending
                    .remove(&message.id)
                    .and_then(|requested| self.in_flight.remove(&requested));
                match ticket {
                    Some(ticket) if ticket.coord == coord => {
                        self.pool.apply_remote(ticket, snapshot.state, &mut self.cache)
                    }
                    _ => self.pool.apply_update(coord, snapshot.state, &mut self.cache),
                }
            }
            ServerEvent::BoardUpdate(update) => {
                let Some(coord) = Coordinate::new(update.board_x, update.board_y) else {
                    return Ok(false);
                };
                self.cache
                    .record_activity(coord, update.new_state.activity, now);
                self.pool.apply_update(coord, update.new_state, &mut self.cache)
            }
            ServerEvent::RegionData(region) => {
                let mut changed = false;
                for (key, state) in region.boards {
                    match Coordinate::parse_key(&key) {
                        Some(coord) => {
                            changed |= self.pool.apply_update(coord, state, &mut self.cache)?;
                        }
                        None => warn!("Ignoring region entry with key {:?}", key),
                    }
                }
                Ok(changed)
            }
            ServerEvent::MoveResult(result) => {
                if !result.success {
                    let reason = result.error.map(|e| e.message).unwrap_or_default();
                    warn!("Move {} rejected: {}", result.move_id, reason);
                    return Ok(false);
                }
                match (Coordinate::new(result.board_x, result.board_y), result.board_state) {
                    (Some(coord), Some(state)) => {
                        self.pool.apply_update(coord, state, &mut self.cache)
                    }
                    _ => Ok(false),
                }
            }
            ServerEvent::Error(error) => {
                if let Some(coord) = self.pending.remove(&message.id) {
                    self.in_flight.remove(&coord);
                }
                warn!("Hub error {}: {}", error.code, error.message);
                Ok(false)
            }
            ServerEvent::Welcome(welcome) => {
                info!("Connected as {}", welcome.client_id);
                self.client_id = Some(welcome.client_id);
                Ok(false)
            }
            ServerEvent::Pong(_) => Ok(false),
        }
    }

    /// Builds a `SEND_MOVE` for a board
    pub fn move_request(&self, coord: Coordinate, position: u16, player: Player) -> Message<Request> {
        Message::new(
            Uuid::new_v4().to_string(),
            Request::SendMove(MoveRequest {
                board_x: coord.x(),
                board_y: coord.y(),
                position,
                player,
            }),
        )
    }

    /// Periodic housekeeping; returns how many activity entries decayed
    pub fn tick(&mut self, now: Instant) -> usize {
        self.cache.sweep_expired(now)
    }

    pub fn board(&self, coord: Coordinate) -> Option<&BoardState> {
        self.pool.board(coord)
    }

    pub fn activity(&self, coord: Coordinate, now: Instant) -> Option<u8> {
        self.cache.activity(coord, now)
    }

    pub fn visible(&self) -> &[VisibleBoard] {
        &self.visible
    }

    pub fn viewport(&self) -> &Viewport {
        &self.viewport
    }

    pub fn pool(&self) -> &BoardPool {
        &self.pool
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}
