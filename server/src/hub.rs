//! The hub: a single serialized loop that routes every request
//!
//! The loop owns the connection registry and the zone index outright and
//! processes exactly one event at a time from its sources:
//! - register: a new connection and its mailbox
//! - unregister: a pump reports its connection finished (idempotent)
//! - inbound: one decoded request from a reader pump
//! - outbound: externally originated deliveries and state updates
//!
//! Replies are pushed into mailboxes with `try_send`. A connection whose
//! mailbox is full is queued for forced unregistration, which runs once the
//! current event is done, so one slow reader never stalls anyone else.

use crate::client_manager::{ClientConnection, ClientManager, ConnectionId, DeliveryError};
use crate::store::{BoardStore, StoreError};
use crate::zones::ZoneIndex;
use log::{debug, info, warn};
use shared::{
    error_codes, BoardRef, BoardSnapshot, BoardUpdate, Coordinate, ErrorData, GridRect, Message,
    MoveRequest, MoveResult, PongData, ProtocolError, RegionData, RegionRequest, Request,
    ServerEvent, SubscribeRequest, WelcomeData, ZONE_SIZE,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Side length used to decode move positions on new boards
    pub board_size: u8,
    /// Largest clipped area a single `FETCH_REGION` may cover
    pub max_region_area: u64,
    pub mailbox_capacity: usize,
    pub inbound_capacity: usize,
    /// Capacity of the register, unregister and outbound queues
    pub control_capacity: usize,
    pub max_clients: usize,
    pub stats_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            board_size: shared::DEFAULT_BOARD_SIZE,
            max_region_area: 2500,
            mailbox_capacity: 256,
            inbound_capacity: 1000,
            control_capacity: 100,
            max_clients: 10_000,
            stats_interval: Duration::from_secs(30),
        }
    }
}

/// Counters kept by the hub loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connected_clients: usize,
    pub active_boards: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub active_subscriptions: usize,
    /// Unix milliseconds when the hub was built
    pub started_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("hub is no longer running")]
    Closed,
}

/// A new connection handing its mailbox to the hub
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub addr: Option<SocketAddr>,
    pub mailbox: mpsc::Sender<Message<ServerEvent>>,
}

/// One request read off a connection
///
/// `request` already carries the decode outcome, so payload problems reach
/// the hub and are answered with an `ERROR` instead of closing the socket.
#[derive(Debug)]
pub struct Inbound {
    pub conn: ConnectionId,
    pub id: String,
    pub request: Result<Request, ProtocolError>,
}

/// Work that does not originate from a connection's request
#[derive(Debug)]
pub enum Outbound {
    /// Send to the listed connections, or to everyone when the list is empty
    Deliver {
        recipients: Vec<ConnectionId>,
        message: Message<ServerEvent>,
    },
    /// A move from an external source, applied and fanned out like any other
    Ingest(MoveRequest),
}

enum Query {
    Stats(oneshot::Sender<HubStats>),
}

/// Cloneable entry point into a running hub
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    inbound_tx: mpsc::Sender<Inbound>,
    outbound_tx: mpsc::Sender<Outbound>,
    query_tx: mpsc::Sender<Query>,
    next_id: Arc<AtomicU64>,
    mailbox_capacity: usize,
}

impl HubHandle {
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a new connection and returns its id and mailbox receiver
    pub async fn register(
        &self,
        addr: Option<SocketAddr>,
    ) -> Result<(ConnectionId, mpsc::Receiver<Message<ServerEvent>>), HubError> {
        let id = self.next_connection_id();
        let (mailbox, mailbox_rx) = mpsc::channel(self.mailbox_capacity);
        self.register_tx
            .send(Registration { id, addr, mailbox })
            .await
            .map_err(|_| HubError::Closed)?;
        Ok((id, mailbox_rx))
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.unregister_tx
            .send(id)
            .await
            .map_err(|_| HubError::Closed)
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<Inbound> {
        self.inbound_tx.clone()
    }

    pub fn unregister_sender(&self) -> mpsc::Sender<ConnectionId> {
        self.unregister_tx.clone()
    }

    /// Queues a request as if `conn` had sent it
    pub async fn submit(&self, conn: ConnectionId, id: impl Into<String>, request: Request) -> Result<(), HubError> {
        self.inbound_tx
            .send(Inbound {
                conn,
                id: id.into(),
                request: Ok(request),
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn deliver(
        &self,
        recipients: Vec<ConnectionId>,
        message: Message<ServerEvent>,
    ) -> Result<(), HubError> {
        self.outbound_tx
            .send(Outbound::Deliver {
                recipients,
                message,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn ingest_move(&self, request: MoveRequest) -> Result<(), HubError> {
        self.outbound_tx
            .send(Outbound::Ingest(request))
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.query_tx
            .send(Query::Stats(tx))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

pub struct Hub {
    config: HubConfig,
    store: Arc<BoardStore>,
    clients: ClientManager,
    zones: ZoneIndex,
    stats: HubStats,
    /// Connections whose mailbox overflowed while handling the current event
    doomed: Vec<ConnectionId>,

    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ConnectionId>,
    inbound_rx: mpsc::Receiver<Inbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    query_rx: mpsc::Receiver<Query>,
}

impl Hub {
    pub fn new(config: HubConfig, store: Arc<BoardStore>) -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(config.control_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.control_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.control_capacity);
        let (query_tx, query_rx) = mpsc::channel(config.control_capacity);

        let handle = HubHandle {
            register_tx,
            unregister_tx,
            inbound_tx,
            outbound_tx,
            query_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            mailbox_capacity: config.mailbox_capacity,
        };

        let hub = Self {
            clients: ClientManager::new(config.max_clients),
            zones: ZoneIndex::new(),
            stats: HubStats {
                started_at: shared::now_millis(),
                ..HubStats::default()
            },
            doomed: Vec::new(),
            config,
            store,
            register_rx,
            unregister_rx,
            inbound_rx,
            outbound_rx,
            query_rx,
        };

        (hub, handle)
    }

    pub fn store(&self) -> &Arc<BoardStore> {
        &self.store
    }

    /// Runs until every `HubHandle` has been dropped
    pub async fn run(mut self) {
        let mut stats_timer = interval(self.config.stats_interval);
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first tick since it fires immediately
        stats_timer.tick().await;

        info!(
            "Hub started (board size {}, region cap {}, mailbox {})",
            self.config.board_size, self.config.max_region_area, self.config.mailbox_capacity
        );

        loop {
            tokio::select! {
                // Registrations first, so a reader's first request never
                // overtakes the registration of its own connection
                biased;

                registration = self.register_rx.recv() => match registration {
                    Some(registration) => self.handle_register(registration),
                    None => {
                        info!("Hub shutting down");
                        break;
                    }
                },
                Some(id) = self.unregister_rx.recv() => {
                    self.handle_unregister(id);
                },
                Some(inbound) = self.inbound_rx.recv() => {
                    self.handle_inbound(inbound);
                },
                Some(outbound) = self.outbound_rx.recv() => {
                    self.handle_outbound(outbound);
                },
                Some(query) = self.query_rx.recv() => match query {
                    Query::Stats(reply) => {
                        let _ = reply.send(self.snapshot_stats());
                    }
                },
                _ = stats_timer.tick() => {
                    let stats = self.snapshot_stats();
                    debug!(
                        "Hub: {} clients, {} boards, {} received, {} sent, {} subscriptions",
                        stats.connected_clients,
                        stats.active_boards,
                        stats.messages_received,
                        stats.messages_sent,
                        stats.active_subscriptions
                    );
                },
            }

            self.reap();
        }
    }

    fn snapshot_stats(&self) -> HubStats {
        HubStats {
            connected_clients: self.clients.len(),
            active_boards: self.store.len(),
            active_subscriptions: self.zones.subscription_count(),
            ..self.stats.clone()
        }
    }

    fn handle_register(&mut self, registration: Registration) {
        let client = ClientConnection::new(registration.id, registration.addr, registration.mailbox);

        if let Err(rejected) = self.clients.add_client(client) {
            warn!("Refusing {}: registry full", rejected.id);
            let error = ErrorData::new(error_codes::INTERNAL_ERROR, "server full");
            let _ = rejected.deliver(Message::new(new_id(), ServerEvent::Error(error)));
            return;
        }

        let welcome = WelcomeData {
            client_id: registration.id.to_string(),
            message: "Connected to the board hub".to_string(),
        };
        self.send_to(registration.id, Message::new(new_id(), ServerEvent::Welcome(welcome)));
    }

    fn handle_unregister(&mut self, id: ConnectionId) {
        if let Some(client) = self.clients.remove_client(&id) {
            self.zones.remove_connection(id, &client.zones);
        }
    }

    /// Drops every connection that overflowed during the last event
    fn reap(&mut self) {
        for id in std::mem::take(&mut self.doomed) {
            if self.clients.contains(&id) {
                warn!("Dropping {}: mailbox full or closed", id);
                self.handle_unregister(id);
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { conn, id, request } = inbound;

        if !self.clients.contains(&conn) {
            debug!("Ignoring request {} from unregistered {}", id, conn);
            return;
        }
        self.stats.messages_received += 1;

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                warn!("{} sent a bad request: {}", conn, e);
                self.reply(conn, &id, ServerEvent::Error(ErrorData::from(&e)));
                return;
            }
        };

        debug!("{} -> {:?}", conn, request);
        let outcome = match request {
            Request::FetchBoard(board) => self.fetch_board(conn, &id, board),
            Request::FetchRegion(region) => self.fetch_region(conn, &id, region),
            Request::SendMove(request) => self.send_move(conn, &id, request),
            Request::SubscribeRegion(subscribe) => self.subscribe(conn, subscribe),
            Request::UnsubscribeRegion(subscribe) => self.unsubscribe(conn, subscribe),
            Request::Ping => {
                let pong = PongData {
                    timestamp: shared::now_millis(),
                };
                self.reply(conn, &id, ServerEvent::Pong(pong));
                Ok(())
            }
        };

        if let Err(e) = outcome {
            self.reply(conn, &id, ServerEvent::Error(ErrorData::from(&e)));
        }
    }

    fn handle_outbound(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::Deliver {
                recipients,
                message,
            } => self.deliver(&recipients, message),
            Outbound::Ingest(request) => {
                let coord = match request.coordinate() {
                    Ok(coord) => coord,
                    Err(e) => {
                        warn!("Discarding external move: {}", e);
                        return;
                    }
                };
                match self.store.apply_move(coord, request.position, request.player) {
                    Ok(applied) => self.publish_update(coord, None, applied.last_move, applied.state),
                    Err(e) => warn!("External move on {} failed: {}", coord, e),
                }
            }
        }
    }

    fn fetch_board(&mut self, conn: ConnectionId, id: &str, board: BoardRef) -> Result<(), ProtocolError> {
        let coord = board.coordinate()?;
        let state = self.store.snapshot(coord);
        let snapshot = BoardSnapshot {
            board_x: coord.x(),
            board_y: coord.y(),
            state,
        };
        self.reply(conn, id, ServerEvent::BoardState(snapshot));
        Ok(())
    }

    fn fetch_region(&mut self, conn: ConnectionId, id: &str, region: RegionRequest) -> Result<(), ProtocolError> {
        let rect = region.rect().clipped();
        if rect.area() > self.config.max_region_area {
            return Err(ProtocolError::InvalidPayload {
                kind: shared::MessageType::FetchRegion,
                reason: format!(
                    "region area {} exceeds the limit of {}",
                    rect.area(),
                    self.config.max_region_area
                ),
            });
        }

        let boards: BTreeMap<String, _> = rect
            .coordinates()
            .map(|coord| (coord.key(), self.store.snapshot(coord)))
            .collect();
        debug!("{} fetched {} boards from {:?}", conn, boards.len(), rect);

        let data = RegionData {
            start_x: rect.x as u16,
            start_y: rect.y as u16,
            width: rect.width as u16,
            height: rect.height as u16,
            boards,
        };
        self.reply(conn, id, ServerEvent::RegionData(data));
        Ok(())
    }

    fn send_move(&mut self, conn: ConnectionId, id: &str, request: MoveRequest) -> Result<(), ProtocolError> {
        let coord = request.coordinate()?;

        match self.store.apply_move(coord, request.position, request.player) {
            Ok(applied) => {
                let result = MoveResult {
                    success: true,
                    move_id: new_id(),
                    board_x: coord.x(),
                    board_y: coord.y(),
                    board_state: Some(applied.state.clone()),
                    error: None,
                };
                self.reply(conn, id, ServerEvent::MoveResult(result));
                self.publish_update(coord, Some(conn), applied.last_move, applied.state);
                Ok(())
            }
            Err(StoreError::Rejected(reason)) => {
                let result = MoveResult {
                    success: false,
                    move_id: new_id(),
                    board_x: coord.x(),
                    board_y: coord.y(),
                    board_state: None,
                    error: Some(ErrorData::new(error_codes::MOVE_REJECTED, reason)),
                };
                self.reply(conn, id, ServerEvent::MoveResult(result));
                Ok(())
            }
            Err(e @ StoreError::PositionOutOfRange { .. }) => Err(ProtocolError::InvalidPayload {
                kind: shared::MessageType::SendMove,
                reason: e.to_string(),
            }),
        }
    }

    fn subscribe(&mut self, conn: ConnectionId, request: SubscribeRequest) -> Result<(), ProtocolError> {
        let center = request.center()?;
        let zones = subscription_rect(center, &request).zones();

        if let Some(client) = self.clients.get_mut(&conn) {
            client.camera = Some(center);
            for zone in zones {
                if client.zones.insert(zone) {
                    self.zones.subscribe(zone, conn);
                }
            }
            debug!("{} now watches {} zones around {}", conn, client.zones.len(), center);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, conn: ConnectionId, request: SubscribeRequest) -> Result<(), ProtocolError> {
        let center = request.center()?;
        let zones = subscription_rect(center, &request).zones();

        if let Some(client) = self.clients.get_mut(&conn) {
            for zone in zones {
                if client.zones.remove(&zone) {
                    self.zones.unsubscribe(zone, conn);
                }
            }
            debug!("{} now watches {} zones", conn, client.zones.len());
        }
        Ok(())
    }

    /// Sends `BOARD_UPDATE` to the zone's subscribers, skipping `except`
    fn publish_update(
        &mut self,
        coord: Coordinate,
        except: Option<ConnectionId>,
        last_move: shared::Move,
        state: shared::BoardState,
    ) {
        let recipients: Vec<ConnectionId> = self
            .zones
            .subscribers(coord.zone())
            .into_iter()
            .filter(|id| Some(*id) != except)
            .collect();
        if recipients.is_empty() {
            return;
        }

        let update = BoardUpdate {
            board_x: coord.x(),
            board_y: coord.y(),
            last_move,
            new_state: state,
        };
        self.deliver(&recipients, Message::new(new_id(), ServerEvent::BoardUpdate(update)));
    }

    fn reply(&mut self, conn: ConnectionId, request_id: &str, event: ServerEvent) {
        let id = if request_id.is_empty() {
            new_id()
        } else {
            request_id.to_string()
        };
        self.send_to(conn, Message::new(id, event));
    }

    fn send_to(&mut self, conn: ConnectionId, message: Message<ServerEvent>) {
        self.deliver(&[conn], message);
    }

    /// Unicast to `recipients`, or broadcast when the list is empty
    fn deliver(&mut self, recipients: &[ConnectionId], message: Message<ServerEvent>) {
        let targets = if recipients.is_empty() {
            self.clients.ids()
        } else {
            recipients.to_vec()
        };

        for id in targets {
            let Some(client) = self.clients.get(&id) else {
                continue;
            };
            match client.deliver(message.clone()) {
                Ok(()) => self.stats.messages_sent += 1,
                Err(DeliveryError::Full) => {
                    warn!("{} mailbox full, scheduling disconnect", id);
                    self.doomed.push(id);
                }
                Err(DeliveryError::Closed) => self.doomed.push(id),
            }
        }
    }
}

/// The rectangle a subscription covers: the viewport, or one zone's extent
fn subscription_rect(center: Coordinate, request: &SubscribeRequest) -> GridRect {
    match request.viewport {
        Some(viewport) => GridRect::around(
            center,
            u32::from(viewport.viewport_width / 2),
            u32::from(viewport.viewport_height / 2),
        ),
        None => {
            let half = u32::from(ZONE_SIZE / 2);
            GridRect::around(center, half, half)
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{GamePhase, Player, ViewportSize};
    use tokio::time::timeout;

    type Mailbox = mpsc::Receiver<Message<ServerEvent>>;

    fn start(config: HubConfig) -> HubHandle {
        let store = Arc::new(BoardStore::new(config.board_size));
        let (hub, handle) = Hub::new(config, store);
        tokio::spawn(hub.run());
        handle
    }

    async fn next(mailbox: &mut Mailbox) -> Message<ServerEvent> {
        timeout(Duration::from_secs(1), mailbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("mailbox closed")
    }

    async fn connect(handle: &HubHandle) -> (ConnectionId, Mailbox) {
        let (id, mut mailbox) = handle.register(None).await.unwrap();
        let welcome = next(&mut mailbox).await;
        assert!(matches!(welcome.body, ServerEvent::Welcome(_)));
        (id, mailbox)
    }

    fn at(x: u16, y: u16) -> BoardRef {
        BoardRef {
            board_x: x,
            board_y: y,
        }
    }

    #[tokio::test]
    async fn test_welcome_carries_client_id() {
        let handle = start(HubConfig::default());
        let (id, mut mailbox) = handle.register(None).await.unwrap();

        match next(&mut mailbox).await.body {
            ServerEvent::Welcome(welcome) => assert_eq!(welcome.client_id, id.to_string()),
            other => panic!("expected WELCOME, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_board_fresh_state() {
        let handle = start(HubConfig::default());
        let (conn, mut mailbox) = connect(&handle).await;

        handle.submit(conn, "req-1", Request::FetchBoard(at(500, 500))).await.unwrap();

        let reply = next(&mut mailbox).await;
        assert_eq!(reply.id, "req-1");
        match reply.body {
            ServerEvent::BoardState(snapshot) => {
                assert_eq!((snapshot.board_x, snapshot.board_y), (500, 500));
                assert_eq!(snapshot.state.move_count, 0);
                assert_eq!(snapshot.state.current_player, Player::Black);
                assert_eq!(snapshot.state.game_phase, GamePhase::Playing);
            }
            other => panic!("expected BOARD_STATE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_off_grid_fetch_is_invalid_request() {
        let handle = start(HubConfig::default());
        let (conn, mut mailbox) = connect(&handle).await;

        handle.submit(conn, "bad", Request::FetchBoard(at(1000, 0))).await.unwrap();

        let reply = next(&mut mailbox).await;
        assert_eq!(reply.id, "bad");
        match reply.body {
            ServerEvent::Error(error) => assert_eq!(error.code, error_codes::INVALID_REQUEST),
            other => panic!("expected ERROR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decode_failure_is_answered_and_connection_stays() {
        let handle = start(HubConfig::default());
        let (conn, mut mailbox) = connect(&handle).await;

        handle
            .inbound_sender()
            .send(Inbound {
                conn,
                id: "x".into(),
                request: Err(ProtocolError::UnknownType("TELEPORT".into())),
            })
            .await
            .unwrap();
        match next(&mut mailbox).await.body {
            ServerEvent::Error(error) => assert_eq!(error.code, error_codes::UNKNOWN_MESSAGE_TYPE),
            other => panic!("expected ERROR, got {:?}", other),
        }

        handle.submit(conn, "p", Request::Ping).await.unwrap();
        assert!(matches!(next(&mut mailbox).await.body, ServerEvent::Pong(_)));
    }

    #[tokio::test]
    async fn test_moves_alternate_and_echo_request_id() {
        let handle = start(HubConfig::default());
        let (conn, mut mailbox) = connect(&handle).await;

        let mut players = Vec::new();
        for (n, position) in [(1u16, 0u16), (2, 1)] {
            let request = MoveRequest {
                board_x: 500,
                board_y: 500,
                position,
                player: if n == 1 { Player::Black } else { Player::White },
            };
            let id = format!("move-{}", n);
            handle.submit(conn, id.clone(), Request::SendMove(request)).await.unwrap();

            let reply = next(&mut mailbox).await;
            assert_eq!(reply.id, id);
            match reply.body {
                ServerEvent::MoveResult(result) => {
                    assert!(result.success);
                    let state = result.board_state.unwrap();
                    assert_eq!(state.move_count, n);
                    players.push(state.current_player);
                }
                other => panic!("expected MOVE_RESULT, got {:?}", other),
            }
        }

        assert_eq!(players, vec![Player::White, Player::Black]);
    }

    #[tokio::test]
    async fn test_out_of_range_position_is_invalid_request() {
        let handle = start(HubConfig::default());
        let (conn, mut mailbox) = connect(&handle).await;

        let request = MoveRequest {
            board_x: 1,
            board_y: 1,
            position: 361,
            player: Player::Black,
        };
        handle.submit(conn, "m", Request::SendMove(request)).await.unwrap();

        match next(&mut mailbox).await.body {
            ServerEvent::Error(error) => assert_eq!(error.code, error_codes::INVALID_REQUEST),
            other => panic!("expected ERROR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_region_keys_and_cap() {
        let config = HubConfig {
            max_region_area: 25,
            ..HubConfig::default()
        };
        let handle = start(config);
        let (conn, mut mailbox) = connect(&handle).await;

        let region = RegionRequest {
            start_x: 0,
            start_y: 0,
            width: 5,
            height: 5,
        };
        handle.submit(conn, "r", Request::FetchRegion(region)).await.unwrap();
        match next(&mut mailbox).await.body {
            ServerEvent::RegionData(data) => {
                assert_eq!(data.boards.len(), 25);
                assert!(data.boards.contains_key("0,0"));
                assert!(data.boards.contains_key("4,4"));
            }
            other => panic!("expected REGION_DATA, got {:?}", other),
        }

        let too_big = RegionRequest {
            start_x: 0,
            start_y: 0,
            width: 6,
            height: 5,
        };
        handle.submit(conn, "r2", Request::FetchRegion(too_big)).await.unwrap();
        match next(&mut mailbox).await.body {
            ServerEvent::Error(error) => assert_eq!(error.code, error_codes::INVALID_REQUEST),
            other => panic!("expected ERROR, got {:?}", other),
        }

        // Clipping happens before the cap is checked
        let edge = RegionRequest {
            start_x: 998,
            start_y: 998,
            width: 100,
            height: 100,
        };
        handle.submit(conn, "r3", Request::FetchRegion(edge)).await.unwrap();
        match next(&mut mailbox).await.body {
            ServerEvent::RegionData(data) => {
                assert_eq!((data.width, data.height), (2, 2));
                assert_eq!(data.boards.len(), 4);
            }
            other => panic!("expected REGION_DATA, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_board_update_reaches_zone_subscribers_only() {
        let handle = start(HubConfig::default());
        let (mover, mut mover_box) = connect(&handle).await;
        let (watcher, mut watcher_box) = connect(&handle).await;
        let (elsewhere, mut elsewhere_box) = connect(&handle).await;

        let near = SubscribeRequest {
            center_x: 10,
            center_y: 10,
            viewport: Some(ViewportSize {
                viewport_width: 4,
                viewport_height: 4,
            }),
        };
        let far = SubscribeRequest {
            center_x: 900,
            center_y: 900,
            viewport: None,
        };
        handle.submit(watcher, "s1", Request::SubscribeRegion(near)).await.unwrap();
        handle.submit(mover, "s2", Request::SubscribeRegion(near)).await.unwrap();
        handle.submit(elsewhere, "s3", Request::SubscribeRegion(far)).await.unwrap();

        let request = MoveRequest {
            board_x: 12,
            board_y: 11,
            position: 5,
            player: Player::Black,
        };
        handle.submit(mover, "m", Request::SendMove(request)).await.unwrap();

        assert!(matches!(next(&mut mover_box).await.body, ServerEvent::MoveResult(_)));
        match next(&mut watcher_box).await.body {
            ServerEvent::BoardUpdate(update) => {
                assert_eq!((update.board_x, update.board_y), (12, 11));
                assert_eq!(update.new_state.move_count, 1);
                assert_eq!(update.last_move.position, 5);
            }
            other => panic!("expected BOARD_UPDATE, got {:?}", other),
        }

        // Neither the mover nor the far subscriber gets the update
        handle.submit(mover, "p", Request::Ping).await.unwrap();
        assert!(matches!(next(&mut mover_box).await.body, ServerEvent::Pong(_)));
        handle.submit(elsewhere, "p", Request::Ping).await.unwrap();
        assert!(matches!(next(&mut elsewhere_box).await.body, ServerEvent::Pong(_)));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connected_clients, 3);
        // One zone each for the two near subscribers, four around (900,900)
        assert_eq!(stats.active_subscriptions, 6);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_updates() {
        let handle = start(HubConfig::default());
        let (mover, mut mover_box) = connect(&handle).await;
        let (watcher, mut watcher_box) = connect(&handle).await;

        let region = SubscribeRequest {
            center_x: 100,
            center_y: 100,
            viewport: None,
        };
        handle.submit(watcher, "s", Request::SubscribeRegion(region)).await.unwrap();
        handle.submit(watcher, "u", Request::UnsubscribeRegion(region)).await.unwrap();

        let request = MoveRequest {
            board_x: 100,
            board_y: 100,
            position: 0,
            player: Player::Black,
        };
        handle.submit(mover, "m", Request::SendMove(request)).await.unwrap();
        assert!(matches!(next(&mut mover_box).await.body, ServerEvent::MoveResult(_)));

        handle.submit(watcher, "p", Request::Ping).await.unwrap();
        assert!(matches!(next(&mut watcher_box).await.body, ServerEvent::Pong(_)));
        assert_eq!(handle.stats().await.unwrap().active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_disconnects_only_that_client() {
        let config = HubConfig {
            mailbox_capacity: 2,
            ..HubConfig::default()
        };
        let handle = start(config);

        // Never drained: WELCOME plus one reply fills it
        let (slow, mut slow_box) = handle.register(None).await.unwrap();
        let (fast, mut fast_box) = connect(&handle).await;

        for n in 0..3 {
            handle.submit(slow, format!("s{}", n), Request::Ping).await.unwrap();
            handle.submit(fast, format!("f{}", n), Request::Ping).await.unwrap();
            assert!(matches!(next(&mut fast_box).await.body, ServerEvent::Pong(_)));
        }

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connected_clients, 1);

        // The slow mailbox keeps what fit, then reports closed
        assert!(matches!(next(&mut slow_box).await.body, ServerEvent::Welcome(_)));
        assert!(matches!(next(&mut slow_box).await.body, ServerEvent::Pong(_)));
        assert!(slow_box.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let handle = start(HubConfig::default());
        let (conn, _mailbox) = connect(&handle).await;

        handle.unregister(conn).await.unwrap();
        handle.unregister(conn).await.unwrap();
        handle.unregister(ConnectionId(999)).await.unwrap();

        assert_eq!(handle.stats().await.unwrap().connected_clients, 0);
    }

    #[tokio::test]
    async fn test_request_after_unregister_is_ignored() {
        let handle = start(HubConfig::default());
        let (conn, _mailbox) = connect(&handle).await;

        handle.unregister(conn).await.unwrap();
        handle.submit(conn, "late", Request::Ping).await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.connected_clients, 0);
        assert_eq!(stats.messages_received, 0);
    }

    #[tokio::test]
    async fn test_broadcast_with_empty_recipients() {
        let handle = start(HubConfig::default());
        let (_a, mut a_box) = connect(&handle).await;
        let (b, mut b_box) = connect(&handle).await;

        let pong = Message::new("b", ServerEvent::Pong(PongData { timestamp: 9 }));
        handle.deliver(Vec::new(), pong).await.unwrap();
        assert_eq!(next(&mut a_box).await.id, "b");
        assert_eq!(next(&mut b_box).await.id, "b");

        let unicast = Message::new("u", ServerEvent::Pong(PongData { timestamp: 10 }));
        handle.deliver(vec![b], unicast).await.unwrap();
        assert_eq!(next(&mut b_box).await.id, "u");
    }

    #[tokio::test]
    async fn test_ingested_move_is_fanned_out() {
        let handle = start(HubConfig::default());
        let (watcher, mut watcher_box) = connect(&handle).await;

        let region = SubscribeRequest {
            center_x: 300,
            center_y: 300,
            viewport: None,
        };
        handle.submit(watcher, "s", Request::SubscribeRegion(region)).await.unwrap();

        handle
            .ingest_move(MoveRequest {
                board_x: 301,
                board_y: 299,
                position: 42,
                player: Player::Black,
            })
            .await
            .unwrap();

        match next(&mut watcher_box).await.body {
            ServerEvent::BoardUpdate(update) => assert_eq!((update.board_x, update.board_y), (301, 299)),
            other => panic!("expected BOARD_UPDATE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_registry_capacity_refuses_extra_clients() {
        let config = HubConfig {
            max_clients: 1,
            ..HubConfig::default()
        };
        let handle = start(config);
        let (_first, _first_box) = connect(&handle).await;

        let (_second, mut second_box) = handle.register(None).await.unwrap();
        match next(&mut second_box).await.body {
            ServerEvent::Error(error) => assert_eq!(error.code, error_codes::INTERNAL_ERROR),
            other => panic!("expected ERROR, got {:?}", other),
        }
        assert!(second_box.recv().await.is_none());
    }
}
