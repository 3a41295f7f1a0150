//! WebSocket listener and per-connection reader/writer pumps
//!
//! Every accepted socket is split into two independent loops:
//! - the reader decodes each frame once and pushes it onto the hub's
//!   bounded inbound queue; a frame that is not a valid envelope, or a full
//!   inbound queue, ends the connection
//! - the writer drains the connection's mailbox, sends a keep-alive ping on
//!   a fixed period and bounds every write with a deadline
//!
//! The read deadline restarts on every frame, pongs included. Whichever
//! loop finishes first reports the connection to the hub; unregistration is
//! idempotent, so both may do so.

use crate::client_manager::ConnectionId;
use crate::hub::{HubHandle, Inbound};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{Envelope, Message, Request, ServerEvent};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Timing and size limits for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for one write to the socket
    pub write_wait: Duration,
    /// Longest silence tolerated from the peer
    pub pong_wait: Duration,
    /// Keep-alive period; must be shorter than `pong_wait`
    pub ping_period: Duration,
    /// Largest accepted inbound frame, in bytes
    pub max_message_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            max_message_size: 512 * 1024,
        }
    }
}

impl ConnectionConfig {
    /// Socket limits that stop an oversized frame while it is being read
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

/// Accepts WebSocket connections and wires them to the hub
pub struct Server {
    listener: TcpListener,
    hub: HubHandle,
    config: ConnectionConfig,
}

impl Server {
    pub async fn bind(
        addr: &str,
        hub: HubHandle,
        config: ConnectionConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            hub,
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; each connection runs in its own task
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!("New TCP connection from {}", addr);

            let hub = self.hub.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, hub, config).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    config: ConnectionConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream =
        tokio_tungstenite::accept_async_with_config(stream, Some(config.websocket_config())).await?;
    let (ws_tx, ws_rx) = ws_stream.split();

    let (id, mailbox) = hub.register(Some(addr)).await?;
    debug!("{}: registered", id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let writer = tokio::spawn(write_pump(
        id,
        ws_tx,
        mailbox,
        hub.unregister_sender(),
        config.clone(),
        shutdown_tx,
    ));

    read_pump(id, ws_rx, hub.inbound_sender(), config, shutdown_rx).await;
    hub.unregister(id).await?;

    writer.await?;
    debug!("{}: closed", id);
    Ok(())
}

/// Reads frames until the peer leaves, misbehaves or goes silent
async fn read_pump(
    id: ConnectionId,
    mut ws_rx: WsSource,
    inbound: mpsc::Sender<Inbound>,
    config: ConnectionConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = timeout(config.pong_wait, ws_rx.next()) => frame,
        };

        let text = match frame {
            Err(_) => {
                warn!("{}: no traffic for {:?}, closing", id, config.pong_wait);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(WsError::Capacity(e)))) => {
                warn!("{}: {}, closing", id, e);
                break;
            }
            Ok(Some(Err(e))) => {
                error!("{}: read failed: {}", id, e);
                break;
            }
            Ok(Some(Ok(WsMessage::Text(text)))) => text,
            Ok(Some(Ok(WsMessage::Close(_)))) => break,
            Ok(Some(Ok(WsMessage::Binary(_)))) => {
                warn!("{}: binary frames are not supported, closing", id);
                break;
            }
            // Pings and pongs only refresh the deadline
            Ok(Some(Ok(_))) => continue,
        };

        let envelope = match Envelope::from_json(text.as_str()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("{}: {}, closing", id, e);
                break;
            }
        };

        let request_id = envelope.id.clone();
        let request = Message::<Request>::from_envelope(envelope).map(|message| message.body);
        match inbound.try_send(Inbound {
            conn: id,
            id: request_id,
            request,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("{}: inbound queue full, closing", id);
                break;
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
}

/// Drains the mailbox into the socket and keeps the connection alive
async fn write_pump(
    id: ConnectionId,
    mut ws_tx: WsSink,
    mut mailbox: mpsc::Receiver<Message<ServerEvent>>,
    unregister: mpsc::Sender<ConnectionId>,
    config: ConnectionConfig,
    shutdown: watch::Sender<bool>,
) {
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        tokio::select! {
            message = mailbox.recv() => match message {
                Some(message) => {
                    let text = match message.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!("{}: dropping unencodable {}: {}", id, message.message_type(), e);
                            continue;
                        }
                    };
                    if let Err(e) = write(&mut ws_tx, WsMessage::Text(text.into()), &config).await {
                        warn!("{}: write failed: {}", id, e);
                        break;
                    }
                }
                None => {
                    // Hub dropped the mailbox: say goodbye and stop
                    let _ = write(&mut ws_tx, WsMessage::Close(None), &config).await;
                    break;
                }
            },
            _ = ping.tick() => {
                if let Err(e) = write(&mut ws_tx, WsMessage::Ping(Vec::new().into()), &config).await {
                    warn!("{}: keep-alive failed: {}", id, e);
                    break;
                }
            }
        }
    }

    let _ = shutdown.send(true);
    let _ = unregister.send(id).await;
}

async fn write(ws_tx: &mut WsSink, message: WsMessage, config: &ConnectionConfig) -> Result<(), String> {
    match timeout(config.write_wait, ws_tx.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("no progress within {:?}", config.write_wait)),
    }
}
