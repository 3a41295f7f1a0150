use crate::pool::PoolError;
use crate::viewer::Viewer;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Message, ProtocolError, Request, ServerEvent};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Reconnect schedule: exponential, capped and bounded in attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    /// Retries after the first failure; the connection is then given up
    pub max_attempts: u32,
    /// Spread each delay uniformly over its upper half
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (starting at 1), or `None` when
    /// the attempts are used up
    pub fn delay<R: Rng>(&self, attempt: u32, rng: &mut R) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .initial
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return Some(delay);
        }
        let millis = delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let half = millis / 2;
        Some(Duration::from_millis(half + rng.gen_range(0..=millis - half)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    PermanentlyDisconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("gave up after {attempts} connection attempts")]
    PermanentlyDisconnected { attempts: u32 },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port` of the hub
    pub server_url: String,
    /// Period of camera drift and cache housekeeping
    pub tick_interval: Duration,
    /// Camera movement applied on every tick, in boards
    pub pan_per_tick: (f32, f32),
    pub backoff: Backoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080".to_string(),
            tick_interval: Duration::from_millis(250),
            pan_per_tick: (0.0, 0.0),
            backoff: Backoff::default(),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed,
}

pub struct ViewerClient {
    config: ClientConfig,
    viewer: Viewer,
    state: ConnectionState,
    rng: StdRng,
}

impl ViewerClient {
    pub fn new(config: ClientConfig, viewer: Viewer) -> Self {
        Self {
            config,
            viewer,
            state: ConnectionState::Disconnected,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn viewer_mut(&mut self) -> &mut Viewer {
        &mut self.viewer
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Viewer connection {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Connects, runs sessions and reconnects until shut down or out of retries
    ///
    /// Setting the `shutdown` flag (or dropping its sender) ends the loop
    /// cleanly.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let mut attempt = 0u32;

        loop {
            if *shutdown.borrow() {
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }
            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting { attempt }
            });

            match connect_async(self.config.server_url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to {}", self.config.server_url);
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);

                    match self.session(ws, &mut shutdown).await {
                        Ok(SessionEnd::Shutdown) => {
                            self.set_state(ConnectionState::Disconnected);
                            return Ok(());
                        }
                        Ok(SessionEnd::Closed) => warn!("Server closed the connection"),
                        Err(ClientError::Transport(e)) => error!("Connection lost: {}", e),
                        Err(e) => {
                            self.set_state(ConnectionState::Disconnected);
                            return Err(e);
                        }
                    }
                }
                Err(e) => warn!("Failed to connect to {}: {}", self.config.server_url, e),
            }

            attempt += 1;
            let Some(delay) = self.config.backoff.delay(attempt, &mut self.rng) else {
                self.set_state(ConnectionState::PermanentlyDisconnected);
                error!("Giving up on {} after {} attempts", self.config.server_url, attempt);
                return Err(ClientError::PermanentlyDisconnected { attempts: attempt });
            };

            info!("Reconnecting in {:?} (attempt {})", delay, attempt);
            self.set_state(ConnectionState::Reconnecting { attempt });
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn session(
        &mut self,
        ws: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, ClientError> {
        let (mut ws_tx, mut ws_rx) = ws.split();

        for request in self.viewer.resync()? {
            send(&mut ws_tx, &request).await?;
        }

        let period = self.config.tick_interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = ws_tx.send(WsMessage::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }

                frame = ws_rx.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match Message::<ServerEvent>::from_json(text.as_str()) {
                            Ok(message) => {
                                self.viewer.handle_event(message, Instant::now())?;
                            }
                            Err(e) => warn!("Ignoring undecodable event: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },

                _ = ticker.tick() => {
                    let expired = self.viewer.tick(Instant::now());
                    if expired > 0 {
                        debug!("{} activity entries decayed", expired);
                    }

                    let (dx, dy) = self.config.pan_per_tick;
                    if dx != 0.0 || dy != 0.0 {
                        for request in self.viewer.pan(dx, dy)? {
                            send(&mut ws_tx, &request).await?;
                        }
                    }
                }
            }
        }
    }
}

async fn send(ws_tx: &mut WsSink, message: &Message<Request>) -> Result<(), ClientError> {
    let text = message.to_json()?;
    ws_tx.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::pool::PoolConfig;
    use crate::viewport::ViewportConfig;
    use tokio::net::TcpListener;

    fn viewer() -> Viewer {
        Viewer::new(
            ViewportConfig::default(),
            PoolConfig::default(),
            CacheConfig::default(),
            10.0,
            10.0,
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff {
            jitter: false,
            ..Backoff::default()
        };
        let mut rng = StdRng::seed_from_u64(1);

        assert_eq!(backoff.delay(1, &mut rng), Some(Duration::from_millis(500)));
        assert_eq!(backoff.delay(2, &mut rng), Some(Duration::from_secs(1)));
        assert_eq!(backoff.delay(4, &mut rng), Some(Duration::from_secs(4)));
        assert_eq!(backoff.delay(7, &mut rng), Some(Duration::from_secs(30)));
        assert_eq!(backoff.delay(10, &mut rng), Some(Duration::from_secs(30)));
        assert_eq!(backoff.delay(11, &mut rng), None);
        assert_eq!(backoff.delay(0, &mut rng), None);
    }

    #[test]
    fn test_backoff_jitter_stays_in_upper_half() {
        let backoff = Backoff::default();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..=10 {
            let plain = Backoff {
                jitter: false,
                ..backoff
            }
            .delay(attempt, &mut rng)
            .unwrap();
            let jittered = backoff.delay(attempt, &mut rng).unwrap();
            assert!(jittered >= plain / 2);
            assert!(jittered <= plain);
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_becomes_permanent() {
        // Reserve a port, then free it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            server_url: format!("ws://{}", addr),
            backoff: Backoff {
                initial: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 2,
                jitter: false,
            },
            ..ClientConfig::default()
        };
        let mut client = ViewerClient::new(config, viewer());
        let (_tx, rx) = watch::channel(false);

        let result = client.run(rx).await;
        assert!(matches!(
            result,
            Err(ClientError::PermanentlyDisconnected { attempts: 3 })
        ));
        assert_eq!(client.state(), ConnectionState::PermanentlyDisconnected);
    }

    #[tokio::test]
    async fn test_shutdown_before_connecting() {
        let mut client = ViewerClient::new(ClientConfig::default(), viewer());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        tokio_test::assert_ok!(client.run(rx).await);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
