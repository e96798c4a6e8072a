//! Single relay WebSocket connection.
//!
//! A [`RelayConnection`] owns one socket to one relay. A background
//! supervisor task drives the whole lifecycle: dial, read until the peer
//! goes away, then reconnect with exponential backoff. Everything the
//! relay says is parsed into a [`RelayMessage`] and forwarded on an
//! unbounded channel; the session layer decides what the messages mean.

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr_proto::{ClientMessage, RelayMessage, normalize_relay_url};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What the connection reports upward to its session.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Socket established. Fires on every connect, including reconnects,
    /// so the session can replay its open REQs and reset auth state.
    Connected,
    /// Socket lost. A reconnect attempt follows unless shut down.
    Disconnected,
    /// A well-formed relay message.
    Message(RelayMessage),
}

/// Doubling delay between reconnect attempts, capped.
struct Backoff {
    next: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            next: INITIAL_RECONNECT_DELAY,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_RECONNECT_DELAY);
        delay
    }

    fn reset(&mut self) {
        self.next = INITIAL_RECONNECT_DELAY;
    }
}

/// One relay, one socket, one supervisor task.
pub struct RelayConnection {
    url: String,
    connect_timeout: Duration,
    state: Arc<watch::Sender<ConnectionState>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: Arc<AtomicBool>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelayConnection {
    /// Create a connection for a relay URL (does not dial yet).
    ///
    /// Returns the connection and the receiving end of its event channel.
    pub fn new(
        url: &str,
        config: &PoolConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let url = normalize_relay_url(url).map_err(|e| PoolError::InvalidUrl(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let connection = Self {
            url,
            connect_timeout: config.connection_timeout,
            state: Arc::new(state),
            sink: Arc::new(Mutex::new(None)),
            events: tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            supervisor: Mutex::new(None),
        };
        Ok((connection, rx))
    }

    /// Relay URL in normalized form.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    /// Wait up to `wait` for the connection to come up. Returns whether it
    /// is connected when the wait ends.
    pub async fn wait_until_connected(&self, wait: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let deadline = Instant::now() + wait;
        loop {
            if *rx.borrow_and_update() == ConnectionState::Connected {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return false,
            }
        }
    }

    /// Start the supervisor task. Idempotent while running; callable again
    /// after `disconnect()` to bring the connection back.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let url = self.url.clone();
        let connect_timeout = self.connect_timeout;
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let events = self.events.clone();
        let shutdown = Arc::clone(&self.shutdown);

        *supervisor = Some(tokio::spawn(async move {
            let mut backoff = Backoff::new();

            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let _ = state.send(ConnectionState::Connecting);
                match dial(&url, connect_timeout).await {
                    Ok(stream) => {
                        info!("connected to relay: {}", url);
                        backoff.reset();

                        let (write, read) = stream.split();
                        *sink.lock().await = Some(write);
                        let _ = state.send(ConnectionState::Connected);

                        if events.send(ConnectionEvent::Connected).is_err() {
                            break;
                        }

                        read_until_closed(&url, read, &sink, &events).await;

                        *sink.lock().await = None;
                        if events.send(ConnectionEvent::Disconnected).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("failed to connect to {}: {}", url, e);
                    }
                }

                if shutdown.load(Ordering::SeqCst) {
                    break;
                }

                let _ = state.send(ConnectionState::Reconnecting);
                let delay = backoff.next_delay();
                debug!("reconnecting to {} in {:?}", url, delay);
                tokio::time::sleep(delay).await;
            }

            let _ = state.send(ConnectionState::Disconnected);
        }));
    }

    /// Send a client message to the relay.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        let text = message
            .to_json()
            .map_err(|e| PoolError::Protocol(e.to_string()))?;
        debug!("sending to {}: {}", self.url, text);

        let mut sink = self.sink.lock().await;
        match sink.as_mut() {
            Some(write) => write
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| PoolError::WebSocket(e.to_string())),
            None => Err(PoolError::NotConnected),
        }
    }

    /// Tear the connection down for good. No further reconnect attempts.
    pub async fn disconnect(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }

        let mut sink = self.sink.lock().await;
        if let Some(mut write) = sink.take() {
            let _ = write.close().await;
        }

        let _ = self.state.send(ConnectionState::Disconnected);
        info!("disconnected from relay: {}", self.url);
        Ok(())
    }
}

async fn dial(url: &str, connect_timeout: Duration) -> Result<WsStream> {
    match timeout(connect_timeout, connect_async(url)).await {
        Ok(Ok((stream, _))) => Ok(stream),
        Ok(Err(e)) => Err(PoolError::WebSocket(e.to_string())),
        Err(_) => Err(PoolError::Timeout(format!(
            "connection timeout after {:?}",
            connect_timeout
        ))),
    }
}

/// Pump the read half until the socket dies or the session goes away.
async fn read_until_closed(
    url: &str,
    mut read: SplitStream<WsStream>,
    sink: &Arc<Mutex<Option<WsSink>>>,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                debug!("received from {}: {}", url, text);
                match RelayMessage::from_json(&text) {
                    Ok(message) => {
                        if events.send(ConnectionEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("ignoring malformed message from {}: {}", url, e);
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let mut sink = sink.lock().await;
                if let Some(write) = sink.as_mut() {
                    let _ = write.send(Message::Pong(data)).await;
                }
            }
            Ok(Message::Close(_)) => {
                info!("relay {} closed connection", url);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("websocket error from {}: {}", url, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_normalizes_relay_url() {
        let config = PoolConfig::default();
        let (conn, _rx) = RelayConnection::new("wss://relay.example.com:443/", &config).unwrap();
        assert_eq!(conn.url(), "wss://relay.example.com");
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let config = PoolConfig::default();
        let result = RelayConnection::new("https://relay.example.com", &config);
        assert!(matches!(result, Err(PoolError::InvalidUrl(_))));
    }

    #[test]
    fn starts_disconnected() {
        let config = PoolConfig::default();
        let (conn, _rx) = RelayConnection::new("wss://relay.example.com", &config).unwrap();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn send_fails_when_disconnected() {
        let config = PoolConfig::default();
        let (conn, _rx) = RelayConnection::new("wss://relay.example.com", &config).unwrap();
        let result = conn.send(&ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        })
        .await;
        assert!(matches!(result, Err(PoolError::NotConnected)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), MAX_RECONNECT_DELAY);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
