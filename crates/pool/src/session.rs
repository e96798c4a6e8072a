//! Per-relay session state on top of a [`RelayConnection`].
//!
//! A session owns the pool's view of one relay: whether it is sleeping,
//! when it was last useful, whether it has authenticated, and which
//! subscriptions currently span it. A dispatch task consumes the
//! connection's event channel and routes relay messages:
//!
//! - `EVENT` is signature-verified; invalid events are dropped with a
//!   `debug!`, valid ones go to the subscription route for that id.
//! - `EOSE` becomes an end-of-stored marker on the same route.
//! - `OK` resolves the pending confirmation for that event id.
//! - `AUTH` challenges land in a watch channel for the coordinator.
//! - `NOTICE` and `CLOSED` are logged.
//!
//! On every (re)connect the dispatch task replays the REQ for each
//! registered route and resets the authenticated flag, so routes survive
//! transport drops.

use crate::config::PoolConfig;
use crate::connection::{ConnectionEvent, RelayConnection};
use crate::error::{PoolError, Result};
use crate::subscription::SubscriptionUpdate;
use nostr_proto::{ClientMessage, Filter, RelayMessage, verify_event};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

struct SessionState {
    sleeping: bool,
    last_active: Instant,
    authenticated: bool,
    /// Ids of subscriptions spanning this session, in open order.
    subscription_ids: Vec<String>,
}

struct Route {
    filters: Vec<Filter>,
    updates: mpsc::UnboundedSender<SubscriptionUpdate>,
}

type PendingOks = HashMap<String, oneshot::Sender<(bool, String)>>;

/// The pool's long-lived handle to one relay.
pub struct RelaySession {
    url: String,
    connection: Arc<RelayConnection>,
    state: Arc<RwLock<SessionState>>,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    pending_oks: Arc<Mutex<PendingOks>>,
    challenge: watch::Receiver<Option<String>>,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RelaySession {
    /// Create a session for a relay. Starts sleeping; `wake()` dials.
    pub fn new(url: &str, config: &PoolConfig) -> Result<Arc<Self>> {
        let (connection, events) = RelayConnection::new(url, config)?;
        let connection = Arc::new(connection);
        let (challenge_tx, challenge_rx) = watch::channel(None);

        let state = Arc::new(RwLock::new(SessionState {
            sleeping: true,
            last_active: Instant::now(),
            authenticated: false,
            subscription_ids: Vec::new(),
        }));
        let routes = Arc::new(Mutex::new(HashMap::new()));
        let pending_oks = Arc::new(Mutex::new(HashMap::new()));

        let handle = tokio::spawn(dispatch_loop(
            connection.url().to_string(),
            Arc::clone(&connection),
            events,
            Arc::clone(&state),
            Arc::clone(&routes),
            Arc::clone(&pending_oks),
            challenge_tx,
        ));

        Ok(Arc::new(Self {
            url: connection.url().to_string(),
            connection,
            state,
            routes,
            pending_oks,
            challenge: challenge_rx,
            dispatch_task: Mutex::new(Some(handle)),
        }))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Refresh the activity timestamp.
    pub async fn touch(&self) {
        self.state.write().await.last_active = Instant::now();
    }

    pub async fn last_active(&self) -> Instant {
        self.state.read().await.last_active
    }

    pub async fn is_sleeping(&self) -> bool {
        self.state.read().await.sleeping
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.read().await.authenticated
    }

    pub async fn set_authenticated(&self, authenticated: bool) {
        self.state.write().await.authenticated = authenticated;
    }

    pub async fn has_active_subscriptions(&self) -> bool {
        !self.state.read().await.subscription_ids.is_empty()
    }

    pub async fn subscription_ids(&self) -> Vec<String> {
        self.state.read().await.subscription_ids.clone()
    }

    /// Bring the session out of sleep, dialing if necessary, and refresh
    /// its activity. Connect failures are retried by the transport and
    /// never propagate from here.
    pub async fn wake(&self) {
        let mut state = self.state.write().await;
        state.last_active = Instant::now();
        if state.sleeping {
            state.sleeping = false;
            drop(state);
            self.connection.start().await;
        }
    }

    /// Wait for the transport to come up, bounded by `wait`. Returns
    /// whether it is connected when the wait ends.
    pub async fn wait_until_connected(&self, wait: Duration) -> bool {
        self.connection.wait_until_connected(wait).await
    }

    /// Disconnect and mark sleeping, but only if the session is awake,
    /// has no active subscriptions and has been idle past `keep_alive`.
    /// The check and the sleep happen under one state lock, so a
    /// concurrent `wake()` or `open_subscription()` either lands before
    /// the check (and spares the session) or blocks until the transport
    /// is down and sees `sleeping=true`. Returns whether it slept.
    /// Disconnect errors are warned and swallowed; the session sleeps
    /// regardless.
    pub async fn sleep_if_idle(&self, keep_alive: Duration) -> bool {
        let mut state = self.state.write().await;
        if state.sleeping
            || !state.subscription_ids.is_empty()
            || state.last_active.elapsed() <= keep_alive
        {
            return false;
        }
        if let Err(e) = self.connection.disconnect().await {
            warn!("error disconnecting idle {}: {}", self.url, e);
        }
        state.sleeping = true;
        true
    }

    /// Register a subscription route and send its REQ. The route outlives
    /// transport drops; if the REQ cannot be sent now it is replayed as
    /// soon as the connection is up.
    pub async fn open_subscription(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        updates: mpsc::UnboundedSender<SubscriptionUpdate>,
    ) {
        {
            let mut routes = self.routes.lock().await;
            routes.insert(
                subscription_id.to_string(),
                Route {
                    filters: filters.clone(),
                    updates,
                },
            );
        }
        {
            let mut state = self.state.write().await;
            state.last_active = Instant::now();
            if !state.subscription_ids.iter().any(|id| id == subscription_id) {
                state.subscription_ids.push(subscription_id.to_string());
            }
        }

        let req = ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters,
        };
        if let Err(e) = self.connection.send(&req).await {
            debug!(
                "REQ {} to {} deferred until connected: {}",
                subscription_id, self.url, e
            );
        }
    }

    /// Drop a subscription route and tell the relay. Tolerant of ids that
    /// were never opened or are already gone; CLOSE send failures are
    /// logged, removal happens regardless.
    pub async fn close_subscription(&self, subscription_id: &str) {
        self.routes.lock().await.remove(subscription_id);
        self.state
            .write()
            .await
            .subscription_ids
            .retain(|id| id != subscription_id);

        let close = ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        };
        if let Err(e) = self.connection.send(&close).await {
            debug!("CLOSE {} to {} not sent: {}", subscription_id, self.url, e);
        }
    }

    /// Send a client message, refreshing activity.
    pub async fn send(&self, message: &ClientMessage) -> Result<()> {
        self.touch().await;
        self.connection.send(message).await
    }

    /// Send a message carrying an event and wait for the relay's OK for
    /// that event id. Used for the auth handshake.
    pub async fn send_with_ok(
        &self,
        message: &ClientMessage,
        event_id: &str,
        wait: Duration,
    ) -> Result<(bool, String)> {
        let (tx, rx) = oneshot::channel();
        self.pending_oks
            .lock()
            .await
            .insert(event_id.to_string(), tx);

        if let Err(e) = self.send(message).await {
            self.pending_oks.lock().await.remove(event_id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => {
                self.pending_oks.lock().await.remove(event_id);
                Err(PoolError::Protocol("confirmation channel closed".to_string()))
            }
            Err(_) => {
                self.pending_oks.lock().await.remove(event_id);
                Err(PoolError::Timeout(format!(
                    "no OK for event {} within {:?}",
                    event_id, wait
                )))
            }
        }
    }

    /// Wait for the relay's AUTH challenge, bounded by `wait`. Returns the
    /// most recent challenge if one already arrived.
    pub async fn wait_for_challenge(&self, wait: Duration) -> Option<String> {
        let mut rx = self.challenge.clone();
        let deadline = Instant::now() + wait;
        loop {
            if let Some(challenge) = rx.borrow_and_update().clone() {
                return Some(challenge);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => return None,
            }
        }
    }

    /// Tear the session down: best-effort CLOSE for every route, transport
    /// disconnect, dispatch task abort. Only the pool's `close()` calls
    /// this; sessions are otherwise never removed.
    pub async fn shutdown(&self) {
        let ids = self.subscription_ids().await;
        for id in ids {
            self.close_subscription(&id).await;
        }
        if let Err(e) = self.connection.disconnect().await {
            warn!("error disconnecting {}: {}", self.url, e);
        }
        self.state.write().await.sleeping = true;
        if let Some(handle) = self.dispatch_task.lock().await.take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(
    url: String,
    connection: Arc<RelayConnection>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    state: Arc<RwLock<SessionState>>,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    pending_oks: Arc<Mutex<PendingOks>>,
    challenge: watch::Sender<Option<String>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected => {
                // Fresh socket: previous auth and challenge no longer hold.
                let _ = challenge.send(None);
                state.write().await.authenticated = false;

                let routes = routes.lock().await;
                for (id, route) in routes.iter() {
                    let req = ClientMessage::Req {
                        subscription_id: id.clone(),
                        filters: route.filters.clone(),
                    };
                    match connection.send(&req).await {
                        Ok(()) => debug!("replayed subscription {} on {}", id, url),
                        Err(e) => warn!("failed to replay subscription {} on {}: {}", id, url, e),
                    }
                }
            }
            ConnectionEvent::Disconnected => {
                debug!("lost connection to {}", url);
            }
            ConnectionEvent::Message(message) => {
                handle_relay_message(&url, message, &state, &routes, &pending_oks, &challenge)
                    .await;
            }
        }
    }
}

async fn handle_relay_message(
    url: &str,
    message: RelayMessage,
    state: &Arc<RwLock<SessionState>>,
    routes: &Arc<Mutex<HashMap<String, Route>>>,
    pending_oks: &Arc<Mutex<PendingOks>>,
    challenge: &watch::Sender<Option<String>>,
) {
    match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => {
            if !matches!(verify_event(&event), Ok(true)) {
                debug!(
                    "dropping event {} from {}: failed verification",
                    event.id, url
                );
                return;
            }
            deliver(
                url,
                &subscription_id,
                SubscriptionUpdate::Event {
                    relay_url: url.to_string(),
                    event,
                },
                state,
                routes,
            )
            .await;
        }
        RelayMessage::Eose { subscription_id } => {
            deliver(
                url,
                &subscription_id,
                SubscriptionUpdate::EndOfStored {
                    relay_url: url.to_string(),
                },
                state,
                routes,
            )
            .await;
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(tx) = pending_oks.lock().await.remove(&event_id) {
                let _ = tx.send((accepted, message));
            } else {
                debug!("unsolicited OK for {} from {}", event_id, url);
            }
        }
        RelayMessage::Auth { challenge: c } => {
            debug!("auth challenge from {}", url);
            let _ = challenge.send(Some(c));
        }
        RelayMessage::Notice { message } => {
            info!("notice from {}: {}", url, message);
        }
        RelayMessage::Closed {
            subscription_id,
            message,
        } => {
            warn!("{} closed subscription {}: {}", url, subscription_id, message);
        }
    }
}

/// Forward an update to its route. A route whose receiver is gone is
/// pruned so the session can go idle.
async fn deliver(
    url: &str,
    subscription_id: &str,
    update: SubscriptionUpdate,
    state: &Arc<RwLock<SessionState>>,
    routes: &Arc<Mutex<HashMap<String, Route>>>,
) {
    let mut routes = routes.lock().await;
    let Some(route) = routes.get(subscription_id) else {
        debug!("no route for subscription {} on {}", subscription_id, url);
        return;
    };

    if route.updates.send(update).is_err() {
        debug!(
            "subscription {} receiver dropped, pruning route on {}",
            subscription_id, url
        );
        routes.remove(subscription_id);
        state
            .write()
            .await
            .subscription_ids
            .retain(|id| id != subscription_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PoolConfig {
        PoolConfig::default()
    }

    #[tokio::test]
    async fn new_session_starts_sleeping_and_unauthenticated() {
        let session = RelaySession::new("wss://relay.example.com", &config()).unwrap();
        assert!(session.is_sleeping().await);
        assert!(!session.is_authenticated().await);
        assert!(!session.has_active_subscriptions().await);
    }

    #[tokio::test]
    async fn open_subscription_tracks_id_and_refreshes_activity() {
        let session = RelaySession::new("wss://relay.example.com", &config()).unwrap();
        let before = session.last_active().await;

        let (tx, _rx) = mpsc::unbounded_channel();
        session
            .open_subscription("sub1", vec![Filter::new().kinds(vec![1])], tx)
            .await;

        assert_eq!(session.subscription_ids().await, vec!["sub1".to_string()]);
        assert!(session.last_active().await >= before);
    }

    #[tokio::test]
    async fn reopening_same_id_does_not_duplicate() {
        let session = RelaySession::new("wss://relay.example.com", &config()).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        session
            .open_subscription("sub1", vec![Filter::new()], tx.clone())
            .await;
        session.open_subscription("sub1", vec![Filter::new()], tx).await;

        assert_eq!(session.subscription_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn close_subscription_tolerates_unknown_ids() {
        let session = RelaySession::new("wss://relay.example.com", &config()).unwrap();
        session.close_subscription("never-opened").await;
        assert!(!session.has_active_subscriptions().await);
    }

    #[tokio::test]
    async fn wake_clears_sleeping_flag() {
        let session = RelaySession::new("wss://relay.example.com", &config()).unwrap();
        assert!(session.is_sleeping().await);

        session.wake().await;
        assert!(!session.is_sleeping().await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_if_idle_sleeps_stale_sessions() {
        let session = RelaySession::new("ws://127.0.0.1:1", &config()).unwrap();
        session.wake().await;

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(session.sleep_if_idle(Duration::from_secs(60)).await);
        assert!(session.is_sleeping().await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_if_idle_spares_subscribed_sessions() {
        let session = RelaySession::new("ws://127.0.0.1:1", &config()).unwrap();
        session.wake().await;

        let (tx, _rx) = mpsc::unbounded_channel();
        session
            .open_subscription("sub1", vec![Filter::new()], tx)
            .await;

        // A subscription opened between GC ticks must keep the session
        // awake no matter how stale its activity stamp is.
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!session.sleep_if_idle(Duration::from_secs(60)).await);
        assert!(!session.is_sleeping().await);
        assert!(session.has_active_subscriptions().await);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_if_idle_spares_fresh_sessions() {
        let session = RelaySession::new("ws://127.0.0.1:1", &config()).unwrap();
        session.wake().await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!session.sleep_if_idle(Duration::from_secs(60)).await);
        assert!(!session.is_sleeping().await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_challenge_times_out_without_one() {
        let session = RelaySession::new("wss://relay.example.com", &config()).unwrap();
        let challenge = session.wait_for_challenge(Duration::from_millis(50)).await;
        assert!(challenge.is_none());
    }
}
