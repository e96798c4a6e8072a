//! The relay pool: session registry, subscription multiplexing, fetch
//! aggregation, publish broadcast, NIP-42 coordination and the idle-session
//! GC loop.
//!
//! Sessions are created lazily and never removed except by [`RelayPool::close`];
//! the GC only puts idle ones to sleep. All operations key sessions by
//! normalized relay URL.

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::session::RelaySession;
use crate::signer::Signer;
use crate::subscription::{
    EoseTracker, Subscription, SubscriptionUpdate, generate_subscription_id,
};
use nostr_proto::{
    AUTH_KIND, ClientMessage, Event, EventTemplate, Filter, create_auth_event_tags,
    normalize_relay_url,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

type SessionMap = HashMap<String, Arc<RelaySession>>;

/// Pool of relay sessions behind one read/write surface.
pub struct RelayPool {
    config: PoolConfig,
    sessions: Arc<RwLock<SessionMap>>,
    auth_outcomes: Arc<RwLock<HashMap<String, bool>>>,
    gc_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayPool {
    /// Create a pool and start its GC loop. Must be called inside a tokio
    /// runtime.
    pub fn new(config: PoolConfig) -> Self {
        let sessions: Arc<RwLock<SessionMap>> = Arc::new(RwLock::new(HashMap::new()));

        let gc_sessions = Arc::clone(&sessions);
        let keep_alive = config.keep_alive;
        let gc_interval = config.gc_interval;
        let gc_task = tokio::spawn(async move {
            let mut ticker = interval(gc_interval);
            // A slow sweep delays the next tick instead of stacking up.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&gc_sessions, keep_alive).await;
            }
        });

        Self {
            config,
            sessions,
            auth_outcomes: Arc::new(RwLock::new(HashMap::new())),
            gc_task: Mutex::new(Some(gc_task)),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a pool with an initial, ordered set of relays. The pool is
    /// torn down again if any URL is rejected.
    pub async fn with_relays(urls: Vec<String>, config: PoolConfig) -> Result<Self> {
        let pool = Self::new(config);
        if let Err(e) = pool.add_relays(&urls).await {
            pool.close().await;
            return Err(e);
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// URLs of all known relays, normalized.
    pub async fn relay_urls(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Register a relay, creating a sleeping session if one does not exist.
    /// Idempotent; rejects non-ws/wss URLs.
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        self.ensure_session(url).await?;
        Ok(())
    }

    /// Register several relays.
    pub async fn add_relays(&self, urls: &[String]) -> Result<()> {
        for url in urls {
            self.add_relay(url).await?;
        }
        Ok(())
    }

    /// Open a subscription across the given relays (all known relays when
    /// `None`). Fails before any network contact if the pool is not
    /// readable.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        relay_urls: Option<Vec<String>>,
    ) -> Result<Subscription> {
        if !self.config.readable {
            return Err(PoolError::ReadDisabled);
        }
        self.ensure_open()?;

        let sessions = self.target_sessions(relay_urls).await?;
        let subscription_id = generate_subscription_id();
        let (tx, rx) = mpsc::unbounded_channel();

        for session in &sessions {
            session.wake().await;
            session
                .open_subscription(&subscription_id, filters.clone(), tx.clone())
                .await;
        }

        info!(
            "opened subscription {} across {} relays",
            subscription_id,
            sessions.len()
        );
        Ok(Subscription::new(subscription_id, rx, sessions))
    }

    /// One-shot query: subscribe, collect validated events until every
    /// spanned relay has sent EOSE, close, resolve. On timeout the
    /// subscription is closed before the error is returned, so nothing
    /// dangles.
    pub async fn fetch(
        &self,
        filters: Vec<Filter>,
        fetch_timeout: Duration,
        relay_urls: Option<Vec<String>>,
    ) -> Result<Vec<Event>> {
        let mut subscription = self.subscribe(filters, relay_urls).await?;
        let mut tracker = EoseTracker::new(subscription.relay_urls());
        let mut events = Vec::new();

        let outcome = tokio::time::timeout(fetch_timeout, async {
            while !tracker.all_eose() {
                match subscription.recv().await {
                    Some(SubscriptionUpdate::Event { event, .. }) => events.push(event),
                    Some(SubscriptionUpdate::EndOfStored { relay_url }) => {
                        tracker.mark(&relay_url);
                    }
                    // Channel ended; whoever is left counts as done.
                    None => break,
                }
            }
        })
        .await;

        subscription.close().await;
        match outcome {
            Ok(()) => Ok(events),
            Err(_) => Err(PoolError::Timeout(format!(
                "fetch timed out after {:?}",
                fetch_timeout
            ))),
        }
    }

    /// Broadcast an event. Each relay is attempted independently and its
    /// send outcome is returned alongside its URL; one relay's failure
    /// never stops delivery to the rest. Fails before any network contact
    /// if the pool is not writable.
    pub async fn publish(
        &self,
        event: &Event,
        relay_urls: Option<Vec<String>>,
        signer: Option<&Signer>,
    ) -> Result<Vec<(String, Result<()>)>> {
        if !self.config.writable {
            return Err(PoolError::WriteDisabled);
        }
        self.ensure_open()?;

        let sessions = self.target_sessions(relay_urls).await?;

        if self.config.auto_auth
            && let Some(signer) = signer
        {
            for session in &sessions {
                if session.is_authenticated().await {
                    continue;
                }
                if !self.authenticate_to_relay(signer, session.url()).await {
                    warn!("publishing to {} without authentication", session.url());
                }
            }
        }

        let mut results = Vec::with_capacity(sessions.len());
        for session in &sessions {
            session.wake().await;
            if !session
                .wait_until_connected(self.config.connection_timeout)
                .await
            {
                debug!("publishing to {} while not connected", session.url());
            }
            let result = session.send(&ClientMessage::Event(event.clone())).await;
            if let Err(ref e) = result {
                warn!("failed to publish {} to {}: {}", event.id, session.url(), e);
            }
            results.push((session.url().to_string(), result));
        }
        Ok(results)
    }

    /// Run the NIP-42 handshake against one relay. Every failure path
    /// degrades to `false`; the outcome is recorded in the auth record and
    /// on the session.
    pub async fn authenticate_to_relay(&self, signer: &Signer, url: &str) -> bool {
        let session = match self.ensure_session(url).await {
            Ok(session) => session,
            Err(e) => {
                warn!("cannot authenticate to {}: {}", url, e);
                return false;
            }
        };
        session.wake().await;

        let wait = self.config.connection_timeout;
        let Some(challenge) = session.wait_for_challenge(wait).await else {
            warn!("no auth challenge from {} within {:?}", session.url(), wait);
            self.record_auth(&session, false).await;
            return false;
        };

        let template = EventTemplate {
            created_at: unix_now(),
            kind: AUTH_KIND,
            tags: create_auth_event_tags(session.url(), &challenge),
            content: String::new(),
        };
        let event = match signer.sign_event(&template).await {
            Ok(event) => event,
            Err(e) => {
                warn!("signer failed for {}: {}", session.url(), e);
                self.record_auth(&session, false).await;
                return false;
            }
        };

        let event_id = event.id.clone();
        let accepted = match session
            .send_with_ok(&ClientMessage::Auth(event), &event_id, wait)
            .await
        {
            Ok((accepted, message)) => {
                if !accepted {
                    debug!("{} rejected auth: {}", session.url(), message);
                }
                accepted
            }
            Err(e) => {
                warn!("auth handshake with {} failed: {}", session.url(), e);
                false
            }
        };

        self.record_auth(&session, accepted).await;
        accepted
    }

    /// Authenticate against many relays (all known when `None`); per-URL
    /// outcomes, partial failure expected.
    pub async fn authenticate_to_relays(
        &self,
        signer: &Signer,
        relay_urls: Option<Vec<String>>,
    ) -> HashMap<String, bool> {
        let urls = match relay_urls {
            Some(urls) => urls,
            None => self.relay_urls().await,
        };

        let mut outcomes = HashMap::new();
        for url in urls {
            let outcome = self.authenticate_to_relay(signer, &url).await;
            let key = normalize_relay_url(&url).unwrap_or(url);
            outcomes.insert(key, outcome);
        }
        outcomes
    }

    /// Auth status for a relay; `false` for unknown relays. When a live
    /// session exists its current flag is authoritative, so the reset a
    /// reconnect performs is reflected here immediately; the recorded
    /// outcome only answers for relays without a session.
    pub async fn is_relay_authenticated(&self, url: &str) -> bool {
        let Ok(normalized) = normalize_relay_url(url) else {
            return false;
        };
        let session = self.sessions.read().await.get(&normalized).cloned();
        if let Some(session) = session {
            return session.is_authenticated().await;
        }
        self.auth_outcomes
            .read()
            .await
            .get(&normalized)
            .copied()
            .unwrap_or(false)
    }

    /// Shut the pool down: stop the GC, close every subscription, drop
    /// every connection, empty the registry and the auth record. Not safe
    /// to race with other operations on the same pool.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing relay pool");

        if let Some(handle) = self.gc_task.lock().await.take() {
            handle.abort();
        }

        let sessions: Vec<Arc<RelaySession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.shutdown().await;
        }

        self.auth_outcomes.write().await.clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PoolError::Closed)
        } else {
            Ok(())
        }
    }

    async fn ensure_session(&self, url: &str) -> Result<Arc<RelaySession>> {
        let normalized =
            normalize_relay_url(url).map_err(|e| PoolError::InvalidUrl(e.to_string()))?;

        if let Some(session) = self.sessions.read().await.get(&normalized) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&normalized) {
            return Ok(Arc::clone(session));
        }

        let session = RelaySession::new(&normalized, &self.config)?;
        info!("added relay {}", normalized);
        sessions.insert(normalized, Arc::clone(&session));
        Ok(session)
    }

    async fn target_sessions(
        &self,
        relay_urls: Option<Vec<String>>,
    ) -> Result<Vec<Arc<RelaySession>>> {
        match relay_urls {
            Some(urls) => {
                let mut sessions = Vec::with_capacity(urls.len());
                for url in urls {
                    sessions.push(self.ensure_session(&url).await?);
                }
                Ok(sessions)
            }
            None => Ok(self.sessions.read().await.values().cloned().collect()),
        }
    }

    async fn record_auth(&self, session: &RelaySession, outcome: bool) {
        session.set_authenticated(outcome).await;
        self.auth_outcomes
            .write()
            .await
            .insert(session.url().to_string(), outcome);
    }
}

/// One GC pass: put every awake session that has no active subscription
/// and has been idle past `keep_alive` to sleep. The idle check and the
/// sleep are one atomic session operation, so a subscription racing the
/// sweep always spares its session. A single session's trouble never
/// stops the pass.
async fn sweep(sessions: &RwLock<SessionMap>, keep_alive: Duration) {
    let sessions: Vec<Arc<RelaySession>> = sessions.read().await.values().cloned().collect();
    for session in sessions {
        if session.sleep_if_idle(keep_alive).await {
            debug!("put idle relay {} to sleep", session.url());
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_relay_is_idempotent_and_normalizes() {
        let pool = RelayPool::new(PoolConfig::default());
        pool.add_relay("wss://relay.example.com").await.unwrap();
        pool.add_relay("wss://relay.example.com:443/").await.unwrap();

        let urls = pool.relay_urls().await;
        assert_eq!(urls, vec!["wss://relay.example.com".to_string()]);
        pool.close().await;
    }

    #[tokio::test]
    async fn add_relay_rejects_non_websocket_urls() {
        let pool = RelayPool::new(PoolConfig::default());
        let result = pool.add_relay("https://relay.example.com").await;
        assert!(matches!(result, Err(PoolError::InvalidUrl(_))));
        assert!(pool.relay_urls().await.is_empty());
        pool.close().await;
    }

    #[tokio::test]
    async fn subscribe_on_unreadable_pool_makes_no_network_contact() {
        let pool = RelayPool::new(PoolConfig {
            readable: false,
            ..PoolConfig::default()
        });

        let result = pool
            .subscribe(
                vec![Filter::new().kinds(vec![1])],
                Some(vec!["wss://relay.example.com".to_string()]),
            )
            .await;
        assert!(matches!(result, Err(PoolError::ReadDisabled)));
        // Capability check fires before any session is even created.
        assert!(pool.relay_urls().await.is_empty());
        pool.close().await;
    }

    #[tokio::test]
    async fn publish_on_unwritable_pool_makes_no_network_contact() {
        let pool = RelayPool::new(PoolConfig {
            writable: false,
            ..PoolConfig::default()
        });

        let event = Event {
            id: "00".repeat(32),
            pubkey: "00".repeat(32),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "00".repeat(64),
        };
        let result = pool
            .publish(&event, Some(vec!["wss://relay.example.com".to_string()]), None)
            .await;
        assert!(matches!(result, Err(PoolError::WriteDisabled)));
        assert!(pool.relay_urls().await.is_empty());
        pool.close().await;
    }

    #[tokio::test]
    async fn with_relays_registers_initial_urls_in_order() {
        let pool = RelayPool::with_relays(
            vec![
                "wss://a.example.com".to_string(),
                "wss://b.example.com:443/".to_string(),
            ],
            PoolConfig::default(),
        )
        .await
        .unwrap();

        let mut urls = pool.relay_urls().await;
        urls.sort();
        assert_eq!(urls, vec!["wss://a.example.com", "wss://b.example.com"]);
        pool.close().await;
    }

    #[tokio::test]
    async fn with_relays_rejects_invalid_urls() {
        let result = RelayPool::with_relays(
            vec![
                "wss://a.example.com".to_string(),
                "https://b.example.com".to_string(),
            ],
            PoolConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(PoolError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn auth_record_defaults_to_false() {
        let pool = RelayPool::new(PoolConfig::default());
        assert!(!pool.is_relay_authenticated("wss://relay.example.com").await);
        assert!(!pool.is_relay_authenticated("not a url").await);
        pool.close().await;
    }

    #[tokio::test]
    async fn reconnect_auth_reset_is_visible_through_the_pool() {
        let pool = RelayPool::new(PoolConfig::default());
        pool.add_relay("ws://127.0.0.1:1").await.unwrap();
        let session = pool
            .sessions
            .read()
            .await
            .get("ws://127.0.0.1:1")
            .cloned()
            .unwrap();

        pool.record_auth(&session, true).await;
        assert!(pool.is_relay_authenticated("ws://127.0.0.1:1").await);

        // What the dispatch task does when the transport comes back up.
        session.set_authenticated(false).await;
        assert!(!pool.is_relay_authenticated("ws://127.0.0.1:1").await);
        pool.close().await;
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let pool = RelayPool::new(PoolConfig::default());
        pool.add_relay("ws://127.0.0.1:1").await.unwrap();

        pool.close().await;
        assert!(pool.relay_urls().await.is_empty());

        let result = pool.add_relay("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(PoolError::Closed)));

        // Second close is a no-op.
        pool.close().await;
    }

    mod sweeps {
        use super::*;
        use crate::session::RelaySession;

        async fn session_map(
            session: &Arc<RelaySession>,
        ) -> RwLock<SessionMap> {
            let mut map = HashMap::new();
            map.insert(session.url().to_string(), Arc::clone(session));
            RwLock::new(map)
        }

        #[tokio::test(start_paused = true)]
        async fn stale_idle_sessions_are_put_to_sleep() {
            let session = RelaySession::new("ws://127.0.0.1:1", &PoolConfig::default()).unwrap();
            session.wake().await;
            let sessions = session_map(&session).await;

            tokio::time::advance(Duration::from_secs(61)).await;
            sweep(&sessions, Duration::from_secs(60)).await;

            assert!(session.is_sleeping().await);
        }

        #[tokio::test(start_paused = true)]
        async fn fresh_sessions_are_spared() {
            let session = RelaySession::new("ws://127.0.0.1:1", &PoolConfig::default()).unwrap();
            session.wake().await;
            let sessions = session_map(&session).await;

            tokio::time::advance(Duration::from_secs(10)).await;
            sweep(&sessions, Duration::from_secs(60)).await;

            assert!(!session.is_sleeping().await);
        }

        #[tokio::test(start_paused = true)]
        async fn subscribed_sessions_are_never_swept() {
            let session = RelaySession::new("ws://127.0.0.1:1", &PoolConfig::default()).unwrap();
            session.wake().await;

            let (tx, _rx) = mpsc::unbounded_channel();
            session
                .open_subscription("sub1", vec![Filter::new()], tx)
                .await;
            let sessions = session_map(&session).await;

            tokio::time::advance(Duration::from_secs(3600)).await;
            sweep(&sessions, Duration::from_secs(60)).await;

            assert!(!session.is_sleeping().await);
        }

        #[tokio::test(start_paused = true)]
        async fn sleeping_sessions_are_left_alone() {
            let session = RelaySession::new("ws://127.0.0.1:1", &PoolConfig::default()).unwrap();
            let sessions = session_map(&session).await;

            tokio::time::advance(Duration::from_secs(3600)).await;
            sweep(&sessions, Duration::from_secs(60)).await;

            assert!(session.is_sleeping().await);
        }
    }
}
