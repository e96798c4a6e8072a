//! Subscription handles.
//!
//! A [`Subscription`] is the caller's end of one logical REQ fanned out
//! across one or more relay sessions. Updates arrive lazily over an
//! unbounded channel; only signature-valid events are ever put on it.
//! The stream is not restartable: once closed, a new subscription must
//! be opened.

use crate::session::RelaySession;
use nostr_proto::Event;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Generate a short unique subscription id.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

/// What a subscription yields.
#[derive(Debug, Clone)]
pub enum SubscriptionUpdate {
    /// A validated event from one relay.
    Event { relay_url: String, event: Event },
    /// One relay finished replaying its stored events.
    EndOfStored { relay_url: String },
}

/// Handle for one multiplexed subscription.
pub struct Subscription {
    id: String,
    updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
    sessions: Vec<Arc<RelaySession>>,
    closed: bool,
}

impl Subscription {
    pub(crate) fn new(
        id: String,
        updates: mpsc::UnboundedReceiver<SubscriptionUpdate>,
        sessions: Vec<Arc<RelaySession>>,
    ) -> Self {
        Self {
            id,
            updates,
            sessions,
            closed: false,
        }
    }

    /// Subscription id as sent on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// URLs of the relays this subscription spans.
    pub fn relay_urls(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.url().to_string()).collect()
    }

    /// Receive the next update. `None` once the subscription is closed
    /// and the channel drained.
    pub async fn recv(&mut self) -> Option<SubscriptionUpdate> {
        self.updates.recv().await
    }

    /// Close the subscription on every spanned relay. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        debug!("closing subscription {}", self.id);
        for session in &self.sessions {
            session.close_subscription(&self.id).await;
        }
    }
}

/// Tracks which spanned relays have sent EOSE for one subscription.
pub struct EoseTracker {
    pending: HashSet<String>,
}

impl EoseTracker {
    pub fn new<I>(relay_urls: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            pending: relay_urls.into_iter().collect(),
        }
    }

    /// Record an EOSE from a relay. Unknown URLs are ignored.
    pub fn mark(&mut self, relay_url: &str) {
        self.pending.remove(relay_url);
    }

    /// True once every spanned relay has sent EOSE.
    pub fn all_eose(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use nostr_proto::Filter;

    #[test]
    fn subscription_ids_are_short_and_unique() {
        let id1 = generate_subscription_id();
        let id2 = generate_subscription_id();
        assert_eq!(id1.len(), 8);
        assert_ne!(id1, id2);
    }

    #[test]
    fn eose_tracker_completes_when_all_relays_report() {
        let mut tracker = EoseTracker::new(vec![
            "wss://a.example.com".to_string(),
            "wss://b.example.com".to_string(),
        ]);
        assert!(!tracker.all_eose());

        tracker.mark("wss://a.example.com");
        assert!(!tracker.all_eose());

        tracker.mark("wss://unknown.example.com");
        assert!(!tracker.all_eose());

        tracker.mark("wss://b.example.com");
        assert!(tracker.all_eose());
    }

    #[test]
    fn eose_tracker_with_no_relays_is_done() {
        let tracker = EoseTracker::new(Vec::new());
        assert!(tracker.all_eose());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_clears_session_routes() {
        let config = PoolConfig::default();
        let session = RelaySession::new("wss://relay.example.com", &config).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        session
            .open_subscription("sub1", vec![Filter::new().kinds(vec![1])], tx)
            .await;
        assert!(session.has_active_subscriptions().await);

        let mut subscription =
            Subscription::new("sub1".to_string(), rx, vec![Arc::clone(&session)]);
        subscription.close().await;
        assert!(!session.has_active_subscriptions().await);

        // Second close is a no-op, tolerant of already-removed ids.
        subscription.close().await;
        assert!(!session.has_active_subscriptions().await);
    }
}
