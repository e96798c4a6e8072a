//! NIP-42: challenge-response authentication of clients to relays.
//!
//! A relay sends `["AUTH", <challenge>]`; the client answers with a signed
//! kind-22242 event carrying the challenge and the relay URL in its tags.
//! Helpers here build and validate those events; the handshake itself lives
//! in the pool.

use crate::event::Event;
use thiserror::Error;

/// Event kind for client authentication.
pub const AUTH_KIND: u16 = 22242;

/// Tag name carrying the relay challenge.
pub const CHALLENGE_TAG: &str = "challenge";

/// Tag name carrying the relay URL.
pub const RELAY_TAG: &str = "relay";

/// Machine-readable OK/CLOSED prefix demanding authentication.
pub const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

/// Machine-readable OK/CLOSED prefix for insufficient authorization.
pub const RESTRICTED_PREFIX: &str = "restricted:";

/// Maximum allowed skew between an auth event's `created_at` and now,
/// in seconds.
pub const MAX_TIME_DIFF: u64 = 600;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid relay url: {0}")]
    InvalidRelayUrl(String),
}

/// Build the tags for an auth event answering `challenge` at `relay_url`.
pub fn create_auth_event_tags(relay_url: &str, challenge: &str) -> Vec<Vec<String>> {
    vec![
        vec![RELAY_TAG.to_string(), relay_url.to_string()],
        vec![CHALLENGE_TAG.to_string(), challenge.to_string()],
    ]
}

fn tag_value<'a>(event: &'a Event, name: &str) -> Option<&'a str> {
    event
        .tags
        .iter()
        .find(|t| t.len() >= 2 && t[0] == name)
        .map(|t| t[1].as_str())
}

/// Extract the challenge from an auth event.
pub fn get_challenge(event: &Event) -> Option<&str> {
    tag_value(event, CHALLENGE_TAG)
}

/// Extract the relay URL from an auth event.
pub fn get_relay_url(event: &Event) -> Option<&str> {
    tag_value(event, RELAY_TAG)
}

/// Whether an event has the auth kind.
pub fn is_auth_event(event: &Event) -> bool {
    event.kind == AUTH_KIND
}

/// Normalize a relay URL for comparison: lowercase scheme and host, drop
/// default ports and any trailing slash on the root path.
pub fn normalize_relay_url(url: &str) -> Result<String, AuthError> {
    let parsed = url::Url::parse(url).map_err(|e| AuthError::InvalidRelayUrl(e.to_string()))?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(AuthError::InvalidRelayUrl(format!(
            "expected ws:// or wss:// url, got {}",
            url
        )));
    }
    let mut normalized = parsed.to_string();
    if parsed.path() == "/" && parsed.query().is_none() {
        normalized.truncate(normalized.len() - 1);
    }
    Ok(normalized)
}

/// Validate an auth event against the expected challenge and relay URL.
///
/// Checks kind, tag contents and `created_at` freshness; signature
/// verification is a separate concern.
pub fn validate_auth_event(event: &Event, challenge: &str, relay_url: &str, now: u64) -> bool {
    if !is_auth_event(event) {
        return false;
    }
    if get_challenge(event) != Some(challenge) {
        return false;
    }
    let Some(event_relay) = get_relay_url(event) else {
        return false;
    };
    match (normalize_relay_url(event_relay), normalize_relay_url(relay_url)) {
        (Ok(a), Ok(b)) if a == b => {}
        _ => return false,
    }
    now.abs_diff(event.created_at) <= MAX_TIME_DIFF
}

/// Whether an OK/CLOSED message demands authentication first.
pub fn is_auth_required_error(message: &str) -> bool {
    message.starts_with(AUTH_REQUIRED_PREFIX)
}

/// Whether an OK/CLOSED message reports insufficient authorization.
pub fn is_restricted_error(message: &str) -> bool {
    message.starts_with(RESTRICTED_PREFIX)
}
