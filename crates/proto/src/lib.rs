//! Nostr protocol types and pure operations.
//!
//! This crate provides:
//! - Events: structure, canonical serialization, Schnorr signing and
//!   verification
//! - Filters: structured predicates over event attributes
//! - Wire messages: the JSON arrays exchanged with relays
//! - NIP-42: auth-event construction and validation
//! - NIP-44: versioned payload encryption
//!
//! There is no networking here; the `nostr-pool` crate drives these types
//! over WebSocket connections.

mod auth;
mod crypto;
mod event;
mod filter;
mod message;

pub use auth::{
    AUTH_KIND, AUTH_REQUIRED_PREFIX, AuthError, CHALLENGE_TAG, MAX_TIME_DIFF, RELAY_TAG,
    RESTRICTED_PREFIX, create_auth_event_tags, get_challenge, get_relay_url, is_auth_event,
    is_auth_required_error, is_restricted_error, normalize_relay_url, validate_auth_event,
};
pub use crypto::{
    CHACHA_KEY_SIZE, CHACHA_NONCE_SIZE, CryptoError, HMAC_KEY_SIZE, MAC_SIZE, MAX_PLAINTEXT_LEN,
    MIN_PLAINTEXT_LEN, NONCE_SIZE, VERSION as NIP44_VERSION, conversation_key, decrypt, encrypt,
};
pub use event::{
    Event, EventError, EventTemplate, UnsignedEvent, finalize_event, generate_secret_key,
    get_event_hash, get_public_key_hex, serialize_event, validate_event_shape, verify_event,
};
pub use filter::Filter;
pub use message::{ClientMessage, MessageError, RelayMessage};
