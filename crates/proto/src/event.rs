//! Event structure, canonical serialization, signing and verification.
//!
//! Events are the only unit of data in the protocol. An event's `id` is the
//! sha256 of its canonical serialization and its `sig` is a Schnorr signature
//! over that id, so validity can always be checked from the event alone.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from event serialization, signing and verification.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),
}

/// A signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-byte lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// 32-byte lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Ordered list of tag entries, each an ordered list of strings
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-byte lowercase hex Schnorr signature over `id`
    pub sig: String,
}

/// An event before its id has been computed and signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// A template for creating events. The pubkey is absent because it derives
/// from the signing key at signing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Canonical serialization used for hashing: `[0, pubkey, created_at, kind, tags, content]`.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, EventError> {
    if !is_lower_hex(&event.pubkey, 64) {
        return Err(EventError::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))
    .map_err(|e| EventError::Serialization(e.to_string()))
}

/// Compute the event id (hex sha256 of the canonical serialization).
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, EventError> {
    let serialized = serialize_event(event)?;
    let hash = sha256::Hash::hash(serialized.as_bytes());
    Ok(hex::encode(hash.as_byte_array()))
}

/// Structural validation of a signed event (hex field shapes only,
/// no cryptography).
pub fn validate_event_shape(event: &Event) -> bool {
    is_lower_hex(&event.id, 64) && is_lower_hex(&event.pubkey, 64) && is_lower_hex(&event.sig, 128)
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Derive the x-only public key (hex) from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, EventError> {
    let secp = Secp256k1::new();
    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| EventError::Signing(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}

/// Sign a template with a secret key, producing a complete signed event.
pub fn finalize_event(
    template: &EventTemplate,
    secret_key: &[u8; 32],
) -> Result<Event, EventError> {
    let secp = Secp256k1::new();

    let sk =
        SecretKey::from_slice(secret_key).map_err(|e| EventError::Signing(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    let pubkey = hex::encode(xonly.serialize());

    let unsigned = UnsignedEvent {
        pubkey: pubkey.clone(),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let id = get_event_hash(&unsigned)?;

    let id_bytes =
        hex::decode(&id).map_err(|e| EventError::Signing(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Signing(format!("invalid message: {}", e)))?;

    let keypair = Keypair::from_secret_key(&secp, &sk);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id,
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature against its own pubkey.
///
/// Returns `Ok(false)` for structurally valid events that fail the check;
/// `Err` only for events whose fields cannot even be decoded for the attempt.
pub fn verify_event(event: &Event) -> Result<bool, EventError> {
    if !validate_event_shape(event) {
        return Ok(false);
    }

    let unsigned = UnsignedEvent {
        pubkey: event.pubkey.clone(),
        created_at: event.created_at,
        kind: event.kind,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    if get_event_hash(&unsigned)? != event.id {
        return Ok(false);
    }

    let secp = Secp256k1::verification_only();

    let id_bytes = hex::decode(&event.id)
        .map_err(|e| EventError::Verification(format!("invalid id hex: {}", e)))?;
    let message = Message::from_digest_slice(&id_bytes)
        .map_err(|e| EventError::Verification(format!("invalid message: {}", e)))?;

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| EventError::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| EventError::Verification(format!("invalid signature: {}", e)))?;

    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| EventError::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| EventError::Verification(format!("invalid pubkey: {}", e)))?;

    Ok(secp.verify_schnorr(&sig, &message, &pubkey).is_ok())
}
