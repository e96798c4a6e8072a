//! Signer capability: one signing/decryption interface over several
//! credential backends.
//!
//! Backends form a closed set selected by the `"type"` discriminant of a
//! plain key-value configuration blob:
//!
//! - `"local"` — holds the secret key in-process; signs and runs NIP-44
//!   encryption directly.
//! - `"extension"` — keys live in a browser/OS extension; every operation
//!   is delegated through an attached [`SignerBridge`].
//! - `"remote"` — keys live behind a NIP-46-style remote signer identified
//!   by a bunker URL; operations delegate through a [`SignerBridge`].
//!
//! Construction fails with an invalid-signer-type error when the blob's
//! discriminant is missing or unrecognized.

use crate::error::{PoolError, Result};
use async_trait::async_trait;
use nostr_proto::{
    Event, EventTemplate, conversation_key, decrypt as nip44_decrypt, encrypt as nip44_encrypt,
    finalize_event, get_public_key_hex,
};
use serde_json::{Value, json};
use std::sync::Arc;

/// Transport for backends whose keys live outside this process.
///
/// The embedder wires the actual channel (extension messaging, a NIP-46
/// session, ...); the pool only issues requests and reads replies.
#[async_trait]
pub trait SignerBridge: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value>;
}

/// Signer backed by an in-process secret key.
pub struct LocalSigner {
    secret_key: [u8; 32],
    pubkey: String,
}

impl LocalSigner {
    pub fn new(secret_key: [u8; 32]) -> Result<Self> {
        let pubkey =
            get_public_key_hex(&secret_key).map_err(|e| PoolError::Signer(e.to_string()))?;
        Ok(Self { secret_key, pubkey })
    }

    pub fn from_hex(secret_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_key_hex)
            .map_err(|e| PoolError::Signer(format!("invalid secret key hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PoolError::Signer("secret key must be 32 bytes".to_string()))?;
        Self::new(key)
    }
}

/// Signer mediated by a browser/OS extension.
pub struct ExtensionSigner {
    pubkey: String,
    bridge: Option<Arc<dyn SignerBridge>>,
}

/// Signer speaking a remote-signer protocol through a bunker.
pub struct RemoteSigner {
    pubkey: String,
    bunker_url: String,
    bridge: Option<Arc<dyn SignerBridge>>,
}

/// The closed set of credential backends.
pub enum Signer {
    Local(LocalSigner),
    Extension(ExtensionSigner),
    Remote(RemoteSigner),
}

fn required_str<'a>(config: &'a Value, field: &str) -> Result<&'a str> {
    config
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| PoolError::Signer(format!("signer config missing field: {}", field)))
}

impl Signer {
    /// Build a signer from a configuration blob, selecting the backend by
    /// its `"type"` field.
    pub fn from_config(config: &Value) -> Result<Self> {
        match config.get("type").and_then(Value::as_str) {
            Some("local") => {
                let signer = LocalSigner::from_hex(required_str(config, "secret_key")?)?;
                Ok(Signer::Local(signer))
            }
            Some("extension") => Ok(Signer::Extension(ExtensionSigner {
                pubkey: required_str(config, "pubkey")?.to_string(),
                bridge: None,
            })),
            Some("remote") => Ok(Signer::Remote(RemoteSigner {
                pubkey: required_str(config, "pubkey")?.to_string(),
                bunker_url: required_str(config, "bunker_url")?.to_string(),
                bridge: None,
            })),
            other => Err(PoolError::Signer(format!(
                "invalid signer type: {}",
                other.unwrap_or("<missing>")
            ))),
        }
    }

    /// Attach the delegation transport for extension/remote backends.
    /// No-op for local signers.
    pub fn with_bridge(mut self, bridge: Arc<dyn SignerBridge>) -> Self {
        match &mut self {
            Signer::Local(_) => {}
            Signer::Extension(s) => s.bridge = Some(bridge),
            Signer::Remote(s) => s.bridge = Some(bridge),
        }
        self
    }

    /// The x-only public key (hex) this signer signs as.
    pub fn public_key(&self) -> &str {
        match self {
            Signer::Local(s) => &s.pubkey,
            Signer::Extension(s) => &s.pubkey,
            Signer::Remote(s) => &s.pubkey,
        }
    }

    fn bridge(&self) -> Result<(&Arc<dyn SignerBridge>, Value)> {
        match self {
            Signer::Local(_) => Err(PoolError::Signer(
                "local signer does not delegate".to_string(),
            )),
            Signer::Extension(s) => s
                .bridge
                .as_ref()
                .map(|b| (b, json!({})))
                .ok_or_else(|| PoolError::Signer("extension signer bridge not attached".to_string())),
            Signer::Remote(s) => s
                .bridge
                .as_ref()
                .map(|b| (b, json!({ "bunker_url": s.bunker_url })))
                .ok_or_else(|| PoolError::Signer("remote signer bridge not attached".to_string())),
        }
    }

    async fn delegate(&self, method: &str, mut params: Value) -> Result<Value> {
        let (bridge, extra) = self.bridge()?;
        if let (Some(params), Some(extra)) = (params.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                params.insert(k.clone(), v.clone());
            }
        }
        bridge.request(method, params).await
    }

    /// Sign an event template, producing a complete signed event.
    pub async fn sign_event(&self, template: &EventTemplate) -> Result<Event> {
        match self {
            Signer::Local(s) => finalize_event(template, &s.secret_key)
                .map_err(|e| PoolError::Signer(e.to_string())),
            _ => {
                let reply = self
                    .delegate("sign_event", json!({ "template": template }))
                    .await?;
                serde_json::from_value(reply)
                    .map_err(|e| PoolError::Signer(format!("malformed signed event: {}", e)))
            }
        }
    }

    /// Encrypt a plaintext to a peer's pubkey (NIP-44).
    pub async fn encrypt(&self, peer_pubkey: &str, plaintext: &str) -> Result<String> {
        match self {
            Signer::Local(s) => {
                let key = conversation_key(&s.secret_key, peer_pubkey)
                    .map_err(|e| PoolError::Signer(e.to_string()))?;
                nip44_encrypt(&key, plaintext).map_err(|e| PoolError::Signer(e.to_string()))
            }
            _ => {
                let reply = self
                    .delegate(
                        "nip44_encrypt",
                        json!({ "peer": peer_pubkey, "plaintext": plaintext }),
                    )
                    .await?;
                reply
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| PoolError::Signer("malformed encrypt reply".to_string()))
            }
        }
    }

    /// Decrypt a payload from a peer's pubkey (NIP-44).
    pub async fn decrypt(&self, peer_pubkey: &str, ciphertext: &str) -> Result<String> {
        match self {
            Signer::Local(s) => {
                let key = conversation_key(&s.secret_key, peer_pubkey)
                    .map_err(|e| PoolError::Signer(e.to_string()))?;
                nip44_decrypt(&key, ciphertext).map_err(|e| PoolError::Signer(e.to_string()))
            }
            _ => {
                let reply = self
                    .delegate(
                        "nip44_decrypt",
                        json!({ "peer": peer_pubkey, "ciphertext": ciphertext }),
                    )
                    .await?;
                reply
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| PoolError::Signer("malformed decrypt reply".to_string()))
            }
        }
    }
}
