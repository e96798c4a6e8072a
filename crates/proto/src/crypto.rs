//! NIP-44 v2 payload encryption.
//!
//! ChaCha20 with an HMAC-SHA256 authenticator, keyed per conversation via
//! ECDH and HKDF. Payloads are `base64(version || nonce || ciphertext || mac)`.
//! Plaintext length is hidden up to a power-of-two bucket by padding.

use bitcoin::secp256k1::{PublicKey, SecretKey, ecdh};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

type HmacSha256 = Hmac<Sha256>;

pub const VERSION: u8 = 2;
pub const NONCE_SIZE: usize = 32;
pub const CHACHA_KEY_SIZE: usize = 32;
pub const CHACHA_NONCE_SIZE: usize = 12;
pub const HMAC_KEY_SIZE: usize = 32;
pub const MAC_SIZE: usize = 32;
pub const MIN_PLAINTEXT_LEN: usize = 1;
pub const MAX_PLAINTEXT_LEN: usize = 65535;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid plaintext length: {0}")]
    InvalidPlaintextLength(usize),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("MAC verification failed")]
    MacMismatch,
}

/// HKDF-extract: PRK = HMAC(salt, ikm).
fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(ikm);
    mac.finalize().into_bytes().into()
}

/// HKDF-expand to `out.len()` bytes (at most 255 blocks).
fn hkdf_expand(prk: &[u8; 32], info: &[u8], out: &mut [u8]) {
    let mut previous: Vec<u8> = Vec::new();
    let mut written = 0usize;
    let mut counter = 1u8;
    while written < out.len() {
        let mut mac = HmacSha256::new_from_slice(prk).expect("hmac accepts any key length");
        mac.update(&previous);
        mac.update(info);
        mac.update(&[counter]);
        let block = mac.finalize().into_bytes();
        let take = (out.len() - written).min(block.len());
        out[written..written + take].copy_from_slice(&block[..take]);
        previous = block.to_vec();
        written += take;
        counter += 1;
    }
}

/// Derive the shared conversation key between a secret key and a peer's
/// x-only public key (hex). Symmetric: both sides derive the same key.
pub fn conversation_key(
    secret_key: &[u8; 32],
    peer_pubkey_hex: &str,
) -> Result<[u8; 32], CryptoError> {
    let sk = SecretKey::from_slice(secret_key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    // x-only keys lift to the even-parity point
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    let peer_bytes =
        hex::decode(peer_pubkey_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if peer_bytes.len() != 32 {
        return Err(CryptoError::InvalidKey(
            "peer pubkey must be 32 bytes of hex".to_string(),
        ));
    }
    compressed[1..].copy_from_slice(&peer_bytes);
    let peer =
        PublicKey::from_slice(&compressed).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let point = ecdh::shared_secret_point(&peer, &sk);
    let shared_x = &point[..32];

    Ok(hkdf_extract(b"nip44-v2", shared_x))
}

fn message_keys(
    conversation_key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
) -> ([u8; CHACHA_KEY_SIZE], [u8; CHACHA_NONCE_SIZE], [u8; HMAC_KEY_SIZE]) {
    let mut okm = [0u8; CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE + HMAC_KEY_SIZE];
    hkdf_expand(conversation_key, nonce, &mut okm);

    let mut chacha_key = [0u8; CHACHA_KEY_SIZE];
    let mut chacha_nonce = [0u8; CHACHA_NONCE_SIZE];
    let mut hmac_key = [0u8; HMAC_KEY_SIZE];
    chacha_key.copy_from_slice(&okm[..CHACHA_KEY_SIZE]);
    chacha_nonce.copy_from_slice(&okm[CHACHA_KEY_SIZE..CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE]);
    hmac_key.copy_from_slice(&okm[CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE..]);
    (chacha_key, chacha_nonce, hmac_key)
}

/// Padded length bucket for a plaintext of `len` bytes.
fn calc_padded_len(len: usize) -> usize {
    if len <= 32 {
        return 32;
    }
    let next_power = 1usize << (usize::BITS - (len - 1).leading_zeros());
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT_LEN..=MAX_PLAINTEXT_LEN).contains(&len) {
        return Err(CryptoError::InvalidPlaintextLength(len));
    }
    let mut padded = vec![0u8; 2 + calc_padded_len(len)];
    padded[0] = (len >> 8) as u8;
    padded[1] = (len & 0xff) as u8;
    padded[2..2 + len].copy_from_slice(plaintext);
    Ok(padded)
}

fn unpad(padded: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if padded.len() < 2 {
        return Err(CryptoError::InvalidPayload("padded data too short".to_string()));
    }
    let len = ((padded[0] as usize) << 8) | padded[1] as usize;
    if len < MIN_PLAINTEXT_LEN
        || 2 + len > padded.len()
        || padded.len() != 2 + calc_padded_len(len)
    {
        return Err(CryptoError::InvalidPayload("invalid padding".to_string()));
    }
    Ok(padded[2..2 + len].to_vec())
}

fn hmac_aad(key: &[u8], aad: &[u8; NONCE_SIZE], data: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(aad);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn encrypt_with_nonce(
    conversation_key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &str,
) -> Result<String, CryptoError> {
    let (chacha_key, chacha_nonce, hmac_key) = message_keys(conversation_key, nonce);

    let mut buffer = pad(plaintext.as_bytes())?;
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    let mac = hmac_aad(&hmac_key, nonce, &buffer);

    let mut payload = Vec::with_capacity(1 + NONCE_SIZE + buffer.len() + MAC_SIZE);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&buffer);
    payload.extend_from_slice(&mac);
    Ok(BASE64.encode(payload))
}

/// Encrypt a plaintext under a conversation key with a fresh random nonce.
pub fn encrypt(conversation_key: &[u8; 32], plaintext: &str) -> Result<String, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(conversation_key, &nonce, plaintext)
}

/// Decrypt a payload under a conversation key, verifying its MAC first.
pub fn decrypt(conversation_key: &[u8; 32], payload: &str) -> Result<String, CryptoError> {
    let bytes = BASE64
        .decode(payload)
        .map_err(|e| CryptoError::InvalidPayload(e.to_string()))?;

    // version + nonce + minimum padded block + mac
    if bytes.len() < 1 + NONCE_SIZE + 2 + 32 + MAC_SIZE {
        return Err(CryptoError::InvalidPayload("payload too short".to_string()));
    }
    if bytes[0] != VERSION {
        return Err(CryptoError::UnsupportedVersion(bytes[0]));
    }

    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes[1..1 + NONCE_SIZE]);
    let ciphertext = &bytes[1 + NONCE_SIZE..bytes.len() - MAC_SIZE];
    let mac = &bytes[bytes.len() - MAC_SIZE..];

    let (chacha_key, chacha_nonce, hmac_key) = message_keys(conversation_key, &nonce);

    // constant-time comparison through the Mac trait
    let mut verifier = HmacSha256::new_from_slice(&hmac_key).expect("hmac accepts any key length");
    verifier.update(&nonce);
    verifier.update(ciphertext);
    if verifier.verify_slice(mac).is_err() {
        return Err(CryptoError::MacMismatch);
    }

    let mut buffer = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&chacha_key.into(), &chacha_nonce.into());
    cipher.apply_keystream(&mut buffer);

    let plaintext = unpad(&buffer)?;
    String::from_utf8(plaintext)
        .map_err(|e| CryptoError::InvalidPayload(format!("invalid utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{generate_secret_key, get_public_key_hex};

    fn keypair() -> ([u8; 32], String) {
        let sk = generate_secret_key();
        let pk = get_public_key_hex(&sk).unwrap();
        (sk, pk)
    }

    #[test]
    fn conversation_key_is_symmetric() {
        let (sk_a, pk_a) = keypair();
        let (sk_b, pk_b) = keypair();

        let key_ab = conversation_key(&sk_a, &pk_b).unwrap();
        let key_ba = conversation_key(&sk_b, &pk_a).unwrap();
        assert_eq!(key_ab, key_ba);
    }

    #[test]
    fn encrypt_then_decrypt() {
        let (sk_a, _) = keypair();
        let (sk_b, pk_b) = keypair();
        let key = conversation_key(&sk_a, &pk_b).unwrap();
        // decrypting side derives the same key
        let _ = sk_b;

        let payload = encrypt(&key, "the lady doth protest too much").unwrap();
        assert_eq!(decrypt(&key, &payload).unwrap(), "the lady doth protest too much");
    }

    #[test]
    fn tampered_payload_fails_mac() {
        let (sk_a, _) = keypair();
        let (_, pk_b) = keypair();
        let key = conversation_key(&sk_a, &pk_b).unwrap();

        let payload = encrypt(&key, "secret").unwrap();
        let mut bytes = BASE64.decode(&payload).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let tampered = BASE64.encode(bytes);

        assert!(matches!(
            decrypt(&key, &tampered),
            Err(CryptoError::MacMismatch) | Err(CryptoError::InvalidPayload(_))
        ));
    }

    #[test]
    fn wrong_key_fails_mac() {
        let (sk_a, _) = keypair();
        let (_, pk_b) = keypair();
        let key = conversation_key(&sk_a, &pk_b).unwrap();
        let payload = encrypt(&key, "secret").unwrap();

        let (sk_c, _) = keypair();
        let (_, pk_d) = keypair();
        let other = conversation_key(&sk_c, &pk_d).unwrap();
        assert!(matches!(decrypt(&other, &payload), Err(CryptoError::MacMismatch)));
    }

    #[test]
    fn rejects_empty_and_oversized_plaintext() {
        let (sk_a, _) = keypair();
        let (_, pk_b) = keypair();
        let key = conversation_key(&sk_a, &pk_b).unwrap();

        assert!(matches!(
            encrypt(&key, ""),
            Err(CryptoError::InvalidPlaintextLength(0))
        ));
        let big = "x".repeat(MAX_PLAINTEXT_LEN + 1);
        assert!(encrypt(&key, &big).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        let (sk_a, _) = keypair();
        let (_, pk_b) = keypair();
        let key = conversation_key(&sk_a, &pk_b).unwrap();

        let payload = encrypt(&key, "versioned").unwrap();
        let mut bytes = BASE64.decode(&payload).unwrap();
        bytes[0] = 1;
        assert!(matches!(
            decrypt(&key, &BASE64.encode(bytes)),
            Err(CryptoError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn padding_buckets() {
        assert_eq!(calc_padded_len(1), 32);
        assert_eq!(calc_padded_len(32), 32);
        assert_eq!(calc_padded_len(33), 64);
        assert_eq!(calc_padded_len(37), 64);
        assert_eq!(calc_padded_len(255), 256);
        assert_eq!(calc_padded_len(257), 320);
        assert_eq!(calc_padded_len(1024), 1024);
    }

    #[test]
    fn padding_hides_exact_length() {
        let (sk_a, _) = keypair();
        let (_, pk_b) = keypair();
        let key = conversation_key(&sk_a, &pk_b).unwrap();

        let a = encrypt(&key, "ab").unwrap();
        let b = encrypt(&key, "abcdefghijklmnop").unwrap();
        assert_eq!(a.len(), b.len());
    }
}
