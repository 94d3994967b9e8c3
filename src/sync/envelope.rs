//! Passphrase-sealed payloads.
//!
//! Wire layout is `base64(salt[16] ‖ nonce[12] ‖ ciphertext ‖ tag[16])`. The key
//! is PBKDF2-HMAC-SHA256 over the shared secret with a fresh salt per payload,
//! so every seal pays the full derivation cost. The async variants push that
//! work onto the blocking pool.

use crate::error::{Result, SyncError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::{CryptoRng, RngCore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KDF_ITERATIONS: u32 = 100_000;
const KEY_LEN: usize = 32;

fn derive_key(secret: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, KDF_ITERATIONS, &mut key[..]);
    key
}

fn seal_bytes<R: RngCore + CryptoRng>(plaintext: &[u8], secret: &str, rng: &mut R) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let key = derive_key(secret, &salt);
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| SyncError::Encryption("aead encrypt failed".into()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

// every failure path collapses into the same error
fn open_bytes(blob: &str, secret: &str) -> Result<Vec<u8>> {
    let raw = BASE64.decode(blob.trim()).map_err(|_| SyncError::Decryption)?;
    if raw.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(SyncError::Decryption);
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(secret, salt);
    let cipher = ChaCha20Poly1305::new(GenericArray::from_slice(&key[..]));
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| SyncError::Decryption)
}

fn to_json<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| SyncError::Encryption(format!("serialize: {}", e)))
}

/// Serialize `payload` as JSON and seal it under `secret`.
pub fn seal<T: Serialize + ?Sized>(payload: &T, secret: &str) -> Result<String> {
    seal_with_rng(payload, secret, &mut rand::thread_rng())
}

pub fn seal_with_rng<T, R>(payload: &T, secret: &str, rng: &mut R) -> Result<String>
where
    T: Serialize + ?Sized,
    R: RngCore + CryptoRng,
{
    seal_bytes(&to_json(payload)?, secret, rng)
}

/// Open a sealed blob and parse it back into `T`.
pub fn open<T: DeserializeOwned>(blob: &str, secret: &str) -> Result<T> {
    let plaintext = Zeroizing::new(open_bytes(blob, secret)?);
    serde_json::from_slice(&plaintext).map_err(|_| SyncError::Decryption)
}

pub async fn seal_async<T: Serialize + ?Sized>(payload: &T, secret: &str) -> Result<String> {
    let plaintext = to_json(payload)?;
    let secret = Zeroizing::new(secret.to_string());
    tokio::task::spawn_blocking(move || seal_bytes(&plaintext, &secret, &mut rand::thread_rng()))
        .await
        .map_err(|e| SyncError::Encryption(format!("crypto task: {}", e)))?
}

pub async fn open_async<T: DeserializeOwned>(blob: String, secret: &str) -> Result<T> {
    let secret = Zeroizing::new(secret.to_string());
    let plaintext = tokio::task::spawn_blocking(move || open_bytes(&blob, &secret))
        .await
        .map_err(|e| SyncError::Protocol(format!("crypto task: {}", e)))??;
    let plaintext = Zeroizing::new(plaintext);
    serde_json::from_slice(&plaintext).map_err(|_| SyncError::Decryption)
}
