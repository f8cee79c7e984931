//! Offline signing-key rotation
//!
//! Rotation is an admin operation over the key set file, not a request-path
//! concern. `generate` mints a fresh `next` key; `promote` makes the current
//! `next` key active and drops the previous active key. Verifiers accept
//! both states, so a generate → deploy → promote sequence never invalidates
//! live URLs.

use std::path::Path;

use rand::RngCore;
use sabt_metrics::ServiceMetrics;

use crate::{KeyState, SignError, SignResult, SigningKey, SigningKeySet};

/// Read a key set from a JSON file
pub fn load_key_set(path: &Path) -> SignResult<SigningKeySet> {
    let raw =
        std::fs::read_to_string(path).map_err(|err| SignError::KeySetIo(err.to_string()))?;
    SigningKeySet::from_json(&raw)
}

/// Persist a key set to a JSON file
pub fn save_key_set(path: &Path, keys: &SigningKeySet) -> SignResult<()> {
    let payload =
        serde_json::to_string_pretty(keys).map_err(|err| SignError::KeySetIo(err.to_string()))?;
    std::fs::write(path, payload).map_err(|err| SignError::KeySetIo(err.to_string()))
}

fn random_hex(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buffer);
    hex::encode(buffer)
}

/// Mint a fresh `next` key, replacing any existing one
pub fn generate(path: &Path, kid: Option<String>, metrics: &ServiceMetrics) -> SignResult<SigningKeySet> {
    let current = load_key_set(path)?;
    let kid = kid.unwrap_or_else(|| random_hex(4).to_uppercase());
    let mut keys: Vec<SigningKey> = current
        .keys()
        .iter()
        .filter(|key| key.state != KeyState::Next)
        .cloned()
        .collect();
    keys.push(SigningKey {
        kid,
        secret: random_hex(32),
        state: KeyState::Next,
    });
    let rotated = SigningKeySet::new(keys);
    save_key_set(path, &rotated)?;
    metrics
        .token_rotation_total
        .with_label_values(&["generate"])
        .inc();
    Ok(rotated)
}

/// Promote the `next` key to active, dropping the previous active key
pub fn promote(path: &Path, metrics: &ServiceMetrics) -> SignResult<SigningKeySet> {
    let current = load_key_set(path)?;
    let next = current.next().ok_or(SignError::NoNextKey)?.clone();
    let keys = vec![SigningKey {
        kid: next.kid,
        secret: next.secret,
        state: KeyState::Active,
    }];
    let rotated = SigningKeySet::new(keys);
    save_key_set(path, &rotated)?;
    metrics
        .token_rotation_total
        .with_label_values(&["promote"])
        .inc();
    Ok(rotated)
}
