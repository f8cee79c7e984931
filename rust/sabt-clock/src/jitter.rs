//! Deterministic backoff jitter
//!
//! Retries must be reproducible across runs and across processes, so the
//! jitter factor is derived from a BLAKE2b digest of `seed:attempt` rather
//! than a random source.

use blake2::{Blake2b512, Digest};

/// Compute the backoff delay for `attempt` (1-indexed).
///
/// `base * 2^(attempt-1) * (0.9 + 0.2u)` where `u ∈ [0, 1)` comes from the
/// first 8 bytes of `BLAKE2b(seed:attempt)`. The result never exceeds
/// `max_delay`.
pub fn deterministic_jitter(base: f64, attempt: u32, seed: &str, max_delay: f64) -> f64 {
    let attempt = attempt.max(1);
    let raw = base * 2f64.powi(attempt as i32 - 1);
    let delay = raw * (0.9 + 0.2 * jitter_fraction(seed, attempt));
    delay.min(max_delay)
}

/// The `u ∈ [0, 1)` term for `seed:attempt`, exposed for retry policies
/// with a non-doubling growth factor.
pub fn jitter_fraction(seed: &str, attempt: u32) -> f64 {
    let mut hasher = Blake2b512::new();
    hasher.update(format!("{seed}:{attempt}").as_bytes());
    let digest = hasher.finalize();
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    // Top 53 bits give an exact f64 in [0, 1).
    (u64::from_be_bytes(word) >> 11) as f64 / (1u64 << 53) as f64
}
