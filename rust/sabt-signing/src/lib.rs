// sabt-signing: Time-limited signed download URLs
//
// Downloads authenticate themselves: the URL carries a base64url path, a key
// id, an expiry, and an HMAC-SHA256 signature over a canonical string. Two
// keys (active + next) verify at any time so rotation never breaks live
// links.

pub mod rotation;

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sabt_clock::Clock;
use sabt_metrics::ServiceMetrics;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Result type for signing operations
pub type SignResult<T> = Result<T, SignError>;

/// Signed URL failures; `outcome` feeds `download_signed_total`
#[derive(Debug, Error)]
pub enum SignError {
    #[error("لینک دانلود منقضی شده است.")]
    Expired,

    #[error("کلید امضا ناشناخته است.")]
    UnknownKid,

    #[error("توکن نامعتبر است.")]
    Forged,

    #[error("درخواست دانلود ناقص است.")]
    Malformed,

    #[error("مسیر درخواستی مجاز نیست.")]
    PathTraversal,

    #[error("هیچ کلید فعالی تنظیم نشده است.")]
    NoActiveKey,

    #[error("کلید بعدی برای ارتقا وجود ندارد.")]
    NoNextKey,

    #[error("پروندهٔ کلیدهای امضا قابل استفاده نیست: {0}")]
    KeySetIo(String),
}

impl SignError {
    pub fn outcome(&self) -> &'static str {
        match self {
            SignError::Expired => "expired",
            SignError::UnknownKid => "unknown_kid",
            SignError::Forged => "forged",
            SignError::Malformed => "malformed",
            SignError::PathTraversal => "path_traversal",
            SignError::NoActiveKey => "no_active_key",
            SignError::NoNextKey => "no_next_key",
            SignError::KeySetIo(_) => "key_set_io",
        }
    }
}

/// Key lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Active,
    Next,
}

/// One signing key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningKey {
    pub kid: String,
    pub secret: String,
    pub state: KeyState,
}

/// Ordered key set with exactly one active key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SigningKeySet {
    keys: Vec<SigningKey>,
}

impl SigningKeySet {
    pub fn new(keys: Vec<SigningKey>) -> Self {
        Self { keys }
    }

    pub fn from_json(raw: &str) -> SignResult<Self> {
        let set: Self = serde_json::from_str(raw).map_err(|_| SignError::Malformed)?;
        set.active()?;
        Ok(set)
    }

    pub fn keys(&self) -> &[SigningKey] {
        &self.keys
    }

    pub fn active(&self) -> SignResult<&SigningKey> {
        self.keys
            .iter()
            .find(|key| key.state == KeyState::Active)
            .ok_or(SignError::NoActiveKey)
    }

    pub fn next(&self) -> Option<&SigningKey> {
        self.keys.iter().find(|key| key.state == KeyState::Next)
    }

    /// Key usable for verification (active or next states only)
    pub fn verification_key(&self, kid: &str) -> Option<&SigningKey> {
        self.keys
            .iter()
            .find(|key| key.kid == kid && matches!(key.state, KeyState::Active | KeyState::Next))
    }
}

/// Components of an issued URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub path: String,
    pub signed: String,
    pub kid: String,
    pub exp: i64,
    pub sig: String,
}

impl SignedUrl {
    pub fn as_query(&self) -> String {
        format!(
            "signed={}&kid={}&exp={}&sig={}",
            self.signed, self.kid, self.exp, self.sig
        )
    }
}

fn normalize_path(path: &str) -> SignResult<String> {
    let mut normalized = path.replace('\\', "/");
    while normalized.contains("//") {
        normalized = normalized.replace("//", "/");
    }
    if normalized.starts_with("../") || normalized.contains("/../") || normalized == ".." {
        return Err(SignError::PathTraversal);
    }
    Ok(normalized)
}

fn canonical(method: &str, path: &str, query: &BTreeMap<String, String>, exp: i64) -> Vec<u8> {
    let query_text = query
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}\n{path}\n{query_text}\n{exp}", method.to_uppercase()).into_bytes()
}

fn sign_bytes(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn verify_bytes(secret: &str, payload: &[u8], sig: &str) -> SignResult<()> {
    let provided = URL_SAFE_NO_PAD.decode(sig).map_err(|_| SignError::Forged)?;
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload);
    mac.verify_slice(&provided).map_err(|_| SignError::Forged)
}

/// Generate and verify download URLs using dual rotating keys
pub struct DualKeySigner {
    keys: RwLock<SigningKeySet>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ServiceMetrics>,
    default_ttl_seconds: u64,
    base_path: String,
}

impl DualKeySigner {
    pub fn new(
        keys: SigningKeySet,
        clock: Arc<dyn Clock>,
        metrics: Arc<ServiceMetrics>,
        default_ttl_seconds: u64,
    ) -> Self {
        Self {
            keys: RwLock::new(keys),
            clock,
            metrics,
            default_ttl_seconds,
            base_path: "/download".to_string(),
        }
    }

    /// Swap in a freshly rotated key set
    pub fn reload_keys(&self, keys: SigningKeySet) {
        *self.keys.write() = keys;
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .download_signed_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Issue a signed URL for `path`
    pub fn issue(&self, path: &str, ttl_seconds: Option<u64>) -> SignResult<SignedUrl> {
        let normalized = normalize_path(path).inspect_err(|err| self.count(err.outcome()))?;
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds).max(1);
        let exp = self.clock.now().timestamp() + ttl as i64;
        let keys = self.keys.read();
        let active = keys.active()?;
        let payload = canonical("GET", &normalized, &BTreeMap::new(), exp);
        let sig = sign_bytes(&active.secret, &payload);
        let signed = URL_SAFE_NO_PAD.encode(normalized.as_bytes());
        self.count("issued");
        Ok(SignedUrl {
            path: normalized,
            signed,
            kid: active.kid.clone(),
            exp,
            sig,
        })
    }

    /// Full relative URL, query included
    pub fn sign(&self, file_path: &str, ttl_seconds: Option<u64>) -> SignResult<String> {
        let components = self.issue(file_path, ttl_seconds)?;
        Ok(format!("{}?{}", self.base_path, components.as_query()))
    }

    /// Verify an incoming quadruple and return the decoded path
    pub fn verify(&self, signed: &str, kid: &str, exp: i64, sig: &str) -> SignResult<String> {
        match self.verify_inner(signed, kid, exp, sig) {
            Ok(path) => {
                self.count("ok");
                Ok(path)
            }
            Err(error) => {
                self.count(error.outcome());
                Err(error)
            }
        }
    }

    fn verify_inner(&self, signed: &str, kid: &str, exp: i64, sig: &str) -> SignResult<String> {
        let decoded = URL_SAFE_NO_PAD
            .decode(signed)
            .map_err(|_| SignError::Malformed)?;
        let path = String::from_utf8(decoded).map_err(|_| SignError::Malformed)?;
        let path = normalize_path(&path)?;
        let now = self.clock.now().timestamp();
        if exp <= now {
            return Err(SignError::Expired);
        }
        let keys = self.keys.read();
        let key = keys.verification_key(kid).ok_or(SignError::UnknownKid)?;
        let payload = canonical("GET", &path, &BTreeMap::new(), exp);
        verify_bytes(&key.secret, &payload, sig)?;
        Ok(path)
    }

    /// Verify a raw query-parameter map; any missing or malformed member is
    /// a `malformed` outcome.
    pub fn verify_query(&self, query: &BTreeMap<String, String>) -> SignResult<String> {
        let (Some(signed), Some(kid), Some(exp), Some(sig)) = (
            query.get("signed"),
            query.get("kid"),
            query.get("exp"),
            query.get("sig"),
        ) else {
            self.count("malformed");
            return Err(SignError::Malformed);
        };
        let Ok(exp) = exp.parse::<i64>() else {
            self.count("malformed");
            return Err(SignError::Malformed);
        };
        self.verify(signed, kid, exp, sig)
    }
}
