//! Shared application state and request-scoped markers

use std::sync::Arc;

use parking_lot::Mutex;
use sabt_allocation::AllocationEngine;
use sabt_clock::{Clock, Timer};
use sabt_jobs::ExportJobRunner;
use sabt_metrics::ServiceMetrics;
use sabt_signing::DualKeySigner;
use sabt_store::KeyValueStore;
use serde::Serialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::probes::Probe;
use crate::tokens::TokenRegistry;

/// Correlation id attached to every request
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Middleware tags in execution order, for diagnostics and tests
#[derive(Debug, Clone, Default)]
pub struct MiddlewareChain(pub Vec<String>);

/// Snapshot of the last observed middleware decisions
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticsSnapshot {
    pub last_chain: Vec<String>,
    pub last_rate_limit: Option<Value>,
    pub last_idempotency: Option<Value>,
    pub last_auth: Option<Value>,
}

/// Diagnostics sink; a no-op unless enabled in configuration
pub struct Diagnostics {
    enabled: bool,
    inner: Mutex<DiagnosticsSnapshot>,
}

impl Diagnostics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            inner: Mutex::new(DiagnosticsSnapshot::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_rate_limit(&self, decision: &str, duration: f64) {
        if !self.enabled {
            return;
        }
        self.inner.lock().last_rate_limit = Some(serde_json::json!({
            "decision": decision,
            "duration": duration,
        }));
    }

    pub fn record_idempotency(&self, outcome: &str, duration: f64) {
        if !self.enabled {
            return;
        }
        self.inner.lock().last_idempotency = Some(serde_json::json!({
            "outcome": outcome,
            "duration": duration,
        }));
    }

    pub fn record_auth(&self, value: Value) {
        if !self.enabled {
            return;
        }
        self.inner.lock().last_auth = Some(value);
    }

    pub fn record_chain(&self, chain: &[String]) {
        if !self.enabled {
            return;
        }
        self.inner.lock().last_chain = chain.to_vec();
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.inner.lock().clone()
    }
}

/// Application-wide dependency container
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
    pub timer: Arc<dyn Timer>,
    pub metrics: Arc<ServiceMetrics>,
    pub store: Arc<dyn KeyValueStore>,
    pub tokens: Arc<TokenRegistry>,
    pub signer: Arc<DualKeySigner>,
    pub runner: Arc<ExportJobRunner>,
    pub engine: Arc<AllocationEngine>,
    pub probes: Arc<Vec<Arc<dyn Probe>>>,
    pub diagnostics: Arc<Diagnostics>,
    pub output_dir: std::path::PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_diagnostics_records_nothing() {
        let diagnostics = Diagnostics::new(false);
        diagnostics.record_rate_limit("block", 0.1);
        diagnostics.record_chain(&["RateLimit".to_string()]);
        let snapshot = diagnostics.snapshot();
        assert!(snapshot.last_rate_limit.is_none());
        assert!(snapshot.last_chain.is_empty());
    }

    #[test]
    fn enabled_diagnostics_keeps_latest_state() {
        let diagnostics = Diagnostics::new(true);
        diagnostics.record_rate_limit("allow", 0.01);
        diagnostics.record_rate_limit("block", 0.02);
        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.last_rate_limit.unwrap()["decision"], "block");
    }
}
