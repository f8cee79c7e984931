//! Time-boxed readiness probes
//!
//! Each probe checks one collaborator. The aggregator enforces a per-call
//! timeout so a hung dependency can never stall the others, and records
//! every result in `readiness_checks{component,status}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sabt_metrics::ServiceMetrics;
use sabt_store::KeyValueStore;
use serde::Serialize;

/// Result of one probe call
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub component: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One health check over a collaborator
#[async_trait]
pub trait Probe: Send + Sync {
    fn component(&self) -> &str;

    async fn check(&self) -> Result<(), String>;
}

/// Probe over the key-value store
pub struct StoreProbe {
    store: Arc<dyn KeyValueStore>,
}

impl StoreProbe {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Probe for StoreProbe {
    fn component(&self) -> &str {
        "store"
    }

    async fn check(&self) -> Result<(), String> {
        self.store
            .get("probe:ping")
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// Minimal database surface required by readiness checking; the real
/// adapter lives outside this service.
#[async_trait]
pub trait PingableDatabase: Send + Sync {
    async fn ping(&self) -> Result<(), String>;
}

/// Probe over the database collaborator
pub struct DatabaseProbe {
    database: Arc<dyn PingableDatabase>,
}

impl DatabaseProbe {
    pub fn new(database: Arc<dyn PingableDatabase>) -> Self {
        Self { database }
    }
}

#[async_trait]
impl Probe for DatabaseProbe {
    fn component(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        self.database.ping().await
    }
}

async fn run_one(probe: &dyn Probe, timeout: Duration) -> ProbeResult {
    let component = probe.component().to_string();
    match tokio::time::timeout(timeout, probe.check()).await {
        Ok(Ok(())) => ProbeResult {
            component,
            healthy: true,
            detail: None,
        },
        Ok(Err(detail)) => ProbeResult {
            component,
            healthy: false,
            detail: Some(detail),
        },
        Err(_) => ProbeResult {
            component,
            healthy: false,
            detail: Some(format!("timed out after {}ms", timeout.as_millis())),
        },
    }
}

/// Run all probes concurrently under the per-call timeout.
///
/// `status_labels` is the (ok, failed) pair recorded in
/// `readiness_checks{component,status}`; liveness and readiness report
/// under different labels.
pub async fn run_probes(
    probes: &[Arc<dyn Probe>],
    timeout: Duration,
    metrics: &ServiceMetrics,
    status_labels: (&str, &str),
) -> Vec<ProbeResult> {
    let futures = probes.iter().map(|probe| run_one(probe.as_ref(), timeout));
    let results = futures::future::join_all(futures).await;
    for result in &results {
        let status = if result.healthy {
            status_labels.0
        } else {
            status_labels.1
        };
        metrics
            .readiness_checks
            .with_label_values(&[&result.component, status])
            .inc();
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowProbe;

    #[async_trait]
    impl Probe for SlowProbe {
        fn component(&self) -> &str {
            "slow"
        }

        async fn check(&self) -> Result<(), String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl Probe for FailingProbe {
        fn component(&self) -> &str {
            "broken"
        }

        async fn check(&self) -> Result<(), String> {
            Err("connection refused".to_string())
        }
    }

    struct OkProbe;

    #[async_trait]
    impl Probe for OkProbe {
        fn component(&self) -> &str {
            "fine"
        }

        async fn check(&self) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_probe_times_out_without_blocking_others() {
        let metrics = ServiceMetrics::new("probe_timeout_test").unwrap();
        let probes: Vec<Arc<dyn Probe>> = vec![Arc::new(SlowProbe), Arc::new(OkProbe)];
        let started = std::time::Instant::now();
        let results = run_probes(&probes, Duration::from_millis(50), &metrics, ("healthy", "degraded")).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!results[0].healthy);
        assert!(results[0].detail.as_ref().unwrap().contains("timed out"));
        assert!(results[1].healthy);
    }

    #[tokio::test]
    async fn failures_carry_detail_and_metric() {
        let metrics = ServiceMetrics::new("probe_fail_test").unwrap();
        let probes: Vec<Arc<dyn Probe>> = vec![Arc::new(FailingProbe)];
        let results = run_probes(&probes, Duration::from_millis(100), &metrics, ("healthy", "degraded")).await;
        assert!(!results[0].healthy);
        assert_eq!(results[0].detail.as_deref(), Some("connection refused"));
        assert_eq!(
            metrics
                .readiness_checks
                .with_label_values(&["broken", "degraded"])
                .get(),
            1
        );
    }
}
