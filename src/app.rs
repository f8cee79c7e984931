//! Application assembly
//!
//! All process state lives in an explicit `Application` value built here;
//! tests construct their own instances with frozen clocks and in-memory
//! stores to guarantee isolation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tracing::warn;

use sabt_allocation::{
    AllocationConfig, AllocationEngine, EligibilityPolicy, InMemoryManagerCenters,
    InMemorySpecialSchools, ManagerCentersProvider, SpecialSchoolsProvider,
};
use sabt_clock::{Clock, MonotonicTimer, SystemClock, Timer, TokioSleeper};
use sabt_export::{
    ExportDataSource, ExportFilters, ExportResult, ExportSnapshot, SabtExporter,
    SpecialSchoolsRoster, StudentExportRow, SABT_V1,
};
use sabt_jobs::ExportJobRunner;
use sabt_metrics::ServiceMetrics;
use sabt_retry::RetryPolicy;
use sabt_signing::{DualKeySigner, KeyState, SigningKey, SigningKeySet};
use sabt_store::{InMemoryStore, KeyValueStore, RedisStore};

use crate::config::AppConfig;
use crate::probes::{Probe, StoreProbe};
use crate::routes::build_router;
use crate::state::{AppState, Diagnostics};
use crate::tokens::TokenRegistry;

/// Data source stand-in until a database adapter is wired in; every export
/// resolves to the empty state.
struct UnconfiguredDataSource;

impl ExportDataSource for UnconfiguredDataSource {
    fn fetch_rows(
        &self,
        _filters: &ExportFilters,
        _snapshot: &ExportSnapshot,
    ) -> ExportResult<Vec<StudentExportRow>> {
        Ok(Vec::new())
    }
}

/// Roster stand-in treating every school as regular
struct EmptyRoster;

impl SpecialSchoolsRoster for EmptyRoster {
    fn is_special(&self, _year: i32, _school_code: Option<i64>) -> bool {
        false
    }
}

/// The assembled service
pub struct Application {
    pub state: AppState,
}

impl Application {
    pub fn builder(config: AppConfig) -> ApplicationBuilder {
        ApplicationBuilder::new(config)
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Bind and serve until shutdown
    pub async fn serve(self, bind: &str) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind {bind}"))?;
        tracing::info!(bind = %bind, "service listening");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .context("server terminated")?;
        Ok(())
    }
}

/// Builder with injectable collaborators
pub struct ApplicationBuilder {
    config: AppConfig,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<dyn Timer>>,
    metrics: Option<Arc<ServiceMetrics>>,
    store: Option<Arc<dyn KeyValueStore>>,
    tokens: Option<TokenRegistry>,
    signing_keys: Option<SigningKeySet>,
    data_source: Option<Arc<dyn ExportDataSource>>,
    roster: Option<Arc<dyn SpecialSchoolsRoster>>,
    manager_centers: Option<Arc<dyn ManagerCentersProvider>>,
    special_schools: Option<Arc<dyn SpecialSchoolsProvider>>,
    extra_probes: Vec<Arc<dyn Probe>>,
    output_dir: Option<PathBuf>,
}

impl ApplicationBuilder {
    fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: None,
            timer: None,
            metrics: None,
            store: None,
            tokens: None,
            signing_keys: None,
            data_source: None,
            roster: None,
            manager_centers: None,
            special_schools: None,
            extra_probes: Vec::new(),
            output_dir: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ServiceMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tokens(mut self, tokens: TokenRegistry) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn signing_keys(mut self, keys: SigningKeySet) -> Self {
        self.signing_keys = Some(keys);
        self
    }

    pub fn data_source(mut self, data_source: Arc<dyn ExportDataSource>) -> Self {
        self.data_source = Some(data_source);
        self
    }

    pub fn roster(mut self, roster: Arc<dyn SpecialSchoolsRoster>) -> Self {
        self.roster = Some(roster);
        self
    }

    pub fn manager_centers(mut self, provider: Arc<dyn ManagerCentersProvider>) -> Self {
        self.manager_centers = Some(provider);
        self
    }

    pub fn special_schools(mut self, provider: Arc<dyn SpecialSchoolsProvider>) -> Self {
        self.special_schools = Some(provider);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.extra_probes.push(probe);
        self
    }

    pub fn output_dir(mut self, output_dir: PathBuf) -> Self {
        self.output_dir = Some(output_dir);
        self
    }

    fn load_signing_keys(config: &AppConfig) -> SigningKeySet {
        let raw = config.secret_from_env(&config.auth.signing_keys_env);
        if !raw.is_empty() {
            match SigningKeySet::from_json(&raw) {
                Ok(keys) => return keys,
                Err(error) => {
                    warn!(error = %error, "signing key set from environment is unusable");
                }
            }
        }
        // An ephemeral key keeps the service functional; issued URLs die
        // with the process.
        warn!("no signing keys configured; generating an ephemeral key");
        SigningKeySet::new(vec![SigningKey {
            kid: "EPHM".to_string(),
            secret: uuid::Uuid::new_v4().to_string(),
            state: KeyState::Active,
        }])
    }

    pub async fn build(self) -> anyhow::Result<Application> {
        let config = Arc::new(self.config);

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(
                SystemClock::for_timezone(&config.timezone)
                    .context("invalid timezone in configuration")?,
            ),
        };
        let timer: Arc<dyn Timer> = self.timer.unwrap_or_else(|| Arc::new(MonotonicTimer));
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                ServiceMetrics::new(&config.metrics_namespace)
                    .context("metrics registry construction failed")?,
            ),
        };

        let store: Arc<dyn KeyValueStore> = match self.store {
            Some(store) => store,
            None => match &config.redis.dsn {
                Some(dsn) => Arc::new(
                    RedisStore::connect(dsn, config.redis.namespace.clone())
                        .await
                        .context("redis connection failed")?,
                ),
                None => Arc::new(InMemoryStore::new(
                    config.redis.namespace.clone(),
                    Arc::clone(&clock),
                )),
            },
        };

        let tokens = Arc::new(
            self.tokens
                .unwrap_or_else(|| TokenRegistry::from_env(&config)),
        );

        let signing_keys = self
            .signing_keys
            .unwrap_or_else(|| Self::load_signing_keys(&config));
        let signer = Arc::new(DualKeySigner::new(
            signing_keys,
            Arc::clone(&clock),
            Arc::clone(&metrics),
            config.auth.download_url_ttl_seconds,
        ));

        let output_dir = self
            .output_dir
            .unwrap_or_else(|| PathBuf::from(&config.export.output_dir));
        let data_source = self
            .data_source
            .unwrap_or_else(|| Arc::new(UnconfiguredDataSource));
        let roster = self.roster.unwrap_or_else(|| Arc::new(EmptyRoster));

        let exporter = Arc::new(SabtExporter::new(
            data_source,
            roster,
            output_dir.clone(),
            SABT_V1,
            Arc::clone(&clock),
            Box::new(sabt_clock::ThreadSleeper),
            RetryPolicy::default(),
            Arc::clone(&metrics),
        ));
        let runner = Arc::new(ExportJobRunner::new(
            exporter,
            Arc::clone(&store),
            Arc::clone(&metrics),
            Arc::clone(&clock),
            Arc::new(TokioSleeper),
            config.export.max_retries,
        ));

        let manager_centers = self
            .manager_centers
            .unwrap_or_else(|| Arc::new(InMemoryManagerCenters::default()));
        let special_schools = self
            .special_schools
            .unwrap_or_else(|| Arc::new(InMemorySpecialSchools::default()));
        let engine = Arc::new(AllocationEngine::new(
            EligibilityPolicy::new(
                special_schools,
                manager_centers,
                AllocationConfig {
                    fast_fail: config.allocation.fast_fail,
                    trace_limit_rejected: config.allocation.trace_limit_rejected,
                },
            ),
            Some(Arc::clone(&metrics)),
        ));

        let mut probes: Vec<Arc<dyn Probe>> = vec![Arc::new(StoreProbe::new(Arc::clone(&store)))];
        probes.extend(self.extra_probes);

        let diagnostics = Arc::new(Diagnostics::new(config.enable_diagnostics));

        Ok(Application {
            state: AppState {
                config,
                clock,
                timer,
                metrics,
                store,
                tokens,
                signer,
                runner,
                engine,
                probes: Arc::new(probes),
                diagnostics,
                output_dir,
            },
        })
    }
}
