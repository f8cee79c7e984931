// sabt: Batch student-mentor allocation and Excel-safe export service
//
// The HTTP surface wraps every request in RateLimit → Idempotency → Auth,
// hands export work to the background job runner, and publishes results as
// signed, time-limited downloads. Domain logic lives in the rust/ crates;
// this crate wires them together.

pub mod app;
pub mod config;
pub mod errors;
pub mod logging;
pub mod middleware;
pub mod probes;
pub mod routes;
pub mod state;
pub mod tokens;

pub use app::{Application, ApplicationBuilder};
pub use config::{AppConfig, ConfigError};
pub use logging::JsonLogLayer;
pub use probes::{DatabaseProbe, PingableDatabase, Probe, ProbeResult, StoreProbe};
pub use state::{AppState, CorrelationId, Diagnostics, MiddlewareChain};
pub use tokens::{Actor, TokenDefinition, TokenRegistry};
