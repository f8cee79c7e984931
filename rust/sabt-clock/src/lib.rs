// sabt-clock: Deterministic clock abstraction for the whole service
//
// This crate is the only place where direct access to the system wall clock
// is permitted. Every other crate must inject a `Clock` (or a `FrozenClock`
// test double) and a `Sleeper`.

pub mod jitter;
pub mod timing;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use thiserror::Error;

pub use jitter::{deterministic_jitter, jitter_fraction};
pub use timing::{DeterministicTimer, MonotonicTimer, Timer, TimerHandle};

/// Result type for clock operations
pub type ClockResult<T> = Result<T, ClockError>;

/// Clock error types
#[derive(Debug, Error)]
pub enum ClockError {
    /// Frozen clock read before `set` was called
    #[error("CLOCK_NOT_AWARE: frozen clock not initialised; call set() first")]
    NotInitialized,

    /// Unknown IANA timezone name
    #[error("CONFIG_TZ_INVALID: {0} is not a valid IANA timezone")]
    InvalidTimezone(String),
}

/// Default service timezone
pub const DEFAULT_TIMEZONE: &str = "Asia/Tehran";

/// Injected time source
pub trait Clock: Send + Sync {
    /// Current timezone-aware instant
    fn now(&self) -> DateTime<Tz>;

    /// Monotonic seconds, suitable for latency measurement only
    fn monotonic(&self) -> f64;
}

/// Validate and resolve an IANA timezone name
pub fn validate_timezone(name: &str) -> ClockResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| ClockError::InvalidTimezone(name.to_string()))
}

/// System clock bound to a configured timezone
pub struct SystemClock {
    timezone: Tz,
    anchor: Instant,
}

impl SystemClock {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            anchor: Instant::now(),
        }
    }

    /// Create a clock for the given IANA timezone name
    pub fn for_timezone(name: &str) -> ClockResult<Self> {
        Ok(Self::new(validate_timezone(name)?))
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.timezone)
    }

    fn monotonic(&self) -> f64 {
        self.anchor.elapsed().as_secs_f64()
    }
}

/// Clock bound to the Tehran timezone
pub fn tehran_clock() -> SystemClock {
    SystemClock::new(chrono_tz::Asia::Tehran)
}

#[derive(Default)]
struct FrozenState {
    current: Option<DateTime<Tz>>,
    monotonic: f64,
}

/// Clock implementation that only moves when told to
///
/// Reads before `set` fail with `ClockError::NotInitialized`. Inputs are
/// `DateTime<Utc>` so a naive instant cannot reach the clock at all.
pub struct FrozenClock {
    timezone: Tz,
    state: Mutex<FrozenState>,
}

impl FrozenClock {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            state: Mutex::new(FrozenState::default()),
        }
    }

    /// Frozen clock in the Tehran timezone, preset to the given instant
    pub fn at(instant: DateTime<Utc>) -> Self {
        let clock = Self::new(chrono_tz::Asia::Tehran);
        clock.set(instant);
        clock
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.current = Some(instant.with_timezone(&self.timezone));
    }

    /// Advance the frozen instant by `delta_seconds`
    pub fn tick(&self, delta_seconds: f64) {
        let mut state = self.state.lock();
        if let Some(current) = state.current {
            let millis = (delta_seconds * 1000.0).round() as i64;
            state.current = Some(current + chrono::Duration::milliseconds(millis));
            state.monotonic += delta_seconds;
        }
    }

    /// Checked read used by code that must not panic on an unset clock
    pub fn try_now(&self) -> ClockResult<DateTime<Tz>> {
        self.state.lock().current.ok_or(ClockError::NotInitialized)
    }
}

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Tz> {
        // Unset frozen clocks are a test-harness bug; fall back to the epoch
        // so production paths stay panic-free.
        self.state
            .lock()
            .current
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap().with_timezone(&self.timezone))
    }

    fn monotonic(&self) -> f64 {
        self.state.lock().monotonic
    }
}

/// Synchronous sleep source for the blocking retry path
pub trait Sleeper: Send + Sync {
    fn sleep(&self, seconds: f64);
}

/// Asynchronous sleep source for the request path
#[async_trait::async_trait]
pub trait AsyncSleeper: Send + Sync {
    async fn sleep(&self, seconds: f64);
}

/// Real sleeper backed by the OS
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, seconds: f64) {
        std::thread::sleep(std::time::Duration::from_secs_f64(seconds.max(0.0)));
    }
}

/// Real async sleeper backed by the tokio timer wheel
pub struct TokioSleeper;

#[async_trait::async_trait]
impl AsyncSleeper for TokioSleeper {
    async fn sleep(&self, seconds: f64) {
        tokio::time::sleep(std::time::Duration::from_secs_f64(seconds.max(0.0))).await;
    }
}

/// Sleeper that advances a frozen clock instead of blocking
///
/// Retry tests assert on observed backoff without waiting for it.
pub struct TickSleeper {
    clock: Arc<FrozenClock>,
}

impl TickSleeper {
    pub fn new(clock: Arc<FrozenClock>) -> Self {
        Self { clock }
    }
}

impl Sleeper for TickSleeper {
    fn sleep(&self, seconds: f64) {
        self.clock.tick(seconds);
    }
}

#[async_trait::async_trait]
impl AsyncSleeper for TickSleeper {
    async fn sleep(&self, seconds: f64) {
        self.clock.tick(seconds);
        tokio::task::yield_now().await;
    }
}
