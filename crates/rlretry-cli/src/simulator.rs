//! Mock server with a handful of failure behaviours
//!
//! Each request may fail in one of four ways, checked in order:
//! - random: a small fixed probability on any request (a 504)
//! - clustered outage: every request during a recurring outage window (a 502)
//! - too busy: `busy_limit` requests inside `busy_window`, counting the current one (a 429)
//! - repeatable: always for parameters starting with `k` (a 404)
//!
//! The server's clock runs `speedup` times faster than wall time.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::time::Instant;

use rlretry::State;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerFailure {
    #[error("random failure")]
    Random,

    #[error("server in clustered outage")]
    ClusteredOutage,

    #[error("too many requests")]
    TooBusy,

    #[error("request can never succeed")]
    Repeatable,
}

impl ServerFailure {
    pub fn label(self) -> &'static str {
        match self {
            ServerFailure::Random => "RandomFailure",
            ServerFailure::ClusteredOutage => "ClusteredFailure",
            ServerFailure::TooBusy => "TooBusyFailure",
            ServerFailure::Repeatable => "RepeatableFailure",
        }
    }
}

/// Failure classifier for the retry policy
pub fn classify(failure: &ServerFailure) -> Option<State> {
    Some(State::new(failure.label()))
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Simulated seconds per wall-clock second
    pub speedup: f64,
    pub random_failure_rate: f64,
    pub outage_period: Duration,
    pub outage_length: Duration,
    pub busy_limit: usize,
    pub busy_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            speedup: 30.0,
            random_failure_rate: 0.02,
            outage_period: Duration::from_secs(300),
            outage_length: Duration::from_secs(30),
            busy_limit: 100,
            busy_window: Duration::from_secs(60),
        }
    }
}

pub struct MockServer {
    config: ServerConfig,
    started: Instant,
    recent: Mutex<VecDeque<Duration>>,
    rng: Mutex<StdRng>,
}

impl MockServer {
    pub fn new(config: ServerConfig, seed: u64) -> Self {
        Self {
            config,
            started: Instant::now(),
            recent: Mutex::new(VecDeque::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Time on the server's accelerated clock
    pub fn now(&self) -> Duration {
        self.started.elapsed().mul_f64(self.config.speedup)
    }

    /// Convert simulated time to wall-clock time
    pub fn to_wall(&self, simulated: Duration) -> Duration {
        simulated.div_f64(self.config.speedup)
    }

    /// Random request parameter
    pub fn parameter(&self) -> String {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        (0..6).map(|_| char::from(rng.gen_range(b'a'..=b'z'))).collect()
    }

    pub fn handle(&self, parameter: &str) -> Result<(), ServerFailure> {
        let now = self.now();

        let roll: f64 = self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen();
        if roll < self.config.random_failure_rate {
            return Err(ServerFailure::Random);
        }
        if self.in_outage(now) {
            return Err(ServerFailure::ClusteredOutage);
        }
        if self.too_busy(now) {
            return Err(ServerFailure::TooBusy);
        }
        if parameter.starts_with('k') {
            return Err(ServerFailure::Repeatable);
        }
        Ok(())
    }

    fn in_outage(&self, now: Duration) -> bool {
        let period = self.config.outage_period.as_nanos();
        period > 0 && now.as_nanos() % period < self.config.outage_length.as_nanos()
    }

    fn too_busy(&self, now: Duration) -> bool {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_back(now);
        // The request just made counts towards the limit
        if recent.len() >= self.config.busy_limit {
            if let Some(oldest) = recent.pop_front() {
                return now.saturating_sub(oldest) < self.config.busy_window;
            }
        }
        false
    }
}
