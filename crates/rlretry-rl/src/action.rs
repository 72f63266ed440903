//! Discrete retry actions and the delay ladder they index into

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RlError};

/// Default ladder: retry immediately, or after 1.0s, 1.1s, 1.2s or 1.5s.
pub const DEFAULT_DELAYS_MS: [u64; 5] = [0, 1000, 1100, 1200, 1500];

/// A single retry decision.
///
/// The derived ordering is the tie-break preference used by action
/// selection: `Abort` first, then retry tiers from shortest to longest delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Action {
    /// Give up; no further attempt is made.
    Abort,

    /// Retry after the delay of the given ladder tier.
    Retry(usize),
}

impl Action {
    /// Column index in a value table (abort is column 0)
    pub fn index(self) -> usize {
        match self {
            Action::Abort => 0,
            Action::Retry(tier) => tier + 1,
        }
    }

    /// Inverse of [`Action::index`]
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Action::Abort,
            i => Action::Retry(i - 1),
        }
    }

    pub fn is_abort(self) -> bool {
        matches!(self, Action::Abort)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Abort => f.write_str("abort"),
            Action::Retry(tier) => write!(f, "retry:{tier}"),
        }
    }
}

impl FromStr for Action {
    type Err = RlError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "abort" {
            return Ok(Action::Abort);
        }
        s.strip_prefix("retry:")
            .and_then(|tier| tier.parse::<usize>().ok())
            .map(Action::Retry)
            .ok_or_else(|| RlError::UnknownAction(s.to_string()))
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.to_string()
    }
}

impl TryFrom<String> for Action {
    type Error = RlError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Ordered set of retry delays.
///
/// Fixed for the lifetime of an agent/environment pair: values learned under
/// one ladder are meaningless under another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub struct DelayLadder {
    delays: Vec<Duration>,
}

impl DelayLadder {
    /// Build a ladder; delays must be non-empty and ascending.
    pub fn new(delays: Vec<Duration>) -> Result<Self> {
        if delays.is_empty() {
            return Err(RlError::InvalidLadder(
                "at least one retry delay is required".to_string(),
            ));
        }
        if delays.windows(2).any(|w| w[0] > w[1]) {
            return Err(RlError::InvalidLadder(format!(
                "delays must be ascending, got {delays:?}"
            )));
        }
        Ok(Self { delays })
    }

    /// Build a ladder from millisecond values
    pub fn from_millis(delays_ms: &[u64]) -> Result<Self> {
        Self::new(delays_ms.iter().copied().map(Duration::from_millis).collect())
    }

    /// Number of actions including abort
    pub fn action_space_size(&self) -> usize {
        self.delays.len() + 1
    }

    /// Every action in preference order
    pub fn actions(&self) -> impl Iterator<Item = Action> + '_ {
        (0..self.action_space_size()).map(Action::from_index)
    }

    /// Delay before the retry, or `None` for abort and unknown tiers
    pub fn delay(&self, action: Action) -> Option<Duration> {
        match action {
            Action::Abort => None,
            Action::Retry(tier) => self.delays.get(tier).copied(),
        }
    }

    pub fn contains(&self, action: Action) -> bool {
        action.index() < self.action_space_size()
    }

    /// Longest retry delay
    pub fn max_delay(&self) -> Duration {
        self.delays.last().copied().unwrap_or_default()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for DelayLadder {
    fn default() -> Self {
        Self {
            delays: DEFAULT_DELAYS_MS
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

impl TryFrom<Vec<u64>> for DelayLadder {
    type Error = RlError;

    fn try_from(value: Vec<u64>) -> Result<Self> {
        Self::from_millis(&value)
    }
}

impl From<DelayLadder> for Vec<u64> {
    fn from(ladder: DelayLadder) -> Self {
        ladder
            .delays
            .iter()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .collect()
    }
}
