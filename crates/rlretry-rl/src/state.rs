//! State labels and the reward type

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Reward value from environment
pub type Reward = f64;

/// Label of a failure or success condition.
///
/// The label space is open: the classifier may produce new labels at any
/// time, and the value table treats unseen labels as priors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(String);

impl State {
    pub const SUCCESS: &'static str = "success";
    pub const ABORT: &'static str = "abort";

    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn success() -> Self {
        Self::new(Self::SUCCESS)
    }

    pub fn abort() -> Self {
        Self::new(Self::ABORT)
    }

    pub fn is_success(&self) -> bool {
        self.0 == Self::SUCCESS
    }

    pub fn is_abort(&self) -> bool {
        self.0 == Self::ABORT
    }

    /// A sequence ends once it reaches success or abort
    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_abort()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for State {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for State {
    fn from(label: String) -> Self {
        Self(label)
    }
}

impl Borrow<str> for State {
    fn borrow(&self) -> &str {
        &self.0
    }
}
