//! rlretry - adaptive retry policy
//!
//! Wraps a fallible async operation and learns, per failure state, whether
//! to retry after one of a fixed ladder of delays or to give up. The
//! learning core lives in `rlretry-rl`; this crate drives retry sequences,
//! loads configuration, persists weights and paces repeated requests.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod pacing;
pub mod persistence;
pub mod retry;

pub use self::config::{RuntimeConfig, Settings};
pub use pacing::{AutoRequestInterval, PacingConfig};
pub use persistence::{merge_delta, merge_tables, Checkpoint, FileWeightStore, WEIGHTS_FILE};
pub use retry::{ExhaustionMode, RetryConfig, RetryError, RetryPolicy};

pub use rlretry_rl::{
    Action, AgentConfig, DelayLadder, Environment, LearningRate, Outcome, RLAgent, RewardParams,
    State, StateActionMap, Step, WeightStore, WeightTables,
};
