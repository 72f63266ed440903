//! rlretry RL - learning core of the adaptive retry policy
//!
//! This crate provides the discrete retry actions, the state-action value
//! table with its merge protocol, the reward model and the agent that picks
//! retry actions and learns from their outcomes.

// Clippy pedantic allows - these are intentional design choices
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::float_cmp)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod agent;
pub mod environment;
pub mod error;
pub mod experience;
pub mod state;
pub mod table;

pub use action::{Action, DelayLadder};
pub use agent::{AgentConfig, AgentStats, ImportMode, RLAgent, WeightStore};
pub use environment::{
    Environment, Outcome, RLEnvironment, RewardModel, RewardParams, Step, ABORT_DURATION,
};
pub use error::{Result, RlError};
pub use experience::Experience;
pub use state::{Reward, State};
pub use table::{LearningRate, StateActionMap, WeightTables};
