//! RL Agent - epsilon-greedy action selection over a learned value table

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{Action, DelayLadder};
use crate::error::{Result, RlError};
use crate::experience::{self, Experience};
use crate::state::{Reward, State};
use crate::table::{LearningRate, StateActionMap, WeightTables};

/// How imported weights combine with the live table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Imported tables overwrite the live table
    #[default]
    Replace,

    /// Updates made since the last snapshot are merged onto the imported
    /// tables, so progress from sibling processes and our own both survive
    Merge,
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Probability of picking a uniformly random action
    pub epsilon: f64,

    /// Multiplier applied to epsilon after every learned sequence
    pub epsilon_decay: f64,

    /// Floor for the decayed epsilon
    pub min_epsilon: f64,

    /// Discount applied when crediting later rewards to earlier steps
    pub discount_factor: f64,

    /// Estimate assumed for pairs never observed
    pub initial_value: f64,

    pub learning_rate: LearningRate,

    pub import_mode: ImportMode,

    /// Seed for exploration; `None` seeds from the OS
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            epsilon_decay: 1.0,
            min_epsilon: 0.01,
            discount_factor: 1.0,
            initial_value: 0.0,
            learning_rate: LearningRate::RunningMean,
            import_mode: ImportMode::Replace,
            seed: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(RlError::InvalidConfig(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("epsilon", self.epsilon)?;
        unit("min_epsilon", self.min_epsilon)?;
        unit("discount_factor", self.discount_factor)?;
        if !(self.epsilon_decay > 0.0 && self.epsilon_decay <= 1.0) {
            return Err(RlError::InvalidConfig(format!(
                "epsilon_decay must be within (0, 1], got {}",
                self.epsilon_decay
            )));
        }
        if !self.initial_value.is_finite() {
            return Err(RlError::InvalidConfig("initial_value must be finite".to_string()));
        }
        if let LearningRate::Fixed(alpha) = self.learning_rate {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(RlError::InvalidConfig(format!(
                    "alpha must be within (0, 1], got {alpha}"
                )));
            }
        }
        Ok(())
    }
}

/// Durable storage for value tables.
///
/// `dump` receives both the tables being saved and the tables as they were
/// at the previous checkpoint, so a store shared by several processes can
/// merge only the new observations onto whatever is stored now.
pub trait WeightStore: Send + Sync {
    /// Last persisted tables, or `None` if nothing was saved yet
    fn load(&self) -> Result<Option<WeightTables>>;

    fn dump(&self, current: &WeightTables, previous: &WeightTables) -> Result<()>;
}

/// Agent statistics
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub known_states: usize,
    pub total_updates: u64,
    pub total_sequences: u64,
    pub average_return: f64,
    pub epsilon: f64,
}

/// Learner owning one value table
pub struct RLAgent {
    map: StateActionMap,
    /// Table as of the last checkpoint or import
    snapshot: StateActionMap,
    config: AgentConfig,
    epsilon: f64,
    rng: StdRng,
    total_sequences: u64,
    total_return: f64,
}

impl RLAgent {
    pub fn new(ladder: DelayLadder, config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let map = StateActionMap::new(ladder, config.initial_value, config.learning_rate);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            snapshot: map.clone(),
            map,
            epsilon: config.epsilon,
            config,
            rng,
            total_sequences: 0,
            total_return: 0.0,
        })
    }

    /// Pick an action for `state`: random with probability epsilon,
    /// otherwise the table's best action.
    pub fn choose_action(&mut self, state: &State) -> Action {
        if self.rng.gen::<f64>() < self.epsilon {
            let idx = self.rng.gen_range(0..self.map.ladder().action_space_size());
            let action = Action::from_index(idx);
            debug!(%state, %action, "exploring");
            action
        } else {
            self.map.best_action(state)
        }
    }

    /// Forward one reward to the table
    pub fn apply_reward(&mut self, state: &State, action: Action, reward: Reward) {
        self.map.update(state, action, reward);
    }

    /// Credit every step of a finished sequence with its return, then
    /// decay epsilon.
    pub fn learn_sequence(&mut self, experiences: &[Experience]) {
        if experiences.is_empty() {
            return;
        }
        let returns = experience::returns(experiences, self.config.discount_factor);
        for (exp, &ret) in experiences.iter().zip(&returns) {
            self.apply_reward(&exp.state, exp.action, ret);
        }

        self.total_sequences += 1;
        self.total_return += returns[0];

        let floor = self.config.min_epsilon.min(self.config.epsilon);
        self.epsilon = (self.epsilon * self.config.epsilon_decay).max(floor);
    }

    /// Current tables in serializable form
    pub fn export_weights(&self) -> WeightTables {
        self.map.to_tables()
    }

    /// Load tables according to the configured [`ImportMode`]
    pub fn import_weights(&mut self, tables: &WeightTables) -> Result<()> {
        if &tables.ladder != self.map.ladder() {
            return Err(RlError::LadderMismatch {
                expected: self.map.ladder().action_space_size(),
                found: tables.ladder.action_space_size(),
            });
        }
        let imported =
            StateActionMap::from_tables(tables, self.config.initial_value, self.config.learning_rate)?;

        match self.config.import_mode {
            ImportMode::Replace => {
                self.map = imported.clone();
            }
            ImportMode::Merge => {
                let local = self.map.delta_since(&self.snapshot)?;
                let mut merged = imported.clone();
                merged.merge(&local)?;
                self.map = merged;
            }
        }
        self.snapshot = imported;
        Ok(())
    }

    /// Load weights from a store at startup.
    ///
    /// Missing, unreadable or incompatible weights leave the table at its
    /// initial values; returns whether anything was loaded.
    pub fn restore(&mut self, store: &dyn WeightStore) -> bool {
        match store.load() {
            Ok(Some(tables)) => match self.import_weights(&tables) {
                Ok(()) => {
                    info!(states = self.map.len(), "restored value tables");
                    true
                }
                Err(e) => {
                    warn!("Ignoring stored weights: {}", e);
                    false
                }
            },
            Ok(None) => {
                debug!("no stored weights, starting from initial values");
                false
            }
            Err(e) => {
                warn!("Failed to load weights, starting from initial values: {}", e);
                false
            }
        }
    }

    /// Persist the table, passing the previous snapshot along.
    ///
    /// In merge mode the stored result is read back afterwards so sibling
    /// progress flows into the live table.
    pub fn checkpoint(&mut self, store: &dyn WeightStore) -> Result<()> {
        let (current, previous) = self.checkpoint_tables();
        store.dump(&current, &previous)?;
        let latest = if self.wants_latest() { store.load()? } else { None };
        self.checkpoint_written(&current, latest.as_ref())
    }

    /// Tables to hand a store's `dump`: the live table and the one from the
    /// previous checkpoint.
    ///
    /// Together with [`checkpoint_written`](Self::checkpoint_written) this
    /// lets the store I/O happen without holding on to the agent.
    pub fn checkpoint_tables(&self) -> (WeightTables, WeightTables) {
        (self.map.to_tables(), self.snapshot.to_tables())
    }

    /// Whether a completed checkpoint should read back the stored tables
    pub fn wants_latest(&self) -> bool {
        self.config.import_mode == ImportMode::Merge
    }

    /// Record that `written` reached the store, then fold in `latest` if it
    /// was read back. Updates made since `written` was taken are kept.
    pub fn checkpoint_written(
        &mut self,
        written: &WeightTables,
        latest: Option<&WeightTables>,
    ) -> Result<()> {
        self.snapshot = StateActionMap::from_tables(
            written,
            self.config.initial_value,
            self.config.learning_rate,
        )?;
        debug!(states = self.snapshot.len(), "checkpointed value tables");

        if let Some(latest) = latest {
            self.import_weights(latest)?;
        }
        Ok(())
    }

    pub fn table(&self) -> &StateActionMap {
        &self.map
    }

    pub fn ladder(&self) -> &DelayLadder {
        self.map.ladder()
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            known_states: self.map.len(),
            total_updates: self.map.total_updates(),
            total_sequences: self.total_sequences,
            average_return: if self.total_sequences > 0 {
                self.total_return / self.total_sequences as f64
            } else {
                0.0
            },
            epsilon: self.epsilon,
        }
    }
}
