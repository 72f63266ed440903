//! Configuration loading for rlretry

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use rlretry_rl::{AgentConfig, DelayLadder, ImportMode, LearningRate, RewardParams};

use crate::persistence::FileWeightStore;
use crate::retry::{ExhaustionMode, RetryConfig, RetryPolicy};

/// Settings as read from file and environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub retry: RetrySettings,
    pub learning: LearningSettings,
    pub reward: RewardParams,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub timeout_secs: f64,
    pub max_retries: u32,
    pub delays_ms: Vec<u64>,
    pub on_exhaustion: ExhaustionMode,
    pub checkpoint_interval: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            timeout_secs: defaults.timeout.as_secs_f64(),
            max_retries: defaults.max_retries,
            delays_ms: defaults.ladder.into(),
            on_exhaustion: defaults.on_exhaustion,
            checkpoint_interval: defaults.checkpoint_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningSettings {
    pub epsilon: f64,
    pub epsilon_decay: f64,
    pub min_epsilon: f64,
    pub discount_factor: f64,
    pub initial_value: f64,
    /// Fixed learning rate; 0 selects the running mean
    pub alpha: f64,
    pub import_mode: ImportMode,
    pub seed: Option<u64>,
}

impl Default for LearningSettings {
    fn default() -> Self {
        let defaults = AgentConfig::default();
        Self {
            epsilon: defaults.epsilon,
            epsilon_decay: defaults.epsilon_decay,
            min_epsilon: defaults.min_epsilon,
            discount_factor: defaults.discount_factor,
            initial_value: defaults.initial_value,
            alpha: 0.0,
            import_mode: defaults.import_mode,
            seed: defaults.seed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Directory holding `weights.json`; unset keeps weights in memory only
    pub weights_dir: Option<PathBuf>,
    /// Merge with checkpoints written by other processes sharing the directory
    pub distributed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Validated runtime values built from [`Settings`]
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub retry: RetryConfig,
    pub agent: AgentConfig,
    pub weights_dir: Option<PathBuf>,
    pub distributed: bool,
}

impl RuntimeConfig {
    /// Build a policy, attaching a file store when a weights directory is set
    pub fn build_policy(&self) -> Result<RetryPolicy> {
        let policy = RetryPolicy::new(self.retry.clone(), self.agent.clone())
            .context("Invalid retry policy configuration")?;
        match &self.weights_dir {
            Some(dir) => {
                let store = FileWeightStore::new(dir, self.distributed)
                    .with_context(|| format!("Failed to open weights directory {}", dir.display()))?;
                Ok(policy.with_store(Box::new(store)))
            }
            None => Ok(policy),
        }
    }
}

impl Settings {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        Self::load_from(Self::find_config_file().as_deref())
    }

    /// Load from an explicit file (if any) layered under the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            tracing::info!("Loading config from: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        } else {
            tracing::debug!("No config file found, using defaults");
        }

        // RLRETRY__RETRY__MAX_RETRIES=3 and friends
        builder = builder.add_source(
            Environment::with_prefix("RLRETRY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("retry.delays_ms"),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Parse settings from TOML text alone
    pub fn from_toml(contents: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(contents, FileFormat::Toml))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Check every value and convert to runtime types
    pub fn validate(&self) -> Result<RuntimeConfig> {
        let retry = &self.retry;
        if !(retry.timeout_secs.is_finite() && retry.timeout_secs > 0.0) {
            anyhow::bail!("retry.timeout_secs must be positive, got {}", retry.timeout_secs);
        }
        let timeout = match Duration::try_from_secs_f64(retry.timeout_secs) {
            Ok(timeout) => timeout,
            Err(_) => anyhow::bail!("retry.timeout_secs is too large, got {}", retry.timeout_secs),
        };
        let ladder =
            DelayLadder::from_millis(&retry.delays_ms).context("Invalid retry.delays_ms")?;
        self.reward.validate().context("Invalid reward settings")?;

        let learning = &self.learning;
        let agent = AgentConfig {
            epsilon: learning.epsilon,
            epsilon_decay: learning.epsilon_decay,
            min_epsilon: learning.min_epsilon,
            discount_factor: learning.discount_factor,
            initial_value: learning.initial_value,
            learning_rate: LearningRate::from_alpha(learning.alpha),
            import_mode: learning.import_mode,
            seed: learning.seed,
        };
        agent.validate().context("Invalid learning settings")?;

        Ok(RuntimeConfig {
            retry: RetryConfig {
                timeout,
                max_retries: retry.max_retries,
                ladder,
                reward: self.reward,
                on_exhaustion: retry.on_exhaustion,
                checkpoint_interval: retry.checkpoint_interval,
            },
            agent,
            weights_dir: self.persistence.weights_dir.clone(),
            distributed: self.persistence.distributed,
        })
    }

    /// Find the configuration file
    fn find_config_file() -> Option<PathBuf> {
        // Check in order: RLRETRY_CONFIG env, ./rlretry.toml, ~/.config/rlretry/rlretry.toml
        if let Ok(path) = std::env::var("RLRETRY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let local = PathBuf::from("rlretry.toml");
        if local.exists() {
            return Some(local);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config").join("rlretry").join("rlretry.toml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }
}
