//! Retry loop driving the agent and environment through one sequence per call

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use rlretry_rl::{
    AgentConfig, DelayLadder, Environment, Experience, Outcome, RLAgent, RLEnvironment,
    RewardModel, RewardParams, RlError, State, WeightStore,
};

/// What the caller sees when a sequence ends without success
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionMode {
    /// Return [`RetryError::Exhausted`] with the last failure attached
    #[default]
    Wrap,

    /// Return [`RetryError::Exhausted`] without the last failure
    Suppress,

    /// Return the last failure itself as [`RetryError::Operation`]
    Reraise,
}

/// Error returned by [`RetryPolicy::call`]
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// Failure surfaced as-is: unrecognized by the classifier, or the last
    /// failure of an exhausted sequence in re-raise mode
    #[error("operation failed: {0}")]
    Operation(#[source] E),

    #[error("retries exhausted in state `{state}` after {attempts} attempts ({elapsed:?})")]
    Exhausted {
        state: State,
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: Option<E>,
    },
}

impl<E> RetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// The underlying operation error, if one was kept
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Operation(error) => Some(error),
            RetryError::Exhausted { source, .. } => source,
        }
    }
}

/// Sequence-level configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Wall-clock budget for one sequence
    pub timeout: Duration,

    /// Retries allowed after the first attempt
    pub max_retries: u32,

    pub ladder: DelayLadder,

    pub reward: RewardParams,

    pub on_exhaustion: ExhaustionMode,

    /// Checkpoint to the weight store every this many sequences; 0 disables
    pub checkpoint_interval: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_retries: 5,
            ladder: DelayLadder::default(),
            reward: RewardParams::default(),
            on_exhaustion: ExhaustionMode::Wrap,
            checkpoint_interval: 10,
        }
    }
}

/// Adaptive retry policy.
///
/// Holds one agent shared by every call made through the policy. The agent
/// is locked only while choosing an action or learning, never across the
/// delay, the operation itself or weight store I/O.
pub struct RetryPolicy {
    agent: Mutex<RLAgent>,
    config: RetryConfig,
    rewards: RewardModel,
    store: Option<Arc<dyn WeightStore>>,
    /// One checkpoint at a time, so a delta is never dumped twice
    checkpointing: Mutex<()>,
    sequences: AtomicU64,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, agent_config: AgentConfig) -> rlretry_rl::Result<Self> {
        let rewards =
            RewardModel::new(config.reward, config.timeout, config.max_retries, &config.ladder)?;
        let agent = RLAgent::new(config.ladder.clone(), agent_config)?;

        debug!(
            timeout_ms = config.timeout.as_millis() as u64,
            max_retries = config.max_retries,
            success_reward = rewards.success_reward(config.timeout, config.max_retries),
            "retry policy initialized"
        );

        Ok(Self {
            agent: Mutex::new(agent),
            config,
            rewards,
            store: None,
            checkpointing: Mutex::new(()),
            sequences: AtomicU64::new(0),
        })
    }

    /// Attach a weight store and restore any weights it holds
    pub fn with_store(mut self, store: Box<dyn WeightStore>) -> Self {
        self.agent.get_mut().restore(store.as_ref());
        self.store = Some(Arc::from(store));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn reward_model(&self) -> &RewardModel {
        &self.rewards
    }

    pub fn agent(&self) -> &Mutex<RLAgent> {
        &self.agent
    }

    /// Number of sequences that ran through the learning step
    pub fn sequences(&self) -> u64 {
        self.sequences.load(Ordering::Relaxed)
    }

    /// Run `operation` under the policy.
    ///
    /// `classifier` labels recognized failures; errors it returns `None` for
    /// are returned immediately as [`RetryError::Operation`].
    pub async fn call<F, Fut, C, T, E>(&self, operation: F, classifier: C) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        C: Fn(&E) -> Option<State> + Send,
        T: Send,
        E: Send,
    {
        let mut env =
            RLEnvironment::new(operation, classifier, self.config.ladder.clone(), self.rewards.clone());
        self.run(&mut env).await
    }

    /// Drive one sequence against any [`Environment`]
    pub async fn run<Env>(&self, env: &mut Env) -> Result<Env::Output, RetryError<Env::Error>>
    where
        Env: Environment,
    {
        let started = Instant::now();
        let first = env.attempt().await.map_err(RetryError::Operation)?;
        let mut state = first.next_state;
        let mut last_error = match first.outcome {
            Outcome::Success(value) => return Ok(value),
            Outcome::Failed(error) => Some(error),
            Outcome::Aborted => None,
        };

        let mut attempts: u32 = 1;
        let mut retries: u32 = 0;
        let mut experiences: Vec<Experience> = Vec::new();

        if last_error.is_none()
            || started.elapsed() >= self.config.timeout
            || self.config.max_retries == 0
        {
            return Err(self.exhausted(state, attempts, started.elapsed(), last_error));
        }

        loop {
            let action = self.agent.lock().await.choose_action(&state);
            let step = match env.execute_action(action).await {
                Ok(step) => step,
                Err(error) => {
                    debug!(%state, %action, "unrecognized failure, discarding sequence");
                    return Err(RetryError::Operation(error));
                }
            };
            if !action.is_abort() {
                attempts += 1;
                retries += 1;
            }
            let elapsed = started.elapsed();

            match step.outcome {
                Outcome::Success(value) => {
                    experiences.push(Experience::new(state, action, step.reward, step.next_state, true));
                    self.finish(&experiences).await;
                    debug!(attempts, elapsed_ms = elapsed.as_millis() as u64, "sequence succeeded");
                    return Ok(value);
                }
                Outcome::Aborted => {
                    experiences.push(Experience::new(
                        state.clone(),
                        action,
                        step.reward,
                        step.next_state,
                        true,
                    ));
                    self.finish(&experiences).await;
                    debug!(%state, attempts, "sequence aborted by policy");
                    return Err(self.exhausted(state, attempts, elapsed, last_error));
                }
                Outcome::Failed(error) => {
                    last_error = Some(error);
                    if elapsed >= self.config.timeout || retries >= self.config.max_retries {
                        // Forced terminal: the step still pays for its time
                        let reward = step.reward + self.rewards.abort_reward();
                        experiences.push(Experience::new(state, action, reward, State::abort(), true));
                        self.finish(&experiences).await;
                        debug!(
                            state = %step.next_state,
                            attempts,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "sequence exhausted"
                        );
                        return Err(self.exhausted(step.next_state, attempts, elapsed, last_error));
                    }
                    experiences.push(Experience::new(
                        state,
                        action,
                        step.reward,
                        step.next_state.clone(),
                        false,
                    ));
                    state = step.next_state;
                }
            }
        }
    }

    /// Persist the agent's tables now.
    ///
    /// The store is written on the blocking pool; calls keep learning while
    /// it runs and their updates stay in the live table.
    pub async fn checkpoint(&self) -> rlretry_rl::Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self.checkpointing.lock().await;

        let (current, previous, wants_latest) = {
            let agent = self.agent.lock().await;
            let (current, previous) = agent.checkpoint_tables();
            (current, previous, agent.wants_latest())
        };

        let store = Arc::clone(store);
        let (current, latest) = tokio::task::spawn_blocking(move || {
            store.dump(&current, &previous)?;
            let latest = if wants_latest { store.load()? } else { None };
            Ok::<_, RlError>((current, latest))
        })
        .await
        .map_err(|e| RlError::Persistence(format!("checkpoint task failed: {e}")))??;

        self.agent
            .lock()
            .await
            .checkpoint_written(&current, latest.as_ref())
    }

    async fn finish(&self, experiences: &[Experience]) {
        self.agent.lock().await.learn_sequence(experiences);
        let done = self.sequences.fetch_add(1, Ordering::Relaxed) + 1;

        let interval = self.config.checkpoint_interval;
        if self.store.is_some() && interval > 0 && done % interval == 0 {
            if let Err(e) = self.checkpoint().await {
                warn!("Failed to checkpoint weights: {}", e);
            }
        }
    }

    fn exhausted<E>(
        &self,
        state: State,
        attempts: u32,
        elapsed: Duration,
        last_error: Option<E>,
    ) -> RetryError<E> {
        match (self.config.on_exhaustion, last_error) {
            (ExhaustionMode::Reraise, Some(error)) => RetryError::Operation(error),
            (ExhaustionMode::Wrap, source) => RetryError::Exhausted {
                state,
                attempts,
                elapsed,
                source,
            },
            (_, _) => RetryError::Exhausted {
                state,
                attempts,
                elapsed,
                source: None,
            },
        }
    }
}
