//! RL Environment - runs retry actions against the wrapped operation
//!
//! The environment owns the operation, the failure classifier and the
//! reward model. It executes one action at a time, times it, classifies the
//! outcome into a [`State`] and prices the step with a [`Reward`]. It never
//! touches the value table.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::action::{Action, DelayLadder};
use crate::error::{Result, RlError};
use crate::state::{Reward, State};

/// Time charged for an abort, kept non-zero so downstream ratios stay finite
pub const ABORT_DURATION: Duration = Duration::from_millis(10);

/// Reward shaping parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardParams {
    /// Reward lost per whole timeout budget spent
    pub time_cost_weight: f64,

    /// Fixed reward for giving up; must be below `-time_cost_weight`
    pub abort_reward: f64,

    /// Added on top of the worst-case time cost to form the success reward
    pub success_bonus: f64,
}

impl Default for RewardParams {
    fn default() -> Self {
        Self {
            time_cost_weight: 1.0,
            abort_reward: -2.0,
            success_bonus: 1.0,
        }
    }
}

impl RewardParams {
    /// Check the reward ordering: success > bounded-time failure > abort
    pub fn validate(&self) -> Result<()> {
        if !(self.time_cost_weight.is_finite() && self.time_cost_weight > 0.0) {
            return Err(RlError::InvalidConfig(format!(
                "time_cost_weight must be positive, got {}",
                self.time_cost_weight
            )));
        }
        if !self.abort_reward.is_finite() || self.abort_reward >= -self.time_cost_weight {
            return Err(RlError::InvalidConfig(format!(
                "abort_reward ({}) must be below -time_cost_weight ({})",
                self.abort_reward, -self.time_cost_weight
            )));
        }
        if !(self.success_bonus.is_finite() && self.success_bonus >= 0.0) {
            return Err(RlError::InvalidConfig(format!(
                "success_bonus must be non-negative, got {}",
                self.success_bonus
            )));
        }
        Ok(())
    }
}

/// Pure reward function for one retry sequence configuration
#[derive(Debug, Clone)]
pub struct RewardModel {
    params: RewardParams,
    timeout: Duration,
    longest_delay: Duration,
    success_reward: Reward,
}

impl RewardModel {
    pub fn new(
        params: RewardParams,
        timeout: Duration,
        max_retries: u32,
        ladder: &DelayLadder,
    ) -> Result<Self> {
        params.validate()?;
        if timeout.is_zero() {
            return Err(RlError::InvalidConfig("timeout must be positive".to_string()));
        }
        let mut model = Self {
            params,
            timeout,
            longest_delay: ladder.max_delay(),
            success_reward: 0.0,
        };
        model.success_reward = model.success_reward(timeout, max_retries);
        Ok(model)
    }

    /// Baseline reward for a sequence that ends in success.
    ///
    /// Every attempt can charge at most one budget's worth of time cost, or
    /// more when the longest delay exceeds the budget, so the bonus sits on
    /// top of the worst case over `max_retries + 1` attempts.
    pub fn success_reward(&self, timeout: Duration, max_retries: u32) -> Reward {
        let budget = timeout.as_secs_f64().max(ABORT_DURATION.as_secs_f64());
        let worst_step = (self.longest_delay.as_secs_f64() / budget).max(1.0);
        self.params.success_bonus
            + self.params.time_cost_weight * worst_step * f64::from(max_retries.saturating_add(1))
    }

    /// Time cost of a step as a fraction of the timeout budget
    pub fn time_cost(&self, duration: Duration) -> f64 {
        self.params.time_cost_weight * duration.as_secs_f64() / self.timeout.as_secs_f64()
    }

    /// Reward for landing in `next_state` after spending `duration`
    pub fn next_state_to_reward(&self, next_state: &State, duration: Duration) -> Reward {
        if next_state.is_abort() {
            self.params.abort_reward
        } else if next_state.is_success() {
            self.success_reward - self.time_cost(duration)
        } else {
            -self.time_cost(duration)
        }
    }

    pub fn abort_reward(&self) -> Reward {
        self.params.abort_reward
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn params(&self) -> &RewardParams {
        &self.params
    }
}

/// What happened to the operation during a step
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// The operation returned normally
    Success(T),

    /// The operation failed with an error the classifier recognized
    Failed(E),

    /// The abort action was taken; the operation was not called
    Aborted,
}

/// Result of executing one action
#[derive(Debug)]
pub struct Step<T, E> {
    pub next_state: State,
    pub reward: Reward,
    pub duration: Duration,
    pub outcome: Outcome<T, E>,
}

/// Something the retry loop can drive one action at a time.
///
/// `Err` from either method is an unrecognized failure and ends the sequence
/// immediately.
#[async_trait]
pub trait Environment: Send {
    type Output: Send;
    type Error: Send;

    /// Call the operation once without delay
    async fn attempt(&mut self) -> std::result::Result<Step<Self::Output, Self::Error>, Self::Error>;

    /// Execute a chosen action
    async fn execute_action(
        &mut self,
        action: Action,
    ) -> std::result::Result<Step<Self::Output, Self::Error>, Self::Error>;

    fn reward_model(&self) -> &RewardModel;

    fn ladder(&self) -> &DelayLadder;
}

/// Environment wrapping an async operation and a failure classifier.
///
/// The classifier maps an error to a state label, or returns `None` for
/// failures the policy must not learn about; those propagate untouched.
pub struct RLEnvironment<F, C> {
    operation: F,
    classifier: C,
    ladder: DelayLadder,
    rewards: RewardModel,
}

impl<F, Fut, C, T, E> RLEnvironment<F, C>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = std::result::Result<T, E>> + Send,
    C: Fn(&E) -> Option<State> + Send,
    T: Send,
    E: Send,
{
    pub fn new(operation: F, classifier: C, ladder: DelayLadder, rewards: RewardModel) -> Self {
        Self {
            operation,
            classifier,
            ladder,
            rewards,
        }
    }

    /// See [`RewardModel::success_reward`]
    pub fn success_reward(&self, timeout: Duration, max_retries: u32) -> Reward {
        self.rewards.success_reward(timeout, max_retries)
    }

    /// See [`RewardModel::next_state_to_reward`]
    pub fn next_state_to_reward(&self, next_state: &State, duration: Duration) -> Reward {
        self.rewards.next_state_to_reward(next_state, duration)
    }

    async fn run(&mut self, delay: Duration) -> std::result::Result<Step<T, E>, E> {
        let started = Instant::now();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = (self.operation)().await;
        let duration = started.elapsed();

        let (next_state, outcome) = match result {
            Ok(value) => (State::success(), Outcome::Success(value)),
            Err(error) => match (self.classifier)(&error) {
                Some(state) => (state, Outcome::Failed(error)),
                None => {
                    debug!(?duration, "unrecognized failure, propagating");
                    return Err(error);
                }
            },
        };

        let reward = self.rewards.next_state_to_reward(&next_state, duration);
        Ok(Step {
            next_state,
            reward,
            duration,
            outcome,
        })
    }
}

#[async_trait]
impl<F, Fut, C, T, E> Environment for RLEnvironment<F, C>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = std::result::Result<T, E>> + Send,
    C: Fn(&E) -> Option<State> + Send,
    T: Send,
    E: Send,
{
    type Output = T;
    type Error = E;

    async fn attempt(&mut self) -> std::result::Result<Step<T, E>, E> {
        self.run(Duration::ZERO).await
    }

    async fn execute_action(&mut self, action: Action) -> std::result::Result<Step<T, E>, E> {
        if action.is_abort() {
            let next_state = State::abort();
            let reward = self.rewards.next_state_to_reward(&next_state, ABORT_DURATION);
            return Ok(Step {
                next_state,
                reward,
                duration: ABORT_DURATION,
                outcome: Outcome::Aborted,
            });
        }

        // A tier past the end of the ladder waits the longest delay
        let delay = self.ladder.delay(action).unwrap_or_else(|| {
            warn!(%action, "retry tier outside the ladder, using the longest delay");
            self.ladder.max_delay()
        });

        let step = self.run(delay).await?;
        debug!(
            %action,
            next_state = %step.next_state,
            reward = step.reward,
            duration_ms = step.duration.as_millis() as u64,
            "executed retry action"
        );
        Ok(step)
    }

    fn reward_model(&self) -> &RewardModel {
        &self.rewards
    }

    fn ladder(&self) -> &DelayLadder {
        &self.ladder
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    fn classify(error: &TestError) -> Option<State> {
        match error {
            TestError::Transient => Some(State::new("Transient")),
            TestError::Fatal => None,
        }
    }

    fn model(timeout_secs: u64, max_retries: u32) -> RewardModel {
        RewardModel::new(
            RewardParams::default(),
            Duration::from_secs(timeout_secs),
            max_retries,
            &DelayLadder::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_reward_ordering_invariant() {
        for timeout in [1, 2, 5, 10, 20] {
            for retries in [2, 3, 4] {
                let rewards = model(timeout, retries);
                let timeout = Duration::from_secs(timeout);
                let success = rewards.success_reward(timeout, retries);
                let abort = rewards.next_state_to_reward(&State::abort(), ABORT_DURATION);
                for fraction in [0.0, 0.01, 0.5, 1.0] {
                    let failure = rewards
                        .next_state_to_reward(&State::new("Transient"), timeout.mul_f64(fraction));
                    assert!(success > failure, "success {success} <= failure {failure}");
                    assert!(failure > abort, "failure {failure} <= abort {abort}");
                }
                assert!(success > abort);
            }
        }
    }

    #[test]
    fn test_success_reward_exceeds_exhausted_sequence() {
        let rewards = model(2, 3);
        // Four failed attempts, each spending the whole budget
        let exhausted: f64 = (0..4)
            .map(|_| rewards.next_state_to_reward(&State::new("Transient"), Duration::from_secs(2)))
            .sum();
        assert!(rewards.success_reward(Duration::from_secs(2), 3) > exhausted);
        assert!(rewards.success_reward(Duration::from_secs(2), 3) > rewards.abort_reward());
    }

    #[test]
    fn test_success_reward_grows_with_long_delays() {
        let ladder = DelayLadder::from_millis(&[0, 5000]).unwrap();
        let rewards =
            RewardModel::new(RewardParams::default(), Duration::from_secs(1), 1, &ladder).unwrap();
        // 5s delay over a 1s budget, two attempts, plus the bonus
        assert!((rewards.success_reward(Duration::from_secs(1), 1) - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_next_state_to_reward_is_deterministic() {
        let rewards = model(10, 3);
        let d = Duration::from_millis(2500);
        let failure = rewards.next_state_to_reward(&State::new("Transient"), d);
        assert!((failure + 0.25).abs() < 1e-9);
        assert_eq!(failure, rewards.next_state_to_reward(&State::new("Transient"), d));

        let success = rewards.next_state_to_reward(&State::success(), d);
        assert!((success - (rewards.success_reward(Duration::from_secs(10), 3) - 0.25)).abs() < 1e-9);

        let abort_fast = rewards.next_state_to_reward(&State::abort(), Duration::ZERO);
        let abort_slow = rewards.next_state_to_reward(&State::abort(), Duration::from_secs(100));
        assert_eq!(abort_fast, -2.0);
        assert_eq!(abort_fast, abort_slow);
    }

    #[test]
    fn test_reward_params_validation() {
        assert!(RewardParams::default().validate().is_ok());
        let bad_abort = RewardParams {
            abort_reward: -0.5,
            ..RewardParams::default()
        };
        assert!(bad_abort.validate().is_err());
        let bad_weight = RewardParams {
            time_cost_weight: 0.0,
            ..RewardParams::default()
        };
        assert!(bad_weight.validate().is_err());
        assert!(RewardModel::new(
            RewardParams::default(),
            Duration::ZERO,
            3,
            &DelayLadder::default()
        )
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_abort_does_not_call_operation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut env = RLEnvironment::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, TestError>(()) }
            },
            classify,
            DelayLadder::default(),
            model(5, 3),
        );

        let step = env.execute_action(Action::Abort).await.unwrap();
        assert!(step.next_state.is_abort());
        assert_eq!(step.duration, ABORT_DURATION);
        assert_eq!(step.reward, -2.0);
        assert!(matches!(step.outcome, Outcome::Aborted));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retry_sleeps_then_succeeds() {
        let mut env = RLEnvironment::new(
            || async { Ok::<_, TestError>(42) },
            classify,
            DelayLadder::default(),
            model(10, 3),
        );

        let step = env.execute_action(Action::Retry(4)).await.unwrap();
        assert!(step.next_state.is_success());
        assert!(step.duration >= Duration::from_millis(1500));
        assert!(step.duration < Duration::from_millis(1600));
        assert!(matches!(step.outcome, Outcome::Success(42)));
        let expected = env.next_state_to_reward(&State::success(), step.duration);
        assert_eq!(step.reward, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognized_failure_is_classified() {
        let mut env = RLEnvironment::new(
            || async { Err::<(), _>(TestError::Transient) },
            classify,
            DelayLadder::default(),
            model(10, 3),
        );

        let step = env.execute_action(Action::Retry(1)).await.unwrap();
        assert_eq!(step.next_state, State::new("Transient"));
        assert!(step.reward < 0.0);
        assert!(matches!(step.outcome, Outcome::Failed(TestError::Transient)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecognized_failure_propagates() {
        let mut env = RLEnvironment::new(
            || async { Err::<(), _>(TestError::Fatal) },
            classify,
            DelayLadder::default(),
            model(10, 3),
        );

        assert_eq!(env.attempt().await.unwrap_err(), TestError::Fatal);
        assert_eq!(env.execute_action(Action::Retry(0)).await.unwrap_err(), TestError::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_tier_retries_instead_of_aborting() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut env = RLEnvironment::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, TestError>(()) }
            },
            classify,
            DelayLadder::default(),
            model(10, 3),
        );

        let step = env.execute_action(Action::Retry(99)).await.unwrap();
        assert!(step.next_state.is_success());
        assert!(step.duration >= DelayLadder::default().max_delay());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
