//! Transitions observed during one retry sequence

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::state::{Reward, State};

/// A single experience tuple (s, a, r, s', done)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub state: State,
    pub action: Action,
    pub reward: Reward,
    pub next_state: State,
    pub done: bool,
}

impl Experience {
    /// Create a new experience
    pub fn new(state: State, action: Action, reward: Reward, next_state: State, done: bool) -> Self {
        Self {
            state,
            action,
            reward,
            next_state,
            done,
        }
    }
}

/// Discounted return of every step, computed back to front.
///
/// Element `i` is `r_i + discount * r_{i+1} + discount^2 * r_{i+2} + ...`
/// up to the end of the sequence.
pub fn returns(experiences: &[Experience], discount: f64) -> Vec<Reward> {
    let mut out = vec![0.0; experiences.len()];
    let mut acc = 0.0;
    for (i, exp) in experiences.iter().enumerate().rev() {
        acc = exp.reward + discount * acc;
        out[i] = acc;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(reward: Reward, done: bool) -> Experience {
        let next = if done { State::abort() } else { State::new("RandomFailure") };
        Experience::new(State::new("RandomFailure"), Action::Retry(0), reward, next, done)
    }

    #[test]
    fn test_experience_creation() {
        let exp = step(-0.1, false);
        assert_eq!(exp.reward, -0.1);
        assert!(!exp.done);
        assert!(!exp.next_state.is_terminal());
    }

    #[test]
    fn test_undiscounted_returns() {
        let seq = vec![step(-1.0, false), step(-2.0, false), step(5.0, true)];
        assert_eq!(returns(&seq, 1.0), vec![2.0, 3.0, 5.0]);
    }

    #[test]
    fn test_discounted_returns() {
        let seq = vec![step(1.0, false), step(1.0, true)];
        assert_eq!(returns(&seq, 0.5), vec![1.5, 1.0]);
    }

    #[test]
    fn test_empty_sequence() {
        assert!(returns(&[], 1.0).is_empty());
    }
}
