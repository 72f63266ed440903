//! State-action value table with online updates and count-weighted merging

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::action::{Action, DelayLadder};
use crate::error::{Result, RlError};
use crate::state::{Reward, State};

/// How an observed reward moves a stored estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRate {
    /// `alpha = 1 / count`: the estimate is the plain mean of observations,
    /// so the initial value stops mattering after the first update.
    RunningMean,

    /// Exponential moving average; adapts faster to bursty failure regimes
    /// at the cost of variance.
    Fixed(f64),
}

impl LearningRate {
    /// Map a configured alpha to a mode; zero selects the running mean.
    pub fn from_alpha(alpha: f64) -> Self {
        if alpha > 0.0 {
            LearningRate::Fixed(alpha)
        } else {
            LearningRate::RunningMean
        }
    }

    fn step(self, count_after: u64) -> f64 {
        match self {
            LearningRate::RunningMean => 1.0 / count_after as f64,
            LearningRate::Fixed(alpha) => alpha,
        }
    }
}

impl Default for LearningRate {
    fn default() -> Self {
        LearningRate::RunningMean
    }
}

/// Serializable form of a value table: the ladder it was learned under plus
/// the value and count tables for every observed pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeightTables {
    pub ladder: DelayLadder,
    pub values: BTreeMap<State, BTreeMap<Action, f64>>,
    pub counts: BTreeMap<State, BTreeMap<Action, u64>>,
}

impl WeightTables {
    /// Tables with no observations
    pub fn empty(ladder: DelayLadder) -> Self {
        Self {
            ladder,
            values: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.values().all(|row| row.values().all(|c| *c == 0))
    }
}

/// Value estimates and observation counts keyed by (state, action).
///
/// Rows are vectors indexed by [`Action::index`]; a row exists once any
/// action of that state has been observed, and unobserved cells hold the
/// initial value with a zero count.
#[derive(Debug, Clone)]
pub struct StateActionMap {
    ladder: DelayLadder,
    initial_value: f64,
    learning_rate: LearningRate,
    values: HashMap<State, Vec<f64>>,
    counts: HashMap<State, Vec<u64>>,
}

impl StateActionMap {
    /// Create an empty map.
    ///
    /// A high `initial_value` makes untried actions look attractive and so
    /// drives early exploration; a low one makes the agent conservative.
    pub fn new(ladder: DelayLadder, initial_value: f64, learning_rate: LearningRate) -> Self {
        Self {
            ladder,
            initial_value,
            learning_rate,
            values: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    pub fn ladder(&self) -> &DelayLadder {
        &self.ladder
    }

    pub fn initial_value(&self) -> f64 {
        self.initial_value
    }

    pub fn learning_rate(&self) -> LearningRate {
        self.learning_rate
    }

    /// Stored estimate, or the initial value for a pair never updated
    pub fn value_of(&self, state: &State, action: Action) -> f64 {
        match (self.values.get(state), self.counts.get(state)) {
            (Some(values), Some(counts)) if counts.get(action.index()).copied().unwrap_or(0) > 0 => {
                values[action.index()]
            }
            _ => self.initial_value,
        }
    }

    /// Number of updates applied to a pair
    pub fn count_of(&self, state: &State, action: Action) -> u64 {
        self.counts
            .get(state)
            .and_then(|row| row.get(action.index()))
            .copied()
            .unwrap_or(0)
    }

    /// Highest-valued action for a state.
    ///
    /// Ties go to the earliest action in ladder order, i.e. the one that
    /// spends the least time. Unseen states tie everywhere and so resolve to
    /// the first action.
    pub fn best_action(&self, state: &State) -> Action {
        let mut best = Action::Abort;
        let mut best_value = f64::NEG_INFINITY;
        for action in self.ladder.actions() {
            let value = self.value_of(state, action);
            if value > best_value {
                best = action;
                best_value = value;
            }
        }
        best
    }

    /// Fold one observed reward into the estimate for (state, action)
    pub fn update(&mut self, state: &State, action: Action, reward: Reward) {
        if !self.ladder.contains(action) {
            warn!(%state, %action, "ignoring update for action outside the ladder");
            return;
        }
        let size = self.ladder.action_space_size();
        let idx = action.index();

        let counts = self
            .counts
            .entry(state.clone())
            .or_insert_with(|| vec![0; size]);
        counts[idx] = counts[idx].saturating_add(1);
        let count_after = counts[idx];

        let values = self
            .values
            .entry(state.clone())
            .or_insert_with(|| vec![self.initial_value; size]);
        let step = self.learning_rate.step(count_after);
        values[idx] += step * (reward - values[idx]);
    }

    /// Combine another map's experience into this one.
    ///
    /// Each pair becomes the count-weighted mean of both sides and the counts
    /// add up; pairs observed on one side only pass through unchanged.
    /// Fails without touching `self` if a merged count overflows.
    pub fn merge(&mut self, other: &StateActionMap) -> Result<()> {
        self.check_ladder(other)?;
        let size = self.ladder.action_space_size();
        let mut merged_counts = self.counts.clone();
        let mut merged_values = self.values.clone();

        for (state, other_counts) in &other.counts {
            let other_values = &other.values[state];
            let counts = merged_counts
                .entry(state.clone())
                .or_insert_with(|| vec![0; size]);
            let values = merged_values
                .entry(state.clone())
                .or_insert_with(|| vec![self.initial_value; size]);

            for idx in 0..size {
                let c2 = other_counts[idx];
                if c2 == 0 {
                    continue;
                }
                let c1 = counts[idx];
                let total = c1.checked_add(c2).ok_or_else(|| {
                    RlError::Persistence(format!(
                        "count overflow merging {state}/{}",
                        Action::from_index(idx)
                    ))
                })?;
                values[idx] = if c1 == 0 {
                    other_values[idx]
                } else {
                    (values[idx] * c1 as f64 + other_values[idx] * c2 as f64) / total as f64
                };
                counts[idx] = total;
            }
        }

        self.counts = merged_counts;
        self.values = merged_values;
        debug!(states = self.len(), "merged value tables");
        Ok(())
    }

    /// Observations made since `previous` was taken, as a map of their own.
    ///
    /// Each pair's count is the count difference and its value is the mean
    /// of the new observations recovered from the count-weighted totals.
    /// Pairs whose count did not grow are left out.
    pub fn delta_since(&self, previous: &StateActionMap) -> Result<StateActionMap> {
        self.check_ladder(previous)?;
        let size = self.ladder.action_space_size();
        let mut delta = StateActionMap::new(self.ladder.clone(), self.initial_value, self.learning_rate);

        for (state, counts) in &self.counts {
            let values = &self.values[state];
            for idx in 0..size {
                let action = Action::from_index(idx);
                let c_new = counts[idx];
                let c_prev = previous.count_of(state, action);
                if c_new <= c_prev {
                    continue;
                }
                let added = c_new - c_prev;
                let v_prev = if c_prev == 0 { 0.0 } else { previous.value_of(state, action) };
                let value = (values[idx] * c_new as f64 - v_prev * c_prev as f64) / added as f64;
                if !value.is_finite() {
                    return Err(RlError::Persistence(format!(
                        "non-finite delta for {state}/{action}"
                    )));
                }
                delta.set(state, action, value, added);
            }
        }

        Ok(delta)
    }

    /// Number of states with at least one observation
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Known states, sorted for stable output
    pub fn states(&self) -> Vec<&State> {
        let mut states: Vec<_> = self.counts.keys().collect();
        states.sort();
        states
    }

    /// Total number of updates across all pairs
    pub fn total_updates(&self) -> u64 {
        self.counts
            .values()
            .flatten()
            .fold(0u64, |total, &c| total.saturating_add(c))
    }

    /// Export the observed pairs
    pub fn to_tables(&self) -> WeightTables {
        let mut tables = WeightTables::empty(self.ladder.clone());
        for (state, counts) in &self.counts {
            let values = &self.values[state];
            for (idx, &count) in counts.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let action = Action::from_index(idx);
                tables
                    .values
                    .entry(state.clone())
                    .or_default()
                    .insert(action, values[idx]);
                tables
                    .counts
                    .entry(state.clone())
                    .or_default()
                    .insert(action, count);
            }
        }
        tables
    }

    /// Rebuild a map from exported tables.
    ///
    /// A pair listed with a count but no value is skipped, as is any action
    /// outside the tables' ladder. A non-finite value means the tables are
    /// corrupt and fails the whole load.
    pub fn from_tables(
        tables: &WeightTables,
        initial_value: f64,
        learning_rate: LearningRate,
    ) -> Result<Self> {
        let mut map = Self::new(tables.ladder.clone(), initial_value, learning_rate);
        for (state, counts) in &tables.counts {
            for (&action, &count) in counts {
                let value = tables.values.get(state).and_then(|row| row.get(&action));
                match value {
                    Some(&value) if !value.is_finite() => {
                        return Err(RlError::Persistence(format!(
                            "non-finite value {value} for {state}/{action}"
                        )));
                    }
                    Some(&value) if count > 0 && tables.ladder.contains(action) => {
                        map.set(state, action, value, count);
                    }
                    _ => debug!(%state, %action, "skipping incomplete table entry"),
                }
            }
        }
        Ok(map)
    }

    fn set(&mut self, state: &State, action: Action, value: f64, count: u64) {
        let size = self.ladder.action_space_size();
        let idx = action.index();
        self.counts
            .entry(state.clone())
            .or_insert_with(|| vec![0; size])[idx] = count;
        self.values
            .entry(state.clone())
            .or_insert_with(|| vec![self.initial_value; size])[idx] = value;
    }

    fn check_ladder(&self, other: &StateActionMap) -> Result<()> {
        if self.ladder != other.ladder {
            return Err(RlError::LadderMismatch {
                expected: self.ladder.action_space_size(),
                found: other.ladder.action_space_size(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn map(initial_value: f64) -> StateActionMap {
        StateActionMap::new(DelayLadder::default(), initial_value, LearningRate::RunningMean)
    }

    fn state(label: &str) -> State {
        State::new(label)
    }

    fn assert_maps_close(a: &StateActionMap, b: &StateActionMap) {
        let (ta, tb) = (a.to_tables(), b.to_tables());
        assert_eq!(ta.counts, tb.counts);
        for (s, row) in &ta.values {
            for (action, v) in row {
                let other = tb.values[s][action];
                assert!((v - other).abs() < EPS, "{s}/{action}: {v} vs {other}");
            }
        }
    }

    #[test]
    fn test_unseen_pairs_return_initial_value() {
        let table = map(3.5);
        let s = state("never-seen");
        for action in DelayLadder::default().actions() {
            assert_eq!(table.value_of(&s, action), 3.5);
            assert_eq!(table.count_of(&s, action), 0);
        }
        assert_eq!(table.best_action(&s), Action::Abort);
    }

    #[test]
    fn test_unobserved_cells_in_known_row_return_initial_value() {
        let mut table = map(0.25);
        let s = state("RandomFailure");
        table.update(&s, Action::Retry(1), -4.0);
        assert_eq!(table.value_of(&s, Action::Retry(2)), 0.25);
        assert_eq!(table.value_of(&s, Action::Retry(1)), -4.0);
    }

    #[test]
    fn test_best_action_ties_prefer_cheapest() {
        let mut table = map(-10.0);
        let s = state("TooBusyFailure");
        table.update(&s, Action::Retry(3), 1.0);
        table.update(&s, Action::Retry(1), 1.0);
        assert_eq!(table.best_action(&s), Action::Retry(1));
        table.update(&s, Action::Abort, 2.0);
        assert_eq!(table.best_action(&s), Action::Abort);
    }

    #[test]
    fn test_running_mean_update() {
        let mut table = map(100.0);
        let s = state("ClusteredFailure");
        table.update(&s, Action::Retry(0), 1.0);
        assert_eq!(table.value_of(&s, Action::Retry(0)), 1.0);
        table.update(&s, Action::Retry(0), 3.0);
        table.update(&s, Action::Retry(0), 5.0);
        assert!((table.value_of(&s, Action::Retry(0)) - 3.0).abs() < EPS);
        assert_eq!(table.count_of(&s, Action::Retry(0)), 3);
    }

    #[test]
    fn test_fixed_alpha_update() {
        let mut table = StateActionMap::new(DelayLadder::default(), 0.0, LearningRate::Fixed(0.5));
        let s = state("RandomFailure");
        table.update(&s, Action::Retry(2), 4.0);
        assert!((table.value_of(&s, Action::Retry(2)) - 2.0).abs() < EPS);
        table.update(&s, Action::Retry(2), 4.0);
        assert!((table.value_of(&s, Action::Retry(2)) - 3.0).abs() < EPS);
    }

    #[test]
    fn test_repeated_reward_converges() {
        for rate in [LearningRate::RunningMean, LearningRate::Fixed(0.1)] {
            for initial in [-50.0, 0.0, 50.0] {
                let mut table = StateActionMap::new(DelayLadder::default(), initial, rate);
                let s = state("RepeatableFailure");
                for _ in 0..500 {
                    table.update(&s, Action::Retry(4), -0.75);
                }
                let v = table.value_of(&s, Action::Retry(4));
                assert!((v + 0.75).abs() < 1e-6, "{rate:?} from {initial}: {v}");
            }
        }
    }

    #[test]
    fn test_update_outside_ladder_is_ignored() {
        let mut table = map(0.0);
        let s = state("RandomFailure");
        table.update(&s, Action::Retry(42), 1.0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_merge_count_weighted() {
        let s = state("RandomFailure");
        let mut a = map(0.0);
        a.update(&s, Action::Retry(0), 1.0);
        let mut b = map(0.0);
        for _ in 0..3 {
            b.update(&s, Action::Retry(0), 5.0);
        }
        a.merge(&b).unwrap();
        assert_eq!(a.count_of(&s, Action::Retry(0)), 4);
        assert!((a.value_of(&s, Action::Retry(0)) - 4.0).abs() < EPS);
    }

    #[test]
    fn test_merge_commutative_and_associative() {
        let s1 = state("RandomFailure");
        let s2 = state("TooBusyFailure");
        let mut a = map(0.0);
        let mut b = map(0.0);
        let mut c = map(0.0);
        a.update(&s1, Action::Retry(0), 0.3);
        a.update(&s1, Action::Retry(0), 0.9);
        a.update(&s2, Action::Abort, -2.0);
        b.update(&s1, Action::Retry(0), -1.7);
        b.update(&s1, Action::Retry(2), 0.4);
        c.update(&s2, Action::Abort, -2.0);
        c.update(&s2, Action::Retry(3), 1.25);
        c.update(&s1, Action::Retry(0), 2.5);

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_maps_close(&ab, &ba);

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut a_bc = a.clone();
        a_bc.merge(&bc).unwrap();
        let mut ab_c = ab.clone();
        ab_c.merge(&c).unwrap();
        assert_maps_close(&a_bc, &ab_c);
    }

    #[test]
    fn test_merge_with_empty_is_identity() {
        let s = state("RandomFailure");
        let mut a = map(0.0);
        a.update(&s, Action::Retry(1), -0.5);
        a.update(&s, Action::Abort, -2.0);

        let mut merged = a.clone();
        merged.merge(&map(0.0)).unwrap();
        assert_maps_close(&merged, &a);

        let mut from_empty = map(0.0);
        from_empty.merge(&a).unwrap();
        assert_maps_close(&from_empty, &a);
    }

    #[test]
    fn test_merge_disjoint_states_is_union() {
        let s1 = state("RandomFailure");
        let s2 = state("ClusteredFailure");
        let mut a = map(0.0);
        a.update(&s1, Action::Retry(0), 0.7);
        let mut b = map(0.0);
        b.update(&s2, Action::Retry(4), -0.2);
        b.update(&s2, Action::Retry(4), -0.4);

        a.merge(&b).unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a.value_of(&s1, Action::Retry(0)), 0.7);
        assert_eq!(a.count_of(&s1, Action::Retry(0)), 1);
        assert!((a.value_of(&s2, Action::Retry(4)) + 0.3).abs() < EPS);
        assert_eq!(a.count_of(&s2, Action::Retry(4)), 2);
    }

    #[test]
    fn test_merge_rejects_different_ladder() {
        let mut a = map(0.0);
        let b = StateActionMap::new(
            DelayLadder::from_millis(&[0, 500]).unwrap(),
            0.0,
            LearningRate::RunningMean,
        );
        assert!(matches!(a.merge(&b), Err(RlError::LadderMismatch { .. })));
    }

    #[test]
    fn test_delta_since_recovers_new_observations() {
        let s = state("RandomFailure");
        let mut table = map(0.0);
        table.update(&s, Action::Retry(0), 1.0);
        table.update(&s, Action::Retry(0), 3.0);
        let snapshot = table.clone();

        table.update(&s, Action::Retry(0), 8.0);
        table.update(&s, Action::Retry(0), 10.0);
        table.update(&s, Action::Abort, -2.0);

        let delta = table.delta_since(&snapshot).unwrap();
        assert_eq!(delta.count_of(&s, Action::Retry(0)), 2);
        assert!((delta.value_of(&s, Action::Retry(0)) - 9.0).abs() < EPS);
        assert_eq!(delta.count_of(&s, Action::Abort), 1);
        assert_eq!(delta.value_of(&s, Action::Abort), -2.0);

        let mut rebuilt = snapshot.clone();
        rebuilt.merge(&delta).unwrap();
        assert_maps_close(&rebuilt, &table);
    }

    #[test]
    fn test_tables_roundtrip_keeps_only_observed_pairs() {
        let s = state("TooBusyFailure");
        let mut table = map(0.5);
        table.update(&s, Action::Retry(2), -1.0);

        let tables = table.to_tables();
        assert_eq!(tables.counts[&s].len(), 1);

        let json = serde_json::to_string(&tables).unwrap();
        let parsed: WeightTables = serde_json::from_str(&json).unwrap();
        let restored =
            StateActionMap::from_tables(&parsed, 0.5, LearningRate::RunningMean).unwrap();
        assert_maps_close(&restored, &table);
        assert_eq!(restored.value_of(&s, Action::Retry(3)), 0.5);
    }

    #[test]
    fn test_from_tables_rejects_non_finite_value() {
        let s = state("RandomFailure");
        let mut tables = WeightTables::empty(DelayLadder::default());
        tables.values.entry(s.clone()).or_default().insert(Action::Abort, f64::NAN);
        tables.counts.entry(s).or_default().insert(Action::Abort, 3);

        let err = StateActionMap::from_tables(&tables, 0.0, LearningRate::RunningMean).unwrap_err();
        assert!(matches!(err, RlError::Persistence(_)));
    }

    #[test]
    fn test_merge_count_overflow_is_an_error() {
        let s = state("RandomFailure");
        let mut tables = WeightTables::empty(DelayLadder::default());
        tables.values.entry(s.clone()).or_default().insert(Action::Abort, -2.0);
        tables.counts.entry(s.clone()).or_default().insert(Action::Abort, u64::MAX);
        let huge = StateActionMap::from_tables(&tables, 0.0, LearningRate::RunningMean).unwrap();

        let mut merged = huge.clone();
        let err = merged.merge(&huge).unwrap_err();
        assert!(matches!(err, RlError::Persistence(_)));
        // Left as it was
        assert_eq!(merged.count_of(&s, Action::Abort), u64::MAX);
        assert_eq!(merged.total_updates(), u64::MAX);

        // Further updates saturate rather than wrap
        merged.update(&s, Action::Abort, -2.0);
        assert_eq!(merged.count_of(&s, Action::Abort), u64::MAX);
    }

    #[test]
    fn test_learning_rate_from_alpha() {
        assert_eq!(LearningRate::from_alpha(0.0), LearningRate::RunningMean);
        assert_eq!(LearningRate::from_alpha(0.2), LearningRate::Fixed(0.2));
    }
}
