//! File-backed weight store
//!
//! Tables are kept as a single JSON checkpoint in a directory. In
//! distributed mode several processes share the directory: each dump reads
//! the latest checkpoint, merges in only the observations made since the
//! writer's previous checkpoint, and writes the merged tables back.
//! Concurrent writers race at the file level (last rename wins); nothing
//! here locks.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use rlretry_rl::{LearningRate, Result, StateActionMap, WeightStore, WeightTables};

/// File name of the checkpoint inside the weights directory
pub const WEIGHTS_FILE: &str = "weights.json";

/// On-disk envelope around the tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Process that wrote this checkpoint
    pub writer: Uuid,
    pub saved_at: DateTime<Utc>,
    pub tables: WeightTables,
}

impl Checkpoint {
    pub fn new(writer: Uuid, tables: WeightTables) -> Self {
        Self {
            writer,
            saved_at: Utc::now(),
            tables,
        }
    }

    /// Read a checkpoint; a missing file is `Ok(None)`
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Write through a temporary file and rename into place
    pub fn write(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension(format!("json.{}.tmp", self.writer.simple()));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Merge the observations in `current` that are not in `previous` onto
/// `latest`.
pub fn merge_delta(
    latest: &WeightTables,
    current: &WeightTables,
    previous: &WeightTables,
) -> Result<WeightTables> {
    let current = from_tables(current)?;
    let previous = from_tables(previous)?;
    let delta = current.delta_since(&previous)?;
    let mut merged = from_tables(latest)?;
    merged.merge(&delta)?;
    Ok(merged.to_tables())
}

/// Count-weighted merge of two independently learned tables
pub fn merge_tables(left: &WeightTables, right: &WeightTables) -> Result<WeightTables> {
    let mut merged = from_tables(left)?;
    merged.merge(&from_tables(right)?)?;
    Ok(merged.to_tables())
}

// Only observed pairs are exported, so the prior used here never leaks out.
fn from_tables(tables: &WeightTables) -> Result<StateActionMap> {
    StateActionMap::from_tables(tables, 0.0, LearningRate::RunningMean)
}

/// Weight store persisting to `<dir>/weights.json`
#[derive(Debug, Clone)]
pub struct FileWeightStore {
    dir: PathBuf,
    distributed: bool,
    writer: Uuid,
}

impl FileWeightStore {
    /// Create a store, creating the directory if needed
    pub fn new(dir: impl Into<PathBuf>, distributed: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            distributed,
            writer: Uuid::new_v4(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(WEIGHTS_FILE)
    }

    pub fn writer(&self) -> Uuid {
        self.writer
    }

    pub fn is_distributed(&self) -> bool {
        self.distributed
    }

    fn save(&self, tables: WeightTables) -> Result<()> {
        let path = self.path();
        Checkpoint::new(self.writer, tables).write(&path)?;
        debug!(path = %path.display(), "wrote checkpoint");
        Ok(())
    }
}

impl WeightStore for FileWeightStore {
    fn load(&self) -> Result<Option<WeightTables>> {
        Ok(Checkpoint::read(&self.path())?.map(|checkpoint| checkpoint.tables))
    }

    fn dump(&self, current: &WeightTables, previous: &WeightTables) -> Result<()> {
        if !self.distributed {
            return self.save(current.clone());
        }

        let latest = match self.load() {
            Ok(latest) => latest,
            Err(e) => {
                warn!("Replacing unreadable checkpoint: {}", e);
                None
            }
        };
        match latest {
            Some(latest) if latest.ladder == current.ladder => {
                match merge_delta(&latest, current, previous) {
                    Ok(merged) => self.save(merged),
                    Err(e) => {
                        warn!("Replacing checkpoint that cannot be merged: {}", e);
                        self.save(current.clone())
                    }
                }
            }
            Some(_) => {
                warn!("Stored checkpoint uses a different delay ladder, replacing it");
                self.save(current.clone())
            }
            None => self.save(current.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rlretry_rl::{Action, DelayLadder, State};
    use tempfile::TempDir;

    use super::*;

    fn tables(entries: &[(&str, Action, f64, u64)]) -> WeightTables {
        let mut map = StateActionMap::new(DelayLadder::default(), 0.0, LearningRate::RunningMean);
        for &(state, action, value, count) in entries {
            for _ in 0..count {
                map.update(&State::new(state), action, value);
            }
        }
        map.to_tables()
    }

    fn value(tables: &WeightTables, state: &str, action: Action) -> f64 {
        tables.values[&State::new(state)][&action]
    }

    fn count(tables: &WeightTables, state: &str, action: Action) -> u64 {
        tables.counts[&State::new(state)][&action]
    }

    #[test]
    fn test_missing_checkpoint_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = FileWeightStore::new(dir.path(), false).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_dump_then_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileWeightStore::new(dir.path().join("weights"), false).unwrap();
        let saved = tables(&[("RandomFailure", Action::Retry(0), 1.5, 2)]);
        store.dump(&saved, &WeightTables::default()).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, saved);

        let checkpoint = Checkpoint::read(&store.path()).unwrap().unwrap();
        assert_eq!(checkpoint.writer, store.writer());
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = FileWeightStore::new(dir.path(), false).unwrap();
        fs::write(store.path(), b"{ not json").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_distributed_dump_persists_merged_tables() {
        let dir = TempDir::new().unwrap();
        let a = FileWeightStore::new(dir.path(), true).unwrap();
        let b = FileWeightStore::new(dir.path(), true).unwrap();
        let empty = WeightTables::empty(DelayLadder::default());

        let from_a = tables(&[("RandomFailure", Action::Retry(0), 1.0, 2)]);
        a.dump(&from_a, &empty).unwrap();

        let from_b = tables(&[
            ("RandomFailure", Action::Retry(0), 4.0, 1),
            ("TooBusyFailure", Action::Retry(4), -0.5, 3),
        ]);
        b.dump(&from_b, &empty).unwrap();

        let reloaded = a.load().unwrap().unwrap();
        assert_eq!(count(&reloaded, "RandomFailure", Action::Retry(0)), 3);
        assert!((value(&reloaded, "RandomFailure", Action::Retry(0)) - 2.0).abs() < 1e-9);
        assert_eq!(count(&reloaded, "TooBusyFailure", Action::Retry(4)), 3);
    }

    #[test]
    fn test_distributed_dump_sends_only_new_observations() {
        let dir = TempDir::new().unwrap();
        let store = FileWeightStore::new(dir.path(), true).unwrap();
        let empty = WeightTables::empty(DelayLadder::default());

        let first = tables(&[("RandomFailure", Action::Abort, -2.0, 2)]);
        store.dump(&first, &empty).unwrap();

        // Two more aborts observed locally since the first checkpoint
        let second = tables(&[("RandomFailure", Action::Abort, -2.0, 4)]);
        store.dump(&second, &first).unwrap();

        let reloaded = store.load().unwrap().unwrap();
        assert_eq!(count(&reloaded, "RandomFailure", Action::Abort), 4);
    }

    #[test]
    fn test_distributed_dump_replaces_corrupt_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = FileWeightStore::new(dir.path(), true).unwrap();
        fs::write(store.path(), b"garbage").unwrap();

        let current = tables(&[("RandomFailure", Action::Retry(1), 0.5, 1)]);
        store.dump(&current, &WeightTables::default()).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), current);
    }

    #[test]
    fn test_merge_tables_disjoint_union() {
        let left = tables(&[("RandomFailure", Action::Retry(0), 0.2, 2)]);
        let right = tables(&[("ClusteredFailure", Action::Retry(3), -1.0, 5)]);
        let merged = merge_tables(&left, &right).unwrap();
        assert_eq!(count(&merged, "RandomFailure", Action::Retry(0)), 2);
        assert!((value(&merged, "RandomFailure", Action::Retry(0)) - 0.2).abs() < 1e-9);
        assert_eq!(count(&merged, "ClusteredFailure", Action::Retry(3)), 5);
        assert!((value(&merged, "ClusteredFailure", Action::Retry(3)) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_tables_reports_count_overflow() {
        let mut huge = tables(&[("RandomFailure", Action::Abort, -2.0, 1)]);
        huge.counts
            .get_mut(&State::new("RandomFailure"))
            .unwrap()
            .insert(Action::Abort, u64::MAX);
        assert!(merge_tables(&huge, &huge).is_err());
    }

    #[test]
    fn test_distributed_dump_replaces_unmergeable_checkpoint() {
        let dir = TempDir::new().unwrap();
        let store = FileWeightStore::new(dir.path(), true).unwrap();
        let mut stored = tables(&[("RandomFailure", Action::Abort, -2.0, 1)]);
        stored
            .counts
            .get_mut(&State::new("RandomFailure"))
            .unwrap()
            .insert(Action::Abort, u64::MAX);
        Checkpoint::new(Uuid::new_v4(), stored).write(&store.path()).unwrap();

        let current = tables(&[("RandomFailure", Action::Abort, -2.0, 2)]);
        store
            .dump(&current, &WeightTables::empty(DelayLadder::default()))
            .unwrap();
        assert_eq!(store.load().unwrap().unwrap(), current);
    }
}
