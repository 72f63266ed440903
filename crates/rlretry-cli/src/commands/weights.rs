//! Checkpoint inspection and merging

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use rlretry::{merge_tables, Action, Checkpoint, DelayLadder, WeightTables, WEIGHTS_FILE};

/// Accept either a checkpoint file or the directory holding one
fn checkpoint_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(WEIGHTS_FILE)
    } else {
        path.to_path_buf()
    }
}

fn read(path: &Path) -> Result<Checkpoint> {
    let path = checkpoint_path(path);
    Checkpoint::read(&path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?
        .with_context(|| format!("No checkpoint at {}", path.display()))
}

pub fn inspect(path: &Path) -> Result<()> {
    let checkpoint = read(path)?;
    println!("Checkpoint: {}", checkpoint_path(path).display());
    println!("Writer:     {}", checkpoint.writer);
    println!("Saved at:   {}", checkpoint.saved_at.to_rfc3339());
    println!();
    print_table(&checkpoint.tables);
    Ok(())
}

pub fn merge(left: &Path, right: &Path, output: &Path) -> Result<()> {
    let left = read(left)?;
    let right = read(right)?;
    let merged = merge_tables(&left.tables, &right.tables)
        .context("Checkpoints cannot be merged")?;

    let output = checkpoint_path(output);
    Checkpoint::new(Uuid::new_v4(), merged)
        .write(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Merged checkpoint written to {}", output.display());
    Ok(())
}

/// Best action among the observed ones, earlier ladder entries winning ties
pub fn best_observed(ladder: &DelayLadder, values: &BTreeMap<Action, f64>) -> Option<Action> {
    let mut best: Option<(Action, f64)> = None;
    for action in ladder.actions() {
        if let Some(&value) = values.get(&action) {
            if best.map_or(true, |(_, v)| value > v) {
                best = Some((action, value));
            }
        }
    }
    best.map(|(action, _)| action)
}

fn column(ladder: &DelayLadder, action: Action) -> String {
    match ladder.delay(action) {
        Some(delay) => format!("{}ms", delay.as_millis()),
        None => "abort".to_string(),
    }
}

/// Print values with their counts, one row per state
pub fn print_table(tables: &WeightTables) {
    let ladder = &tables.ladder;
    if tables.is_empty() {
        println!("(no observations)");
        return;
    }

    let width = tables
        .values
        .keys()
        .map(|state| state.as_str().len())
        .max()
        .unwrap_or(0)
        .max("state".len());

    print!("{:<width$}", "state");
    for action in ladder.actions() {
        print!("  {:>16}", column(ladder, action));
    }
    println!("  best");

    for (state, values) in &tables.values {
        let counts = tables.counts.get(state);
        print!("{:<width$}", state.as_str());
        for action in ladder.actions() {
            let cell = match values.get(&action) {
                Some(value) => {
                    let count = counts.and_then(|c| c.get(&action)).copied().unwrap_or(0);
                    format!("{value:.3} ({count})")
                }
                None => "-".to_string(),
            };
            print!("  {cell:>16}");
        }
        let best = best_observed(ladder, values).map_or("-".to_string(), |a| column(ladder, a));
        println!("  {best}");
    }
}
