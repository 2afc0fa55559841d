use crate::optimizer::{export_params, format_epoch_line};
use crate::storage::{best_epoch, latest_hyperopt_path, load_epochs};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Results file to show: the given one, else the latest run in `results_dir`.
pub fn resolve_results_file(file: Option<PathBuf>, results_dir: &Path) -> Result<PathBuf> {
    match file {
        Some(path) => Ok(path),
        None => latest_hyperopt_path(results_dir),
    }
}

/// Prints the best epoch of a results file and its parameters.
pub fn run(path: &Path) -> Result<()> {
    let epochs = load_epochs(path)?;
    let best = best_epoch(&epochs)
        .ok_or_else(|| anyhow!("No epochs found in {}", path.display()))?;
    let total = epochs.len();
    println!("{} epochs in {}", total, path.display());
    println!("\nBest result:\n\n{}\n", format_epoch_line(best, total));
    println!(
        "{}",
        serde_json::to_string_pretty(&Value::Object(export_params(best)))?
    );
    Ok(())
}
