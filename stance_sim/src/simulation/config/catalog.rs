// stance_sim/src/simulation/config/catalog.rs

//! Finds the scenario files a run should process.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::simulation::core::error::SimError;

/// A single file is returned as is. A directory is walked for `*.toml`
/// files, returned in path order so runs are reproducible.
pub fn discover_scenarios(path: &Path) -> Result<Vec<PathBuf>, SimError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(SimError::MissingScenario(path.to_path_buf()));
    }

    info!("Looking for scenarios in: {:?}", path);
    let mut scenarios: Vec<PathBuf> = WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|e| !e.file_type().is_dir() && e.path().extension().is_some_and(|ext| ext == "toml"))
        .map(|e| e.into_path())
        .collect();
    scenarios.sort();

    if scenarios.is_empty() {
        warn!("No scenario files found under {:?}", path);
    }
    Ok(scenarios)
}
