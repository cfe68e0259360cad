//! Snapshot persistence between CLI runs

use std::path::Path;

use meshmon_core::snapshot::StateSnapshot;
use meshmon_core::{SharedState, SystemTimeSource, TimeSource};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::Result;

/// Shared state seeded from the saved snapshot, if there is one
pub fn load_state(config: &AppConfig) -> Result<SharedState> {
    let state = SharedState::new(&config.mesh);
    let path = config.snapshot_path();
    if path.exists() {
        StateSnapshot::load(&path)?.restore_into(&state)?;
        info!(path = %path.display(), "Restored saved state");
    } else {
        debug!(path = %path.display(), "No saved state");
    }
    Ok(state)
}

pub fn save_state(state: &SharedState, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    StateSnapshot::capture(state, SystemTimeSource.now()).save(path)?;
    info!(path = %path.display(), "Saved state");
    Ok(())
}
