use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::scheduler;

/// Compactor wake-up cadence; compaction itself only runs past the
/// append threshold.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Manages per-workspace engines. Each workspace gets its own Engine +
/// WAL + background generation sweep and compactor.
/// Workspace = database name from the pgwire connection.
pub struct WorkspaceManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    horizon_weeks: u32,
    sweep_interval: Duration,
}

impl WorkspaceManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        horizon_weeks: u32,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            horizon_weeks,
            sweep_interval,
        }
    }

    /// Get or lazily create an engine for the given workspace.
    pub fn get_or_create(&self, workspace: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(workspace) {
            return Ok(engine.value().clone());
        }
        if workspace.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "workspace name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many workspaces"));
        }

        // Sanitize workspace name to prevent path traversal
        let safe_name: String = workspace
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty workspace name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify)?);

        // Spawn generation sweep + compactor for this workspace
        let sweep_engine = engine.clone();
        let horizon = self.horizon_weeks;
        let sweep_every = self.sweep_interval;
        tokio::spawn(async move {
            scheduler::run_generator(sweep_engine, horizon, sweep_every).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            scheduler::run_compactor(compactor_engine, threshold, COMPACT_CHECK_INTERVAL).await;
        });

        self.engines.insert(workspace.to_string(), engine.clone());
        metrics::gauge!(crate::observability::WORKSPACES_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}
