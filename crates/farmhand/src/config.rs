use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Integer override for the default remote worker count.
pub const WORKERS_ENV: &str = "FARMHAND_WORKERS";
/// Integer override for the default per-worker in-flight cap.
pub const MAX_CONCURRENT_CALLS_ENV: &str = "FARMHAND_MAX_CONCURRENT_CALLS";

const DEFAULT_CALLS_PER_WORKER: usize = 5;
const DEFAULT_FORCED_KILL_TIME: Duration = Duration::from_millis(100);

/// Farm configuration. Immutable once the farm is constructed.
#[derive(Debug, Clone)]
pub struct FarmOptions {
    /// Upper bound on remote workers. Zero disables the pool entirely.
    pub max_concurrent_workers: usize,
    /// Per-worker in-flight call cap, at least 1.
    pub max_concurrent_calls_per_worker: usize,
    /// Grace period between a stop request and a forced kill.
    pub forced_kill_time: Duration,
    /// Allow in-parent execution while the pool warms up.
    pub use_local_worker: bool,
    /// Run the warmup protocol before cutting over to remote workers.
    pub warm_workers: bool,
    /// Path to the worker executable. Required.
    pub worker_path: PathBuf,
    /// Extra arguments passed to the worker executable.
    pub worker_args: Vec<String>,
}

impl FarmOptions {
    pub fn with_worker_path(path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: path.into(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.worker_path.as_os_str().is_empty() {
            return Err(Error::config("Please provide a worker path!"));
        }
        if self.max_concurrent_calls_per_worker == 0 {
            return Err(Error::config(
                "max_concurrent_calls_per_worker must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for FarmOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_worker_count(),
            max_concurrent_calls_per_worker: default_calls_per_worker(),
            forced_kill_time: DEFAULT_FORCED_KILL_TIME,
            use_local_worker: true,
            warm_workers: true,
            worker_path: PathBuf::new(),
            worker_args: Vec::new(),
        }
    }
}

/// Default remote worker count: `FARMHAND_WORKERS` when set, otherwise the
/// number of available cores.
pub fn default_worker_count() -> usize {
    env_usize(WORKERS_ENV).unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
    })
}

/// Default per-worker cap: `FARMHAND_MAX_CONCURRENT_CALLS` when set,
/// otherwise 5.
pub fn default_calls_per_worker() -> usize {
    env_usize(MAX_CONCURRENT_CALLS_ENV)
        .unwrap_or(DEFAULT_CALLS_PER_WORKER)
        .max(1)
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring unparsable {name}={raw}");
            None
        }
    }
}
