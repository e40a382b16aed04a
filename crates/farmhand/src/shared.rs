use std::path::PathBuf;
use std::sync::OnceLock;

use tokio::sync::Mutex;
use tracing::info;

use farmhand_worker::ModuleRegistry;

use crate::config::FarmOptions;
use crate::error::Result;
use crate::farm::Farm;

struct SharedSlot {
    worker_path: PathBuf,
    farm: Farm,
}

static SHARED_FARM: OnceLock<Mutex<Option<SharedSlot>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<SharedSlot>> {
    SHARED_FARM.get_or_init(|| Mutex::new(None))
}

impl Farm {
    /// Process-wide shared farm. The same worker path returns the same
    /// instance; a different worker path ends the previous farm and
    /// replaces it.
    pub async fn shared(options: FarmOptions, registry: ModuleRegistry) -> Result<Farm> {
        let mut guard = slot().lock().await;
        if let Some(existing) = guard.as_ref()
            && existing.worker_path == options.worker_path
        {
            return Ok(existing.farm.clone());
        }
        if let Some(previous) = guard.take() {
            info!(
                "replacing shared farm: worker path changed to {}",
                options.worker_path.display()
            );
            previous.farm.end_in_place().await;
        }
        let farm = Farm::new(options, registry)?;
        *guard = Some(SharedSlot {
            worker_path: farm.options().worker_path.clone(),
            farm: farm.clone(),
        });
        Ok(farm)
    }
}

/// Clear the slot if this farm occupies it. Called from `Farm::end`.
pub(crate) async fn release(farm: &Farm) {
    let mut guard = slot().lock().await;
    if let Some(shared) = guard.as_ref()
        && shared.farm.ptr_eq(farm)
    {
        *guard = None;
    }
}
