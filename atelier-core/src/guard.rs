use std::io;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::download::ActiveDownloads;
use crate::error::{LifecycleError, Result};
use crate::registry::Registry;
use crate::slot::SlotManager;
use crate::store::ModelStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { freed_bytes: u64 },
    AlreadyAbsent,
}

/// Removes model artifacts from disk, refusing while the model is resident
/// or being downloaded.
///
/// The check and the removal run under the slot lock, so a concurrent load
/// of the same key either finishes first (and the delete is refused) or
/// starts after the directory is gone. The key is also reserved against
/// downloads for the duration of the removal.
#[derive(Clone)]
pub struct DeletionGuard {
    registry: Arc<Registry>,
    store: ModelStore,
    slot: SlotManager,
    downloads: ActiveDownloads,
}

impl DeletionGuard {
    pub fn new(
        registry: Arc<Registry>,
        store: ModelStore,
        slot: SlotManager,
        downloads: ActiveDownloads,
    ) -> Self {
        Self {
            registry,
            store,
            slot,
            downloads,
        }
    }

    pub async fn delete(&self, key: &str) -> Result<DeleteOutcome> {
        let key = self.registry.resolve(key)?.key;
        let store = self.store.clone();
        let downloads = self.downloads.clone();

        self.slot
            .exclusive(move |_, state| {
                if state.occupant_key() == Some(key) {
                    return Err(LifecycleError::ModelInUse(key.to_string()));
                }
                // Held through the removal so no transfer can start mid-delete.
                let _reservation = downloads.claim(key)?;
                let freed_bytes = store.size_on_disk(key);
                match store.delete(key) {
                    Ok(()) => {
                        info!(model = key, freed_bytes, "model deleted from disk");
                        Ok(DeleteOutcome::Deleted { freed_bytes })
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::AlreadyAbsent),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }
}
