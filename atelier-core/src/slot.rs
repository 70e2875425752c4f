//! The single device-resident model slot.
//!
//! All mutations of [`SlotState`] happen on a blocking thread while the
//! slot's `tokio::sync::Mutex` is held, so loads, unloads, guarded deletes
//! and inference never overlap. Callers queue on the mutex in arrival order.
//! A read-only [`SlotSnapshot`] is published through a watch channel for
//! health reporting without waiting behind a running inference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, Result};
use crate::loader::{LoadRequest, Loader};
use crate::registry::{ModelDescriptor, Registry};
use crate::store::ModelStore;
use crate::{ModelLike, Precision};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Empty,
    Loading,
    Ready,
    Unloading,
}

/// Point-in-time view of the slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub status: SlotStatus,
    pub model: Option<String>,
    pub resident_bytes: u64,
    pub loaded_at: Option<String>,
    pub inference_running: bool,
    /// Operations holding or waiting for the slot.
    pub pending_operations: usize,
    pub loads: u64,
    pub unloads: u64,
    pub cache_hits: u64,
    pub inferences: u64,
}

struct Occupant {
    key: String,
    handle: Box<dyn ModelLike>,
    resident_bytes: u64,
    loaded_at: String,
}

pub(crate) struct SlotState {
    occupant: Option<Occupant>,
    status: SlotStatus,
}

impl SlotState {
    pub(crate) fn occupant_key(&self) -> Option<&str> {
        self.occupant.as_ref().map(|occupant| occupant.key.as_str())
    }
}

pub(crate) struct SlotContext {
    registry: Arc<Registry>,
    store: ModelStore,
    loader: Arc<dyn Loader>,
    precision: Precision,
    snapshot: watch::Sender<SlotSnapshot>,
}

impl SlotContext {
    fn publish(&self, state: &SlotState) {
        self.snapshot.send_modify(|snapshot| {
            snapshot.status = state.status;
            snapshot.model = state.occupant.as_ref().map(|o| o.key.clone());
            snapshot.resident_bytes = state.occupant.as_ref().map_or(0, |o| o.resident_bytes);
            snapshot.loaded_at = state.occupant.as_ref().map(|o| o.loaded_at.clone());
        });
    }

    /// Repairs a status left behind by a panicked slot task.
    fn settle(&self, state: &mut SlotState) {
        if matches!(state.status, SlotStatus::Loading | SlotStatus::Unloading) {
            warn!(status = ?state.status, "settling slot left mid-transition");
            state.status = match state.occupant {
                Some(_) => SlotStatus::Ready,
                None => SlotStatus::Empty,
            };
        }
        self.snapshot
            .send_modify(|snapshot| snapshot.inference_running = false);
        self.publish(state);
    }

    fn ensure_loaded(&self, state: &mut SlotState, descriptor: &ModelDescriptor) -> Result<()> {
        let key = descriptor.key;
        if state.status == SlotStatus::Ready && state.occupant_key() == Some(key) {
            debug!(model = key, "model already resident");
            self.snapshot.send_modify(|snapshot| snapshot.cache_hits += 1);
            return Ok(());
        }
        if !self.store.is_present(key) {
            return Err(LifecycleError::ModelNotDownloaded(key.to_string()));
        }

        if let Some(previous) = state.occupant_key() {
            info!(from = previous, to = key, "swapping resident model");
        }
        self.unload(state)?;

        state.status = SlotStatus::Loading;
        self.publish(state);
        let start = Instant::now();
        let dir = self.store.directory_for(key);
        let loaded = self.loader.load(LoadRequest {
            descriptor,
            dir: &dir,
            precision: self.precision,
            optimize_memory: descriptor.needs_memory_optimization,
        });

        match loaded {
            Ok(handle) => {
                let resident_bytes = handle.resident_bytes();
                state.occupant = Some(Occupant {
                    key: key.to_string(),
                    handle,
                    resident_bytes,
                    loaded_at: chrono::Utc::now().to_rfc3339(),
                });
                state.status = SlotStatus::Ready;
                self.snapshot.send_modify(|snapshot| snapshot.loads += 1);
                self.publish(state);
                info!(
                    model = key,
                    resident_bytes,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "model loaded"
                );
                Ok(())
            }
            Err(cause) => {
                state.occupant = None;
                state.status = SlotStatus::Empty;
                self.publish(state);
                error!(model = key, error = %format!("{cause:#}"), "model load failed");
                Err(LifecycleError::load_failed(key, &cause))
            }
        }
    }

    /// Releases the occupant, returning its key. The release is synchronous:
    /// device memory is reclaimed before this returns.
    fn unload(&self, state: &mut SlotState) -> Result<Option<String>> {
        let Some(occupant) = state.occupant.take() else {
            state.status = SlotStatus::Empty;
            self.publish(state);
            return Ok(None);
        };

        state.status = SlotStatus::Unloading;
        self.snapshot
            .send_modify(|snapshot| snapshot.status = SlotStatus::Unloading);
        let start = Instant::now();
        let released = occupant.handle.release();

        state.status = SlotStatus::Empty;
        self.snapshot.send_modify(|snapshot| snapshot.unloads += 1);
        self.publish(state);

        match released {
            Ok(()) => {
                info!(
                    model = %occupant.key,
                    freed_bytes = occupant.resident_bytes,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "model unloaded"
                );
                Ok(Some(occupant.key))
            }
            Err(cause) => {
                error!(
                    model = %occupant.key,
                    error = %format!("{cause:#}"),
                    "device release failed, slot marked empty"
                );
                Err(LifecycleError::UnloadFailed {
                    key: occupant.key,
                    cause: format!("{cause:#}"),
                })
            }
        }
    }
}

/// Counts an operation as pending until dropped, including when the
/// awaiting future is dropped by a disconnected client.
struct PendingOperation<'a>(&'a watch::Sender<SlotSnapshot>);

impl<'a> PendingOperation<'a> {
    fn enter(snapshot: &'a watch::Sender<SlotSnapshot>) -> Self {
        snapshot.send_modify(|snapshot| snapshot.pending_operations += 1);
        Self(snapshot)
    }
}

impl Drop for PendingOperation<'_> {
    fn drop(&mut self) {
        self.0
            .send_modify(|snapshot| snapshot.pending_operations -= 1);
    }
}

/// Owner of the single model slot.
#[derive(Clone)]
pub struct SlotManager {
    state: Arc<Mutex<SlotState>>,
    context: Arc<SlotContext>,
    snapshot: watch::Receiver<SlotSnapshot>,
    cancel_epoch: Arc<AtomicU64>,
}

impl SlotManager {
    pub fn new(
        registry: Arc<Registry>,
        store: ModelStore,
        loader: Arc<dyn Loader>,
        precision: Precision,
    ) -> Self {
        let (sender, receiver) = watch::channel(SlotSnapshot::default());
        Self {
            state: Arc::new(Mutex::new(SlotState {
                occupant: None,
                status: SlotStatus::Empty,
            })),
            context: Arc::new(SlotContext {
                registry,
                store,
                loader,
                precision,
                snapshot: sender,
            }),
            snapshot: receiver,
            cancel_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SlotSnapshot> {
        self.snapshot.clone()
    }

    pub fn device_name(&self) -> String {
        self.context.loader.device_name()
    }

    /// Makes `key` the resident model, evicting any other occupant first.
    pub async fn ensure_loaded(&self, key: &str) -> Result<()> {
        let descriptor = self.context.registry.resolve(key)?.clone();
        self.exclusive(move |context, state| context.ensure_loaded(state, &descriptor))
            .await
    }

    /// Ensures `key` is resident and runs `f` against it without releasing
    /// the slot in between.
    pub async fn with_model<R, F>(&self, key: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn ModelLike) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let descriptor = self.context.registry.resolve(key)?.clone();
        self.exclusive(move |context, state| {
            context.ensure_loaded(state, &descriptor)?;
            let occupant = state.occupant.as_mut().ok_or_else(|| {
                LifecycleError::InferenceFailed("slot emptied before inference".to_string())
            })?;

            context
                .snapshot
                .send_modify(|snapshot| snapshot.inference_running = true);
            let result = f(occupant.handle.as_mut());
            context.snapshot.send_modify(|snapshot| {
                snapshot.inference_running = false;
                snapshot.inferences += 1;
            });
            result.map_err(|cause| LifecycleError::inference_failed(&cause))
        })
        .await
    }

    /// Releases the resident model, if any. Returns the released key.
    pub async fn unload(&self) -> Result<Option<String>> {
        self.exclusive(|context, state| context.unload(state)).await
    }

    /// Records a cancellation request. In-flight work keeps running; when the
    /// slot lock is free the engine is asked to reclaim cached memory while
    /// the lock is held, so a reclaim never overlaps a load or an inference.
    pub async fn request_cancel(&self) -> u64 {
        let epoch = self.cancel_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(state) = self.state.clone().try_lock_owned() else {
            info!(epoch, "cancel requested while the slot is busy, current work will complete");
            return epoch;
        };
        let loader = self.context.loader.clone();
        let reclaimed = tokio::task::spawn_blocking(move || {
            let _state = state;
            loader.reclaim()
        });
        match reclaimed.await {
            Ok(Ok(())) => debug!(epoch, "device memory reclaimed"),
            Ok(Err(cause)) => warn!(epoch, error = %format!("{cause:#}"), "reclaim failed"),
            Err(join) => warn!(epoch, error = %join, "reclaim task failed"),
        }
        epoch
    }

    pub fn cancel_epoch(&self) -> u64 {
        self.cancel_epoch.load(Ordering::SeqCst)
    }

    /// Runs `op` with exclusive access to the slot on a blocking thread.
    pub(crate) async fn exclusive<R, F>(&self, op: F) -> Result<R>
    where
        F: FnOnce(&SlotContext, &mut SlotState) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _pending = PendingOperation::enter(&self.context.snapshot);
        let guard = self.state.clone().lock_owned().await;
        let context = self.context.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut state = guard;
            op(&*context, &mut *state)
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(join) => {
                error!(error = %join, "slot task panicked");
                let mut state = self.state.lock().await;
                self.context.settle(&mut *state);
                Err(LifecycleError::InferenceFailed(format!(
                    "slot task panicked: {join}"
                )))
            }
        }
    }
}
