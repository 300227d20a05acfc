// ABOUTME: Worker registry: id to slot map shared by control calls and the health monitor.
// ABOUTME: Each slot serializes lifecycle operations and guards its record with a short-held lock.

use crate::process::OutputLog;
use crate::worker::{WorkerRecord, WorkerState, WorkerStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use wko_supervisor_core::WorkerConfig;

/// One supervised worker.
///
/// `lifecycle` is held across the whole of a start/stop/restart or health
/// probe, so those never interleave for the same worker. `record` is only
/// ever held for field updates and never across an await.
pub struct WorkerSlot {
    pub id: String,
    pub config: WorkerConfig,
    lifecycle: AsyncMutex<()>,
    record: Mutex<WorkerRecord>,
    output: OutputLog,
}

impl WorkerSlot {
    pub fn new(id: &str, config: WorkerConfig) -> Self {
        Self {
            id: id.to_string(),
            config,
            lifecycle: AsyncMutex::new(()),
            record: Mutex::new(WorkerRecord::default()),
            output: OutputLog::default(),
        }
    }

    pub(crate) async fn lock_lifecycle(&self) -> AsyncMutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// The lifecycle lock, unless another operation holds it.
    pub(crate) fn try_lock_lifecycle(&self) -> Option<AsyncMutexGuard<'_, ()>> {
        self.lifecycle.try_lock().ok()
    }

    pub(crate) fn with_record<R>(&self, f: impl FnOnce(&mut WorkerRecord) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }

    pub fn state(&self) -> WorkerState {
        self.with_record(|r| r.health.status)
    }

    pub fn status(&self) -> WorkerStatus {
        self.with_record(|r| WorkerStatus::capture(&self.id, &self.config, r))
    }

    pub fn output(&self) -> &OutputLog {
        &self.output
    }
}

/// Slots are created on a worker's first start and kept for the life of the supervisor.
#[derive(Default)]
pub struct WorkerRegistry {
    slots: RwLock<HashMap<String, Arc<WorkerSlot>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkerSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn get_or_insert(&self, id: &str, config: &WorkerConfig) -> Arc<WorkerSlot> {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(WorkerSlot::new(id, config.clone()))),
        )
    }

    pub fn all(&self) -> Vec<Arc<WorkerSlot>> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Workers other than `except` that own a live process handle, whatever
    /// their state. A Failed worker left running after a handshake counts.
    pub fn process_count(&self, except: &str) -> usize {
        self.all()
            .iter()
            .filter(|slot| slot.id != except && slot.with_record(|r| r.process.is_some()))
            .count()
    }
}
