//! Cooperative cancellation of task parts
//!
//! Map and reduce loops never get interrupted mid-entry. They hold a
//! [`CancellationToken`] and poll it at a fixed cadence; cancel commands
//! only flip the token registered under the part's id.

use super::TaskId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};
use uuid::Uuid;

/// Shared flag observed by a running task part
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-member registry of running task parts, keyed by part id.
///
/// Cancels for parts that are not running are kept per task until the part
/// registers or the task is released.
#[derive(Debug, Default)]
pub struct CancellationService {
    inner: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    running: HashMap<Uuid, CancellationToken>,
    pending: HashMap<Uuid, TaskId>,
}

impl CancellationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a part about to start and hand back its token.
    ///
    /// If a cancel for `part_id` arrived before the part started, the
    /// returned token is already cancelled.
    pub fn register(&self, part_id: Uuid) -> CancellationToken {
        let mut registry = self.registry();
        let token = CancellationToken::new();
        if registry.pending.remove(&part_id).is_some() {
            token.cancel();
        }
        registry.running.insert(part_id, token.clone());
        trace!("Registered task part {}", part_id);
        token
    }

    pub fn unregister(&self, part_id: &Uuid) {
        self.registry().running.remove(part_id);
        trace!("Unregistered task part {}", part_id);
    }

    /// Cancel the part of `task_id` registered under `part_id`.
    ///
    /// Returns whether a running part was found. An unknown id is remembered
    /// as cancelled so a part registering afterwards starts cancelled.
    pub fn cancel(&self, task_id: &TaskId, part_id: &Uuid) -> bool {
        let mut registry = self.registry();
        match registry.running.get(part_id) {
            Some(token) => {
                debug!("Cancelling task part {}", part_id);
                token.cancel();
                true
            }
            None => {
                debug!("Task part {} not running, recording cancellation", part_id);
                registry.pending.insert(*part_id, task_id.clone());
                false
            }
        }
    }

    /// Drop the cancellations recorded for parts of `task_id` that never ran
    pub fn release_task(&self, task_id: &TaskId) -> usize {
        let mut registry = self.registry();
        let before = registry.pending.len();
        registry.pending.retain(|_, owner| *owner != *task_id);
        let released = before - registry.pending.len();
        if released > 0 {
            debug!(
                "Released {} pending cancellations of task {}",
                released, task_id
            );
        }
        released
    }

    /// Number of parts currently registered, pending cancellations included
    pub fn registered(&self) -> usize {
        let registry = self.registry();
        registry.running.len() + registry.pending.len()
    }
}
