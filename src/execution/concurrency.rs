//! Named concurrency groups
//!
//! A group is a FIFO lock keyed by name and shared across runs. Requests
//! queue behind the current holder. When a request sets
//! `cancel_in_progress`, the holder's cancel flag is raised first; the
//! holder sees it between steps and gives the lock up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

#[derive(Default)]
struct GroupSlot {
    lock: Arc<AsyncMutex<()>>,
    holder: Mutex<Option<Arc<AtomicBool>>>,
}

/// Registry of concurrency groups
#[derive(Default)]
pub struct ConcurrencyRegistry {
    groups: Mutex<HashMap<String, Arc<GroupSlot>>>,
}

impl ConcurrencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, group: &str) -> Arc<GroupSlot> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups.entry(group.to_string()).or_default().clone()
    }

    /// Take the group's lock, waiting in FIFO order. `on_wait` is called
    /// once if the lock is currently held.
    pub async fn acquire(
        &self,
        group: &str,
        cancel_in_progress: bool,
        on_wait: impl FnOnce(),
    ) -> ConcurrencyLease {
        let slot = self.slot(group);

        if cancel_in_progress {
            let holder = slot.holder.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(flag) = holder.as_ref() {
                info!("Cancelling in-progress holder of concurrency group '{}'", group);
                flag.store(true, Ordering::SeqCst);
            }
        }

        let guard = match slot.lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Waiting for concurrency group '{}'", group);
                on_wait();
                slot.lock.clone().lock_owned().await
            }
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        *slot.holder.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancelled.clone());
        debug!("Acquired concurrency group '{}'", group);

        ConcurrencyLease {
            group: group.to_string(),
            cancelled,
            slot,
            _guard: guard,
        }
    }

    /// Whether the group is currently held
    pub fn is_held(&self, group: &str) -> bool {
        self.slot(group).lock.try_lock().is_err()
    }
}

/// Holding a group's lock; dropping the lease releases it
pub struct ConcurrencyLease {
    group: String,
    cancelled: Arc<AtomicBool>,
    slot: Arc<GroupSlot>,
    _guard: OwnedMutexGuard<()>,
}

impl ConcurrencyLease {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Raised when a newer request with `cancel_in_progress` arrives
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }
}

impl Drop for ConcurrencyLease {
    fn drop(&mut self) {
        let mut holder = self.slot.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder
            .as_ref()
            .is_some_and(|flag| Arc::ptr_eq(flag, &self.cancelled))
        {
            *holder = None;
        }
        debug!("Released concurrency group '{}'", self.group);
    }
}

/// A set of cancel flags, each with the reason reported when it is raised
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flags: Vec<(Arc<AtomicBool>, String)>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: Arc<AtomicBool>, reason: impl Into<String>) -> Self {
        self.flags.push((flag, reason.into()));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Reason of the first raised flag
    pub fn reason(&self) -> Option<&str> {
        self.flags
            .iter()
            .find(|(flag, _)| flag.load(Ordering::SeqCst))
            .map(|(_, reason)| reason.as_str())
    }
}
