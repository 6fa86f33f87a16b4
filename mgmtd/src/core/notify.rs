use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

/// Told whenever target states changed in a way other daemons should learn about quickly.
pub trait StateRefreshNotifier: Send + Sync {
    fn notify_state_refresh(&self);
}

/// Change counter that waiters can block on.
#[derive(Debug, Default)]
pub struct RefreshSignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until the counter moves past `since`. Returns the counter value seen last.
    pub fn wait_for_change(&self, since: u64, timeout: Duration) -> u64 {
        let guard = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |generation| *generation == since)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

impl StateRefreshNotifier for RefreshSignal {
    fn notify_state_refresh(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation += 1;
        debug!(generation = *generation, "state refresh requested");
        self.changed.notify_all();
    }
}
