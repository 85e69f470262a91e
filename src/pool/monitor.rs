use parking_lot::{Mutex, MutexGuard};
use std::pin::Pin;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Mutex plus wait/notify-one condition guarding one pool
///
/// A waiter must be created while the lock is held so that a notification
/// issued after the lock is released cannot be missed. Each `notify_one`
/// wakes at most one waiter.
#[derive(Debug, Default)]
pub struct PoolMonitor<T> {
    state: Mutex<T>,
    cond: Notify,
}

impl<T> PoolMonitor<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Notify::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock()
    }

    /// Register interest in the next notification
    pub fn waiter(&self) -> Pin<Box<Notified<'_>>> {
        let mut notified = Box::pin(self.cond.notified());
        notified.as_mut().enable();
        notified
    }

    pub fn notify_one(&self) {
        self.cond.notify_one();
    }
}
