use tracing::warn;

use crate::error::Result;
use crate::lock::{LockCoordinator, LockHandle};

/// Releases the lock when dropped, so early returns and panics inside a
/// locked section still clean up.
pub struct LockGuard<'a> {
    coordinator: &'a LockCoordinator,
    handle: Option<LockHandle>,
}

impl<'a> LockGuard<'a> {
    pub fn new(coordinator: &'a LockCoordinator, handle: LockHandle) -> Self {
        Self {
            coordinator,
            handle: Some(handle),
        }
    }

    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.coordinator.release(handle),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.coordinator.release(handle) {
                warn!("releasing lock failed: {}", err);
            }
        }
    }
}
