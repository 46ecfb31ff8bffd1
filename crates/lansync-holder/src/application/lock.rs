//! Device lock state.
//!
//! When `require_unlock` is enabled the holder refuses data requests while
//! the device is locked (status 423), even for a paired consumer with a valid
//! token.  The platform shell flips the flag on lock/unlock notifications.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the holder device is currently locked.
pub trait DeviceLock: Send + Sync {
    fn is_locked(&self) -> bool;
}

/// A lock flag that can be toggled from any thread.
#[derive(Debug, Default)]
pub struct LockState {
    locked: AtomicBool,
}

impl LockState {
    pub fn new(locked: bool) -> Self {
        Self {
            locked: AtomicBool::new(locked),
        }
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }
}

impl DeviceLock for LockState {
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_state_toggles() {
        let state = LockState::default();
        assert!(!state.is_locked());

        state.lock();
        assert!(state.is_locked());

        state.unlock();
        assert!(!state.is_locked());
    }
}
