//! Process-wide session lock with an explicit owner.
//!
//! Not a mutex around a critical section: a reservation that one connection
//! holds across many WebSocket messages. Gated operations check
//! "locked by me", never just "locked". State changes happen under a short
//! non-suspending critical section and every transition is broadcast by the
//! caller.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::error::GatewayError;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<String>,
    acquired_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of the lock for welcome and broadcast frames.
#[derive(Debug, Clone)]
pub struct LockSnapshot {
    pub active: bool,
    pub owner: Option<String>,
}

/// Single-holder exclusive lock with owner identity.
#[derive(Debug, Default)]
pub struct SessionLock {
    state: Mutex<LockState>,
}

impl SessionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `connection_id` if it is free.
    pub fn acquire(&self, connection_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().expect("session lock poisoned");
        match &state.owner {
            Some(owner) => Err(GatewayError::SessionAlreadyActive {
                owner: owner.clone(),
            }),
            None => {
                state.owner = Some(connection_id.to_string());
                state.acquired_at = Some(Utc::now());
                Ok(())
            }
        }
    }

    /// Release the lock; only the current owner may do so.
    pub fn release(&self, connection_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().expect("session lock poisoned");
        match &state.owner {
            None => Err(GatewayError::NoActiveSession),
            Some(owner) if owner != connection_id => Err(GatewayError::NotSessionOwner {
                owner: owner.clone(),
            }),
            Some(_) => {
                if let Some(acquired_at) = state.acquired_at {
                    debug!(
                        "Session lock held for {}s",
                        (Utc::now() - acquired_at).num_seconds()
                    );
                }
                state.owner = None;
                state.acquired_at = None;
                Ok(())
            }
        }
    }

    /// Predicate for gated operations: held and owned by `connection_id`.
    pub fn require(&self, connection_id: &str) -> Result<(), GatewayError> {
        let state = self.state.lock().expect("session lock poisoned");
        match &state.owner {
            None => Err(GatewayError::NoActiveSession),
            Some(owner) if owner != connection_id => Err(GatewayError::NotSessionOwner {
                owner: owner.clone(),
            }),
            Some(_) => Ok(()),
        }
    }

    /// Release during teardown without failing when this connection is not
    /// the owner. Returns whether a release actually happened.
    pub fn release_if_owner(&self, connection_id: &str) -> bool {
        let mut state = self.state.lock().expect("session lock poisoned");
        if state.owner.as_deref() == Some(connection_id) {
            state.owner = None;
            state.acquired_at = None;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock().expect("session lock poisoned");
        LockSnapshot {
            active: state.owner.is_some(),
            owner: state.owner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_then_release_returns_to_free() {
        let lock = SessionLock::new();

        lock.acquire("conn-a").unwrap();
        lock.release("conn-a").unwrap();

        let snapshot = lock.snapshot();
        assert!(!snapshot.active);
        assert_eq!(snapshot.owner, None);
    }

    #[test]
    fn test_second_acquire_rejected_with_owner() {
        let lock = SessionLock::new();
        lock.acquire("conn-a").unwrap();

        let err = lock.acquire("conn-b").unwrap_err();
        assert_eq!(err.code(), 50004);
        assert_eq!(err.detail(), Some("owner=conn-a".to_string()));

        // Lock remains held by the original owner.
        assert_eq!(lock.snapshot().owner.as_deref(), Some("conn-a"));
    }

    #[test]
    fn test_release_on_free_lock_rejected_and_state_unchanged() {
        let lock = SessionLock::new();

        let err = lock.release("conn-a").unwrap_err();
        assert_eq!(err.code(), 50005);
        assert!(!lock.snapshot().active);
    }

    #[test]
    fn test_release_by_non_owner_rejected() {
        let lock = SessionLock::new();
        lock.acquire("conn-a").unwrap();

        let err = lock.release("conn-b").unwrap_err();
        assert_eq!(err.code(), 50006);
        assert_eq!(lock.snapshot().owner.as_deref(), Some("conn-a"));
    }

    #[test]
    fn test_require_checks_ownership_not_just_busy() {
        let lock = SessionLock::new();

        assert_eq!(lock.require("conn-a").unwrap_err().code(), 50005);

        lock.acquire("conn-a").unwrap();
        assert!(lock.require("conn-a").is_ok());
        assert_eq!(lock.require("conn-b").unwrap_err().code(), 50006);
    }

    #[test]
    fn test_release_if_owner_is_silent_for_non_owner() {
        let lock = SessionLock::new();
        lock.acquire("conn-a").unwrap();

        assert!(!lock.release_if_owner("conn-b"));
        assert_eq!(lock.snapshot().owner.as_deref(), Some("conn-a"));

        assert!(lock.release_if_owner("conn-a"));
        assert!(!lock.snapshot().active);
    }

    #[test]
    fn test_reacquire_after_release() {
        let lock = SessionLock::new();
        lock.acquire("conn-a").unwrap();
        lock.release("conn-a").unwrap();

        assert!(lock.acquire("conn-b").is_ok());
        assert_eq!(lock.snapshot().owner.as_deref(), Some("conn-b"));
    }

    #[test]
    fn test_only_one_holder_under_contention() {
        use std::sync::Arc;

        let lock = Arc::new(SessionLock::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                lock.acquire(&format!("conn-{}", i)).is_ok()
            }));
        }

        let acquired = handles
            .into_iter()
            .map(|h| h.join())
            .filter(|r| matches!(r, Ok(true)))
            .count();
        assert_eq!(acquired, 1);
        assert!(lock.snapshot().active);
    }
}
