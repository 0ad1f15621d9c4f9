// src/orchestrator/guard.rs
//! Per-session re-entrancy guard.
//!
//! One flag per session id, checked-and-set under a single lock. A second
//! concurrent trigger for the same session is rejected with a conflict
//! rather than queued or cancelled. Process-local by design; multi-worker
//! ownership would need a leased lock in a shared store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ProcessingGuard {
    active: Arc<Mutex<HashSet<Uuid>>>,
}

/// Held while a stage runs; releases the flag on drop, including when the
/// stage task panics.
pub struct ProcessingClaim {
    active: Arc<Mutex<HashSet<Uuid>>>,
    session_id: Uuid,
}

fn lock(active: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    // A poisoned lock only means another claim panicked; the set is still
    // coherent because inserts/removes are single operations.
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessingGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the session for processing. Returns `None` when a stage is
    /// already in flight for it.
    pub fn claim(&self, session_id: Uuid) -> Option<ProcessingClaim> {
        let mut active = lock(&self.active);
        if !active.insert(session_id) {
            return None;
        }
        Some(ProcessingClaim {
            active: self.active.clone(),
            session_id,
        })
    }

    pub fn is_processing(&self, session_id: Uuid) -> bool {
        lock(&self.active).contains(&session_id)
    }
}

impl Drop for ProcessingClaim {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_for_same_session_is_rejected() {
        let guard = ProcessingGuard::new();
        let session_id = Uuid::new_v4();

        let claim = guard.claim(session_id);
        assert!(claim.is_some());
        assert!(guard.claim(session_id).is_none());
        assert!(guard.is_processing(session_id));
    }

    #[test]
    fn test_claim_releases_on_drop() {
        let guard = ProcessingGuard::new();
        let session_id = Uuid::new_v4();

        drop(guard.claim(session_id));
        assert!(!guard.is_processing(session_id));
        assert!(guard.claim(session_id).is_some());
    }

    #[test]
    fn test_sessions_are_guarded_independently() {
        let guard = ProcessingGuard::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        let _claim = guard.claim(first).unwrap();
        assert!(guard.claim(second).is_some());
    }
}
