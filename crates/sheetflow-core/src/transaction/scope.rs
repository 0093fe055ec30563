//! Advisory locks over transaction scopes.
//!
//! Exclusive transactions register their scope here for their lifetime. A
//! claimant whose scope overlaps a held one waits (bounded) for a release and
//! then fails with `ScopeUnavailable` instead of deadlocking.

use std::sync::Mutex;
use std::time::Duration;

use sheetflow_types::range::Scope;
use sheetflow_types::transaction::TransactionHandle;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct ScopeLocks {
    held: Mutex<Vec<(TransactionHandle, Scope)>>,
    released: Notify,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `scope` for `owner` if no held scope overlaps it.
    pub fn try_acquire(&self, owner: TransactionHandle, scope: &Scope) -> bool {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.iter().any(|(_, other)| other.overlaps(scope)) {
            return false;
        }
        held.push((owner, scope.clone()));
        true
    }

    /// Claim `scope`, waiting up to `wait` for overlapping holders to release.
    pub async fn acquire(&self, owner: TransactionHandle, scope: &Scope, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            // Register interest before checking so a release in between is not lost.
            let released = self.released.notified();
            if self.try_acquire(owner, scope) {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return false;
            }
        }
    }

    /// Release whatever `owner` holds. Returns whether anything was held.
    pub fn release(&self, owner: TransactionHandle) -> bool {
        let removed = {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            let before = held.len();
            held.retain(|(handle, _)| *handle != owner);
            before != held.len()
        };
        if removed {
            self.released.notify_waiters();
        }
        removed
    }

    pub fn is_held(&self, owner: TransactionHandle) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.iter().any(|(handle, _)| *handle == owner)
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_types::range::RangeKey;
    use std::sync::Arc;

    fn scope(a1: &str) -> Scope {
        Scope::single(RangeKey::parse("book", a1).unwrap())
    }

    #[test]
    fn overlapping_claim_rejected() {
        let locks = ScopeLocks::new();
        let (a, b, c) = (
            TransactionHandle::new(),
            TransactionHandle::new(),
            TransactionHandle::new(),
        );
        assert!(locks.try_acquire(a, &scope("S!A1:B5")));
        assert!(!locks.try_acquire(b, &scope("S!B5:C9")));
        assert!(locks.try_acquire(c, &scope("S!D1:D9")));
        assert_eq!(locks.held_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out() {
        let locks = ScopeLocks::new();
        let holder = TransactionHandle::new();
        assert!(locks.try_acquire(holder, &scope("S")));

        let acquired = locks
            .acquire(TransactionHandle::new(), &scope("S!A1"), Duration::from_millis(50))
            .await;
        assert!(!acquired);
        assert!(locks.is_held(holder));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_on_release() {
        let locks = Arc::new(ScopeLocks::new());
        let holder = TransactionHandle::new();
        assert!(locks.try_acquire(holder, &scope("S!A1")));

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire(TransactionHandle::new(), &scope("S!A1"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(locks.release(holder));
        assert!(waiter.await.unwrap());
        assert!(!locks.release(holder));
    }
}
