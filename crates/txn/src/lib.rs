//! Page-granular lock manager.
//!
//! Writers take exclusive locks, readers take shared locks. A lock is owned by
//! an [`OwnerId`] (one logical mutation or scan) and held until `unlock_all`.
//! Deadlocks are broken by timeout.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

/// Identifies the logical operation holding or requesting locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Page(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockPolicy {
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock wait timed out (possible deadlock)")]
    DeadlockTimeout,
}

pub type LockResult<T> = Result<T, LockError>;

#[derive(Debug)]
struct LockRequest {
    owner: OwnerId,
    mode: LockMode,
}

#[derive(Debug, Default)]
struct LockState {
    mode: Option<LockMode>,
    holders: HashSet<OwnerId>,
    waiters: VecDeque<LockRequest>,
}

#[derive(Debug, Default)]
struct ManagerState {
    locks: HashMap<LockKey, LockState>,
    held_keys: HashMap<OwnerId, HashSet<LockKey>>,
}

pub struct LockManager {
    state: Mutex<ManagerState>,
    condvar: Condvar,
    policy: DeadlockPolicy,
}

impl LockManager {
    pub fn new(policy: DeadlockPolicy) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            condvar: Condvar::new(),
            policy,
        }
    }

    pub fn lock_shared(&self, owner: OwnerId, key: LockKey) -> LockResult<()> {
        self.lock(owner, key, LockMode::Shared)
    }

    pub fn lock_exclusive(&self, owner: OwnerId, key: LockKey) -> LockResult<()> {
        self.lock(owner, key, LockMode::Exclusive)
    }

    /// Releases every lock held by `owner` and wakes eligible waiters.
    pub fn unlock_all(&self, owner: OwnerId) {
        let mut state = self.state.lock();
        let Some(keys) = state.held_keys.remove(&owner) else {
            return;
        };
        for key in keys {
            let lock_state = state.locks.get_mut(&key).expect("lock state exists");
            lock_state.holders.remove(&owner);
            if lock_state.holders.is_empty() {
                lock_state.mode = None;
            }
        }
        self.promote_all(&mut state);
        self.condvar.notify_all();
    }

    pub fn held_keys_for(&self, owner: OwnerId) -> Vec<LockKey> {
        let state = self.state.lock();
        state
            .held_keys
            .get(&owner)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self, owner: OwnerId, key: LockKey, mode: LockMode) -> LockResult<()> {
        let mut state = self.state.lock();
        if Self::holds(&state, owner, &key, mode) {
            return Ok(());
        }
        let deadline = self.deadline();
        loop {
            {
                let lock_state = state.locks.entry(key.clone()).or_default();
                if Self::can_grant(lock_state, owner, mode) && lock_state.waiters.is_empty() {
                    lock_state.mode = Some(mode);
                    lock_state.holders.insert(owner);
                    state
                        .held_keys
                        .entry(owner)
                        .or_default()
                        .insert(key.clone());
                    return Ok(());
                }
                if !lock_state.waiters.iter().any(|waiter| waiter.owner == owner) {
                    lock_state.waiters.push_back(LockRequest { owner, mode });
                }
            }
            state = self.wait(state, deadline)?;
            if Self::holds(&state, owner, &key, mode) {
                return Ok(());
            }
        }
    }

    fn wait<'a>(
        &self,
        mut state: MutexGuard<'a, ManagerState>,
        deadline: Option<Instant>,
    ) -> LockResult<MutexGuard<'a, ManagerState>> {
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(LockError::DeadlockTimeout);
                }
                let remaining = deadline.saturating_duration_since(now);
                if self.condvar.wait_for(&mut state, remaining).timed_out() {
                    return Err(LockError::DeadlockTimeout);
                }
                Ok(state)
            }
            None => {
                self.condvar.wait(&mut state);
                Ok(state)
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.policy {
            DeadlockPolicy::Timeout(duration) => Some(Instant::now() + duration),
        }
    }

    fn can_grant(lock_state: &LockState, owner: OwnerId, mode: LockMode) -> bool {
        match lock_state.mode {
            None => true,
            Some(LockMode::Shared) => {
                mode == LockMode::Shared
                    || (lock_state.holders.len() == 1 && lock_state.holders.contains(&owner))
            }
            Some(LockMode::Exclusive) => lock_state.holders.contains(&owner),
        }
    }

    fn holds(state: &ManagerState, owner: OwnerId, key: &LockKey, mode: LockMode) -> bool {
        let Some(lock_state) = state.locks.get(key) else {
            return false;
        };
        if !lock_state.holders.contains(&owner) {
            return false;
        }
        matches!(
            (lock_state.mode, mode),
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared)
        )
    }

    fn promote_all(&self, state: &mut ManagerState) {
        let keys: Vec<LockKey> = state.locks.keys().cloned().collect();
        for key in keys {
            let lock_state = state.locks.get_mut(&key).expect("lock state exists");
            if lock_state.holders.is_empty() {
                lock_state.mode = None;
            }
            self.promote_waiters(state, key);
        }
    }

    fn promote_waiters(&self, state: &mut ManagerState, key: LockKey) {
        let lock_state = state.locks.get_mut(&key).expect("lock state exists");
        let mut promoted_any = false;
        while let Some(request) = lock_state.waiters.front() {
            if !Self::can_grant(lock_state, request.owner, request.mode) {
                break;
            }
            let request = lock_state.waiters.pop_front().expect("waiter exists");
            lock_state.mode = Some(request.mode);
            lock_state.holders.insert(request.owner);
            state
                .held_keys
                .entry(request.owner)
                .or_default()
                .insert(key.clone());
            promoted_any = true;
            if request.mode == LockMode::Exclusive {
                break;
            }
        }
        if promoted_any {
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn manager() -> LockManager {
        LockManager::new(DeadlockPolicy::Timeout(Duration::from_millis(200)))
    }

    #[test]
    fn shared_shared_is_compatible() {
        let manager = manager();
        let key = LockKey::Page(42);
        assert!(manager.lock_shared(OwnerId(1), key.clone()).is_ok());
        assert!(manager.lock_shared(OwnerId(2), key.clone()).is_ok());
        assert_eq!(manager.held_keys_for(OwnerId(1)), vec![key]);
    }

    #[test]
    fn exclusive_blocks_shared_until_release() {
        let manager = Arc::new(manager());
        let key = LockKey::Page(1);
        manager.lock_exclusive(OwnerId(1), key.clone()).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let manager_clone = Arc::clone(&manager);
        let barrier_clone = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            barrier_clone.wait();
            manager_clone.lock_shared(OwnerId(2), key)
        });
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        manager.unlock_all(OwnerId(1));
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn exclusive_blocks_exclusive_until_release() {
        let manager = Arc::new(manager());
        let key = LockKey::Page(7);
        manager.lock_exclusive(OwnerId(1), key.clone()).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let manager_clone = Arc::clone(&manager);
        let barrier_clone = Arc::clone(&barrier);
        let handle = thread::spawn(move || {
            barrier_clone.wait();
            manager_clone.lock_exclusive(OwnerId(2), key)
        });
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        manager.unlock_all(OwnerId(1));
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn blocked_exclusive_times_out() {
        let manager = Arc::new(LockManager::new(DeadlockPolicy::Timeout(
            Duration::from_millis(50),
        )));
        let key = LockKey::Page(9);
        manager.lock_shared(OwnerId(1), key.clone()).unwrap();
        let manager_clone = Arc::clone(&manager);
        let handle = thread::spawn(move || manager_clone.lock_exclusive(OwnerId(2), key));
        assert_eq!(handle.join().unwrap(), Err(LockError::DeadlockTimeout));
    }

    #[test]
    fn sole_shared_holder_upgrades() {
        let manager = manager();
        let key = LockKey::Page(11);
        let owner = OwnerId(1);
        manager.lock_shared(owner, key.clone()).unwrap();
        manager.lock_exclusive(owner, key.clone()).unwrap();
        assert_eq!(manager.held_keys_for(owner), vec![key]);
    }

    #[test]
    fn unlock_all_releases_every_key() {
        let manager = manager();
        let owner = OwnerId(1);
        for page in [1u64, 2, 3] {
            manager.lock_exclusive(owner, LockKey::Page(page)).unwrap();
        }
        manager.unlock_all(owner);
        assert!(manager.held_keys_for(owner).is_empty());
    }

    #[test]
    fn relock_held_key_is_idempotent() {
        let manager = manager();
        let key = LockKey::Page(5);
        let owner = OwnerId(3);
        manager.lock_exclusive(owner, key.clone()).unwrap();
        manager.lock_shared(owner, key.clone()).unwrap();
        manager.lock_exclusive(owner, key).unwrap();
        assert_eq!(manager.held_keys_for(owner).len(), 1);
    }
}
