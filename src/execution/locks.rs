//! Execution lock set: at most one pipeline pass per (room, task).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::task::{RoomId, TaskId};

type LockKey = (RoomId, TaskId);

/// Process-local set of (room, task) pairs with a pass in flight.
/// Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLocks {
    held: Arc<Mutex<HashSet<LockKey>>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `(room, task)`, or `None` if a pass already
    /// holds it. The lock is released when the guard drops.
    pub fn try_acquire(&self, room: &RoomId, task: TaskId) -> Option<ExecutionGuard> {
        let key = (room.clone(), task);
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.clone());
        inserted.then(|| ExecutionGuard {
            held: Arc::clone(&self.held),
            key,
        })
    }

    pub fn is_held(&self, room: &RoomId, task: TaskId) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&(room.clone(), task))
    }
}

#[derive(Debug)]
pub struct ExecutionGuard {
    held: Arc<Mutex<HashSet<LockKey>>>,
    key: LockKey,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}
