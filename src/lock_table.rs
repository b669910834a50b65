//! Deadlock-detecting lock table for write-write conflict arbitration.
//!
//! Transactions never take row-level locks to read (MVCC handles that); they
//! take a lock here only before mutating a record. Waiting forms a
//! directed graph (`xid_a -> xid_b` when `xid_a` waits on a uid held by
//! `xid_b`); a new wait that would close a cycle is refused immediately
//! rather than left to block forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{QuarryError, Result};
use crate::types::{Uid, Xid};

/// A blocking handle returned by `acquire` when the caller must wait for
/// another transaction to release the resource. `wait()` blocks until the
/// lock table hands ownership to this waiter.
pub struct WaitLatch {
    mu: Mutex<bool>,
    cv: std::sync::Condvar,
}

impl WaitLatch {
    fn new() -> Arc<Self> {
        Arc::new(Self { mu: Mutex::new(false), cv: std::sync::Condvar::new() })
    }

    fn grant(&self) {
        let mut granted = self.mu.lock().unwrap();
        *granted = true;
        self.cv.notify_all();
    }

    /// Block until this waiter has been granted ownership.
    pub fn wait(&self) {
        let mut granted = self.mu.lock().unwrap();
        while !*granted {
            granted = self.cv.wait(granted).unwrap();
        }
    }
}

/// Either the lock was granted immediately, or the caller must block on the
/// returned latch.
pub enum Acquired {
    Granted,
    Wait(Arc<WaitLatch>),
}

struct State {
    held: HashMap<Xid, Vec<Uid>>,
    owner: HashMap<Uid, Xid>,
    waiters: HashMap<Uid, Vec<Xid>>,
    waiting_on: HashMap<Xid, Uid>,
    wake_latch: HashMap<Xid, Arc<WaitLatch>>,
    epoch: u64,
    stamp: HashMap<Xid, u64>,
}

/// Deadlock-detecting lock table over uids.
pub struct LockTable {
    state: Mutex<State>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                held: HashMap::new(),
                owner: HashMap::new(),
                waiters: HashMap::new(),
                waiting_on: HashMap::new(),
                wake_latch: HashMap::new(),
                epoch: 0,
                stamp: HashMap::new(),
            }),
        }
    }

    /// Acquire the lock on `uid` for `xid`. Returns `Granted` immediately if
    /// `xid` already owns it or it is free; otherwise registers `xid` as a
    /// waiter and runs deadlock detection, failing with `Deadlock` if the
    /// new wait edge closes a cycle.
    pub fn acquire(&self, xid: Xid, uid: Uid) -> Result<Acquired> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;

        if state.owner.get(&uid) == Some(&xid) {
            return Ok(Acquired::Granted);
        }

        if !state.owner.contains_key(&uid) {
            state.owner.insert(uid, xid);
            state.held.entry(xid).or_default().push(uid);
            return Ok(Acquired::Granted);
        }

        state.waiters.entry(uid).or_default().push(xid);
        state.waiting_on.insert(xid, uid);

        if has_cycle(&mut state, xid) {
            // Undo the wait registration; this xid must not block.
            state.waiting_on.remove(&xid);
            if let Some(queue) = state.waiters.get_mut(&uid) {
                queue.retain(|w| *w != xid);
            }
            return Err(QuarryError::Deadlock);
        }

        let latch = WaitLatch::new();
        state.wake_latch.insert(xid, latch.clone());
        Ok(Acquired::Wait(latch))
    }

    /// Release every resource held by `xid`, waking the next FIFO waiter
    /// for each.
    pub fn release(&self, xid: Xid) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        let held = state.held.remove(&xid).unwrap_or_default();

        for uid in held {
            state.owner.remove(&uid);

            let mut queue = state.waiters.remove(&uid).unwrap_or_default();
            while let Some(next) = queue.first().copied() {
                queue.remove(0);
                if state.waiting_on.get(&next) != Some(&uid) {
                    // stale entry, already removed elsewhere
                    continue;
                }
                state.waiting_on.remove(&next);
                state.owner.insert(uid, next);
                state.held.entry(next).or_default().push(uid);
                if !queue.is_empty() {
                    state.waiters.insert(uid, queue);
                }
                if let Some(latch) = state.wake_latch.remove(&next) {
                    latch.grant();
                }
                break;
            }
        }

        state.waiting_on.remove(&xid);
        state.wake_latch.remove(&xid);
        Ok(())
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// DFS from `start` following `xid -> owner[waiting_on[xid]]` edges, using
/// epoch stamps so previously-cleared nodes are never revisited.
fn has_cycle(state: &mut State, start: Xid) -> bool {
    state.epoch += 1;
    let epoch = state.epoch;
    let mut current = start;
    loop {
        if let Some(&s) = state.stamp.get(&current) {
            if s == epoch {
                return true;
            }
        }
        state.stamp.insert(current, epoch);

        let uid = match state.waiting_on.get(&current) {
            Some(u) => *u,
            None => return false,
        };
        current = match state.owner.get(&uid) {
            Some(&o) => o,
            None => return false,
        };
    }
}

fn poisoned() -> QuarryError {
    QuarryError::Internal("lock table mutex poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_free_resource_immediately() {
        let table = LockTable::new();
        assert!(matches!(table.acquire(1, 100).unwrap(), Acquired::Granted));
    }

    #[test]
    fn second_xid_waits_then_is_woken_on_release() {
        let table = LockTable::new();
        assert!(matches!(table.acquire(1, 100).unwrap(), Acquired::Granted));
        let latch = match table.acquire(2, 100).unwrap() {
            Acquired::Wait(latch) => latch,
            Acquired::Granted => panic!("expected to wait"),
        };
        table.release(1).unwrap();
        latch.wait();
    }

    #[test]
    fn detects_two_cycle_deadlock() {
        let table = LockTable::new();
        assert!(matches!(table.acquire(1, 10).unwrap(), Acquired::Granted));
        assert!(matches!(table.acquire(2, 20).unwrap(), Acquired::Granted));

        // T1 waits on T2's resource.
        assert!(matches!(table.acquire(1, 20).unwrap(), Acquired::Wait(_)));

        // T2 waits on T1's resource, closing the cycle.
        let result = table.acquire(2, 10);
        assert!(matches!(result, Err(QuarryError::Deadlock)));
    }
}
