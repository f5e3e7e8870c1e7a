//! C1: per-cache-line reader/writer lock table.
//!
//! One [`parking_lot::Mutex`] per slot, a FIFO wait queue per slot, and the
//! writer-preference rule: once a writer is queued, new readers wait rather
//! than being granted ahead of it. Wake-ups are collected while the slot
//! mutex is held and invoked only after it is released -- calling a waiter's
//! callback with the slot mutex held is forbidden, the same "drop the lock
//! before invoking a continuation" discipline `page_cache.rs` applies to its
//! `PageWriteGuard::mark_valid` callers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::CoreError;
use crate::request::CacheLineIdx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Read,
    Write,
}

/// Result of a non-blocking acquisition attempt or of enqueuing a waiter.
/// The `Enqueued` case carries the waiter's id so the caller can later
/// `cancel` it (the request-lock coordinator's ENOMEM rollback path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Enqueued(u64),
}

/// A parked lock request. Lives exactly as long as it is enqueued on a slot;
/// removed when granted (by `unlock_*`) or cancelled (by `cancel`).
pub struct Waiter {
    pub id: u64,
    pub mode: WaitMode,
    pub on_granted: Box<dyn FnOnce() + Send>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Read(u32),
    Write,
}

struct SlotInner {
    state: SlotState,
    waiters: VecDeque<Waiter>,
}

impl std::fmt::Debug for SlotInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotInner")
            .field("state", &self.state)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

struct LockSlot {
    inner: Mutex<SlotInner>,
}

/// `Box<[LockSlot]>` sized once at `init`, mirroring `page_cache.rs`'s
/// `slots: Box<[Slot]>` -- memory cost is `O(num_lines)`, no resizing.
pub struct LockTable {
    slots: Box<[LockSlot]>,
    total_waiters: AtomicUsize,
    next_waiter_id: AtomicUsize,
    /// Test-only fault injection: when `Some(n)`, the n-th waiter enqueue
    /// attempt across the whole table (0-indexed) fails with `NoMem` instead
    /// of actually enqueueing, so the coordinator's ENOMEM mid-slow-path
    /// rollback path is exercisable without genuinely exhausting memory.
    #[cfg(any(test, feature = "testing"))]
    fail_nth_waiter: std::sync::atomic::AtomicI64,

    /// Test-only race injection: when set to `Some(line)`, the next
    /// `lock_read`/`lock_write` call against that line first forces the slot
    /// back to `Free`, as if a concurrent `unlock_*` from another holder had
    /// raced in between a caller's failed `try_*` and its subsequent
    /// `lock_*` (the slot mutex is not held across those two calls, so this
    /// is a real interleaving under the crate's "parallel threads" model,
    /// not a hypothetical one) -- deterministically reproducing the case
    /// where `lock_*` grants immediately instead of enqueuing.
    #[cfg(any(test, feature = "testing"))]
    race_release_before_next_lock: Mutex<Option<u32>>,
}

impl LockTable {
    pub fn new(num_lines: u32) -> Self {
        let slots = (0..num_lines)
            .map(|_| LockSlot {
                inner: Mutex::new(SlotInner {
                    state: SlotState::Free,
                    waiters: VecDeque::new(),
                }),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            total_waiters: AtomicUsize::new(0),
            next_waiter_id: AtomicUsize::new(1),
            #[cfg(any(test, feature = "testing"))]
            fail_nth_waiter: std::sync::atomic::AtomicI64::new(-1),
            #[cfg(any(test, feature = "testing"))]
            race_release_before_next_lock: Mutex::new(None),
        }
    }

    /// Arranges for the next `lock_read`/`lock_write` call against `line` to
    /// observe the slot as freshly `Free`, simulating a concurrent release
    /// that happened after the caller's own `try_*` already reported failure.
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_race_release_before_next_lock(&self, line: CacheLineIdx) {
        *self.race_release_before_next_lock.lock() = Some(line.0);
    }

    /// Arranges for the `n`-th waiter-enqueue attempt (0-indexed, counted
    /// across the whole table from the moment this is called) to fail with
    /// `NoMem`, for exercising the ENOMEM rollback path deterministically.
    #[cfg(any(test, feature = "testing"))]
    pub fn inject_enomem_at_waiter(&self, n: u64) {
        self.fail_nth_waiter
            .store(n as i64, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "testing"))]
    fn should_fail_next_waiter(&self) -> bool {
        let n = self.fail_nth_waiter.load(Ordering::SeqCst);
        if n < 0 {
            return false;
        }
        if n == 0 {
            self.fail_nth_waiter.store(-1, Ordering::SeqCst);
            true
        } else {
            self.fail_nth_waiter.fetch_sub(1, Ordering::SeqCst);
            false
        }
    }

    #[cfg(not(any(test, feature = "testing")))]
    fn should_fail_next_waiter(&self) -> bool {
        false
    }

    pub fn num_lines(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Non-blocking read acquisition. Writer-preference: refuses if any
    /// waiter (of either mode) is already queued.
    pub fn try_read(&self, line: CacheLineIdx) -> bool {
        let mut slot = self.slots[line.index()].inner.lock();
        if !slot.waiters.is_empty() {
            return false;
        }
        match slot.state {
            SlotState::Free => {
                slot.state = SlotState::Read(1);
                true
            }
            SlotState::Read(n) => {
                slot.state = SlotState::Read(n + 1);
                true
            }
            SlotState::Write => false,
        }
    }

    /// Non-blocking write acquisition: succeeds only from `Free`.
    pub fn try_write(&self, line: CacheLineIdx) -> bool {
        let mut slot = self.slots[line.index()].inner.lock();
        if matches!(slot.state, SlotState::Free) {
            slot.state = SlotState::Write;
            true
        } else {
            false
        }
    }

    fn lock_any(
        &self,
        line: CacheLineIdx,
        mode: WaitMode,
        on_granted: Box<dyn FnOnce() + Send>,
    ) -> Result<LockOutcome, CoreError> {
        let mut slot = self.slots[line.index()].inner.lock();

        #[cfg(any(test, feature = "testing"))]
        {
            let mut hook = self.race_release_before_next_lock.lock();
            if *hook == Some(line.0) {
                *hook = None;
                slot.state = SlotState::Free;
            }
        }

        let can_grant_read = mode == WaitMode::Read
            && slot.waiters.is_empty()
            && matches!(slot.state, SlotState::Free | SlotState::Read(_));
        let can_grant_write = mode == WaitMode::Write
            && slot.waiters.is_empty()
            && matches!(slot.state, SlotState::Free);

        if can_grant_read || can_grant_write {
            slot.state = match (mode, slot.state) {
                (WaitMode::Read, SlotState::Read(n)) => SlotState::Read(n + 1),
                (WaitMode::Read, _) => SlotState::Read(1),
                (WaitMode::Write, _) => SlotState::Write,
            };
            return Ok(LockOutcome::Acquired);
        }

        if self.should_fail_next_waiter() || slot.waiters.try_reserve(1).is_err() {
            return Err(CoreError::NoMem("lock table waiter queue"));
        }
        let id = self.next_waiter_id.fetch_add(1, Ordering::AcqRel) as u64;
        slot.waiters.push_back(Waiter { id, mode, on_granted });
        self.total_waiters.fetch_add(1, Ordering::AcqRel);
        Ok(LockOutcome::Enqueued(id))
    }

    pub fn lock_read(
        &self,
        line: CacheLineIdx,
        on_granted: Box<dyn FnOnce() + Send>,
    ) -> Result<LockOutcome, CoreError> {
        self.lock_any(line, WaitMode::Read, on_granted)
    }

    pub fn lock_write(
        &self,
        line: CacheLineIdx,
        on_granted: Box<dyn FnOnce() + Send>,
    ) -> Result<LockOutcome, CoreError> {
        self.lock_any(line, WaitMode::Write, on_granted)
    }

    /// Removes a still-queued waiter by id. Returns `false` if it was not
    /// found (already granted and popped by a concurrent `unlock_*`); the
    /// caller must then treat the lock as held and release it normally.
    pub fn cancel(&self, line: CacheLineIdx, id: u64) -> bool {
        let mut slot = self.slots[line.index()].inner.lock();
        if let Some(pos) = slot.waiters.iter().position(|w| w.id == id) {
            slot.waiters.remove(pos);
            drop(slot);
            self.total_waiters.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Pops the next eligible batch of waiters to wake: a single writer, or a
    /// maximal run of consecutive reader waiters at the head. Must be called
    /// with the slot already transitioned to `Free`.
    fn drain_wakeable(slot: &mut SlotInner) -> Vec<Waiter> {
        let mut woken = Vec::new();
        match slot.waiters.front().map(|w| w.mode) {
            Some(WaitMode::Write) => {
                let w = slot.waiters.pop_front().unwrap();
                slot.state = SlotState::Write;
                woken.push(w);
            }
            Some(WaitMode::Read) => {
                let mut n = 0u32;
                while matches!(slot.waiters.front().map(|w| w.mode), Some(WaitMode::Read)) {
                    woken.push(slot.waiters.pop_front().unwrap());
                    n += 1;
                }
                slot.state = SlotState::Read(n);
            }
            None => {
                slot.state = SlotState::Free;
            }
        }
        woken
    }

    pub fn unlock_read(&self, line: CacheLineIdx) {
        let woken = {
            let mut slot = self.slots[line.index()].inner.lock();
            let n = match slot.state {
                SlotState::Read(n) => n,
                other => panic!("unlock_read on slot not in Read state: {other:?}"),
            };
            if n > 1 {
                slot.state = SlotState::Read(n - 1);
                Vec::new()
            } else {
                slot.state = SlotState::Free;
                Self::drain_wakeable(&mut slot)
            }
        };
        self.fire(woken);
    }

    pub fn unlock_write(&self, line: CacheLineIdx) {
        let woken = {
            let mut slot = self.slots[line.index()].inner.lock();
            debug_assert!(matches!(slot.state, SlotState::Write));
            slot.state = SlotState::Free;
            Self::drain_wakeable(&mut slot)
        };
        self.fire(woken);
    }

    fn fire(&self, woken: Vec<Waiter>) {
        if woken.is_empty() {
            return;
        }
        self.total_waiters
            .fetch_sub(woken.len(), Ordering::AcqRel);
        for w in woken {
            (w.on_granted)();
        }
    }

    pub fn waiters_empty(&self, line: CacheLineIdx) -> bool {
        self.slots[line.index()].inner.lock().waiters.is_empty()
    }

    pub fn total_waiters(&self) -> usize {
        self.total_waiters.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn try_read_then_try_write_fails() {
        let t = LockTable::new(4);
        let line = CacheLineIdx(0);
        assert!(t.try_read(line));
        assert!(t.try_read(line));
        assert!(!t.try_write(line));
        t.unlock_read(line);
        t.unlock_read(line);
        assert!(t.try_write(line));
    }

    #[test]
    fn writer_preference_blocks_new_readers() {
        // S5: line held READ by R1, waiters [W1, R2, R3]. R1 releases -> W1
        // granted, R2/R3 still queued. W1 releases -> R2 and R3 both granted.
        let t = LockTable::new(4);
        let line = CacheLineIdx(0);
        assert!(t.try_read(line)); // R1

        let w1_granted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let w1g = w1_granted.clone();
        let outcome = t
            .lock_write(line, Box::new(move || w1g.store(true, Ordering::SeqCst)))
            .unwrap();
        assert!(matches!(outcome, LockOutcome::Enqueued(_)));

        // A fresh reader must not jump the queue.
        assert!(!t.try_read(line));

        let r2_granted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let r2g = r2_granted.clone();
        assert!(matches!(
            t.lock_read(line, Box::new(move || r2g.store(true, Ordering::SeqCst)))
                .unwrap(),
            LockOutcome::Enqueued(_)
        ));
        let r3_granted = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let r3g = r3_granted.clone();
        assert!(matches!(
            t.lock_read(line, Box::new(move || r3g.store(true, Ordering::SeqCst)))
                .unwrap(),
            LockOutcome::Enqueued(_)
        ));

        t.unlock_read(line); // R1 releases
        assert!(w1_granted.load(Ordering::SeqCst));
        assert!(!r2_granted.load(Ordering::SeqCst));
        assert!(!r3_granted.load(Ordering::SeqCst));

        t.unlock_write(line); // W1 releases
        assert!(r2_granted.load(Ordering::SeqCst));
        assert!(r3_granted.load(Ordering::SeqCst));
        assert!(t.waiters_empty(line));
    }

    #[test]
    fn total_waiters_tracks_enqueue_and_wake() {
        let t = LockTable::new(1);
        let line = CacheLineIdx(0);
        assert!(t.try_write(line));
        assert!(matches!(
            t.lock_read(line, Box::new(|| {})).unwrap(),
            LockOutcome::Enqueued(_)
        ));
        assert_eq!(t.total_waiters(), 1);
        t.unlock_write(line);
        assert_eq!(t.total_waiters(), 0);
    }

    #[test]
    fn cancel_removes_unwoken_waiter() {
        let t = LockTable::new(1);
        let line = CacheLineIdx(0);
        assert!(t.try_write(line));
        let LockOutcome::Enqueued(id) = t.lock_read(line, Box::new(|| panic!("must not fire"))).unwrap() else {
            panic!("expected Enqueued");
        };
        assert!(t.cancel(line, id));
        assert!(t.waiters_empty(line));
        // Cancelling twice fails the second time.
        assert!(!t.cancel(line, id));
        t.unlock_write(line);
    }
}
