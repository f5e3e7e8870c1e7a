//! C2: the request-lock coordinator. Acquires or enqueues the full set of
//! locks a request needs across its participating blocks, atomically, in
//! ascending `coll_idx` order -- the crate's global deadlock-avoidance
//! invariant: every caller that needs more than one line always asks for them
//! in the same order, so no two requests can each be waiting on a line the
//! other already holds.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::error::CoreError;
use crate::lock_table::{LockOutcome, LockTable, WaitMode};
use crate::request::{CacheLineIdx, Request, RwMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAllOutcome {
    Acquired,
    NotAcquired,
}

fn wait_mode(rw: RwMode) -> WaitMode {
    match rw {
        RwMode::Write => WaitMode::Write,
        // `ReadMappedOnly` participates under the same read-lock discipline
        // as `Read`; it differs only in which blocks the mapper lets
        // participate (already encoded in `participates_in_locking`).
        RwMode::Read | RwMode::ReadMappedOnly => WaitMode::Read,
    }
}

fn release_one(table: &LockTable, mode: WaitMode, line: CacheLineIdx) {
    match mode {
        WaitMode::Read => table.unlock_read(line),
        WaitMode::Write => table.unlock_write(line),
    }
}

/// Indices of participating blocks, sorted by ascending `coll_idx`.
fn participating_order(blocks: &[crate::request::RequestMapEntry]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..blocks.len())
        .filter(|&i| blocks[i].participates_in_locking())
        .collect();
    order.sort_by_key(|&i| blocks[i].coll_idx);
    order
}

/// Fast, non-blocking, all-or-nothing acquisition.
pub fn try_all(table: &LockTable, request: &Request) -> TryAllOutcome {
    let mode = wait_mode(request.rw);
    let mut blocks = request.blocks.lock().unwrap();
    let order = participating_order(&blocks);

    let mut acquired_so_far: Vec<usize> = Vec::with_capacity(order.len());
    for idx in order {
        let line = blocks[idx].coll_idx;
        let ok = match mode {
            WaitMode::Read => table.try_read(line),
            WaitMode::Write => table.try_write(line),
        };
        if !ok {
            for &done in acquired_so_far.iter().rev() {
                release_one(table, mode, blocks[done].coll_idx);
                blocks[done].locked = false;
            }
            return TryAllOutcome::NotAcquired;
        }
        blocks[idx].locked = true;
        acquired_so_far.push(idx);
    }
    TryAllOutcome::Acquired
}

/// Fast-try read acquisition regardless of the request's own `rw` mode, used
/// by the pass-through engine: it only ever needs to keep a concurrent cache
/// promotion from racing with the pass-through read, never a write lock.
pub fn try_all_read(table: &LockTable, request: &Request) -> TryAllOutcome {
    let mut blocks = request.blocks.lock().unwrap();
    let order = participating_order(&blocks);

    let mut acquired_so_far: Vec<usize> = Vec::with_capacity(order.len());
    for idx in order {
        let line = blocks[idx].coll_idx;
        if !table.try_read(line) {
            for &done in acquired_so_far.iter().rev() {
                table.unlock_read(blocks[done].coll_idx);
                blocks[done].locked = false;
            }
            return TryAllOutcome::NotAcquired;
        }
        blocks[idx].locked = true;
        acquired_so_far.push(idx);
    }
    TryAllOutcome::Acquired
}

/// Dry-run hint: predicts whether `try_all` would succeed for `WRITE`,
/// acquiring and immediately releasing every participating line. Never
/// leaves an observable lock behind.
pub fn check_fast(table: &LockTable, request: &Request) -> bool {
    let blocks = request.blocks.lock().unwrap();
    let order = participating_order(&blocks);

    let mut acquired: Vec<CacheLineIdx> = Vec::with_capacity(order.len());
    let mut all_ok = true;
    for idx in order {
        let line = blocks[idx].coll_idx;
        if table.try_write(line) {
            acquired.push(line);
        } else {
            all_ok = false;
            break;
        }
    }
    for line in acquired {
        table.unlock_write(line);
    }
    all_ok
}

/// Slow path: acquire immediately where possible, enqueue a waiter otherwise,
/// and invoke `on_all_granted` exactly once when every participating and
/// non-participating block has been accounted for.
pub fn lock_all_async(
    table: &LockTable,
    request: &Arc<Request>,
    on_all_granted: Box<dyn FnOnce() + Send>,
) -> Result<(), CoreError> {
    let mode = wait_mode(request.rw);
    let completion: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> =
        Arc::new(Mutex::new(Some(on_all_granted)));

    let mut blocks = request.blocks.lock().unwrap();
    let order = participating_order(&blocks);
    let participating: std::collections::HashSet<usize> = order.iter().copied().collect();

    // Non-participating blocks (MISS/REMAPPED) are counted as immediately
    // satisfied; their lines are assigned individually during eviction,
    // external to this core.
    for idx in 0..blocks.len() {
        if !participating.contains(&idx) {
            request.lock_remaining.fetch_sub(1, Ordering::AcqRel);
        }
    }

    let mut granted_this_call: Vec<usize> = Vec::new();
    let mut enqueued: Vec<(CacheLineIdx, u64)> = Vec::new();
    let mut enomem = false;

    for idx in order {
        let line = blocks[idx].coll_idx;
        let granted_now = match mode {
            WaitMode::Read => table.try_read(line),
            WaitMode::Write => table.try_write(line),
        };
        if granted_now {
            blocks[idx].locked = true;
            granted_this_call.push(idx);
            request.lock_remaining.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        let req = Arc::clone(request);
        let completion_for_cb = Arc::clone(&completion);
        let cb: Box<dyn FnOnce() + Send> = Box::new(move || {
            {
                let mut b = req.blocks.lock().unwrap();
                b[idx].locked = true;
            }
            if req.lock_remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                if let Some(f) = completion_for_cb.lock().unwrap().take() {
                    f();
                }
            }
        });

        let outcome = match mode {
            WaitMode::Read => table.lock_read(line, cb),
            WaitMode::Write => table.lock_write(line, cb),
        };
        match outcome {
            Ok(LockOutcome::Enqueued(id)) => enqueued.push((line, id)),
            Ok(LockOutcome::Acquired) => {
                // The slot was free at `try_*` time above but a concurrent
                // `unlock_*` on another request holding this line could have
                // drained its waiters and freed it again between that call
                // and this one (the slot mutex is not held across the two);
                // `lock_*` then grants immediately instead of enqueuing, and
                // the `on_granted` closure we just passed is dropped unfired.
                // Treat it exactly like the `granted_now` case above: the
                // caller's closure was never invoked, so account for the
                // grant here instead.
                blocks[idx].locked = true;
                granted_this_call.push(idx);
                request.lock_remaining.fetch_sub(1, Ordering::AcqRel);
            }
            Err(_) => {
                enomem = true;
                break;
            }
        }
    }

    if enomem {
        // Poison the completion first: a concurrent wake firing the
        // callback after this point must not observe a live continuation.
        let _ = completion.lock().unwrap().take();

        for (line, id) in enqueued {
            if !table.cancel(line, id) {
                // Lost the race to a concurrent unlock; the line is ours now.
                // Undo it so the net effect matches "never attempted".
                release_one(table, mode, line);
            }
        }
        for idx in granted_this_call {
            release_one(table, mode, blocks[idx].coll_idx);
            blocks[idx].locked = false;
        }
        return Err(CoreError::NoMem("lock coordinator waiter queue"));
    }
    drop(blocks);

    // All participating blocks may have been satisfied synchronously
    // (everything granted immediately, nothing enqueued); fire now in that
    // case since no later wake-up will do it for us.
    if request.lock_remaining.load(Ordering::Acquire) == 0 {
        if let Some(f) = completion.lock().unwrap().take() {
            f();
        }
    }

    Ok(())
}

/// Release every line this request currently holds.
pub fn release_all(table: &LockTable, request: &Request) {
    let mode = wait_mode(request.rw);
    let mut blocks = request.blocks.lock().unwrap();
    for entry in blocks.iter_mut() {
        if entry.locked {
            release_one(table, mode, entry.coll_idx);
            entry.locked = false;
        }
    }
}
