//! C4: the read engine. Drives one request through
//! `HASH -> MAP -> ADMIT? -> LOCK -> DISPATCH -> COMPLETE_FANIN`. There is no
//! suspension point in this code: every branch either returns immediately or
//! hands the request off via a callback, matching a "caller never blocks"
//! scheduling model.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::PAGE_SIZE;
use crate::error::{CompletionFn, Completion, CoreError};
use crate::external::LockPrepareHint;
use crate::lock_coordinator::{self, TryAllOutcome};
use crate::metrics;
use crate::passthrough_engine;
use crate::request::{LineStatus, Request, RwMode};
use crate::CacheCore;

/// The HASH step's one required property: consecutive block addresses map
/// to consecutive keys (mod table size), so that ordering by this key is the
/// same order the lock coordinator already uses (ascending `coll_idx`). This
/// is unrelated to, and much simpler than, the admission history's
/// MurmurHash3-style bucket hash -- see `admission_history::history_hash`.
pub fn metadata_order_key(addr: u64) -> u64 {
    addr / PAGE_SIZE
}

fn page_span(addr: u64, size: u32) -> impl Iterator<Item = u64> + Clone {
    let first = addr / PAGE_SIZE;
    let pages = (size as u64).div_ceil(PAGE_SIZE).max(1);
    (first..first + pages).map(|p| p * PAGE_SIZE)
}

pub(crate) fn enter(core: &Arc<CacheCore>, request: Arc<Request>, on_complete: CompletionFn) {
    request.retain();
    let completion = Completion::new(on_complete);

    if core
        .pending_read_misses_blocked
        .load(Ordering::Acquire)
    {
        request.force_pt.set(true);
        passthrough_engine::enter(core, request, completion);
        return;
    }

    hash_and_map(core, request, completion);
}

fn hash_and_map(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    // HASH: order is fixed by `coll_idx` ascending, assigned by the mapper
    // during MAP below; logged here for parity with that step.
    debug!(addr = request.addr, "HASH: metadata order key computed");

    if let Err(e) = core.mapper.traverse(&request) {
        warn!(error = %e, "mapper reported an inconsistency during MAP; routing to pass-through");
        request.force_pt.set(true);
        passthrough_engine::enter(core, request, completion);
        return;
    }

    if core.mapper.needs_repartition(&request) {
        // Best-effort housekeeping: failure does not abort the request.
        core.mapper.move_partition(&request);
    }

    admit_check(core, request, completion);
}

fn admit_check(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    if !request.allow_second_admission {
        lock_try(core, request, completion);
        return;
    }

    let cache_near_full = core.cache_stats.occupancy_percent() >= core.conf.full_threshold;
    let span = page_span(request.addr, request.size);
    let admitted = core
        .history
        .admit(&core.conf, span, request.backing_id, cache_near_full);
    metrics::record_admission(admitted);

    if !admitted {
        request.force_pt.set(true);
        passthrough_engine::enter(core, request, completion);
        return;
    }

    lock_try(core, request, completion);
}

fn lock_try(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    match core.mapper.prepare_clines(&request) {
        Ok(LockPrepareHint::Acquired) => {
            match lock_coordinator::try_all(&core.lock_table, &request) {
                TryAllOutcome::Acquired => dispatch(core, request, completion),
                TryAllOutcome::NotAcquired => lock_async(core, request, completion),
            }
        }
        Ok(LockPrepareHint::NotAcquired) => {
            // The mapper already knows this request's lines are contended
            // (e.g. one is mid-remap) and a fast `try_all` would just fail;
            // skip straight to the slow path instead of paying for it.
            lock_async(core, request, completion);
        }
        Err(e) => {
            warn!(error = %e, "mapper prepare_clines reported an error; routing to pass-through");
            request.force_pt.set(true);
            passthrough_engine::enter(core, request, completion);
        }
    }
}

fn lock_async(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    metrics::LOCK_WAIT_TOTAL
        .with_label_values(&[rw_label(request.rw)])
        .inc();
    core.mark_suspended();

    let core_for_cb = Arc::clone(core);
    let request_for_cb = Arc::clone(&request);
    let completion_for_cb = Arc::clone(&completion);
    let result = lock_coordinator::lock_all_async(
        &core.lock_table,
        &request,
        Box::new(move || {
            core_for_cb.mark_resumed();
            dispatch(&core_for_cb, request_for_cb, completion_for_cb);
        }),
    );

    if let Err(e) = result {
        core.mark_resumed();
        metrics::record_completion("no_mem");
        let _ = request.release();
        completion.fire(Err(e));
    }
}

fn rw_label(rw: RwMode) -> &'static str {
    match rw {
        RwMode::Read => "read",
        RwMode::Write => "write",
        RwMode::ReadMappedOnly => "read_mapped_only",
    }
}

fn dispatch(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    let (has_miss, has_remapped) = {
        let blocks = request.blocks.lock().unwrap();
        (
            blocks.iter().any(|e| matches!(e.status, LineStatus::Miss)),
            blocks.iter().any(|e| matches!(e.status, LineStatus::Remapped)),
        )
    };

    // A REMAPPED line has a reassignment in flight, owned by eviction rather
    // than this request's own lock set; it is neither cache-readable yet nor
    // something this engine can write-lock its way past. The external
    // eviction path is the only thing that turns it into HIT, so a request
    // that still sees REMAPPED at DISPATCH time falls back to pass-through
    // rather than risk reading through a line that isn't valid yet.
    if has_remapped {
        debug!("REMAPPED line present at dispatch; falling back to pass-through");
        lock_coordinator::release_all(&core.lock_table, &request);
        passthrough_engine::enter(core, request, completion);
        return;
    }

    if !has_miss {
        dispatch_hit(core, request, completion);
        return;
    }

    if !matches!(request.rw, RwMode::Write) {
        // MISS requires write-locking the assigned line; this engine does
        // not upgrade a read-mode acquisition, it falls back to pass-through.
        debug!("MISS present under a read-only lock acquisition; falling back to pass-through");
        lock_coordinator::release_all(&core.lock_table, &request);
        passthrough_engine::enter(core, request, completion);
        return;
    }

    dispatch_miss(core, request, completion);
}

fn dispatch_hit(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    let count = request.blocks.lock().unwrap().len() as u32;
    request.io_remaining.store(1, Ordering::Release);

    let core_cb = Arc::clone(core);
    let request_cb = Arc::clone(&request);
    let completion_cb = Arc::clone(&completion);
    core.cache_io.submit_cache_reads(
        Arc::clone(&request),
        request.addr,
        request.size,
        count,
        Box::new(move |result| complete_hit(&core_cb, request_cb, completion_cb, result)),
    );
}

fn complete_hit(
    core: &Arc<CacheCore>,
    request: Arc<Request>,
    completion: Arc<Completion>,
    result: Result<(), CoreError>,
) {
    if request.io_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    match result {
        Ok(()) => {
            lock_coordinator::release_all(&core.lock_table, &request);
            metrics::record_completion("ok");
            let _ = request.release();
            completion.fire(Ok(()));
        }
        Err(CoreError::CacheError(e)) => {
            // Local recovery is attempted only for CACHE_ERROR: demote the
            // remainder to pass-through rather than failing the request.
            warn!(error = %e, "cache read failed, demoting to pass-through");
            lock_coordinator::release_all(&core.lock_table, &request);
            request.force_pt.set(true);
            passthrough_engine::enter(core, request, completion);
        }
        Err(other) => {
            lock_coordinator::release_all(&core.lock_table, &request);
            metrics::record_completion(error_label(&other));
            let _ = request.release();
            completion.fire(Err(other));
        }
    }
}

fn dispatch_miss(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    let miss_pages = {
        let blocks = request.blocks.lock().unwrap();
        blocks
            .iter()
            .filter(|e| matches!(e.status, LineStatus::Miss))
            .count() as u32
    };

    let handle = match core.buffers.alloc(miss_pages.max(1)) {
        Ok(h) => h,
        Err(e) => {
            lock_coordinator::release_all(&core.lock_table, &request);
            metrics::record_completion("no_mem");
            let _ = request.release();
            completion.fire(Err(e));
            return;
        }
    };
    if let Err(e) = core.buffers.mlock(handle) {
        core.buffers.free(handle);
        lock_coordinator::release_all(&core.lock_table, &request);
        metrics::record_completion("no_mem");
        let _ = request.release();
        completion.fire(Err(e));
        return;
    }

    request.io_remaining.store(1, Ordering::Release);
    let core_cb = Arc::clone(core);
    let request_cb = Arc::clone(&request);
    let completion_cb = Arc::clone(&completion);
    core.backing_io.submit(
        Arc::clone(&request),
        Box::new(move |result| complete_miss(&core_cb, request_cb, completion_cb, handle, result)),
    );
}

fn complete_miss(
    core: &Arc<CacheCore>,
    request: Arc<Request>,
    completion: Arc<Completion>,
    handle: crate::external::BufferHandle,
    result: Result<(), CoreError>,
) {
    if request.io_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    match result {
        Ok(()) => {
            // The backing read landed in the private copy buffer `handle`;
            // copy it into the caller's own buffer before anything else
            // observes the request as complete, then mark the metadata
            // valid so subsequent requests observe a HIT (the backfill).
            core.buffers
                .copy(handle, &mut request.user_buf.lock().unwrap());
            core.mapper.set_valid_map(&request);
            core.buffers.free(handle);
            lock_coordinator::release_all(&core.lock_table, &request);
            metrics::record_completion("ok");
            let _ = request.release();
            completion.fire(Ok(()));
        }
        Err(e) => {
            // CORE_ERROR is terminal: invalidate in-flight MISS metadata,
            // release buffers, propagate.
            core.mapper.invalidate(&request);
            core.buffers.free(handle);
            lock_coordinator::release_all(&core.lock_table, &request);
            metrics::record_completion(error_label(&e));
            let _ = request.release();
            completion.fire(Err(e));
        }
    }
}

pub(crate) fn error_label(e: &CoreError) -> &'static str {
    match e {
        CoreError::NoMem(_) => "no_mem",
        CoreError::CacheError(_) => "cache_error",
        CoreError::CoreError(_) => "core_error",
        CoreError::MappingError(_) => "mapping_error",
    }
}
