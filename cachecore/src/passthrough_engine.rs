//! C5: the pass-through engine. Serves a request directly from the backing
//! device, honouring any locks already held on lines it maps to.
//!
//! Unlike the read engine, this state machine never enqueues a lock-table
//! waiter: a fast-try failure parks the request by simply returning without
//! firing completion, on the expectation that the external scheduler
//! re-invokes [`crate::CacheCore::passthrough`] later with the same request.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Completion, CoreError};
use crate::lock_coordinator::{self, TryAllOutcome};
use crate::request::Request;
use crate::CacheCore;

pub(crate) fn enter(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    request.retain();

    if core.mapper.any_dirty(&request) {
        // Cleaning is asynchronous and external; this request does not
        // complete here, it is expected back through `passthrough` once the
        // cleaner has settled the dirty blocks.
        core.cleaner.trigger_cleaning(&request);
        let _ = request.release();
        return;
    }

    if core.mapper.needs_repartition(&request) {
        core.mapper.move_partition(&request);
    }

    match lock_coordinator::try_all_read(&core.lock_table, &request) {
        TryAllOutcome::Acquired => submit(core, request, completion),
        TryAllOutcome::NotAcquired => {
            debug!("pass-through fast-try lock failed, parking for external resume");
            core.mark_suspended();
            let _ = request.release();
        }
    }
}

fn release_read_locks(core: &Arc<CacheCore>, request: &Request) {
    let mut blocks = request.blocks.lock().unwrap();
    for entry in blocks.iter_mut() {
        if entry.locked {
            core.lock_table.unlock_read(entry.coll_idx);
            entry.locked = false;
        }
    }
}

fn submit(core: &Arc<CacheCore>, request: Arc<Request>, completion: Arc<Completion>) {
    let core_cb = Arc::clone(core);
    let request_cb = Arc::clone(&request);
    let completion_cb = Arc::clone(&completion);
    core.backing_io.submit(
        Arc::clone(&request),
        Box::new(move |result: Result<(), CoreError>| {
            release_read_locks(&core_cb, &request_cb);
            let label = match &result {
                Ok(()) => "ok",
                Err(e) => crate::read_engine::error_label(e),
            };
            crate::metrics::record_completion(label);
            let _ = request_cb.release();
            completion_cb.fire(result);
        }),
    );
}
