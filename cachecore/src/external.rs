//! Interfaces the core *consumes*. Everything here is an external
//! collaborator: metadata layout, the user-partition scheduler, the
//! write-back/cleaning worker, the device I/O submission primitive, and the
//! allocator are all out of this crate's scope and are modeled only by the
//! trait surface the core needs.

use std::sync::Arc;

use crate::error::{CompletionFn, CoreError};
use crate::request::Request;

/// `ACQUIRED` / `NOT_ACQUIRED` / a negative error, returned by
/// `mapper.prepare_clines`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPrepareHint {
    Acquired,
    NotAcquired,
}

/// Sets each block's `status` and `coll_idx`, and performs the metadata-only
/// side effects the read/pass-through engines call out to.
pub trait Mapper: Send + Sync {
    fn traverse(&self, request: &Request) -> Result<(), CoreError>;
    fn prepare_clines(&self, request: &Request) -> Result<LockPrepareHint, CoreError>;
    fn move_partition(&self, request: &Request);
    fn set_valid_map(&self, request: &Request);
    fn invalidate(&self, request: &Request);

    /// Best-effort signal that this request's user-partition assignment looks
    /// stale and `move_partition` is worth trying before dispatch. Default:
    /// never ask for it.
    fn needs_repartition(&self, _request: &Request) -> bool {
        false
    }

    /// Whether any block this request maps to is dirty and must be cleaned
    /// before a pass-through read can safely bypass the cache. Default:
    /// nothing is ever dirty.
    fn any_dirty(&self, _request: &Request) -> bool {
        false
    }
}

/// The write-back/cleaning worker. Pass-through defers to it rather than
/// reading stale backing-device data out from under a dirty cache line.
pub trait Cleaner: Send + Sync {
    /// Schedules cleaning for this request's dirty blocks. Does not block;
    /// the external scheduler re-invokes `passthrough` once cleaning settles.
    fn trigger_cleaning(&self, request: &Request);
}

pub trait CacheIo: Send + Sync {
    fn submit_cache_reads(
        &self,
        request: Arc<Request>,
        offset: u64,
        length: u32,
        count: u32,
        on_complete: CompletionFn,
    );
}

pub trait BackingIo: Send + Sync {
    fn submit(&self, request: Arc<Request>, on_complete: CompletionFn);
}

/// Monotone-in-occupancy integer in `[0, 100]`. A stale-for-N-ms sample is
/// acceptable as long as it is consistent within one admission-check call.
pub trait CacheStats: Send + Sync {
    fn occupancy_percent(&self) -> u8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

pub trait BufferPool: Send + Sync {
    fn alloc(&self, pages: u32) -> Result<BufferHandle, CoreError>;
    fn mlock(&self, handle: BufferHandle) -> Result<(), CoreError>;
    /// Copies the bytes the backing read landed in `handle`'s buffer out
    /// into `dst` -- the MISS path's "copy into the user buffer" step (spec
    /// §4.4 DISPATCH).
    fn copy(&self, handle: BufferHandle, dst: &mut [u8]);
    fn free(&self, handle: BufferHandle);
}
