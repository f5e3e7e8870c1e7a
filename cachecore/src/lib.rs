//! `cachecore`: per-cache-line concurrency control, the read-engine request
//! lifecycle, and a secondary-admission filter for a block-level cache
//! sitting between a cache device and a backing device.
//!
//! This crate is deliberately narrow. It owns three things: [`lock_table`]
//! (C1), [`lock_coordinator`] (C2) and [`admission_history`] (C3), and drives
//! them through the [`read_engine`] (C4) and [`passthrough_engine`] (C5)
//! state machines. Everything else -- cache-device metadata layout, the
//! user-partition scheduler, the write-back/cleaning worker, device I/O
//! submission, and the allocator -- is an external collaborator reached only
//! through the traits in [`external`].

pub mod admission_history;
pub mod config;
pub mod error;
pub mod external;
pub mod lock_coordinator;
pub mod lock_table;
pub mod metrics;
pub mod passthrough_engine;
pub mod read_engine;
pub mod request;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tracing::instrument;

use admission_history::AdmissionHistory;
use config::CacheCoreConf;
use error::{CompletionFn, CoreError};
use external::{BufferPool, CacheIo, CacheStats, Cleaner, Mapper};
use lock_table::LockTable;
use request::{CacheLineIdx, Request};

/// Owns the lock table, admission history, and references to every external
/// collaborator. Obtained from [`CacheCore::init`] and shared behind an
/// `Arc` -- every public entry point is callable from multiple threads
/// concurrently.
pub struct CacheCore {
    pub(crate) conf: CacheCoreConf,
    pub(crate) lock_table: LockTable,
    pub(crate) history: AdmissionHistory,
    pub(crate) mapper: Arc<dyn Mapper>,
    pub(crate) cache_io: Arc<dyn CacheIo>,
    pub(crate) backing_io: Arc<dyn external::BackingIo>,
    pub(crate) cache_stats: Arc<dyn CacheStats>,
    pub(crate) buffers: Arc<dyn BufferPool>,
    pub(crate) cleaner: Arc<dyn Cleaner>,

    /// Set by the external scheduler to force every new request straight to
    /// pass-through, e.g. while a bulk invalidation is in flight.
    pending_read_misses_blocked: AtomicBool,

    suspended_requests: AtomicU32,
}

impl CacheCore {
    /// `init(cache_ref, num_lines) -> handle | error`. The cache reference
    /// and per-request I/O collaborators are supplied as trait objects
    /// rather than a single opaque `cache_ref`, since this crate has no
    /// knowledge of the cache device's own type.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        conf: CacheCoreConf,
        mapper: Arc<dyn Mapper>,
        cache_io: Arc<dyn CacheIo>,
        backing_io: Arc<dyn external::BackingIo>,
        cache_stats: Arc<dyn CacheStats>,
        buffers: Arc<dyn BufferPool>,
        cleaner: Arc<dyn Cleaner>,
    ) -> Result<Arc<Self>, CoreError> {
        conf.validate()
            .map_err(|e| CoreError::MappingError(e.context("invalid CacheCoreConf")))?;
        let lock_table = LockTable::new(conf.num_lines);
        let history = AdmissionHistory::new(&conf);
        Ok(Arc::new(Self {
            conf,
            lock_table,
            history,
            mapper,
            cache_io,
            backing_io,
            cache_stats,
            buffers,
            cleaner,
            pending_read_misses_blocked: AtomicBool::new(false),
            suspended_requests: AtomicU32::new(0),
        }))
    }

    /// `deinit(handle)`. All state is in-memory and owned by the `Arc`;
    /// dropping the last reference is the whole of deinitialization. The
    /// host must have already reached quiescence: no in-flight requests
    /// should remain against this handle.
    pub fn deinit(self: Arc<Self>) {
        drop(self)
    }

    pub fn set_pending_read_misses_blocked(&self, blocked: bool) {
        self.pending_read_misses_blocked
            .store(blocked, Ordering::Release);
    }

    /// `read(request) -> 0 | negative_error`: the Read Engine entry point.
    #[instrument(skip_all)]
    pub fn read(self: &Arc<Self>, request: Arc<Request>, on_complete: CompletionFn) {
        read_engine::enter(self, request, on_complete);
    }

    /// `passthrough(request)`: the Pass-Through Engine entry point.
    #[instrument(skip_all)]
    pub fn passthrough(self: &Arc<Self>, request: Arc<Request>, on_complete: CompletionFn) {
        passthrough_engine::enter(self, request, error::Completion::new(on_complete));
    }

    pub fn try_lock_line_rd(&self, line: CacheLineIdx) -> bool {
        self.lock_table.try_read(line)
    }

    pub fn try_lock_line_wr(&self, line: CacheLineIdx) -> bool {
        self.lock_table.try_write(line)
    }

    pub fn unlock_line_rd(&self, line: CacheLineIdx) {
        self.lock_table.unlock_read(line)
    }

    pub fn unlock_line_wr(&self, line: CacheLineIdx) {
        self.lock_table.unlock_write(line)
    }

    /// For the caller taking ownership of a request's locks temporarily.
    pub fn unlock_request(&self, request: &Request) {
        lock_coordinator::release_all(&self.lock_table, request);
    }

    pub fn waiters_on_line(&self, line: CacheLineIdx) -> bool {
        !self.lock_table.waiters_empty(line)
    }

    /// `check_fast(request)`: a caller-facing pre-flight hint, not part of
    /// the read/pass-through state machines. Predicts whether a `WRITE`
    /// `try_all` would succeed right now by acquiring and immediately
    /// releasing every participating line; never leaves a lock behind.
    pub fn check_fast(&self, request: &Request) -> bool {
        lock_coordinator::check_fast(&self.lock_table, request)
    }

    pub fn total_suspended(&self) -> u32 {
        self.suspended_requests.load(Ordering::Acquire)
    }

    pub(crate) fn mark_suspended(&self) {
        self.suspended_requests.fetch_add(1, Ordering::AcqRel);
        metrics::SUSPENDED_REQUESTS.inc();
    }

    pub(crate) fn mark_resumed(&self) {
        self.suspended_requests.fetch_sub(1, Ordering::AcqRel);
        metrics::SUSPENDED_REQUESTS.dec();
    }

    pub fn total_lock_waiters(&self) -> usize {
        self.lock_table.total_waiters()
    }
}
