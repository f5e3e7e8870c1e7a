//! Integration tests exercising [`cachecore::CacheCore`] end-to-end against
//! in-memory fake collaborators, covering the concurrency and admission
//! scenarios named S1 through S6 below.
//! Unit tests colocated with each module already cover the same scenarios
//! against the narrower module surface (`lock_table`, `lock_coordinator`,
//! `read_engine`); this file drives them through the crate's public API
//! instead, plus S6, which needs the `testing`-feature fault injection on
//! the bare lock table.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use cachecore::config::CacheCoreConf;
use cachecore::error::{CompletionFn, CoreError};
use cachecore::external::{
    BackingIo, BufferHandle, BufferPool, CacheIo, CacheStats, Cleaner, LockPrepareHint, Mapper,
};
use cachecore::lock_coordinator;
use cachecore::lock_table::{LockOutcome, LockTable};
use cachecore::request::{CacheLineIdx, LineStatus, Request, RequestMapEntry, RwMode};
use cachecore::CacheCore;

struct PassthroughMapper;
impl Mapper for PassthroughMapper {
    fn traverse(&self, _r: &Request) -> Result<(), CoreError> {
        Ok(())
    }
    fn prepare_clines(&self, _r: &Request) -> Result<LockPrepareHint, CoreError> {
        Ok(LockPrepareHint::Acquired)
    }
    fn move_partition(&self, _r: &Request) {}
    fn set_valid_map(&self, _r: &Request) {}
    fn invalidate(&self, _r: &Request) {}
}

/// Maps every request entirely onto `line`, always `Hit` -- lets a `Write`
/// mode request exercise write-lock acquisition through `CacheCore::read`
/// without going through a MISS's backing I/O.
struct FixedLineMapper {
    line: u32,
}
impl Mapper for FixedLineMapper {
    fn traverse(&self, request: &Request) -> Result<(), CoreError> {
        let mut blocks = request.blocks.lock().unwrap();
        for e in blocks.iter_mut() {
            e.coll_idx = CacheLineIdx(self.line);
            e.status = LineStatus::Hit;
        }
        Ok(())
    }
    fn prepare_clines(&self, _r: &Request) -> Result<LockPrepareHint, CoreError> {
        Ok(LockPrepareHint::Acquired)
    }
    fn move_partition(&self, _r: &Request) {}
    fn set_valid_map(&self, _r: &Request) {}
    fn invalidate(&self, _r: &Request) {}
}

struct CountingBackingIo {
    calls: AtomicUsize,
}
impl BackingIo for CountingBackingIo {
    fn submit(&self, _r: Arc<Request>, on_complete: CompletionFn) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        on_complete(Ok(()));
    }
}

struct NeverCalledCacheIo;
impl CacheIo for NeverCalledCacheIo {
    fn submit_cache_reads(
        &self,
        _r: Arc<Request>,
        _o: u64,
        _l: u32,
        _c: u32,
        _on_complete: CompletionFn,
    ) {
        panic!("this scenario never dispatches a cache read");
    }
}

/// Completes `submit_cache_reads` only when `fire()` is called on the
/// returned handle, so a test can hold a request's dispatch "in flight" to
/// simulate real contention between two concurrent requests.
#[derive(Default)]
struct DeferredCacheIo {
    pending: StdMutex<Vec<CompletionFn>>,
}
impl DeferredCacheIo {
    fn fire_oldest(&self) {
        let cb = self.pending.lock().unwrap().remove(0);
        cb(Ok(()));
    }
    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
impl CacheIo for DeferredCacheIo {
    fn submit_cache_reads(
        &self,
        _r: Arc<Request>,
        _o: u64,
        _l: u32,
        _c: u32,
        on_complete: CompletionFn,
    ) {
        self.pending.lock().unwrap().push(on_complete);
    }
}

struct FixedStats(u8);
impl CacheStats for FixedStats {
    fn occupancy_percent(&self) -> u8 {
        self.0
    }
}

struct NoopBuffers;
impl BufferPool for NoopBuffers {
    fn alloc(&self, _pages: u32) -> Result<BufferHandle, CoreError> {
        Ok(BufferHandle(1))
    }
    fn mlock(&self, _h: BufferHandle) -> Result<(), CoreError> {
        Ok(())
    }
    fn copy(&self, _h: BufferHandle, _dst: &mut [u8]) {}
    fn free(&self, _h: BufferHandle) {}
}

struct NoopCleaner;
impl Cleaner for NoopCleaner {
    fn trigger_cleaning(&self, _r: &Request) {}
}

fn entry(line: u32, status: LineStatus) -> RequestMapEntry {
    RequestMapEntry {
        coll_idx: CacheLineIdx(line),
        status,
        locked: false,
    }
}

/// S3, second half: once the history has warmed up on a prior miss, a
/// repeat read at the same offset takes the normal (non-force-pass-through)
/// path. Since `NeverCalledCacheIo` panics on any cache dispatch, completing
/// without a panic confirms the second request still resolved its MISS
/// through the backing device rather than (incorrectly) through a HIT path.
#[test]
fn s3_repeat_read_after_history_warms_takes_normal_path() {
    let backing_io = Arc::new(CountingBackingIo {
        calls: AtomicUsize::new(0),
    });
    let core = CacheCore::init(
        CacheCoreConf {
            num_lines: 64,
            ..Default::default()
        },
        Arc::new(PassthroughMapper),
        Arc::new(NeverCalledCacheIo),
        backing_io.clone(),
        Arc::new(FixedStats(99)),
        Arc::new(NoopBuffers),
        Arc::new(NoopCleaner),
    )
    .unwrap();

    let request = Arc::new(Request::new(
        vec![entry(0, LineStatus::Miss)],
        RwMode::Write,
        1_048_576,
        4096,
        9,
        true,
    ));
    let result = Arc::new(StdMutex::new(None));
    let result_cb = result.clone();
    core.read(
        request.clone(),
        Box::new(move |r| *result_cb.lock().unwrap() = Some(r)),
    );
    assert!(result.lock().unwrap().take().unwrap().is_ok());
    assert_eq!(backing_io.calls.load(Ordering::SeqCst), 1);

    // Second request, same span: ratio is now 1/1 >= 0.5, so admission
    // succeeds and the MISS goes through the normal write-lock path.
    let request2 = Arc::new(Request::new(
        vec![entry(0, LineStatus::Miss)],
        RwMode::Write,
        1_048_576,
        4096,
        9,
        true,
    ));
    let result2 = Arc::new(StdMutex::new(None));
    let result2_cb = result2.clone();
    core.read(
        request2.clone(),
        Box::new(move |r| *result2_cb.lock().unwrap() = Some(r)),
    );
    assert!(result2.lock().unwrap().take().unwrap().is_ok());
    assert_eq!(backing_io.calls.load(Ordering::SeqCst), 2);
    assert_eq!(request2.locked_count(), 0);
}

/// S4: two concurrent WRITE-mode requests overlapping on a single line,
/// driven entirely through `CacheCore::read`. The first request's cache
/// dispatch is held open by `DeferredCacheIo` so the second request
/// genuinely contends on the held write lock and must take the slow path;
/// releasing the first's completion must grant the second exactly once.
#[test]
fn s4_contended_writers_single_delivery_via_read_api() {
    let cache_io = Arc::new(DeferredCacheIo::default());
    let core = CacheCore::init(
        CacheCoreConf {
            num_lines: 64,
            ..Default::default()
        },
        Arc::new(FixedLineMapper { line: 42 }),
        cache_io.clone(),
        Arc::new(CountingBackingIo {
            calls: AtomicUsize::new(0),
        }),
        Arc::new(FixedStats(50)),
        Arc::new(NoopBuffers),
        Arc::new(NoopCleaner),
    )
    .unwrap();

    let req_a = Arc::new(Request::new(vec![entry(42, LineStatus::Hit)], RwMode::Write, 0, 4096, 1, false));
    let a_done = Arc::new(AtomicUsize::new(0));
    let a_cb = a_done.clone();
    core.read(req_a.clone(), Box::new(move |r| {
        assert!(r.is_ok());
        a_cb.fetch_add(1, Ordering::SeqCst);
    }));
    // `req_a` holds the write lock on line 42; its own cache dispatch is
    // parked in `DeferredCacheIo` awaiting `fire_oldest`.
    assert_eq!(req_a.locked_count(), 1);
    assert_eq!(a_done.load(Ordering::SeqCst), 0);

    let req_b = Arc::new(Request::new(vec![entry(42, LineStatus::Hit)], RwMode::Write, 0, 4096, 1, false));
    let b_done = Arc::new(AtomicUsize::new(0));
    let b_cb = b_done.clone();
    core.read(req_b.clone(), Box::new(move |r| {
        assert!(r.is_ok());
        b_cb.fetch_add(1, Ordering::SeqCst);
    }));

    // `req_b` must have gone to the slow path: still unlocked, not complete.
    assert_eq!(req_b.locked_count(), 0);
    assert_eq!(b_done.load(Ordering::SeqCst), 0);
    assert!(core.waiters_on_line(CacheLineIdx(42)));
    assert_eq!(cache_io.pending_count(), 1);

    // Completing `req_a`'s cache dispatch releases its lock, which must
    // grant `req_b` exactly once and let it reach its own dispatch.
    cache_io.fire_oldest();
    assert_eq!(a_done.load(Ordering::SeqCst), 1);
    assert_eq!(req_b.locked_count(), 1);
    assert_eq!(b_done.load(Ordering::SeqCst), 0);
    assert_eq!(cache_io.pending_count(), 1);
    assert!(!core.waiters_on_line(CacheLineIdx(42)));

    cache_io.fire_oldest();
    assert_eq!(b_done.load(Ordering::SeqCst), 1);
    assert_eq!(req_b.locked_count(), 0);
}

/// S5: writer-preference on the bare, publicly exported `LockTable` type --
/// a writer queued behind an active reader must be granted before a fresh
/// reader is allowed to jump the queue, and releasing the writer then wakes
/// every queued reader at once.
#[test]
fn s5_writer_preference_on_public_lock_table() {
    let table = LockTable::new(8);
    let line = CacheLineIdx(7);
    assert!(table.try_read(line)); // R1 holds the line.

    let w1_granted = Arc::new(AtomicUsize::new(0));
    let w1_cb = w1_granted.clone();
    assert!(matches!(
        table
            .lock_write(line, Box::new(move || { w1_cb.fetch_add(1, Ordering::SeqCst); }))
            .unwrap(),
        LockOutcome::Enqueued(_)
    ));

    // A fresh reader must not be granted ahead of the queued writer.
    assert!(!table.try_read(line));

    let r2_granted = Arc::new(AtomicUsize::new(0));
    let r2_cb = r2_granted.clone();
    assert!(matches!(
        table
            .lock_read(line, Box::new(move || { r2_cb.fetch_add(1, Ordering::SeqCst); }))
            .unwrap(),
        LockOutcome::Enqueued(_)
    ));

    table.unlock_read(line); // R1 releases -> W1 granted, R2 still queued.
    assert_eq!(w1_granted.load(Ordering::SeqCst), 1);
    assert_eq!(r2_granted.load(Ordering::SeqCst), 0);

    table.unlock_write(line); // W1 releases -> R2 granted.
    assert_eq!(r2_granted.load(Ordering::SeqCst), 1);
    assert!(table.waiters_empty(line));
}

/// S6: waiter allocation fails partway through a 4-block slow-path
/// acquisition. Waiters already placed on earlier blocks must be rolled
/// back, any fast-granted locks released, `on_all_granted` must never fire,
/// and the caller must see `NoMem`.
#[test]
fn s6_allocation_failure_mid_slow_path_rolls_back() {
    let table = LockTable::new(8);
    // Pre-hold lines 0..4 for write so every participating block must
    // enqueue a waiter rather than being granted immediately.
    for i in 0..4u32 {
        assert!(table.try_write(CacheLineIdx(i)));
    }

    let request = Arc::new(Request::for_locking(
        vec![
            entry(0, LineStatus::Hit),
            entry(1, LineStatus::Hit),
            entry(2, LineStatus::Hit),
            entry(3, LineStatus::Hit),
        ],
        RwMode::Read,
        true,
    ));

    // Fail on the 3rd waiter-enqueue attempt (0-indexed: blocks 0 and 1
    // succeed in enqueuing, block 2 fails).
    table.inject_enomem_at_waiter(2);

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let result = lock_coordinator::lock_all_async(
        &table,
        &request,
        Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert!(matches!(result, Err(CoreError::NoMem(_))));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(request.locked_count(), 0);
    // Waiters placed on blocks 0 and 1 must have been cancelled.
    assert!(table.waiters_empty(CacheLineIdx(0)));
    assert!(table.waiters_empty(CacheLineIdx(1)));
    assert!(table.waiters_empty(CacheLineIdx(2)));
    // The pre-existing writers still hold their lines; nothing extra stuck.
    assert!(!table.try_read(CacheLineIdx(0)));
    assert!(!table.try_read(CacheLineIdx(1)));
    assert!(!table.try_read(CacheLineIdx(2)));
    assert!(!table.try_read(CacheLineIdx(3)));
}

/// Round-trip: a HIT read returns control to the caller with every
/// participating line unlocked again, and a concurrent writer can then
/// immediately take the line.
#[test]
fn round_trip_hit_leaves_lines_unlocked_for_next_writer() {
    struct ImmediateCacheIo;
    impl CacheIo for ImmediateCacheIo {
        fn submit_cache_reads(
            &self,
            _r: Arc<Request>,
            _o: u64,
            _l: u32,
            _c: u32,
            on_complete: CompletionFn,
        ) {
            on_complete(Ok(()));
        }
    }
    let core = CacheCore::init(
        CacheCoreConf {
            num_lines: 8,
            ..Default::default()
        },
        Arc::new(PassthroughMapper),
        Arc::new(ImmediateCacheIo),
        Arc::new(CountingBackingIo {
            calls: AtomicUsize::new(0),
        }),
        Arc::new(FixedStats(10)),
        Arc::new(NoopBuffers),
        Arc::new(NoopCleaner),
    )
    .unwrap();

    let request = Arc::new(Request::new(
        vec![entry(2, LineStatus::Hit)],
        RwMode::Read,
        8192,
        4096,
        1,
        false,
    ));
    let done = Arc::new(AtomicU32::new(0));
    let d = done.clone();
    core.read(
        request,
        Box::new(move |r| {
            assert!(r.is_ok());
            d.store(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert!(core.try_lock_line_wr(CacheLineIdx(2)));
}
