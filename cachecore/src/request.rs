//! The central [`Request`] object and its per-block map entries.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Dense index into the lock table / cache line array. Immutable for the
/// lifetime of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheLineIdx(pub u32);

impl CacheLineIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Status assigned by the external mapper before locking begins. Not mutated
/// by the core thereafter, except the one externally-driven REMAPPED -> HIT
/// transition performed when eviction completes for that line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Hit,
    Miss,
    Remapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwMode {
    Read,
    Write,
    /// write-lock-check-fast: same participation rule as `Read`, but the
    /// coordinator uses write-mode locking semantics for the check.
    ReadMappedOnly,
}

/// One block's worth of bookkeeping inside a [`Request`].
#[derive(Debug, Clone)]
pub struct RequestMapEntry {
    pub coll_idx: CacheLineIdx,
    pub status: LineStatus,
    /// Owned exclusively by the request-lock coordinator (C2).
    pub locked: bool,
}

impl RequestMapEntry {
    /// A block participates in per-line locking iff it is neither MISS nor
    /// REMAPPED (those lines are assigned locks individually during eviction,
    /// external to this core).
    pub fn participates_in_locking(&self) -> bool {
        !matches!(self.status, LineStatus::Miss | LineStatus::Remapped)
    }
}

/// The central request object threaded through the read engine and
/// pass-through engine.
///
/// Always handled behind `Arc<Request>`: it is jointly owned by the caller and
/// by every in-flight sub-I/O or wait-queue entry, and is destroyed only when
/// the last `Arc` is dropped. `refcount` additionally tracks logical
/// acquire/release pairs for the lock-conservation testable property (spec
/// §8, item 3); it is not what keeps the value alive (the `Arc` is), it is a
/// second, independent count kept in sync with it for that invariant check.
pub struct Request {
    pub blocks: Mutex<Vec<RequestMapEntry>>,
    pub rw: RwMode,

    /// Backing-device byte offset of the first block, and the request's
    /// total byte length. Needed by the admission filter (page-aligned span)
    /// and by the read engine to address cache/backing sub-I/Os.
    pub addr: u64,
    pub size: u32,
    pub backing_id: u32,

    /// Decremented as each participating line's lock is granted (and as each
    /// non-participating line is counted as immediately "granted"); the
    /// slow-path completion fires when this reaches zero.
    pub lock_remaining: AtomicU32,

    /// Decremented as each sub-I/O completes; the caller completion fires
    /// when this reaches zero.
    pub io_remaining: AtomicU32,

    pub refcount: AtomicU32,

    pub force_pt: bool_cell::BoolCell,

    /// Caller opt-out of the secondary admission check.
    pub allow_second_admission: bool,

    /// The caller's own destination buffer, `size` bytes. On a MISS, the
    /// read engine's backing read lands in a private copy buffer (see
    /// `external::BufferPool`) which is then copied in here -- this is the
    /// "user buffer" spec §4.4's DISPATCH-MISS step names as the copy
    /// target. Left untouched on a HIT, where the cache I/O collaborator is
    /// assumed to deliver straight into it.
    pub user_buf: Mutex<Vec<u8>>,
}

/// A tiny `AtomicBool`-backed cell so `force_pt` can be flipped through a
/// shared `&Request` the way the state machine flips it mid-flight.
pub mod bool_cell {
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    pub struct BoolCell(AtomicBool);

    impl BoolCell {
        pub fn new(v: bool) -> Self {
            Self(AtomicBool::new(v))
        }
        pub fn get(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
        pub fn set(&self, v: bool) {
            self.0.store(v, Ordering::Release)
        }
    }
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        blocks: Vec<RequestMapEntry>,
        rw: RwMode,
        addr: u64,
        size: u32,
        backing_id: u32,
        allow_second_admission: bool,
    ) -> Self {
        let n = blocks.len() as u32;
        Self {
            blocks: Mutex::new(blocks),
            rw,
            addr,
            size,
            backing_id,
            lock_remaining: AtomicU32::new(n),
            io_remaining: AtomicU32::new(0),
            refcount: AtomicU32::new(1),
            force_pt: bool_cell::BoolCell::new(false),
            allow_second_admission,
            user_buf: Mutex::new(vec![0u8; size as usize]),
        }
    }

    /// Convenience constructor for tests that only exercise per-line locking
    /// and do not care about device addressing.
    #[cfg(any(test, feature = "testing"))]
    pub fn for_locking(blocks: Vec<RequestMapEntry>, rw: RwMode, allow_second_admission: bool) -> Self {
        Self::new(blocks, rw, 0, crate::config::PAGE_SIZE as u32, 1, allow_second_admission)
    }

    pub fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after release, purely for assertions/tests; the
    /// `Arc` wrapping the request is what actually frees it.
    pub fn release(&self) -> u32 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn participating_count(&self) -> usize {
        self.blocks
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.participates_in_locking())
            .count()
    }

    pub fn locked_count(&self) -> usize {
        self.blocks.lock().unwrap().iter().filter(|e| e.locked).count()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("rw", &self.rw)
            .field("blocks", &self.blocks.lock().unwrap().len())
            .field(
                "lock_remaining",
                &self.lock_remaining.load(Ordering::Relaxed),
            )
            .field("io_remaining", &self.io_remaining.load(Ordering::Relaxed))
            .field("force_pt", &self.force_pt.get())
            .finish()
    }
}
