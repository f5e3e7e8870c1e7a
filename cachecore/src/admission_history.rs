//! C3: secondary admission filter.
//!
//! A chaining hash table (power-of-two bucket count) plus a global
//! doubly-linked LRU list, bounded by `max_entries`. The intrusive LRU is
//! realized as an arena: nodes live in a single `Vec<HistoryNode>` and are
//! addressed by index, so there is no unsafe backlink juggling -- the arena
//! owns the node, the LRU links are plain `Option<u32>` indices invalidated
//! on removal.

use std::sync::Mutex;

use crate::config::{defaults, CacheCoreConf, PAGE_SIZE};

const NIL: u32 = u32::MAX;

/// MurmurHash3 64-bit finaliser: it
/// preserves uniform distribution across power-of-two table sizes, which
/// bucket selection by `h & (size - 1)` assumes. This is unrelated to (and
/// much more scrambling than) the simple monotonic key the read engine's HASH
/// step uses to fix lock-acquisition order; see `read_engine::metadata_order_key`.
fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

const GOLDEN_RATIO_64: u64 = 0x9E3779B97F4A7C15;

fn history_hash(aligned_addr: u64, backing_id: u32) -> u64 {
    mix64(aligned_addr ^ (backing_id as u64).wrapping_mul(GOLDEN_RATIO_64))
}

#[derive(Debug, Clone)]
struct HistoryNode {
    aligned_addr: u64,
    backing_id: u32,
    last_seen: u64,
    hits: u32,

    hash_next: u32,
    lru_prev: u32,
    lru_next: u32,
    /// `false` once the node has been evicted and its slot recycled via the
    /// free list; guards against stale indices.
    occupied: bool,
}

struct HistoryInner {
    buckets: Vec<u32>,
    nodes: Vec<HistoryNode>,
    free_list: Vec<u32>,
    lru_head: u32,
    lru_tail: u32,
    count: usize,
    clock: u64,

    max_entries: usize,
    hash_size: usize,

    hits_total: u64,
    lookups_total: u64,
    /// `clock` value as of the last `maybe_resize_bound` check; resize is
    /// reconsidered once `clock` has advanced by at least
    /// `HISTORY_RESIZE_CHECK_INTERVAL` since then. A plain modulo on `clock`
    /// would work only if each call advanced it by exactly one, which it
    /// doesn't (one call can perform several lookups), so a running
    /// watermark is used instead.
    last_bound_check_clock: u64,
}

impl HistoryInner {
    fn new(conf: &CacheCoreConf) -> Self {
        Self {
            buckets: vec![NIL; conf.hash_size_initial],
            nodes: Vec::new(),
            free_list: Vec::new(),
            lru_head: NIL,
            lru_tail: NIL,
            count: 0,
            clock: 0,
            max_entries: conf.max_history_initial,
            hash_size: conf.hash_size_initial,
            hits_total: 0,
            lookups_total: 0,
            last_bound_check_clock: 0,
        }
    }

    fn bucket_of(&self, addr: u64, backing_id: u32) -> usize {
        (history_hash(addr, backing_id) as usize) & (self.hash_size - 1)
    }

    fn find(&self, addr: u64, backing_id: u32) -> Option<u32> {
        let mut cur = self.buckets[self.bucket_of(addr, backing_id)];
        while cur != NIL {
            let n = &self.nodes[cur as usize];
            if n.aligned_addr == addr && n.backing_id == backing_id {
                return Some(cur);
            }
            cur = n.hash_next;
        }
        None
    }

    fn lru_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let n = &self.nodes[idx as usize];
            (n.lru_prev, n.lru_next)
        };
        if prev != NIL {
            self.nodes[prev as usize].lru_next = next;
        } else {
            self.lru_head = next;
        }
        if next != NIL {
            self.nodes[next as usize].lru_prev = prev;
        } else {
            self.lru_tail = prev;
        }
    }

    fn lru_push_front(&mut self, idx: u32) {
        let old_head = self.lru_head;
        {
            let n = &mut self.nodes[idx as usize];
            n.lru_prev = NIL;
            n.lru_next = old_head;
        }
        if old_head != NIL {
            self.nodes[old_head as usize].lru_prev = idx;
        }
        self.lru_head = idx;
        if self.lru_tail == NIL {
            self.lru_tail = idx;
        }
    }

    fn hash_unlink(&mut self, bucket: usize, idx: u32) {
        let mut cur = self.buckets[bucket];
        if cur == idx {
            self.buckets[bucket] = self.nodes[idx as usize].hash_next;
            return;
        }
        while cur != NIL {
            let next = self.nodes[cur as usize].hash_next;
            if next == idx {
                self.nodes[cur as usize].hash_next = self.nodes[idx as usize].hash_next;
                return;
            }
            cur = next;
        }
    }

    fn hash_push_front(&mut self, bucket: usize, idx: u32) {
        self.nodes[idx as usize].hash_next = self.buckets[bucket];
        self.buckets[bucket] = idx;
    }

    fn evict_tail(&mut self) {
        let tail = self.lru_tail;
        if tail == NIL {
            return;
        }
        let (addr, backing_id) = {
            let n = &self.nodes[tail as usize];
            (n.aligned_addr, n.backing_id)
        };
        let bucket = self.bucket_of(addr, backing_id);
        self.hash_unlink(bucket, tail);
        self.lru_unlink(tail);
        self.nodes[tail as usize].occupied = false;
        self.free_list.push(tail);
        self.count -= 1;
    }

    /// `lookup` semantics: on hit, bump `hits`, refresh `last_seen`, move to
    /// LRU head. Returns whether the entry was present.
    fn lookup(&mut self, addr: u64, backing_id: u32) -> bool {
        self.clock += 1;
        self.lookups_total += 1;
        match self.find(addr, backing_id) {
            Some(idx) => {
                self.hits_total += 1;
                {
                    let n = &mut self.nodes[idx as usize];
                    n.hits = n.hits.saturating_add(1);
                    n.last_seen = self.clock;
                }
                self.lru_unlink(idx);
                self.lru_push_front(idx);
                true
            }
            None => false,
        }
    }

    /// `insert_or_touch` semantics: touch if present, else allocate at the
    /// LRU head and evict the tail if now over `max_entries`.
    fn insert_or_touch(&mut self, addr: u64, backing_id: u32) -> bool {
        if self.lookup(addr, backing_id) {
            return true;
        }
        let idx = match self.free_list.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = HistoryNode {
                    aligned_addr: addr,
                    backing_id,
                    last_seen: self.clock,
                    hits: 0,
                    hash_next: NIL,
                    lru_prev: NIL,
                    lru_next: NIL,
                    occupied: true,
                };
                idx
            }
            None => {
                let idx = self.nodes.len() as u32;
                self.nodes.push(HistoryNode {
                    aligned_addr: addr,
                    backing_id,
                    last_seen: self.clock,
                    hits: 0,
                    hash_next: NIL,
                    lru_prev: NIL,
                    lru_next: NIL,
                    occupied: true,
                });
                idx
            }
        };
        let bucket = self.bucket_of(addr, backing_id);
        self.hash_push_front(bucket, idx);
        self.lru_push_front(idx);
        self.count += 1;

        while self.count > self.max_entries {
            self.evict_tail();
        }
        false
    }

    fn maybe_resize_hash(&mut self, conf: &CacheCoreConf) {
        if !conf.adaptive_sizing {
            return;
        }
        let load = self.count as f32 / self.hash_size as f32;
        if load > defaults::HASH_RESIZE_THRESHOLD && self.hash_size * 2 <= conf.hash_size_max {
            self.resize_hash(self.hash_size * 2);
        } else if load < defaults::HASH_RESIZE_THRESHOLD / 2.0
            && self.hash_size / 2 >= conf.hash_size_min
        {
            self.resize_hash(self.hash_size / 2);
        }
    }

    /// Lets `max_entries` drift towards `max_max_history` when the measured
    /// hit ratio is high (the history is paying for itself, worth growing)
    /// and towards `min_max_history` when it is low (most entries are cold,
    /// no point keeping them around). Checked every
    /// `HISTORY_RESIZE_CHECK_INTERVAL` calls rather than on every one, so the
    /// bound doesn't thrash. Never evicts below `count` on shrink -- the
    /// existing `count > max_entries` eviction loop in `insert_or_touch`
    /// handles catching up gradually.
    fn maybe_resize_bound(&mut self, conf: &CacheCoreConf) {
        if !conf.adaptive_sizing || self.lookups_total == 0 {
            return;
        }
        if self.clock - self.last_bound_check_clock < defaults::HISTORY_RESIZE_CHECK_INTERVAL {
            return;
        }
        self.last_bound_check_clock = self.clock;
        let ratio = self.hits_total as f64 / self.lookups_total as f64;
        if ratio >= defaults::HISTORY_GROW_HIT_RATIO && self.max_entries < conf.max_max_history {
            let grown = self.max_entries + (self.max_entries / 4).max(1);
            self.max_entries = grown.min(conf.max_max_history);
        } else if ratio <= defaults::HISTORY_SHRINK_HIT_RATIO
            && self.max_entries > conf.min_max_history
        {
            let shrunk = self.max_entries - (self.max_entries / 4).max(1);
            self.max_entries = shrunk.max(conf.min_max_history);
        }
    }

    fn resize_hash(&mut self, new_size: usize) {
        debug_assert!(new_size.is_power_of_two());
        self.hash_size = new_size;
        self.buckets = vec![NIL; new_size];
        for idx in 0..self.nodes.len() as u32 {
            if !self.nodes[idx as usize].occupied {
                continue;
            }
            let (addr, backing_id) = {
                let n = &self.nodes[idx as usize];
                (n.aligned_addr, n.backing_id)
            };
            let bucket = self.bucket_of(addr, backing_id);
            self.hash_push_front(bucket, idx);
        }
    }
}

/// Page-aligns a block address down to `PAGE_SIZE`.
pub fn aligned_addr(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

pub struct AdmissionHistory {
    inner: Mutex<HistoryInner>,
}

impl AdmissionHistory {
    pub fn new(conf: &CacheCoreConf) -> Self {
        Self {
            inner: Mutex::new(HistoryInner::new(conf)),
        }
    }

    pub fn lookup(&self, addr: u64, backing_id: u32) -> bool {
        self.inner.lock().unwrap().lookup(aligned_addr(addr), backing_id)
    }

    pub fn insert_or_touch(&self, conf: &CacheCoreConf, addr: u64, backing_id: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert_or_touch(aligned_addr(addr), backing_id);
        inner.maybe_resize_hash(conf);
        inner.maybe_resize_bound(conf);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_ratio(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        if inner.lookups_total == 0 {
            0.0
        } else {
            inner.hits_total as f64 / inner.lookups_total as f64
        }
    }

    /// Ratio of already-seen pages over the request's
    /// page-aligned span gates a MISS once the cache is near-full; while the
    /// cache is not full, admission is unconditional (the history still
    /// records the access so its LRU state stays warm). Every block in the
    /// span is recorded via `insert_or_touch` regardless of the decision.
    pub fn admit(
        &self,
        conf: &CacheCoreConf,
        span_pages: impl Iterator<Item = u64> + Clone,
        backing_id: u32,
        cache_near_full: bool,
    ) -> bool {
        let mut total_pages = 0u32;
        let mut hit_pages = 0u32;
        {
            let mut inner = self.inner.lock().unwrap();
            for page_addr in span_pages.clone() {
                total_pages += 1;
                if inner.lookup(page_addr, backing_id) {
                    hit_pages += 1;
                }
            }
        }

        let decision = if !cache_near_full {
            true
        } else if total_pages == 0 {
            false
        } else {
            (hit_pages as f32 / total_pages as f32) >= conf.hit_ratio_threshold
        };

        {
            let mut inner = self.inner.lock().unwrap();
            for page_addr in span_pages {
                inner.insert_or_touch(page_addr, backing_id);
            }
            inner.maybe_resize_hash(conf);
            inner.maybe_resize_bound(conf);
        }

        decision
    }
}
