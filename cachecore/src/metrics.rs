//! Prometheus metrics for the cache core, registered lazily the same way
//! `pageserver/src/metrics.rs` registers its counters -- a `once_cell::Lazy`
//! wrapping a `register_int_counter_vec!` call, evaluated once on first use.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge};

pub static LOCK_WAIT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cachecore_lock_wait_total",
        "Number of times a request took the lock table slow (wait-queue) path",
        &["mode"]
    )
    .expect("failed to register cachecore_lock_wait_total")
});

pub static ADMISSION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cachecore_admission_total",
        "Secondary admission filter decisions",
        &["decision"]
    )
    .expect("failed to register cachecore_admission_total")
});

pub static REQUEST_COMPLETIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "cachecore_request_completions_total",
        "Terminal outcomes of read/pass-through requests",
        &["result"]
    )
    .expect("failed to register cachecore_request_completions_total")
});

pub static SUSPENDED_REQUESTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "cachecore_suspended_requests",
        "Requests currently parked on a lock-table wait queue"
    )
    .expect("failed to register cachecore_suspended_requests")
});

pub fn record_admission(admitted: bool) {
    let label = if admitted { "admit" } else { "reject" };
    ADMISSION_TOTAL.with_label_values(&[label]).inc();
}

pub fn record_completion(result: &str) {
    REQUEST_COMPLETIONS_TOTAL.with_label_values(&[result]).inc();
}
