//! Error taxonomy for the cache core, per the error handling design.
//!
//! [`CoreError`] covers the failure modes the core itself can produce or must
//! surface from a collaborator. `LockOutcome` (in [`crate::lock_table`]) is a
//! control-flow signal, not an error, and intentionally lives outside this enum.

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// Allocation failure: a waiter node, a history entry, or a copy buffer
    /// could not be obtained. Any locks or waiters already taken for the
    /// request have been released before this error reaches the caller.
    #[error("out of memory acquiring {0}")]
    NoMem(&'static str),

    /// A sub-I/O against the cache device failed. The caller only sees this
    /// if the pass-through fallback attempted in response to it also failed;
    /// see the propagation policy on [`crate::read_engine`].
    #[error("cache device I/O error")]
    CacheError(#[source] anyhow::Error),

    /// A sub-I/O against the backing device failed. Terminal: metadata for
    /// in-flight MISS lines has already been invalidated by the time this is
    /// returned.
    #[error("backing device I/O error")]
    CoreError(#[source] anyhow::Error),

    /// The external mapper reported an internal inconsistency. The request
    /// has already been routed via pass-through.
    #[error("mapper reported an inconsistent state")]
    MappingError(#[source] anyhow::Error),
}

/// The caller's completion callback: invoked exactly once per request,
/// carrying the terminal result. "Lock not acquired" never appears here --
/// it is a control signal ("park the request"), not an error.
pub type CompletionFn = Box<dyn FnOnce(Result<(), CoreError>) + Send>;

/// Single-delivery wrapper around a [`CompletionFn`], shared across every
/// branch of the read/pass-through state machines via `Arc`. Double
/// completion is forbidden; `fire` enforces it by construction (the
/// `Option::take` can only ever succeed once).
pub struct Completion(std::sync::Mutex<Option<CompletionFn>>);

impl Completion {
    pub fn new(f: CompletionFn) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self(std::sync::Mutex::new(Some(f))))
    }

    pub fn fire(&self, result: Result<(), CoreError>) {
        if let Some(f) = self.0.lock().unwrap().take() {
            f(result);
        }
    }
}
