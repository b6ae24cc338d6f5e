use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

/// Handle to the process-wide "must cancel" bit.
///
/// Long-running operators and IO paths check this at block boundaries;
/// setting it unwinds every in-flight query with `SfqError::Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    /// A fresh, unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag; every in-flight query unwinds at its next check.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Reset the flag so new queries can run.
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Has the flag been tripped?
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Shared runtime state for query execution: the global query lock, the
/// cancel flag, and the segment-count default.
///
/// The planner holds `query_lock` for the whole of a top-level
/// materialization; nested materializations run inside the held lock through
/// internal entry points, so concurrent top-level queries serialize.
///
/// Handles are passed into the engine explicitly rather than read from
/// free globals so tests can run with isolated runtimes. [`QueryRuntime::global`]
/// provides the per-process default.
#[derive(Debug)]
pub struct QueryRuntime {
    query_lock: Mutex<()>,
    cancel: CancelFlag,
}

impl QueryRuntime {
    /// A fresh, isolated runtime (tests mostly; production code shares
    /// [`QueryRuntime::global`]).
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            query_lock: Mutex::new(()),
            cancel: CancelFlag::new(),
        })
    }

    /// The process-wide default runtime.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<QueryRuntime>> = OnceLock::new();
        GLOBAL.get_or_init(QueryRuntime::new).clone()
    }

    /// Handle to this runtime's cancel bit.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Acquire the global query lock for the duration of a materialization.
    pub fn lock_queries(&self) -> std::sync::MutexGuard<'_, ()> {
        self.query_lock.lock().expect("query lock poisoned")
    }

    /// Number of worker segments to use when the caller asked for 0.
    pub fn default_num_segments(&self) -> usize {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

impl Default for QueryRuntime {
    fn default() -> Self {
        Self {
            query_lock: Mutex::new(()),
            cancel: CancelFlag::new(),
        }
    }
}
