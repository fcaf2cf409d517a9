//! A single shared worker pool, owned by the orchestrator and handed to whichever
//! component needs bounded parallelism (needle search, C5's tile work, C6's pair work).
//!
//! "Replace the source's ad-hoc per-call task spawning with a
//! single shared pool... Backpressure is provided by bounded concurrency; no queue
//! should grow without bound." Grounded on `imgdup-common`'s use of `rayon` throughout
//! (`imgdup-common`'s `Cargo.toml` depends on it directly; its modules spawn rayon scoped
//! work rather than hand-rolling a pool), generalized here into an explicit
//! `rayon::ThreadPool` wrapper so the orchestrator can size and share one pool instead of
//! relying on the implicit global rayon pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag: long-running operations poll
/// this and bail out early with an empty/null result. No preemption.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Thin wrapper around a `rayon::ThreadPool` sized to `num_cpus` by default (requirement:
/// "typically num_cpus"), shared by the orchestrator across needle search, quality-tile
/// work and template-match pairs.
pub struct SharedPool {
    pool: rayon::ThreadPool,
}

impl SharedPool {
    pub fn new(num_threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .expect("failed to build worker pool");
        SharedPool { pool }
    }

    pub fn default_sized() -> Self {
        Self::new(std::thread::available_parallelism().map_or(4, |n| n.get()))
    }

    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }

    pub fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_token_clones_share_state() {
        let a = CancelToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }

    #[test]
    fn shared_pool_runs_work() {
        let pool = SharedPool::new(2);
        let sum: i32 = pool.install(|| (1..=100).sum());
        assert_eq!(sum, 5050);
    }
}
