//! Task executor abstraction for the structural parallelism of the engine.
//!
//! The core never owns a thread pool: independent sub-trees are handed to a
//! `TaskExecutor` as fork/join pairs and the caller decides what runs them.

/// A fork/join execution strategy.
///
/// Implementations must run both closures to completion before returning;
/// whether they run concurrently is up to the implementation.
pub trait TaskExecutor: Sync {
    fn join<RA, RB>(
        &self,
        left: impl FnOnce() -> RA + Send,
        right: impl FnOnce() -> RB + Send,
    ) -> (RA, RB)
    where
        RA: Send,
        RB: Send;
}

/// Runs everything on the calling thread, in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl TaskExecutor for Sequential {
    fn join<RA, RB>(
        &self,
        left: impl FnOnce() -> RA + Send,
        right: impl FnOnce() -> RB + Send,
    ) -> (RA, RB)
    where
        RA: Send,
        RB: Send,
    {
        (left(), right())
    }
}

/// Delegates to the global rayon pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct Threaded;

impl TaskExecutor for Threaded {
    fn join<RA, RB>(
        &self,
        left: impl FnOnce() -> RA + Send,
        right: impl FnOnce() -> RB + Send,
    ) -> (RA, RB)
    where
        RA: Send,
        RB: Send,
    {
        rayon::join(left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_runs_both_sides() {
        let (a, b) = Sequential.join(|| 1 + 1, || "two");
        assert_eq!(a, 2);
        assert_eq!(b, "two");
    }

    #[test]
    fn threaded_runs_both_sides() {
        let (a, b) = Threaded.join(|| (0..10).sum::<i32>(), || (1..5).product::<i32>());
        assert_eq!(a, 45);
        assert_eq!(b, 24);
    }
}
