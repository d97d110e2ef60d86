//! Barrier-synchronized worker threads for contention scenarios.

use std::sync::Barrier;

/// Run `nthreads` copies of `work` concurrently. Every worker waits on a
/// shared barrier so the contention window opens for all of them at once;
/// the worker's index is passed in.
///
/// Panics in workers propagate to the caller.
pub fn run_threads<F>(nthreads: usize, work: F)
where
    F: Fn(usize) + Sync,
{
    let barrier = Barrier::new(nthreads);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..nthreads)
            .map(|tid| {
                let barrier = &barrier;
                let work = &work;
                scope.spawn(move || {
                    barrier.wait();
                    work(tid);
                })
            })
            .collect();
        for handle in handles {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
    });
}
