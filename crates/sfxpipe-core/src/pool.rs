//! Worker pool driving all parallel phases.
//!
//! Two scheduling modes share the same thread plumbing:
//!
//! * **Range mode** – a fixed number of task slots; each idle worker takes
//!   the smallest-index ready slot, runs it, and marks it finished. The
//!   caller blocks until every slot is finished.
//! * **Streaming mode** – tasks are pulled from a factory under the pool
//!   lock until it runs dry or a cap on started tasks is reached; a `done`
//!   hook runs after each task, also under the lock.
//!
//! Cancellation is cooperative through a shared atomic stop flag checked
//! between tasks. Completion counts are updated under the lock and
//! reported to the progress sink after it is released, so reported counts
//! are monotone non-decreasing without serialising workers on the sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Sink for bulk-phase progress reports.
///
/// Implementations must tolerate calls from several worker threads.
pub trait Progress: Sync {
    fn report(&self, done: usize, total: usize, label: &str);
}

/// Progress sink that logs every report at debug level.
#[derive(Debug, Default)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn report(&self, done: usize, total: usize, label: &str) {
        tracing::debug!(done, total, label, "progress");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Ready,
    Running,
    Finished,
}

struct RangeQueue {
    status: Vec<TaskState>,
    n_done: usize,
}

/// Outcome of a range-mode run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeOutcome {
    /// Tasks that reached the finished state.
    pub n_done: usize,
    /// Worker threads that failed to start.
    pub thread_shortfall: usize,
    /// Whether the stop flag ended the run early.
    pub cancelled: bool,
}

/// Run `work(i)` for every `i` in `0..n_tasks` on a pool of `n_threads`
/// workers. Blocks until every slot is finished (or the stop flag is
/// raised).
pub fn run_range<W>(
    n_tasks: usize,
    n_threads: usize,
    label: Option<&str>,
    progress: Option<&dyn Progress>,
    stop: Option<&AtomicBool>,
    work: W,
) -> RangeOutcome
where
    W: Fn(usize) + Sync,
{
    if n_tasks == 0 {
        return RangeOutcome::default();
    }
    // No idle hands: never more workers than tasks.
    let n_threads = n_threads.clamp(1, n_tasks);

    let queue = Mutex::new(RangeQueue {
        status: vec![TaskState::Ready; n_tasks],
        n_done: 0,
    });
    let shortfall = std::sync::atomic::AtomicUsize::new(0);

    let worker = || loop {
        if stop.map_or(false, |s| s.load(Ordering::Relaxed)) {
            return;
        }

        let mytask = {
            let mut q = queue.lock().expect("pool lock poisoned");
            let Some(i) = q.status.iter().position(|s| *s == TaskState::Ready) else {
                return;
            };
            q.status[i] = TaskState::Running;
            i
        };

        work(mytask);

        let done = {
            let mut q = queue.lock().expect("pool lock poisoned");
            q.status[mytask] = TaskState::Finished;
            q.n_done += 1;
            q.n_done
        };
        if let (Some(p), Some(text)) = (progress, label) {
            p.report(done, n_tasks, text);
        }
    };

    std::thread::scope(|scope| {
        let mut started = 0usize;
        for i in 0..n_threads {
            let builder = std::thread::Builder::new().name(format!("pool-{i}"));
            match builder.spawn_scoped(scope, worker) {
                Ok(_) => started += 1,
                Err(e) => {
                    tracing::warn!(worker = i, error = %e, "failed to start pool thread");
                    shortfall.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        // If nothing could be spawned, do the work on the caller's thread
        // rather than returning with the queue untouched.
        if started == 0 {
            worker();
        }
    });

    let q = queue.into_inner().expect("pool lock poisoned");
    RangeOutcome {
        n_done: q.n_done,
        thread_shortfall: shortfall.into_inner(),
        cancelled: stop.map_or(false, |s| s.load(Ordering::Relaxed)),
    }
}

struct StreamState<G, D> {
    get_task: G,
    done: D,
    n_started: usize,
    n_completed: usize,
}

/// Run tasks pulled from `get_task` on a pool of `n_threads` workers.
///
/// `get_task` and `done` run under the pool lock; `work` runs unlocked.
/// The pool exits when `get_task` returns `None` or `max` tasks have been
/// started. Returns the number of completed tasks.
pub fn run_stream<T, G, W, D>(
    n_threads: usize,
    get_task: G,
    work: W,
    done: D,
    max: usize,
    stop: Option<&AtomicBool>,
) -> usize
where
    T: Send,
    G: FnMut() -> Option<T> + Send,
    W: Fn(T) + Sync,
    D: FnMut() + Send,
{
    let n_threads = n_threads.max(1);
    let state = Mutex::new(StreamState {
        get_task,
        done,
        n_started: 0,
        n_completed: 0,
    });

    let worker = || loop {
        if stop.map_or(false, |s| s.load(Ordering::Relaxed)) {
            return;
        }

        let task = {
            let mut st = state.lock().expect("pool lock poisoned");
            if st.n_started >= max {
                return;
            }
            let Some(task) = (st.get_task)() else {
                return;
            };
            st.n_started += 1;
            task
        };

        work(task);

        let mut st = state.lock().expect("pool lock poisoned");
        st.n_completed += 1;
        (st.done)();
    };

    std::thread::scope(|scope| {
        let mut started = 0usize;
        for i in 0..n_threads {
            let builder = std::thread::Builder::new().name(format!("pool-{i}"));
            if builder.spawn_scoped(scope, worker).is_ok() {
                started += 1;
            } else {
                tracing::warn!(worker = i, "failed to start pool thread");
            }
        }
        if started == 0 {
            worker();
        }
    });

    state.into_inner().expect("pool lock poisoned").n_completed
}
