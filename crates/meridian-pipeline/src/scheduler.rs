//! # Task Scheduler
//!
//! Runs periodic and one-shot background work (NACK polling, periodic
//! transport-cc feedback, REMB reports, stats sampling) on one dedicated
//! thread.
//!
//! ## Key design decisions
//!
//! - Tasks live in a `Slab`; the due queue is a min-heap of
//!   `(deadline, key, generation)`. Stale heap entries left behind by
//!   cancellation are skipped when popped.
//! - A task's closure is taken out of its slot while it runs, so no lock is
//!   held during user code and tasks may schedule or cancel other tasks.
//! - A failing or panicking task is logged and counted. Periodic tasks are
//!   rescheduled regardless.
//! - `cancel` is synchronous: when it returns, the task is not running and
//!   will not run again. Called from inside a task (on the scheduler
//!   thread) it does not wait, since that would deadlock.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use quanta::{Clock, Instant};
use serde::Serialize;
use slab::Slab;
use tracing::{debug, info, warn};

use crate::error::PipelineError;

type TaskFn = Box<dyn FnMut(Instant) -> anyhow::Result<()> + Send>;

/// Handle to a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    key: usize,
    generation: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub runs: u64,
    pub failures: u64,
    pub panics: u64,
    pub cancelled: u64,
    pub active: usize,
}

struct TaskEntry {
    name: String,
    generation: u64,
    period: Option<Duration>,
    /// `None` while the task is running.
    func: Option<TaskFn>,
    cancelled: bool,
}

struct State {
    tasks: Slab<TaskEntry>,
    due: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    next_generation: u64,
    running: Option<TaskId>,
    shutdown: bool,
    stats: SchedulerStats,
}

struct Shared {
    state: Mutex<State>,
    /// Signals the worker (new work, shutdown) and waiting cancellers.
    changed: Condvar,
    clock: Clock,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    worker_id: thread::ThreadId,
}

impl TaskScheduler {
    pub fn new(name: &str, clock: Clock) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: Slab::new(),
                due: BinaryHeap::new(),
                next_generation: 0,
                running: None,
                shutdown: false,
                stats: SchedulerStats::default(),
            }),
            changed: Condvar::new(),
            clock,
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("meridian-{name}"))
            .spawn(move || run_scheduler(worker_shared))
            .map_err(|e| anyhow::anyhow!("Failed to spawn scheduler thread: {}", e))?;
        let worker_id = worker.thread().id();
        Ok(TaskScheduler {
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Run `task` every `period`, first after one period.
    pub fn schedule_periodic(
        &self,
        name: &str,
        period: Duration,
        task: impl FnMut(Instant) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<TaskId, PipelineError> {
        if period.is_zero() {
            return Err(PipelineError::InvalidConfig(format!(
                "task '{name}' has a zero period"
            )));
        }
        self.insert(name, period, Some(period), Box::new(task))
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once(
        &self,
        name: &str,
        delay: Duration,
        task: impl FnOnce(Instant) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<TaskId, PipelineError> {
        let mut task = Some(task);
        self.insert(
            name,
            delay,
            None,
            Box::new(move |now| match task.take() {
                Some(f) => f(now),
                None => Ok(()),
            }),
        )
    }

    fn insert(
        &self,
        name: &str,
        delay: Duration,
        period: Option<Duration>,
        func: TaskFn,
    ) -> Result<TaskId, PipelineError> {
        let deadline = self.shared.clock.now() + delay;
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(PipelineError::SchedulerGone);
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        let key = state.tasks.insert(TaskEntry {
            name: name.to_string(),
            generation,
            period,
            func: Some(func),
            cancelled: false,
        });
        state.due.push(Reverse((deadline, key, generation)));
        state.stats.scheduled += 1;
        drop(state);
        self.shared.changed.notify_all();
        debug!(task = name, ?period, "task scheduled");
        Ok(TaskId { key, generation })
    }

    /// Cancel a task. Returns false if it had already finished or been
    /// cancelled. Waits for an in-flight run to complete unless called from
    /// the scheduler thread itself.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.shared.lock();
        let live = matches!(
            state.tasks.get(id.key),
            Some(t) if t.generation == id.generation && !t.cancelled
        );
        if !live {
            return false;
        }
        state.stats.cancelled += 1;
        if state.running == Some(id) {
            if let Some(entry) = state.tasks.get_mut(id.key) {
                entry.cancelled = true;
            }
            if thread::current().id() != self.worker_id {
                while state.running == Some(id) {
                    state = self
                        .shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        } else {
            state.tasks.remove(id.key);
        }
        true
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        let state = self.shared.lock();
        matches!(state.tasks.get(id.key), Some(t) if t.generation == id.generation && !t.cancelled)
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.lock();
        SchedulerStats {
            active: state.tasks.iter().filter(|(_, t)| !t.cancelled).count(),
            ..state.stats.clone()
        }
    }

    /// Cancel every task and join the worker. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let active = state.tasks.len() as u64;
            state.stats.cancelled += active;
            state.tasks.clear();
            state.due.clear();
        }
        self.shared.changed.notify_all();
        if thread::current().id() == self.worker_id {
            return;
        }
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        info!("scheduler stopped");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_scheduler(shared: Arc<Shared>) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            break;
        }
        let now = shared.clock.now();
        let next = match state.due.peek() {
            None => {
                state = shared.changed.wait(state).unwrap_or_else(|e| e.into_inner());
                continue;
            }
            Some(&Reverse(entry)) => entry,
        };
        let (deadline, key, generation) = next;
        let live = matches!(
            state.tasks.get(key),
            Some(t) if t.generation == generation && !t.cancelled
        );
        if !live {
            state.due.pop();
            continue;
        }
        if deadline > now {
            let wait = deadline.saturating_duration_since(now);
            state = shared
                .changed
                .wait_timeout(state, wait)
                .unwrap_or_else(|e| e.into_inner())
                .0;
            continue;
        }
        state.due.pop();

        let id = TaskId { key, generation };
        let Some(entry) = state.tasks.get_mut(key) else {
            continue;
        };
        let Some(mut func) = entry.func.take() else {
            continue;
        };
        let name = entry.name.clone();
        state.running = Some(id);
        drop(state);

        let result = catch_unwind(AssertUnwindSafe(|| func(now)));

        state = shared.lock();
        state.running = None;
        state.stats.runs += 1;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                state.stats.failures += 1;
                warn!(task = %name, error = %e, "scheduled task failed");
            }
            Err(_) => {
                state.stats.panics += 1;
                warn!(task = %name, "scheduled task panicked");
            }
        }

        let reschedule = match state.tasks.get_mut(key) {
            Some(entry) if entry.generation == generation && !entry.cancelled => {
                match entry.period {
                    Some(period) => {
                        entry.func = Some(func);
                        Some(period)
                    }
                    None => None,
                }
            }
            _ => None,
        };
        match reschedule {
            // Next run is one period after the deadline, or now if the task
            // overran.
            Some(period) => {
                let next_deadline = (deadline + period).max(shared.clock.now());
                state.due.push(Reverse((next_deadline, key, generation)));
            }
            None => {
                if matches!(state.tasks.get(key), Some(t) if t.generation == generation) {
                    state.tasks.remove(key);
                }
            }
        }
        shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant as StdInstant;

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = StdInstant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn periodic_task_repeats() {
        let scheduler = TaskScheduler::new("test", Clock::new()).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        scheduler
            .schedule_periodic("tick", Duration::from_millis(5), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) >= 3));
    }

    #[test]
    fn once_task_runs_once_and_is_removed() {
        let scheduler = TaskScheduler::new("test", Clock::new()).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        let id = scheduler
            .schedule_once("once", Duration::from_millis(1), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || !scheduler.is_scheduled(id)));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.cancel(id));
    }

    #[test]
    fn errors_and_panics_do_not_stop_periodic_tasks() {
        let scheduler = TaskScheduler::new("test", Clock::new()).unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        scheduler
            .schedule_periodic("flaky", Duration::from_millis(2), move |_| {
                match r.fetch_add(1, Ordering::SeqCst) {
                    0 => anyhow::bail!("first run fails"),
                    1 => panic!("second run panics"),
                    _ => Ok(()),
                }
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) >= 4));
        let stats = scheduler.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.panics, 1);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn cancel_waits_for_running_task() {
        let scheduler = TaskScheduler::new("test", Clock::new()).unwrap();
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let id = scheduler
            .schedule_periodic("slow", Duration::from_millis(1), move |_| {
                s.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || started.load(Ordering::SeqCst) >= 1));
        assert!(scheduler.cancel(id));
        // The in-flight run completed before cancel returned, and no new run
        // starts afterwards.
        let done = finished.load(Ordering::SeqCst);
        assert_eq!(done, started.load(Ordering::SeqCst));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(started.load(Ordering::SeqCst), done);
        assert!(!scheduler.is_scheduled(id));
    }

    #[test]
    fn task_can_cancel_itself() {
        let scheduler = Arc::new(TaskScheduler::new("test", Clock::new()).unwrap());
        let runs = Arc::new(AtomicU32::new(0));
        let slot: Arc<Mutex<Option<TaskId>>> = Arc::default();
        let (r, sl, sch) = (Arc::clone(&runs), Arc::clone(&slot), Arc::downgrade(&scheduler));
        let id = scheduler
            .schedule_periodic("self-cancel", Duration::from_millis(1), move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                if let (Some(id), Some(sch)) = (*sl.lock().unwrap(), sch.upgrade()) {
                    sch.cancel(id);
                }
                Ok(())
            })
            .unwrap();
        *slot.lock().unwrap() = Some(id);
        assert!(wait_until(Duration::from_secs(5), || !scheduler.is_scheduled(id)));
        let n = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), n);
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let scheduler = TaskScheduler::new("test", Clock::new()).unwrap();
        scheduler
            .schedule_periodic("tick", Duration::from_millis(5), |_| Ok(()))
            .unwrap();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(matches!(
            scheduler.schedule_once("late", Duration::ZERO, |_| Ok(())),
            Err(PipelineError::SchedulerGone)
        ));
        assert_eq!(scheduler.stats().active, 0);
    }

    #[test]
    fn zero_period_is_rejected() {
        let scheduler = TaskScheduler::new("test", Clock::new()).unwrap();
        assert!(scheduler
            .schedule_periodic("bad", Duration::ZERO, |_| Ok(()))
            .is_err());
    }
}
