//! Maintenance task scheduler
//!
//! One dedicated thread runs every periodic job the server needs (world
//! ticks, pings, autosave, backups, heartbeat stats) so none of them compete
//! with session I/O. The thread sleeps on a condition variable until the
//! next task is due or something changes, so an idle scheduler costs nothing.
//!
//! Tasks are rescheduled from their previous due time, not from when they
//! finished, so a slow run does not shift the phase of later runs. A task
//! that returns an error or panics is logged and keeps its schedule.
//!
//! ## Lockdown
//!
//! [`Scheduler::lockdown`] quiesces the scheduler before destructive
//! maintenance. The scheduler thread stops running tasks, waits a short grace
//! period for in-flight session work, runs the lockdown hooks and then
//! reports ready. The caller holds a [`LockdownGuard`]; dropping the last
//! guard resumes normal scheduling.

use crate::error::SchedulerError;
use crate::utils::lock;
use log::{debug, error, info, warn};
use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

pub type TaskResult = Result<(), Box<dyn Error + Send + Sync>>;

type Callback = Box<dyn FnMut() -> TaskResult + Send>;

/// Longest the thread sleeps when no task is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

/// When and how often a task runs.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    name: String,
    interval: Duration,
    first_delay: Duration,
    repeats: Option<u32>,
}

impl TaskSpec {
    /// Runs every `interval`, first after one full interval.
    pub fn every(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            first_delay: interval,
            repeats: None,
        }
    }

    /// Delay before the first run.
    pub fn after(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    /// Stops after `count` runs.
    pub fn times(mut self, count: u32) -> Self {
        self.repeats = Some(count);
        self
    }
}

struct Task {
    id: TaskId,
    name: String,
    interval: Duration,
    next_due: Instant,
    enabled: bool,
    remaining: Option<u32>,
    /// Taken out while the callback runs so the lock is not held.
    callback: Option<Callback>,
}

struct Hook {
    name: String,
    callback: Callback,
}

#[derive(Default)]
struct LockdownState {
    /// Outstanding guards plus callers still waiting.
    holders: usize,
    active: bool,
    ready: bool,
}

struct State {
    tasks: Vec<Task>,
    hooks: Vec<Hook>,
    lockdown: LockdownState,
    running: bool,
    stopping: bool,
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
    grace: Duration,
    thread_id: Mutex<Option<ThreadId>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

/// Handle to the scheduler thread. Clones share the same thread.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Creates a scheduler whose lockdown waits `grace` before flushing.
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    tasks: Vec::new(),
                    hooks: Vec::new(),
                    lockdown: LockdownState::default(),
                    running: false,
                    stopping: false,
                }),
                wake: Condvar::new(),
                grace,
                thread_id: Mutex::new(None),
                handle: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = lock(&self.inner.state);
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.stopping = false;
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || run(inner))
            .map_err(|e| {
                lock(&self.inner.state).running = false;
                SchedulerError::Spawn(e)
            })?;
        *lock(&self.inner.thread_id) = Some(handle.thread().id());
        *lock(&self.inner.handle) = Some(handle);
        info!("Scheduler started");
        Ok(())
    }

    /// Stops the thread after the task in progress finishes and joins it.
    pub fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            if !state.running {
                return;
            }
            state.stopping = true;
        }
        self.inner.wake.notify_all();

        if self.is_scheduler_thread() {
            return;
        }
        let handle = lock(&self.inner.handle).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("scheduler thread panicked");
            }
        }
        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).running
    }

    fn is_scheduler_thread(&self) -> bool {
        *lock(&self.inner.thread_id) == Some(thread::current().id())
    }

    pub fn add_task<F>(&self, spec: TaskSpec, callback: F) -> TaskId
    where
        F: FnMut() -> TaskResult + Send + 'static,
    {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        debug!("scheduling {} every {:?}", spec.name, spec.interval);
        lock(&self.inner.state).tasks.push(Task {
            id,
            name: spec.name,
            interval: spec.interval,
            next_due: Instant::now() + spec.first_delay,
            enabled: true,
            remaining: spec.repeats,
            callback: Some(Box::new(callback)),
        });
        self.inner.wake.notify_all();
        id
    }

    /// Pauses or resumes a task without losing its phase.
    pub fn set_enabled(&self, id: TaskId, enabled: bool) -> bool {
        let found = {
            let mut state = lock(&self.inner.state);
            state
                .tasks
                .iter_mut()
                .find(|t| t.id == id)
                .map(|task| task.enabled = enabled)
                .is_some()
        };
        if found {
            self.inner.wake.notify_all();
        }
        found
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        let mut state = lock(&self.inner.state);
        let before = state.tasks.len();
        state.tasks.retain(|t| t.id != id);
        before != state.tasks.len()
    }

    pub fn task_count(&self) -> usize {
        lock(&self.inner.state).tasks.len()
    }

    /// Registers work that runs on the scheduler thread every time a
    /// lockdown takes effect.
    pub fn add_lockdown_hook<F>(&self, name: impl Into<String>, callback: F)
    where
        F: FnMut() -> TaskResult + Send + 'static,
    {
        lock(&self.inner.state).hooks.push(Hook {
            name: name.into(),
            callback: Box::new(callback),
        });
    }

    pub fn is_locked_down(&self) -> bool {
        lock(&self.inner.state).lockdown.ready
    }

    /// Blocks until the scheduler has quiesced, or `timeout` passes.
    pub fn lockdown(&self, timeout: Duration) -> Result<LockdownGuard, SchedulerError> {
        if self.is_scheduler_thread() {
            return Err(SchedulerError::LockdownFromSchedulerThread);
        }

        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);
        if !state.running || state.stopping {
            return Err(SchedulerError::NotRunning);
        }
        state.lockdown.holders += 1;
        self.inner.wake.notify_all();

        while !state.lockdown.ready {
            let now = Instant::now();
            let failure = if !state.running || state.stopping {
                Some(SchedulerError::NotRunning)
            } else if now >= deadline {
                Some(SchedulerError::LockdownTimeout)
            } else {
                None
            };
            if let Some(err) = failure {
                release(&mut state);
                self.inner.wake.notify_all();
                return Err(err);
            }
            state = wait(&self.inner, state, deadline - now);
        }

        Ok(LockdownGuard {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Keeps the scheduler locked down until dropped.
pub struct LockdownGuard {
    inner: Arc<Inner>,
}

impl Drop for LockdownGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.inner.state);
        release(&mut state);
        drop(state);
        self.inner.wake.notify_all();
    }
}

fn release(state: &mut State) {
    state.lockdown.holders = state.lockdown.holders.saturating_sub(1);
    if state.lockdown.holders == 0 && state.lockdown.active {
        state.lockdown.active = false;
        state.lockdown.ready = false;
        info!("Lockdown ended");
    }
}

fn wait<'a>(inner: &'a Inner, state: MutexGuard<'a, State>, timeout: Duration) -> MutexGuard<'a, State> {
    match inner.wake.wait_timeout(state, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

fn invoke(kind: &str, name: &str, callback: &mut Callback) {
    match catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} {} failed: {}", kind, name, e),
        Err(_) => error!("{} {} panicked", kind, name),
    }
}

fn run(inner: Arc<Inner>) {
    debug!("scheduler thread running");
    let mut state = lock(&inner.state);

    loop {
        if state.stopping {
            break;
        }

        if state.lockdown.holders > 0 && !state.lockdown.active {
            state.lockdown.active = true;
            let mut hooks = std::mem::take(&mut state.hooks);
            drop(state);

            info!("Lockdown requested, quiescing");
            thread::sleep(inner.grace);
            for hook in &mut hooks {
                invoke("lockdown hook", &hook.name, &mut hook.callback);
            }

            state = lock(&inner.state);
            hooks.append(&mut state.hooks);
            state.hooks = hooks;
            if state.lockdown.holders > 0 {
                state.lockdown.ready = true;
                info!("Lockdown ready");
            } else {
                state.lockdown.active = false;
            }
            inner.wake.notify_all();
            continue;
        }

        if state.lockdown.active {
            state = wait(&inner, state, IDLE_WAIT);
            continue;
        }

        let now = Instant::now();
        let due = state
            .tasks
            .iter()
            .filter(|t| t.enabled && t.callback.is_some())
            .min_by_key(|t| t.next_due)
            .map(|t| (t.id, t.next_due));

        let id = match due {
            Some((id, next_due)) if next_due <= now => id,
            Some((_, next_due)) => {
                state = wait(&inner, state, (next_due - now).min(IDLE_WAIT));
                continue;
            }
            None => {
                state = wait(&inner, state, IDLE_WAIT);
                continue;
            }
        };

        let Some(task) = state.tasks.iter_mut().find(|t| t.id == id) else {
            continue;
        };
        let name = task.name.clone();
        let Some(mut callback) = task.callback.take() else {
            continue;
        };
        drop(state);

        invoke("task", &name, &mut callback);

        state = lock(&inner.state);
        let now = Instant::now();
        let mut finished = false;
        if let Some(task) = state.tasks.iter_mut().find(|t| t.id == id) {
            task.callback = Some(callback);
            task.next_due += task.interval;
            if task.next_due + task.interval <= now {
                // More than a whole period behind: skip the missed runs but
                // keep the phase.
                let behind = now.duration_since(task.next_due).as_nanos();
                let periods = behind / task.interval.as_nanos().max(1);
                task.next_due += task.interval * periods as u32;
                debug!("task {} fell {} runs behind", task.name, periods);
            }
            if let Some(remaining) = task.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
                finished = *remaining == 0;
            }
        }
        if finished {
            state.tasks.retain(|t| t.id != id);
        }
    }

    state.running = false;
    state.stopping = false;
    drop(state);
    inner.wake.notify_all();
    debug!("scheduler thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() -> TaskResult + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn started() -> Scheduler {
        let scheduler = Scheduler::new(Duration::from_millis(10));
        scheduler.start().unwrap();
        scheduler
    }

    #[test]
    fn test_first_run_waits_one_interval() {
        let scheduler = started();
        let (tx, rx) = mpsc::channel();
        let created = Instant::now();
        scheduler.add_task(TaskSpec::every("probe", Duration::from_millis(300)), move || {
            let _ = tx.send(Instant::now());
            Ok(())
        });

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(first.duration_since(created) >= Duration::from_millis(300));
        scheduler.stop();
    }

    #[test]
    fn test_repeats_limit_runs() {
        let scheduler = started();
        let (count, task) = counter();
        scheduler.add_task(
            TaskSpec::every("thrice", Duration::from_millis(10)).after(Duration::ZERO).times(3),
            task,
        );
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.task_count(), 0);
        scheduler.stop();
    }

    #[test]
    fn test_rescheduled_from_due_time() {
        let scheduler = started();
        let (count, mut tick) = counter();
        scheduler.add_task(TaskSpec::every("slow", Duration::from_millis(20)), move || {
            thread::sleep(Duration::from_millis(10));
            tick()
        });
        thread::sleep(Duration::from_millis(430));
        scheduler.stop();
        // Drift-free scheduling gives about 21 runs; restarting from the end
        // of each run would give about 14.
        let runs = count.load(Ordering::SeqCst);
        assert!(runs >= 17, "only {} runs", runs);
    }

    #[test]
    fn test_failing_tasks_do_not_stop_others() {
        let scheduler = started();
        let (count, task) = counter();
        scheduler.add_task(TaskSpec::every("err", Duration::from_millis(10)), || Err("broken".into()));
        scheduler.add_task(TaskSpec::every("panic", Duration::from_millis(10)), || panic!("boom"));
        scheduler.add_task(TaskSpec::every("ok", Duration::from_millis(10)), task);

        thread::sleep(Duration::from_millis(150));
        assert!(count.load(Ordering::SeqCst) >= 5);
        assert!(scheduler.is_running());
        assert_eq!(scheduler.task_count(), 3);
        scheduler.stop();
    }

    #[test]
    fn test_disable_and_cancel() {
        let scheduler = started();
        let (count, task) = counter();
        let id = scheduler.add_task(TaskSpec::every("toggle", Duration::from_millis(10)), task);

        assert!(scheduler.set_enabled(id, false));
        // Let a run already in progress finish.
        thread::sleep(Duration::from_millis(20));
        let paused_at = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), paused_at);

        assert!(scheduler.set_enabled(id, true));
        thread::sleep(Duration::from_millis(80));
        assert!(count.load(Ordering::SeqCst) > paused_at);

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(!scheduler.set_enabled(id, true));
        scheduler.stop();
    }

    #[test]
    fn test_lockdown_runs_hooks_and_pauses_tasks() {
        let scheduler = started();
        let (count, task) = counter();
        let (hook_count, hook) = counter();
        scheduler.add_task(TaskSpec::every("busy", Duration::from_millis(5)), task);
        scheduler.add_lockdown_hook("flush", hook);

        let guard = scheduler.lockdown(Duration::from_secs(1)).unwrap();
        assert!(scheduler.is_locked_down());
        assert_eq!(hook_count.load(Ordering::SeqCst), 1);

        let frozen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), frozen);

        drop(guard);
        thread::sleep(Duration::from_millis(60));
        assert!(!scheduler.is_locked_down());
        assert!(count.load(Ordering::SeqCst) > frozen);
        scheduler.stop();
    }

    #[test]
    fn test_concurrent_lockdowns_share_one_quiesce() {
        let scheduler = started();
        let (hook_count, hook) = counter();
        scheduler.add_lockdown_hook("flush", hook);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                thread::spawn(move || {
                    let guard = scheduler.lockdown(Duration::from_secs(2))?;
                    thread::sleep(Duration::from_millis(50));
                    drop(guard);
                    Ok::<_, SchedulerError>(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert!(!scheduler.is_locked_down());
        assert!(hook_count.load(Ordering::SeqCst) >= 1);
        scheduler.stop();
    }

    #[test]
    fn test_lockdown_from_scheduler_thread_is_rejected() {
        let scheduler = started();
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.clone();
        scheduler.add_task(
            TaskSpec::every("self-lock", Duration::from_millis(5)).times(1),
            move || {
                let result = handle.lockdown(Duration::from_millis(50)).map(|_| ());
                let _ = tx.send(result);
                Ok(())
            },
        );
        let result = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(matches!(result, Err(SchedulerError::LockdownFromSchedulerThread)));
        scheduler.stop();
    }

    #[test]
    fn test_lockdown_requires_running_scheduler() {
        let scheduler = Scheduler::new(Duration::from_millis(1));
        assert!(matches!(
            scheduler.lockdown(Duration::from_millis(10)),
            Err(SchedulerError::NotRunning)
        ));
    }
}
