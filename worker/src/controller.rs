use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use shared::{Cancelled, Finished, ItemId, JobListener, JobSpec, TaskError, TaskEvent};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::routine::InferenceRoutine;

/// How long a cancelled task may keep running before its worker thread is
/// abandoned.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    /// The routine returned and the terminal event is being published.
    Finishing,
    /// Cancellation was requested; waiting for the routine or the grace
    /// period, whichever ends first.
    Cancelling,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("a task is already running")]
    AlreadyRunning,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Runs at most one [`InferenceRoutine`] at a time on a dedicated thread and
/// forwards what it reports to the caller's event channel.
///
/// Cloning gives another handle to the same controller.
#[derive(Clone)]
pub struct TaskController {
    inner: Arc<Inner>,
}

struct Inner {
    slot: Mutex<Slot>,
    events: Sender<TaskEvent>,
    routine: Arc<dyn InferenceRoutine>,
    grace_period: Duration,
}

struct Slot {
    state: TaskState,
    run: Option<Arc<Run>>,
}

/// Per-run shared state between the controller, the worker thread and any
/// [`TaskHandle`]s.
struct Run {
    id: Uuid,
    cancel_requested: AtomicBool,
    /// `None` once the terminal event has been sent. Everything the run
    /// emits goes through this lock, so nothing can follow `Finished`.
    outlet: Mutex<Option<Sender<TaskEvent>>>,
    closed: Condvar,
    /// Disconnects when the worker thread exits; taken by the watchdog.
    worker_exit: Mutex<Option<Receiver<()>>>,
}

impl Run {
    fn new(events: Sender<TaskEvent>, worker_exit: Receiver<()>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cancel_requested: AtomicBool::new(false),
            outlet: Mutex::new(Some(events)),
            closed: Condvar::new(),
            worker_exit: Mutex::new(Some(worker_exit)),
        }
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(tx) = self.outlet.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

/// Caller-side handle for one started task.
#[derive(Clone)]
pub struct TaskHandle {
    run: Arc<Run>,
    controller: Weak<Inner>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.run.id
    }

    /// Request cancellation of this task. See [`TaskController::cancel`].
    pub fn cancel(&self) {
        if let Some(inner) = self.controller.upgrade() {
            inner.cancel(&self.run);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.run.outlet.lock().is_none()
    }

    /// Block until the terminal event of this task has been published.
    pub fn wait(&self) {
        let mut outlet = self.run.outlet.lock();
        while outlet.is_some() {
            self.run.closed.wait(&mut outlet);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. Returns
    /// whether the task finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outlet = self.run.outlet.lock();
        while outlet.is_some() {
            if self.run.closed.wait_until(&mut outlet, deadline).timed_out() {
                return outlet.is_none();
            }
        }
        true
    }
}

impl TaskController {
    /// `events` receives every [`TaskEvent`] of every run, in order.
    pub fn new(routine: impl InferenceRoutine, events: Sender<TaskEvent>) -> Self {
        Self::with_grace_period(routine, events, DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(
        routine: impl InferenceRoutine,
        events: Sender<TaskEvent>,
        grace_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    state: TaskState::Idle,
                    run: None,
                }),
                events,
                routine: Arc::new(routine),
                grace_period,
            }),
        }
    }

    pub fn state(&self) -> TaskState {
        self.inner.slot.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() != TaskState::Idle
    }

    pub fn grace_period(&self) -> Duration {
        self.inner.grace_period
    }

    /// Launch `spec` on a new worker thread.
    ///
    /// Fails with [`StartError::AlreadyRunning`] unless the controller is
    /// idle; in that case nothing changes and no thread is started.
    pub fn start(&self, spec: JobSpec) -> Result<TaskHandle, StartError> {
        let mut slot = self.inner.slot.lock();
        if slot.state != TaskState::Idle {
            debug!("Rejecting start while {:?}", slot.state);
            return Err(StartError::AlreadyRunning);
        }

        let (exit_tx, exit_rx) = mpsc::channel();
        let run = Arc::new(Run::new(self.inner.events.clone(), exit_rx));
        let item_count = spec.items().len();

        let inner = Arc::clone(&self.inner);
        let worker_run = Arc::clone(&run);
        thread::Builder::new()
            .name(format!("stemsplit-task-{}", run.id.simple()))
            .spawn(move || {
                run_worker(&inner, &worker_run, spec);
                drop(exit_tx);
            })?;

        // The worker cannot publish `Finished` before this lock is released.
        slot.state = TaskState::Running;
        slot.run = Some(Arc::clone(&run));
        info!("Started task {} with {} item(s)", run.id, item_count);

        Ok(TaskHandle {
            run,
            controller: Arc::downgrade(&self.inner),
        })
    }

    /// Request cancellation of the task behind `handle`.
    ///
    /// Only acts while that task is [`TaskState::Running`]; repeated calls,
    /// stale handles and calls while idle are ignored. The task ends with
    /// exactly one `Finished { cancelled: true, .. }` within the grace
    /// period.
    pub fn cancel(&self, handle: &TaskHandle) {
        self.inner.cancel(&handle.run);
    }

    /// Cancel whatever task is currently running, if any.
    pub fn cancel_current(&self) {
        let run = self.inner.slot.lock().run.clone();
        if let Some(run) = run {
            self.inner.cancel(&run);
        }
    }
}

impl Inner {
    fn is_current(slot: &Slot, run: &Arc<Run>) -> bool {
        slot.run.as_ref().is_some_and(|current| Arc::ptr_eq(current, run))
    }

    fn cancel(self: &Arc<Self>, run: &Arc<Run>) {
        {
            let mut slot = self.slot.lock();
            if !Self::is_current(&slot, run) || slot.state != TaskState::Running {
                return;
            }
            slot.state = TaskState::Cancelling;
            run.cancel_requested.store(true, Ordering::SeqCst);
        }
        info!("Cancellation requested for task {}", run.id);

        let Some(worker_exit) = run.worker_exit.lock().take() else {
            return;
        };
        let inner = Arc::clone(self);
        let watched = Arc::clone(run);
        let spawned = thread::Builder::new()
            .name(format!("stemsplit-cancel-{}", run.id.simple()))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = worker_exit.recv_timeout(inner.grace_period)
                {
                    warn!(
                        "Task {} did not stop within {:?}, abandoning its worker thread",
                        watched.id, inner.grace_period
                    );
                    inner.finish(&watched, Finished::cancelled());
                }
            });
        if let Err(e) = spawned {
            error!("Failed to spawn cancellation watchdog: {}", e);
            self.finish(run, Finished::cancelled());
        }
    }

    fn mark_finishing(&self, run: &Arc<Run>) {
        let mut slot = self.slot.lock();
        if Self::is_current(&slot, run) && slot.state == TaskState::Running {
            slot.state = TaskState::Finishing;
        }
    }

    /// Publish the terminal event for `run` and return to idle. Only the
    /// first call per run has any effect.
    fn finish(&self, run: &Arc<Run>, finished: Finished) {
        let mut outlet = run.outlet.lock();
        let Some(tx) = outlet.take() else {
            return;
        };
        {
            let mut slot = self.slot.lock();
            if Self::is_current(&slot, run) {
                slot.state = TaskState::Idle;
                slot.run = None;
            }
        }
        match &finished.error {
            Some(e) => error!("Task {} finished with error: {}", run.id, e),
            None if finished.cancelled => info!("Task {} cancelled", run.id),
            None => info!("Task {} completed", run.id),
        }
        let _ = tx.send(TaskEvent::Finished(finished));
        run.closed.notify_all();
    }
}

fn run_worker(inner: &Inner, run: &Arc<Run>, spec: JobSpec) {
    let mut reporter = Reporter {
        run: Arc::clone(run),
        reported: HashSet::new(),
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        inner.routine.run(&spec, &mut reporter)
    }));
    inner.mark_finishing(run);

    let cancelled = run.is_cancelled();
    let finished = match outcome {
        Ok(Ok(())) => Finished {
            cancelled,
            error: None,
        },
        Ok(Err(e)) if e.is::<Cancelled>() => Finished::cancelled(),
        Ok(Err(e)) => Finished {
            cancelled,
            error: Some(TaskError::Failed(format!("{:#}", e))),
        },
        Err(payload) => Finished {
            cancelled,
            error: Some(TaskError::Panicked(panic_message(payload.as_ref()))),
        },
    };
    inner.finish(run, finished);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The listener handed to the routine. Forwards into the run's outlet.
struct Reporter {
    run: Arc<Run>,
    reported: HashSet<ItemId>,
}

impl JobListener for Reporter {
    fn on_progress(&mut self, percent: u8) {
        self.run.emit(TaskEvent::Progress(percent.min(100)));
    }

    fn on_item_done(&mut self, item: &ItemId) {
        if self.reported.insert(item.clone()) {
            self.run.emit(TaskEvent::ItemDone(item.clone()));
        } else {
            debug!("Ignoring repeated completion of {}", item);
        }
    }

    fn on_log(&mut self, message: &str) {
        self.run.emit(TaskEvent::Log(message.to_string()));
    }

    fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routine::from_fn;

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[test]
    fn reporter_clamps_progress_and_drops_repeated_items() {
        let (tx, rx) = mpsc::channel();
        let (_exit_tx, exit_rx) = mpsc::channel();
        let mut reporter = Reporter {
            run: Arc::new(Run::new(tx, exit_rx)),
            reported: HashSet::new(),
        };

        reporter.on_progress(250);
        reporter.on_item_done(&ItemId::from("a.wav"));
        reporter.on_item_done(&ItemId::from("a.wav"));
        drop(reporter);

        let events: Vec<TaskEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                TaskEvent::Progress(100),
                TaskEvent::ItemDone(ItemId::from("a.wav")),
            ]
        );
    }

    #[test]
    fn cancel_of_a_finished_handle_is_ignored() {
        let (tx, rx) = mpsc::channel();
        let controller = TaskController::new(from_fn(|_, _| Ok(())), tx);

        let handle = controller
            .start(JobSpec::new(Vec::new(), Default::default()))
            .unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(5)));

        handle.cancel();
        controller.cancel(&handle);
        assert_eq!(controller.state(), TaskState::Idle);
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![TaskEvent::Finished(Finished::completed())]
        );
    }

    #[test]
    fn finishing_run_rejects_start_and_ignores_cancel() {
        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let controller = TaskController::new(
            from_fn(move |_, _| {
                let _ = release_rx.lock().recv();
                Ok(())
            }),
            tx,
        );

        let handle = controller
            .start(JobSpec::new(vec![ItemId::from("a.wav")], Default::default()))
            .unwrap();
        // What the worker does once the routine has returned.
        controller.inner.mark_finishing(&handle.run);
        assert_eq!(controller.state(), TaskState::Finishing);

        assert!(matches!(
            controller.start(JobSpec::new(Vec::new(), Default::default())),
            Err(StartError::AlreadyRunning)
        ));
        handle.cancel();
        controller.cancel_current();
        assert_eq!(controller.state(), TaskState::Finishing);
        assert!(!handle.run.is_cancelled());

        release_tx.send(()).unwrap();
        assert!(handle.wait_timeout(Duration::from_secs(5)));
        assert_eq!(controller.state(), TaskState::Idle);
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![TaskEvent::Finished(Finished::completed())]
        );
    }
}
