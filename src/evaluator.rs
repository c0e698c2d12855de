//! Serialized, cancellable access to hosted Tarn runtime instances
//!
//! A runtime instance is expensive to build and not safe to call reentrantly,
//! so each task category gets one [`EvaluatorSlot`]: the instance is built
//! once in the background, and tasks submitted to the slot take turns holding
//! its guard. Every submission hands back a [`TaskHandle`] immediately; the
//! handle's canceller flips an interrupt flag the running computation polls.
//!
//! Created by M&K (c)2025 The LibraxisAI Team

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// The cooperative-interrupt hook: handed to the runtime factory at
/// construction, raised on cancellation, polled by long computations at safe
/// points.
pub type InterruptFlag = Arc<AtomicBool>;

/// Returned by a hosted computation that observed the interrupt flag and
/// unwound early. Must be returned directly, not wrapped, so the slot can
/// tell interruption from failure.
#[derive(Debug, Error)]
#[error("evaluation interrupted")]
pub struct Interrupted;

/// A slot whose runtime failed to construct. Fatal for the slot: every task
/// ever submitted to it completes with its category default.
#[derive(Debug, Clone, Error)]
#[error("evaluator `{label}` failed to initialize: {message}")]
pub struct SlotInitError {
    pub label: &'static str,
    pub message: String,
}

/// Lifecycle of one submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    /// Cancelled before running, or unwound cooperatively while running.
    Interrupted = 3,
    /// Internal failure, replaced by the category default.
    Failed = 4,
}

#[derive(Clone)]
struct TaskStateCell(Arc<AtomicU8>);

impl TaskStateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TaskState::Pending as u8)))
    }

    fn store(&self, state: TaskState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    fn load(&self) -> TaskState {
        match self.0.load(Ordering::SeqCst) {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Interrupted,
            _ => TaskState::Failed,
        }
    }
}

struct SlotShared<R> {
    label: &'static str,
    interrupted: InterruptFlag,
    runtime: OnceLock<Result<Mutex<R>, SlotInitError>>,
}

/// One hosted runtime instance behind a mutual-exclusion guard.
///
/// Construction starts in the background the moment the slot is created;
/// submissions before it finishes wait for that single construction, never a
/// second one. At most one task executes against the instance at any instant.
pub struct EvaluatorSlot<R> {
    shared: Arc<SlotShared<R>>,
    ready: watch::Receiver<bool>,
}

impl<R: Send + 'static> EvaluatorSlot<R> {
    /// Create the slot and kick off runtime construction on the blocking
    /// pool. The factory receives the slot's interrupt flag so computations
    /// can poll it.
    pub fn new<F>(label: &'static str, factory: F) -> Self
    where
        F: FnOnce(InterruptFlag) -> anyhow::Result<R> + Send + 'static,
    {
        let (tx, ready) = watch::channel(false);
        let shared = Arc::new(SlotShared {
            label,
            interrupted: Arc::new(AtomicBool::new(false)),
            runtime: OnceLock::new(),
        });

        let flag = shared.interrupted.clone();
        let setter = shared.clone();
        tokio::spawn(async move {
            tracing::debug!("creating {label} evaluator");
            let built = tokio::task::spawn_blocking(move || factory(flag)).await;
            let stored = match built {
                Ok(Ok(runtime)) => {
                    tracing::debug!("finished creating {label} evaluator");
                    Ok(Mutex::new(runtime))
                }
                Ok(Err(e)) => {
                    tracing::error!("failed to initialize {label} evaluator: {e:#}");
                    Err(SlotInitError {
                        label,
                        message: format!("{e:#}"),
                    })
                }
                Err(e) => {
                    tracing::error!("initialization of {label} evaluator panicked: {e}");
                    Err(SlotInitError {
                        label,
                        message: e.to_string(),
                    })
                }
            };
            let _ = setter.runtime.set(stored);
            let _ = tx.send(true);
        });

        Self { shared, ready }
    }

    /// Submit one computation against the slot's runtime.
    ///
    /// Returns immediately, before the task acquires anything. The task
    /// completes with `op`'s result, or with `default` when it is cancelled,
    /// interrupted, fails internally, or the slot never came up. No error
    /// from inside `op` escapes to the caller.
    pub fn submit<T, F>(&self, task: &'static str, op: F, default: T) -> TaskHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut R) -> anyhow::Result<T> + Send + 'static,
    {
        let state = TaskStateCell::new();
        let cancel = TaskCancel {
            cancelled: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            interrupt: self.shared.interrupted.clone(),
        };

        let shared = self.shared.clone();
        let mut ready = self.ready.clone();
        let task_state = state.clone();
        let task_cancel = cancel.clone();
        let fallback = default.clone();

        let join = tokio::spawn(async move {
            if ready.wait_for(|up| *up).await.is_err() {
                task_state.store(TaskState::Failed);
                return default;
            }
            let runtime = match shared.runtime.get() {
                Some(Ok(runtime)) => runtime,
                _ => {
                    tracing::debug!(
                        "{task}: {} evaluator unavailable, returning default",
                        shared.label
                    );
                    task_state.store(TaskState::Failed);
                    return default;
                }
            };

            if task_cancel.cancelled.load(Ordering::SeqCst) {
                task_state.store(TaskState::Interrupted);
                return default;
            }
            let mut guard = runtime.lock().await;
            // announce before re-checking, so a concurrent cancel either sees
            // us running and raises the interrupt flag, or we see it here
            task_cancel.running.store(true, Ordering::SeqCst);
            if task_cancel.cancelled.load(Ordering::SeqCst) {
                task_cancel.running.store(false, Ordering::SeqCst);
                shared.interrupted.store(false, Ordering::SeqCst);
                task_state.store(TaskState::Interrupted);
                return default;
            }

            task_state.store(TaskState::Running);
            let result = tokio::task::block_in_place(|| op(&mut guard));
            task_cancel.running.store(false, Ordering::SeqCst);
            // interruption must never leak into the next task on this slot
            shared.interrupted.store(false, Ordering::SeqCst);
            drop(guard);

            match result {
                Ok(value) => {
                    task_state.store(TaskState::Completed);
                    value
                }
                Err(e) if e.is::<Interrupted>() => {
                    tracing::debug!("{task} interrupted on {} evaluator", shared.label);
                    task_state.store(TaskState::Interrupted);
                    default
                }
                Err(e) => {
                    tracing::error!("{task} failed on {} evaluator: {e:#}", shared.label);
                    task_state.store(TaskState::Failed);
                    default
                }
            }
        });

        TaskHandle {
            state,
            cancel,
            join,
            fallback,
        }
    }
}

/// Cancellation side of a task. Cloneable so request handlers can re-expose
/// it as the protocol's own cancellation mechanism.
#[derive(Clone)]
pub struct TaskCancel {
    cancelled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    interrupt: InterruptFlag,
}

impl TaskCancel {
    /// Synchronous and non-blocking. A pending task will never run; a running
    /// task gets the slot's interrupt flag raised and is expected to unwind
    /// at its next safe point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) {
            self.interrupt.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether two cancellers belong to the same task.
    pub fn same_task(&self, other: &TaskCancel) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// Caller side of a submitted task.
pub struct TaskHandle<T> {
    state: TaskStateCell,
    cancel: TaskCancel,
    join: JoinHandle<T>,
    fallback: T,
}

impl<T: Clone + Send + 'static> TaskHandle<T> {
    /// A handle that is already completed; used when input resolution
    /// short-circuits an operation.
    pub fn ready(value: T) -> Self {
        let state = TaskStateCell::new();
        state.store(TaskState::Completed);
        let fallback = value.clone();
        Self {
            state,
            cancel: TaskCancel {
                cancelled: Arc::new(AtomicBool::new(false)),
                running: Arc::new(AtomicBool::new(false)),
                interrupt: Arc::new(AtomicBool::new(false)),
            },
            join: tokio::spawn(async move { value }),
            fallback,
        }
    }

    /// Await the task's result. Never fails: a panicked or aborted task
    /// yields the default.
    pub async fn result(self) -> T {
        match self.join.await {
            Ok(value) => value,
            Err(e) => {
                tracing::error!("task join failed: {e}");
                self.state.store(TaskState::Failed);
                self.fallback
            }
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> TaskCancel {
        self.cancel.clone()
    }

    /// Diagnostic view of the task lifecycle; callers see interrupted and
    /// failed tasks only as "completed with the default".
    pub fn state(&self) -> TaskState {
        self.state.load()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Probe {
        flag: InterruptFlag,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    fn probe_slot() -> (EvaluatorSlot<Probe>, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let peak_in = peak.clone();
        let slot = EvaluatorSlot::new("probe", move |flag| {
            Ok(Probe {
                flag,
                active,
                peak: peak_in,
            })
        });
        (slot, peak)
    }

    async fn wait_for_state<T: Clone + Send + 'static>(handle: &TaskHandle<T>, state: TaskState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.state() != state {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("task did not reach expected state in time");
    }

    /// Busy-wait inside the guard, polling the interrupt flag like a hosted
    /// computation would.
    fn interruptible_wait(probe: &Probe, total: Duration) -> anyhow::Result<()> {
        let start = std::time::Instant::now();
        while start.elapsed() < total {
            if probe.flag.load(Ordering::SeqCst) {
                return Err(Interrupted.into());
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn tasks_serialize_on_one_slot() {
        let (slot, peak) = probe_slot();
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                slot.submit(
                    "count",
                    move |probe: &mut Probe| {
                        let now = probe.active.fetch_add(1, Ordering::SeqCst) + 1;
                        probe.peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        probe.active.fetch_sub(1, Ordering::SeqCst);
                        Ok(i)
                    },
                    u32::MAX,
                )
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.result().await);
        }
        results.sort_unstable();
        assert_eq!(results, (0..8).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn construction_happens_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let builds_in = builds.clone();
        let slot: EvaluatorSlot<u32> = EvaluatorSlot::new("once", move |_flag| {
            builds_in.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            Ok(7)
        });
        let a = slot.submit("read", |v: &mut u32| Ok(*v), 0);
        let b = slot.submit("read", |v: &mut u32| Ok(*v), 0);
        assert_eq!(a.result().await, 7);
        assert_eq!(b.result().await, 7);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_cancel_never_runs() {
        let (slot, _) = probe_slot();
        let ran = Arc::new(AtomicBool::new(false));

        // keep the guard busy so the second task stays pending
        let blocker = slot.submit(
            "block",
            |_probe: &mut Probe| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(0u32)
            },
            u32::MAX,
        );
        wait_for_state(&blocker, TaskState::Running).await;

        let ran_in = ran.clone();
        let victim = slot.submit(
            "victim",
            move |_probe: &mut Probe| {
                ran_in.store(true, Ordering::SeqCst);
                Ok(1u32)
            },
            99,
        );
        victim.cancel();

        wait_for_state(&victim, TaskState::Interrupted).await;
        assert_eq!(victim.result().await, 99);
        assert!(!ran.load(Ordering::SeqCst));
        blocker.result().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn running_cancel_yields_default_in_bounded_time() {
        let (slot, _) = probe_slot();
        let handle = slot.submit(
            "long",
            |probe: &mut Probe| {
                interruptible_wait(probe, Duration::from_secs(30))?;
                Ok(1u32)
            },
            42,
        );

        // wait until the task actually holds the guard
        wait_for_state(&handle, TaskState::Running).await;
        handle.cancel();

        let canceller = handle.canceller();
        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .expect("cancelled task must finish promptly");
        assert_eq!(result, 42);
        assert!(canceller.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupt_does_not_leak_into_next_task() {
        let (slot, _) = probe_slot();
        let first = slot.submit(
            "long",
            |probe: &mut Probe| {
                interruptible_wait(probe, Duration::from_secs(30))?;
                Ok(0u32)
            },
            0,
        );
        wait_for_state(&first, TaskState::Running).await;
        first.cancel();
        first.result().await;

        let second = slot.submit(
            "check-flag",
            |probe: &mut Probe| Ok(probe.flag.load(Ordering::SeqCst) as u32),
            7,
        );
        let second_state = second.state.clone();
        // 0 means the flag was clear when the next task started
        assert_eq!(second.result().await, 0);
        assert_eq!(second_state.load(), TaskState::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn internal_failure_yields_default_and_slot_survives() {
        let (slot, _) = probe_slot();
        let failing = slot.submit(
            "explode",
            |_probe: &mut Probe| Err::<u32, _>(anyhow::anyhow!("runtime fault")),
            13,
        );
        assert_eq!(failing.result().await, 13);

        let next = slot.submit("ok", |_probe: &mut Probe| Ok(5u32), 0);
        assert_eq!(next.result().await, 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_construction_defaults_promptly_forever() {
        let slot: EvaluatorSlot<u32> =
            EvaluatorSlot::new("broken", |_flag| Err(anyhow::anyhow!("no libraries")));

        for _ in 0..3 {
            let handle = slot.submit("any", |v: &mut u32| Ok(*v), 11);
            let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
                .await
                .expect("broken slot must answer promptly");
            assert_eq!(result, 11);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn states_are_observable() {
        let (slot, _) = probe_slot();
        let ok = slot.submit("ok", |_probe: &mut Probe| Ok(1u32), 0);
        wait_for_state(&ok, TaskState::Completed).await;
        assert_eq!(ok.result().await, 1);

        let failed = slot.submit(
            "fail",
            |_probe: &mut Probe| Err::<u32, _>(anyhow::anyhow!("x")),
            0,
        );
        wait_for_state(&failed, TaskState::Failed).await;
        assert_eq!(failed.result().await, 0);

        let ready = TaskHandle::ready(3u32);
        assert_eq!(ready.state(), TaskState::Completed);
        assert_eq!(ready.result().await, 3);
    }
}
