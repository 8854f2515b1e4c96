//! Task scheduler
//!
//! A time-priority queue of recurring tasks. `tick` pushes one bounded
//! `do_tick` worker; each worker pops every due task, runs its pre hook
//! inline, fans executions out into a tracked set and re-enqueues completed
//! tasks through the reschedule signal. Faults are recorded and logged, never
//! propagated past the scheduler.

mod stats;

pub use stats::TaskStatistics;

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Pre-execute calls slower than this are logged
const SLOW_PRE_EXECUTE: Duration = Duration::from_secs(1);

/// A recurring unit of scheduled work
#[async_trait]
pub trait RecurringTask: Send + Sync {
    fn name(&self) -> &str;

    /// Runs inline in the tick before the execution is launched
    async fn pre_execute(&self, _cancel: &CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Runs after the execution with its error, if any
    async fn post_execute(&self, _error: Option<&anyhow::Error>, _cancel: &CancellationToken) {}
}

/// A registered task with its cadence and statistics
pub struct TaskEntry {
    task: Arc<dyn RecurringTask>,
    period: Duration,
    stats: Mutex<TaskStatistics>,
}

impl TaskEntry {
    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Snapshot of this task's statistics
    pub fn statistics(&self) -> TaskStatistics {
        self.stats.lock().clone()
    }

    fn next_fire(&self) -> u64 {
        crate::now_ms() + self.period.as_millis() as u64
    }
}

struct QueuedTask {
    fire_at: u64,
    seq: u64,
    entry: Arc<TaskEntry>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.fire_at, self.seq).cmp(&(other.fire_at, other.seq))
    }
}

struct SchedulerShared {
    tasks: Mutex<BinaryHeap<Reverse<QueuedTask>>>,
    seq: AtomicU64,
    reschedule_tx: mpsc::UnboundedSender<(Arc<TaskEntry>, u64)>,
    reschedule_rx: Mutex<mpsc::UnboundedReceiver<(Arc<TaskEntry>, u64)>>,
}

impl SchedulerShared {
    fn enqueue(&self, entry: Arc<TaskEntry>, fire_at: u64) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().push(Reverse(QueuedTask {
            fire_at,
            seq,
            entry,
        }));
    }

    /// Re-enqueue every signalled task under the queue lock
    fn drain_reschedules(&self) {
        let mut rx = self.reschedule_rx.lock();
        while let Ok((entry, fire_at)) = rx.try_recv() {
            self.enqueue(entry, fire_at);
        }
    }

    async fn do_tick(&self, cancel: CancellationToken) {
        let mut running = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = crate::now_ms();
            let due = {
                let mut tasks = self.tasks.lock();
                match tasks.peek() {
                    Some(Reverse(queued)) if queued.fire_at <= now => {
                        tasks.pop().map(|Reverse(queued)| queued)
                    }
                    _ => None,
                }
            };
            let Some(queued) = due else { break };
            let entry = queued.entry;

            let pre_started = Instant::now();
            let pre_result = entry.task.pre_execute(&cancel).await;
            let pre_took = pre_started.elapsed();
            if pre_took > SLOW_PRE_EXECUTE {
                warn!(
                    task = entry.name(),
                    took_ms = pre_took.as_millis() as u64,
                    "Slow pre_execute"
                );
            }
            if let Err(error) = pre_result {
                if cancel.is_cancelled() {
                    debug!(task = entry.name(), error = %error, "pre_execute cancelled");
                } else {
                    warn!(task = entry.name(), error = %error, "pre_execute failed");
                }
                entry.stats.lock().record_error(&error.to_string());
                let fire_at = entry.next_fire();
                let _ = self.reschedule_tx.send((entry, fire_at));
                continue;
            }

            let reschedule = self.reschedule_tx.clone();
            let exec_cancel = cancel.clone();
            running.spawn(async move {
                let started = Instant::now();
                let result = entry.task.execute(&exec_cancel).await;
                let took = started.elapsed();
                {
                    let mut stats = entry.stats.lock();
                    match &result {
                        Ok(()) => stats.record_success(took),
                        Err(error) => {
                            if exec_cancel.is_cancelled() {
                                debug!(task = entry.name(), error = %error, "execute cancelled");
                            } else {
                                warn!(task = entry.name(), error = %error, "execute failed");
                            }
                            stats.record_error(&error.to_string());
                        }
                    }
                }
                let error = result.err();
                entry.task.post_execute(error.as_ref(), &exec_cancel).await;

                let fire_at = entry.next_fire();
                let _ = reschedule.send((entry, fire_at));
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(error) = joined {
                if !error.is_cancelled() {
                    warn!(error = %error, "Task execution panicked");
                }
            }
        }

        self.drain_reschedules();
    }
}

/// Time-priority scheduler with a bounded tick queue
pub struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    tick_queue: Mutex<VecDeque<JoinHandle<()>>>,
    tick_queue_built: AtomicUsize,
    max_tick_queue: AtomicUsize,
    /// Single-threaded tick gate
    gate: Semaphore,
}

impl TaskScheduler {
    pub fn new(max_tick_queue: usize) -> Self {
        let (reschedule_tx, reschedule_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(SchedulerShared {
                tasks: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                reschedule_tx,
                reschedule_rx: Mutex::new(reschedule_rx),
            }),
            tick_queue: Mutex::new(VecDeque::with_capacity(max_tick_queue)),
            tick_queue_built: AtomicUsize::new(max_tick_queue),
            max_tick_queue: AtomicUsize::new(max_tick_queue),
            gate: Semaphore::new(1),
        }
    }

    /// Register a task; it first fires after `initial_delay`
    pub fn register(
        &self,
        task: Arc<dyn RecurringTask>,
        period: Duration,
        initial_delay: Duration,
    ) -> Arc<TaskEntry> {
        let entry = Arc::new(TaskEntry {
            task,
            period,
            stats: Mutex::new(TaskStatistics::default()),
        });
        self.shared.enqueue(
            Arc::clone(&entry),
            crate::now_ms() + initial_delay.as_millis() as u64,
        );
        entry
    }

    /// Change the tick queue bound; applied at the next maintenance pass
    pub fn set_max_tick_queue(&self, max: usize) {
        self.max_tick_queue.store(max.max(1), Ordering::Release);
    }

    /// Tasks currently waiting in the priority queue
    pub fn queued_tasks(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Launch one bounded tick; returns the number of workers started
    ///
    /// Returns 0 when the tick queue is full after maintenance, applying
    /// backpressure to the caller.
    pub async fn tick(&self, cancel: &CancellationToken) -> usize {
        let Ok(_permit) = self.gate.acquire().await else {
            return 0;
        };

        self.shared.drain_reschedules();

        let max = self.max_tick_queue.load(Ordering::Acquire);
        let mut queue = self.tick_queue.lock();
        if queue.len() >= max {
            self.maintain(&mut queue, max);
        }
        if queue.len() >= max {
            debug!(queued = queue.len(), "Tick queue full, backing off");
            return 0;
        }

        let shared = Arc::clone(&self.shared);
        let cancel = cancel.clone();
        queue.push_back(tokio::spawn(async move {
            shared.do_tick(cancel).await;
        }));
        1
    }

    /// Drop completed workers from both ends; rebuild on capacity change
    fn maintain(&self, queue: &mut VecDeque<JoinHandle<()>>, max: usize) {
        while queue.front().is_some_and(JoinHandle::is_finished) {
            queue.pop_front();
        }
        while queue.back().is_some_and(JoinHandle::is_finished) {
            queue.pop_back();
        }
        if self.tick_queue_built.swap(max, Ordering::AcqRel) != max {
            let mut rebuilt = VecDeque::with_capacity(max);
            rebuilt.extend(queue.drain(..));
            *queue = rebuilt;
        }
    }
}
