//! Task dispatcher: runs session work on a worker pool, or inline.
//!
//! Tasks that carry a lane (a chat id) run strictly one at a time and in
//! submission order for that lane; tasks of different lanes, and lane-less
//! tasks, run in parallel up to the pool size.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    str::FromStr,
    sync::{Arc, Mutex},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    domain::ChatId,
    errors::Error,
    utils::{lock, panic_message},
    Result,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Fixed-size worker pool; `submit` only enqueues.
    #[default]
    Pooled,
    /// No pool; `submit` runs the task to completion on the caller's task.
    Inline,
}

impl FromStr for DispatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pooled" | "pool" => Ok(Self::Pooled),
            "inline" => Ok(Self::Inline),
            other => Err(Error::Config(format!(
                "unknown dispatch mode {other:?} (expected \"pooled\" or \"inline\")"
            ))),
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pooled => f.write_str("pooled"),
            Self::Inline => f.write_str("inline"),
        }
    }
}

/// A unit of work. Panics inside the future are caught and logged.
pub struct Task {
    lane: Option<ChatId>,
    label: &'static str,
    fut: BoxFuture<'static, ()>,
}

impl Task {
    pub fn new(label: &'static str, fut: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            lane: None,
            label,
            fut: fut.boxed(),
        }
    }

    /// Serialize with every other task of the same chat.
    pub fn in_lane(mut self, chat_id: ChatId) -> Self {
        self.lane = Some(chat_id);
        self
    }

    pub fn lane(&self) -> Option<ChatId> {
        self.lane
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("lane", &self.lane)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Pending tasks per busy lane. A lane is present while one of its tasks is
/// queued or running; later tasks for it wait here instead of in the channel.
type Lanes = Arc<Mutex<HashMap<ChatId, VecDeque<Task>>>>;

pub struct TaskDispatcher {
    mode: DispatchMode,
    workers: usize,
    /// `None` once stopped.
    tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>>,
    lanes: Lanes,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskDispatcher {
    pub fn new(mode: DispatchMode, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            mode,
            workers: workers.max(1),
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.tx).is_none()
    }

    /// Spawn the worker pool. Idempotent while running; fails after `stop`.
    pub fn start(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::DispatcherStopped);
        }
        if self.mode == DispatchMode::Pooled {
            self.spawn_workers();
        }
        Ok(())
    }

    fn spawn_workers(&self) {
        let mut handles = lock(&self.handles);
        if !handles.is_empty() {
            return;
        }
        for worker in 0..self.workers {
            handles.push(tokio::spawn(worker_loop(
                worker,
                self.rx.clone(),
                self.lanes.clone(),
            )));
        }
        info!(workers = self.workers, "dispatcher started");
    }

    /// Queue `task` (pooled) or run it to completion (inline).
    pub async fn submit(&self, task: Task) -> Result<()> {
        match self.mode {
            DispatchMode::Pooled => self.enqueue(task),
            DispatchMode::Inline => {
                if self.is_stopped() {
                    return Err(Error::DispatcherStopped);
                }
                run(task).await;
                Ok(())
            }
        }
    }

    fn enqueue(&self, task: Task) -> Result<()> {
        // Holding the sender lock orders this against `stop`.
        let tx = lock(&self.tx);
        let Some(sender) = tx.as_ref() else {
            return Err(Error::DispatcherStopped);
        };

        if let Some(lane) = task.lane {
            let mut lanes = lock(&self.lanes);
            if let Some(pending) = lanes.get_mut(&lane) {
                pending.push_back(task);
                return Ok(());
            }
            lanes.insert(lane, VecDeque::new());
        }

        sender.send(task).map_err(|_| Error::DispatcherStopped)
    }

    /// Refuse new tasks, then wait until everything already accepted has run.
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(sender) = lock(&self.tx).take() else {
            return;
        };
        if self.mode == DispatchMode::Pooled {
            // Tasks queued before `start` still have to drain.
            self.spawn_workers();
        }
        drop(sender);

        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("dispatcher worker ended abnormally: {e}");
            }
        }
        info!("dispatcher stopped");
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>>,
    lanes: Lanes,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(task) = next else {
            break;
        };

        let lane = task.lane;
        run(task).await;

        // Drain the lane on this worker so its tasks never overlap.
        if let Some(lane) = lane {
            while let Some(task) = next_in_lane(&lanes, lane) {
                run(task).await;
            }
        }
    }
    debug!(worker, "dispatcher worker exiting");
}

fn next_in_lane(lanes: &Lanes, lane: ChatId) -> Option<Task> {
    let mut lanes = lock(lanes);
    let next = lanes.get_mut(&lane).and_then(VecDeque::pop_front);
    if next.is_none() {
        lanes.remove(&lane);
    }
    next
}

async fn run(task: Task) {
    let Task { lane, label, fut } = task;
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        error!(
            task = label,
            chat_id = ?lane,
            "task panicked: {}",
            panic_message(&*panic)
        );
    }
}
