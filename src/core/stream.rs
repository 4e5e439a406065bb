//! Ordered, immutable collections of tasks.
//!
//! A stream owns its tasks. Construction happens in the builder; once the
//! task list is sealed the topology never changes. Teardown walks the tasks
//! head to tail: deactivate the queue (the dispatch loop drains what is
//! already there and exits) and join whatever thread or runtime task was
//! driving it.

use crate::core::control::ControlMessage;
use crate::core::envelope::Envelope;
use crate::core::state::ProcessingState;
use crate::core::status::{StreamStatus, TaskStatus};
use crate::core::task::TaskShared;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::watch;

/// Handle for whatever is driving a task's dispatch loop.
pub enum TaskDriver {
    Async(tokio::task::JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

pub struct TaskEntry {
    pub shared: Arc<TaskShared>,
    driver: Mutex<Option<TaskDriver>>,
}

impl TaskEntry {
    pub fn new(shared: Arc<TaskShared>, driver: TaskDriver) -> Self {
        Self {
            shared,
            driver: Mutex::new(Some(driver)),
        }
    }
}

pub struct StreamInner {
    name: String,
    tasks: OnceLock<Vec<TaskEntry>>,
}

impl StreamInner {
    /// Queue depth of every task, head to tail. None until the stream is
    /// sealed.
    pub fn queue_depths(&self) -> Option<Vec<usize>> {
        self.tasks
            .get()
            .map(|tasks| tasks.iter().map(|t| t.shared.queue_len()).collect())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A pipeline of tasks running inside one runner.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("name", &self.inner.name).finish()
    }
}

impl Stream {
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                name: name.to_string(),
                tasks: OnceLock::new(),
            }),
        }
    }

    pub fn inner(&self) -> &Arc<StreamInner> {
        &self.inner
    }

    /// Install the ordered task list. Called exactly once by the builder.
    pub fn seal(&self, tasks: Vec<TaskEntry>) {
        if self.inner.tasks.set(tasks).is_err() {
            panic!("stream '{}' sealed twice", self.inner.name);
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn task_count(&self) -> usize {
        self.inner.tasks.get().map_or(0, Vec::len)
    }

    pub fn task(&self, index: usize) -> Option<Arc<TaskShared>> {
        self.inner
            .tasks
            .get()
            .and_then(|tasks| tasks.get(index))
            .map(|entry| entry.shared.clone())
    }

    pub fn head(&self) -> Option<Arc<TaskShared>> {
        self.task(0)
    }

    /// Inject a processing-state-change at the head of the stream; control
    /// forwarding carries it to every task in order.
    pub fn command_state(&self, goal: ProcessingState) -> bool {
        match self.head() {
            Some(head) => head.put(
                Envelope::control(ControlMessage::ProcessingStateChange(goal)),
                0,
            ),
            None => false,
        }
    }

    /// Inject an arbitrary control message at the head of the stream.
    pub fn inject_control(&self, control: ControlMessage) -> bool {
        match self.head() {
            Some(head) => head.put(Envelope::control(control), 0),
            None => false,
        }
    }

    pub fn status(&self) -> StreamStatus {
        let tasks = self
            .inner
            .tasks
            .get()
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|entry| TaskStatus::collect(&entry.shared))
                    .collect()
            })
            .unwrap_or_default();
        StreamStatus {
            name: self.inner.name.clone(),
            tasks,
        }
    }

    /// Tear the stream down: head to tail, deactivate each queue and join the
    /// dispatch driver.
    pub async fn close(&self) {
        let Some(tasks) = self.inner.tasks.get() else {
            return;
        };
        for entry in tasks {
            entry.shared.deactivate();
            let driver = entry.driver.lock().expect("driver mutex").take();
            match driver {
                Some(TaskDriver::Async(handle)) => {
                    let _ = handle.await;
                }
                Some(TaskDriver::Thread(handle)) => {
                    let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                }
                None => {}
            }
            tracing::info!(stream = %self.inner.name, task = %entry.shared.name(), "task closed");
        }
    }
}

/// Runner-wide stop signal. The shutdown monitor trips it; the runner main
/// waits on it and then closes every stream.
#[derive(Clone)]
pub struct StopGate {
    tx: Arc<watch::Sender<bool>>,
}

impl StopGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for StopGate {
    fn default() -> Self {
        Self::new()
    }
}
