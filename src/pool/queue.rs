use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

/// One build job: clone the golden template and provision the result.
#[derive(Debug, Clone, Copy)]
pub struct CloneTask {
    pub job_id: Uuid,
    pub enqueued_at: Instant,
}

impl CloneTask {
    pub fn new() -> Self {
        Self {
            job_id: Uuid::new_v4(),
            enqueued_at: Instant::now(),
        }
    }
}

impl Default for CloneTask {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Ok,
    Err,
}

/// The single message a clone worker posts back before it exits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    /// Final name the worker assigned (ready name on success, error name
    /// on failure).
    pub vm_name: String,
    /// Diagnostic text, only for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkerResult {
    pub fn ok(vm_name: String) -> Self {
        Self {
            status: WorkerStatus::Ok,
            vm_name,
            message: None,
        }
    }

    pub fn err(vm_name: String, message: String) -> Self {
        Self {
            status: WorkerStatus::Err,
            vm_name,
            message: Some(message),
        }
    }
}

/// Unbounded FIFO of clone tasks with drain tracking.
///
/// `put` registers an unfinished task; the builder pool calls `task_done`
/// once per task after the worker terminated and its result was handled.
/// `join` resolves when every task put so far has been finished, which is
/// what the supervisor waits on during shutdown.
#[derive(Debug, Default)]
pub struct CloneQueue {
    items: Mutex<VecDeque<CloneTask>>,
    unfinished: Mutex<usize>,
    item_added: Notify,
    all_done: Notify,
}

impl CloneQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, task: CloneTask) {
        self.items.lock().unwrap().push_back(task);
        *self.unfinished.lock().unwrap() += 1;
        self.item_added.notify_one();
    }

    pub async fn get(&self) -> CloneTask {
        loop {
            let notified = self.item_added.notified();
            if let Some(task) = self.items.lock().unwrap().pop_front() {
                return task;
            }
            notified.await;
        }
    }

    /// Number of tasks put but not yet marked done (queued + in flight).
    pub fn unfinished(&self) -> usize {
        *self.unfinished.lock().unwrap()
    }

    pub fn task_done(&self) {
        let mut unfinished = self.unfinished.lock().unwrap();
        debug_assert!(*unfinished > 0, "task_done called more times than put");
        *unfinished = unfinished.saturating_sub(1);
        if *unfinished == 0 {
            self.all_done.notify_waiters();
        }
    }

    /// Wait until every enqueued task has been finished.
    pub async fn join(&self) {
        loop {
            let notified = self.all_done.notified();
            if *self.unfinished.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }
}
