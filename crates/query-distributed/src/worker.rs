//! Worker node hosting tasks

use crate::error::{DistributedError, Result};
use crate::network::NetworkConfig;
use crate::plan::TaskPlan;
use crate::task::{Task, TaskOutcome, TaskStatus};
use crate::transport::TransportService;
use crate::types::{TaskId, WorkerId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Accepting tasks
    Active,
    /// Waiting for running tasks, refusing new ones
    Draining,
    /// Shut down
    Stopped,
}

/// Last known state of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Failed,
    UpstreamFailed,
}

impl From<&TaskStatus> for TaskState {
    fn from(status: &TaskStatus) -> Self {
        match status {
            TaskStatus::Completed => TaskState::Completed,
            TaskStatus::Failed { .. } => TaskState::Failed,
            TaskStatus::UpstreamFailed { .. } => TaskState::UpstreamFailed,
        }
    }
}

/// Handle to a task running on its own thread
pub struct TaskHandle {
    task_id: TaskId,
    thread: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the task to finish
    pub fn join(self) -> Result<TaskOutcome> {
        self.thread.join().map_err(|_| {
            DistributedError::Execution(format!("Task {} thread panicked", self.task_id))
        })
    }
}

/// Worker node that runs task fragments
pub struct Worker {
    /// Unique worker ID
    id: WorkerId,
    /// Bound listener address
    address: SocketAddr,
    transport: Arc<TransportService>,
    status: RwLock<WorkerStatus>,
    active_tasks: Arc<AtomicUsize>,
    tasks: Arc<DashMap<TaskId, TaskState>>,
}

impl Worker {
    /// Start a worker listening on `address`. Port 0 picks a free port.
    pub fn new(address: &str, config: NetworkConfig) -> Result<Self> {
        let transport = Arc::new(TransportService::new(config)?);
        let address = transport.listen(address)?;
        let id = WorkerId::new();
        info!("Started worker {} at {}", id, address);

        Ok(Self {
            id,
            address,
            transport,
            status: RwLock::new(WorkerStatus::Active),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            tasks: Arc::new(DashMap::new()),
        })
    }

    /// Get worker ID
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Bound listener address
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn transport(&self) -> &Arc<TransportService> {
        &self.transport
    }

    /// Get current status
    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Get active task count
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.tasks.get(&task_id).map(|state| *state)
    }

    /// Build and initialize the task, then run it on its own thread.
    ///
    /// Initialization happens on the calling thread so configuration and
    /// resource errors are reported here.
    pub fn submit(&self, plan: TaskPlan) -> Result<TaskHandle> {
        if self.status() != WorkerStatus::Active {
            return Err(DistributedError::Execution(format!(
                "Worker {} is not accepting tasks",
                self.id
            )));
        }

        let mut task = Task::from_plan(plan)?;
        task.init(self.transport.clone())?;
        let task_id = task.task_id();

        self.tasks.insert(task_id, TaskState::Running);
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        let active = self.active_tasks.clone();
        let tasks = self.tasks.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("qe-{}", task_id))
            .spawn(move || {
                let outcome = task.run();
                tasks.insert(outcome.task_id, TaskState::from(&outcome.status));
                active.fetch_sub(1, Ordering::SeqCst);
                outcome
            });

        match spawned {
            Ok(thread) => Ok(TaskHandle { task_id, thread }),
            Err(e) => {
                error!("Cannot spawn thread for {}: {}", task_id, e);
                self.tasks.insert(task_id, TaskState::Failed);
                self.active_tasks.fetch_sub(1, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Refuse new tasks and wait for the running ones
    pub fn shutdown(&self) {
        info!("Shutting down worker {}", self.id);
        *self.status.write() = WorkerStatus::Draining;

        while self.active_task_count() > 0 {
            std::thread::sleep(Duration::from_millis(50));
        }

        *self.status.write() = WorkerStatus::Stopped;
    }
}
