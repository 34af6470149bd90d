//! Job runner
//!
//! Jobs are submitted over a bounded queue and each one runs on its own tokio
//! task with its own cancellation token. The runner keeps the tokens by job id
//! so a job can be stopped later.

use crate::dispatcher::Dispatcher;
use crate::egress::EgressWorker;
use crate::{RelayError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Long-running unit of work
pub enum Task {
    /// Drains the inbound queue and fans messages out
    Dispatch(Dispatcher),
    /// Delivers one subscriber's queue over HTTP
    Egress(EgressWorker),
}

impl Task {
    /// Run until the task finishes or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        match self {
            Task::Dispatch(dispatcher) => dispatcher.run(cancel).await,
            Task::Egress(worker) => worker.run(cancel).await,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Dispatch(_) => "dispatch",
            Task::Egress(_) => "egress",
        }
    }
}

/// Job request
pub struct Job {
    pub id: String,
    pub task: Task,
    cancel: CancellationToken,
}

impl Job {
    pub fn new(id: impl Into<String>, task: Task) -> Self {
        Self {
            id: id.into(),
            task,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an existing token, so its owner can stop the job directly
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

type JobTable = DashMap<String, (u64, CancellationToken)>;

/// Handle for submitting and cancelling jobs
#[derive(Clone)]
pub struct JobRunner {
    requests: mpsc::Sender<Job>,
    jobs: Arc<JobTable>,
}

/// Receiving side of the job queue; drive it with [`JobQueue::run`]
pub struct JobQueue {
    requests: mpsc::Receiver<Job>,
    jobs: Arc<JobTable>,
    seq: u64,
}

impl JobRunner {
    /// Create a runner whose request queue holds `capacity` jobs
    pub fn new(capacity: usize) -> (Self, JobQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let jobs = Arc::new(DashMap::new());
        (
            Self {
                requests: tx,
                jobs: jobs.clone(),
            },
            JobQueue {
                requests: rx,
                jobs,
                seq: 0,
            },
        )
    }

    /// Queue a job; waits while the request queue is full
    pub async fn add_job(&self, job: Job) -> Result<()> {
        self.requests
            .send(job)
            .await
            .map_err(|_| RelayError::ShuttingDown)
    }

    /// Cancel a running job
    pub fn cancel(&self, id: &str) -> bool {
        match self.jobs.get(id) {
            Some(entry) => {
                entry.value().1.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every running job
    pub fn shutdown(&self) {
        for entry in self.jobs.iter() {
            entry.value().1.cancel();
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Number of jobs currently running
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

impl JobQueue {
    /// Start every queued job until all runner handles are dropped
    pub async fn run(mut self) {
        while let Some(job) = self.requests.recv().await {
            self.start(job);
        }
        debug!("job queue closed");
    }

    fn start(&mut self, job: Job) {
        let Job { id, task, cancel } = job;
        let seq = self.seq;
        self.seq += 1;

        if let Some((_, (_, previous))) = self.jobs.remove(&id) {
            warn!(job = %id, "replacing running job");
            previous.cancel();
        }
        self.jobs.insert(id.clone(), (seq, cancel.clone()));

        let kind = task.kind();
        info!(job = %id, kind, "starting job");

        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            let handle = tokio::spawn(task.run(cancel));
            match handle.await {
                Ok(()) => debug!(job = %id, "job finished"),
                Err(e) if e.is_panic() => error!(job = %id, kind, "job panicked"),
                Err(e) => warn!(job = %id, error = %e, "job aborted"),
            }
            jobs.remove_if(&id, |_, (s, _)| *s == seq);
        });
    }
}
