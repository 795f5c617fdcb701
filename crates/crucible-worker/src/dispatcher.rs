//! The dispatcher owns the worker's concurrency: it takes an execution slot
//! *before* touching the queue, so when every slot is busy the queue simply
//! lengthens instead of jobs piling up in worker memory.

use anyhow::Result;
use crucible_base::Job;
use slog::{debug, info, warn, Logger};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Semaphore},
    task, time,
};

/// How long one queue pop blocks before the dispatcher rechecks shutdown.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Where jobs come from.
pub trait JobSource: Send + Sync + 'static {
    fn pop_job(&self, timeout: Duration) -> impl Future<Output = Result<Option<Job>>> + Send;
}

impl JobSource for crucible_store::Store {
    async fn pop_job(&self, timeout: Duration) -> Result<Option<Job>> {
        crucible_store::Store::pop_job(self, timeout).await
    }
}

/// What runs a popped job. Implementations must not fail: a job, once
/// popped, always ends in a stored result.
pub trait JobRunner: Send + Sync + 'static {
    fn run_job(&self, job: Job) -> impl Future<Output = ()> + Send;
}

pub struct Dispatcher<SourceT, RunnerT> {
    source: SourceT,
    runner: Arc<RunnerT>,
    slots: Arc<Semaphore>,
    slot_count: usize,
    log: Logger,
}

impl<SourceT: JobSource, RunnerT: JobRunner> Dispatcher<SourceT, RunnerT> {
    pub fn new(source: SourceT, runner: Arc<RunnerT>, slot_count: usize, log: Logger) -> Self {
        Self {
            source,
            runner,
            slots: Arc::new(Semaphore::new(slot_count)),
            slot_count,
            log,
        }
    }

    /// Run until `shutdown` flips to true, then wait for in-flight jobs.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let Some(job) = self.poll_for_job(&shutdown).await else {
                break;
            };
            debug!(self.log, "dispatching job"; "job_id" => %job.id);
            let runner = self.runner.clone();
            task::spawn(async move {
                runner.run_job(job).await;
                drop(permit);
            });
        }
        self.drain().await;
    }

    /// Poll the queue until a job arrives or shutdown is requested. Pops are
    /// awaited to completion rather than raced against the shutdown signal,
    /// so a popped job is never dropped on the floor; shutdown latency is
    /// bounded by the poll timeout.
    async fn poll_for_job(&self, shutdown: &watch::Receiver<bool>) -> Option<Job> {
        while !*shutdown.borrow() {
            match self.source.pop_job(POLL_TIMEOUT).await {
                Ok(Some(job)) => return Some(job),
                Ok(None) => {}
                Err(err) => {
                    warn!(self.log, "queue pop failed"; "error" => %err);
                    time::sleep(POLL_TIMEOUT).await;
                }
            }
        }
        None
    }

    async fn drain(&self) {
        info!(self.log, "draining in-flight jobs");
        let _ = self
            .slots
            .acquire_many(self.slot_count as u32)
            .await
            .expect("semaphore never closed");
    }
}
