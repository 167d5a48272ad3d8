//! The worker daemon control loop.
//!
//! One task owns the queue client, the running processes and the state
//! machine. Each iteration claims work into free slots, polls every running
//! process without blocking, finalizes the ones that exited, and sleeps for
//! the poll interval:
//!
//! ```text
//! Idle ──claim──▶ Filling ──spawn──▶ Running ──all finished──▶ Idle
//!                    │                  │
//!                    └── spawn error ───┴── output missing ──▶ Broken
//! ```
//!
//! `Broken` is terminal: a broken daemon keeps polling what it already runs
//! but never claims again. Queue transport failures never break the daemon;
//! they switch it to reconnecting with exponential backoff while running
//! jobs continue to be polled.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::error::BatchError;
use crate::job::Job;
use crate::queue::{AckOutcome, ClaimedJob, DeliveryHandle, JobQueue};
use crate::worker::reconnect::{Backoff, ReconnectConfig};
use crate::worker::supervisor::{JobProcess, ProcessState, ProcessSupervisor};
use crate::worker::transfer::ArtifactTransfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Filling,
    Running,
    /// A job failed; the daemon claims nothing more until restarted.
    Broken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
}

/// How [`WorkerDaemon::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonOutcome {
    /// Shutdown was requested and every running job finished.
    Drained,
    Broken,
}

/// What one control-loop iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs claimed and started
    pub claimed: usize,
    /// Jobs that exited with their output present
    pub succeeded: usize,
    /// Jobs that exited without their output
    pub failed: usize,
}

struct ActiveJob {
    job: Job,
    process: JobProcess,
    handle: DeliveryHandle,
}

pub struct WorkerDaemon<Q: JobQueue> {
    instance_id: String,
    slots: usize,
    poll_interval: Duration,
    queue: Q,
    supervisor: ProcessSupervisor,
    transfer: ArtifactTransfer,
    active: Vec<ActiveJob>,
    state: DaemonState,
    connection: ConnectionState,
    backoff: Backoff,
    draining: bool,
}

impl<Q: JobQueue> WorkerDaemon<Q> {
    pub fn new(
        instance_id: impl Into<String>,
        config: &DaemonConfig,
        queue: Q,
        transfer: ArtifactTransfer,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            slots: config.slots,
            poll_interval: config.poll_interval(),
            queue,
            supervisor: ProcessSupervisor::new(&config.work_dir),
            transfer,
            active: Vec::new(),
            state: DaemonState::Idle,
            connection: ConnectionState::Connected,
            backoff: Backoff::new(ReconnectConfig::default()),
            draining: false,
        }
    }

    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.backoff = Backoff::new(config);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_broken(&self) -> bool {
        self.state == DaemonState::Broken
    }

    /// Number of jobs whose processes are running.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Enter the terminal `Broken` state.
    pub fn mark_broken(&mut self) {
        if self.state != DaemonState::Broken {
            tracing::error!(
                instance_id = %self.instance_id,
                active = self.active.len(),
                "Daemon is broken, no further jobs will be claimed"
            );
            self.state = DaemonState::Broken;
        }
    }

    fn can_claim(&self) -> bool {
        !self.is_broken()
            && !self.draining
            && self.connection == ConnectionState::Connected
            && self.active.len() < self.slots
    }

    /// Run one control-loop iteration without sleeping.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        if self.connection == ConnectionState::Reconnecting {
            self.try_reconnect().await;
        }
        if self.can_claim() {
            report.claimed = self.fill().await;
        }
        self.monitor(&mut report).await;

        if self.state != DaemonState::Broken {
            self.state = if self.active.is_empty() {
                DaemonState::Idle
            } else {
                DaemonState::Running
            };
        }
        report
    }

    /// Claim jobs into the free slots and start them.
    async fn fill(&mut self) -> usize {
        self.state = DaemonState::Filling;
        let free = self.slots - self.active.len();
        let claimed = match self.queue.claim(free).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.on_queue_error("claim", e).await;
                return 0;
            }
        };

        let mut started = 0;
        for ClaimedJob { mut job, handle } in claimed {
            // After a reconnect the broker redelivers jobs this daemon is still
            // running; take over the fresh delivery instead of starting a copy.
            if let Some(running) = self
                .active
                .iter_mut()
                .find(|a| a.job.id == job.id && a.job.argv == job.argv)
            {
                tracing::info!(job_id = %job.id, "Redelivered job is already running, adopting delivery");
                running.handle = handle;
                continue;
            }
            if self.is_broken() {
                tracing::warn!(job_id = %job.id, "Leaving claimed job unacked");
                continue;
            }

            self.avoid_log_clash(&mut job);
            match self.supervisor.spawn(&job) {
                Ok(process) => {
                    job.local_log_file = Some(process.log_path().to_path_buf());
                    self.active.push(ActiveJob {
                        job,
                        process,
                        handle,
                    });
                    started += 1;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to start job");
                    self.mark_broken();
                }
            }
        }
        started
    }

    /// Point `job` at a log file of its own when a running job already
    /// writes to the one its template names.
    fn avoid_log_clash(&self, job: &mut Job) {
        let work_dir = self.supervisor.work_dir();
        let in_use = |path: &Path| self.active.iter().any(|a| a.process.log_path() == path);
        if !in_use(job.resolve_log_path(work_dir).as_path()) {
            return;
        }

        let requested = job.clone();
        let mut tag = job.id.clone();
        let mut n = 1;
        loop {
            job.log_file_template = requested.tagged_log_template(&tag);
            if !in_use(job.resolve_log_path(work_dir).as_path()) {
                break;
            }
            n += 1;
            tag = format!("{}-{}", job.id, n);
        }
        tracing::warn!(
            job_id = %job.id,
            requested = %requested.log_file_template,
            log_template = %job.log_file_template,
            "Log file is in use by a running job, renaming"
        );
    }

    /// Poll every running job and finalize those that exited, in the order
    /// they were started.
    async fn monitor(&mut self, report: &mut TickReport) {
        let mut i = 0;
        while i < self.active.len() {
            match self.active[i].process.poll() {
                ProcessState::Running => i += 1,
                ProcessState::Exited(code) => {
                    let finished = self.active.remove(i);
                    self.finish(finished, code, report).await;
                }
            }
        }
    }

    async fn finish(&mut self, finished: ActiveJob, code: Option<i32>, report: &mut TickReport) {
        let ActiveJob {
            job,
            process,
            handle,
        } = finished;
        tracing::info!(job_id = %job.id, exit_code = ?code, "Job process exited");

        match self.transfer.finalize(&job, process.log_path()).await {
            Ok(transfer) => {
                report.succeeded += 1;
                tracing::info!(
                    job_id = %job.id,
                    transferred = transfer.transferred,
                    failed_transfers = transfer.failed,
                    "Job succeeded"
                );
                match self.queue.ack(handle).await {
                    Ok(AckOutcome::Acked) => {
                        tracing::debug!(job_id = %job.id, "Job acknowledged");
                    }
                    Ok(AckOutcome::Stale) => {
                        tracing::warn!(
                            job_id = %job.id,
                            "Delivery was requeued after a connection loss, skipping ack"
                        );
                    }
                    Err(e) => self.on_queue_error("ack", e).await,
                }
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(job_id = %job.id, error = %e, "Job failed, leaving it unacked");
                self.mark_broken();
            }
        }
    }

    async fn on_queue_error(&mut self, operation: &str, error: BatchError) {
        if error.is_transport() {
            tracing::warn!(operation, error = %error, "Lost connection to job queue");
        } else {
            tracing::error!(operation, error = %error, "Job queue operation failed");
        }
        self.connection = ConnectionState::Reconnecting;
        self.backoff.reset();
        self.try_reconnect().await;
    }

    async fn try_reconnect(&mut self) {
        if !self.backoff.ready() {
            return;
        }
        match self.queue.reconnect().await {
            Ok(()) => {
                tracing::info!(
                    instance_id = %self.instance_id,
                    failed_attempts = self.backoff.attempts(),
                    active = self.active.len(),
                    "Reconnected to job queue"
                );
                self.connection = ConnectionState::Connected;
                self.backoff.reset();
            }
            Err(e) => {
                let wait = self.backoff.failed();
                tracing::warn!(
                    instance_id = %self.instance_id,
                    attempt = self.backoff.attempts(),
                    retry_in_ms = wait.as_millis() as u64,
                    error = %e,
                    "Reconnect attempt failed"
                );
            }
        }
    }

    fn finished(&self) -> bool {
        self.draining && (self.is_broken() || self.active.is_empty())
    }

    /// Run the control loop until `cancel` fires and the daemon has drained.
    ///
    /// After cancellation no new jobs are claimed; running jobs are
    /// finalized as they exit. A broken daemon exits as soon as shutdown is
    /// requested, killing whatever still runs. Deliveries still held at exit
    /// are returned to the queue.
    pub async fn run(&mut self, cancel: CancellationToken) -> DaemonOutcome {
        tracing::info!(
            instance_id = %self.instance_id,
            slots = self.slots,
            work_dir = %self.supervisor.work_dir().display(),
            "Worker daemon started"
        );

        loop {
            if cancel.is_cancelled() && !self.draining {
                self.draining = true;
                tracing::info!(
                    instance_id = %self.instance_id,
                    active = self.active.len(),
                    "Shutdown requested, draining running jobs"
                );
            }
            if self.finished() {
                break;
            }

            self.tick().await;
            if self.finished() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !self.draining => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.shutdown().await
    }

    async fn shutdown(&mut self) -> DaemonOutcome {
        if !self.active.is_empty() {
            tracing::warn!(
                instance_id = %self.instance_id,
                count = self.active.len(),
                "Killing job processes still running at exit"
            );
            for running in &mut self.active {
                running.process.kill();
            }
            self.active.clear();
        }

        if let Err(e) = self.queue.release_all().await {
            tracing::warn!(error = %e, "Failed to return held deliveries");
        }
        if let Err(e) = self.queue.close().await {
            tracing::debug!(error = %e, "Closing job queue connection failed");
        }

        let outcome = if self.is_broken() {
            DaemonOutcome::Broken
        } else {
            DaemonOutcome::Drained
        };
        tracing::info!(instance_id = %self.instance_id, ?outcome, "Worker daemon stopped");
        outcome
    }
}
