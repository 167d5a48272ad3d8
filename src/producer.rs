//! Job submission.
//!
//! A [`Launcher`] either stages jobs locally and publishes them together as
//! one batch, or posts a single job straight away. Both paths publish
//! through [`JobQueue::publish`] and rebuild the connection when it fails
//! with a transport error.

use std::path::PathBuf;

use crate::error::Result;
use crate::job::{self, Job, NO_BATCH};
use crate::queue::JobQueue;
use crate::worker::reconnect::{next_delay, ReconnectConfig};

/// Attempts per message before a transport error is returned to the caller.
const PUBLISH_ATTEMPTS: u32 = 3;

pub struct Launcher<Q: JobQueue> {
    queue: Q,
    staged: Vec<Job>,
    /// Job whose publish failed; the next flush sends it first, same id.
    interrupted: Option<Job>,
    /// Batch id of a flush that stopped part way.
    open_batch: Option<String>,
    needs_reconnect: bool,
    reconnect: ReconnectConfig,
    last_id: Option<String>,
}

impl<Q: JobQueue> Launcher<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            staged: Vec::new(),
            interrupted: None,
            open_batch: None,
            needs_reconnect: false,
            reconnect: ReconnectConfig::default(),
            last_id: None,
        }
    }

    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Buffer a job for the next [`Launcher::flush`]. Nothing is published.
    pub fn stage_job(
        &mut self,
        argv: Vec<String>,
        num_cpus: u32,
        expected_runtime: f64,
        log_file_template: impl Into<String>,
        output_file: Option<PathBuf>,
    ) -> &mut Self {
        let mut job = Job::new(argv)
            .with_num_cpus(num_cpus)
            .with_expected_runtime(expected_runtime)
            .with_log_template(log_file_template);
        job.output_file = output_file;
        self.staged.push(job);
        self
    }

    /// Number of jobs waiting for a flush.
    pub fn staged(&self) -> usize {
        self.staged.len() + usize::from(self.interrupted.is_some())
    }

    /// Publish every staged job under one batch id and return it. Each newly
    /// staged job gets a fresh id.
    ///
    /// The batch id is `batch_id` if given, else the id of a previous flush
    /// that stopped part way, else a random one. Transport errors rebuild
    /// the connection and retry the same message. If a message still cannot
    /// be published, it and every job after it stay staged, and the next
    /// flush continues the same batch.
    pub async fn flush(&mut self, batch_id: Option<String>) -> Result<String> {
        let batch_id = batch_id
            .or_else(|| self.open_batch.take())
            .unwrap_or_else(job::random_batch_id);
        let mut jobs: Vec<Job> = self.interrupted.take().into_iter().collect();
        let resumed = !jobs.is_empty();
        jobs.append(&mut self.staged);
        let mut pending = jobs.into_iter().enumerate();
        let mut published = 0;

        while let Some((i, mut job)) = pending.next() {
            if i > 0 || !resumed {
                job.id = self.next_id();
            }
            job.batch_id = batch_id.clone();
            if let Err(e) = self.publish(&job).await {
                tracing::warn!(
                    batch_id = %batch_id,
                    published,
                    error = %e,
                    "Batch publish interrupted"
                );
                self.interrupted = Some(job);
                self.staged.extend(pending.map(|(_, job)| job));
                self.open_batch = Some(batch_id);
                return Err(e);
            }
            published += 1;
        }

        tracing::info!(batch_id = %batch_id, jobs = published, "Published batch");
        Ok(batch_id)
    }

    /// Assign a fresh id and publish `job` immediately, bypassing the stage
    /// buffer. Returns the job id.
    pub async fn post_job(&mut self, mut job: Job, batch_id: Option<String>) -> Result<String> {
        job.id = self.next_id();
        job.batch_id = batch_id.unwrap_or_else(|| NO_BATCH.to_string());
        self.publish(&job).await?;
        tracing::info!(job_id = %job.id, batch_id = %job.batch_id, "Posted job");
        Ok(job.id)
    }

    /// Publish one message, rebuilding the connection after transport
    /// errors.
    async fn publish(&mut self, job: &Job) -> Result<()> {
        let mut delay = self.reconnect.initial_delay;
        let mut attempt = 1;
        loop {
            let result = match self.ensure_connected().await {
                Ok(()) => self.queue.publish(job).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transport() => {
                    self.needs_reconnect = true;
                    if attempt >= PUBLISH_ATTEMPTS {
                        return Err(e);
                    }
                    tracing::warn!(
                        job_id = %job.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, &self.reconnect);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.needs_reconnect {
            self.queue.reconnect().await?;
            self.needs_reconnect = false;
            tracing::info!("Reconnected to job queue");
        }
        Ok(())
    }

    pub fn queue_mut(&mut self) -> &mut Q {
        &mut self.queue
    }

    pub fn into_inner(self) -> Q {
        self.queue
    }

    /// Ids hash the clock, so two jobs published within the same microsecond
    /// would share one. Wait for the clock to move on instead.
    fn next_id(&mut self) -> String {
        let mut id = job::generate_job_id();
        while self.last_id.as_deref() == Some(id.as_str()) {
            std::thread::yield_now();
            id = job::generate_job_id();
        }
        self.last_id = Some(id.clone());
        id
    }
}
