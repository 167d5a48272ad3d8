use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::config::QueueConfig;
use crate::error::{BatchError, Result};
use crate::job::{self, Job};
use crate::queue::{
    AckOutcome, Claim, ClaimedJob, DeliveryHandle, DeliveryLedger, JobQueue, NackPlan, Overflow,
    PERSISTENT,
};

/// How long to wait for deliveries still in flight after cancelling a
/// consumer.
const CANCEL_DRAIN: Duration = Duration::from_millis(50);

const REPLY_SUCCESS: u16 = 200;

struct Session {
    connection: Connection,
    channel: Channel,
}

/// [`JobQueue`] over an AMQP 0-9-1 broker.
pub struct AmqpQueue {
    config: QueueConfig,
    /// Channel-wide prefetch; 0 leaves the broker default (unlimited)
    prefetch: u16,
    consumer_prefix: String,
    session: Option<Session>,
    ledger: DeliveryLedger,
    claims: u64,
}

impl AmqpQueue {
    /// Connect, set QoS and declare the durable job queue.
    pub async fn connect(
        config: QueueConfig,
        prefetch: u16,
        consumer_prefix: impl Into<String>,
    ) -> Result<Self> {
        let session = open_session(&config, prefetch).await?;
        tracing::info!(
            queue = %config.job_queue,
            host = %config.host,
            prefetch,
            "Connected to job queue"
        );
        Ok(Self {
            config,
            prefetch,
            consumer_prefix: consumer_prefix.into(),
            session: Some(session),
            ledger: DeliveryLedger::default(),
            claims: 0,
        })
    }

    fn channel(&self) -> Result<Channel> {
        self.session
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or_else(|| BatchError::Transport("not connected to the broker".into()))
    }

    /// Decode a delivery, rejecting it without requeue if it is malformed.
    async fn accept(&mut self, channel: &Channel, delivery: Delivery) -> Result<Option<ClaimedJob>> {
        match job::decode(&delivery.data) {
            Ok(job) => {
                let handle = self.ledger.retain(delivery.delivery_tag);
                Ok(Some(ClaimedJob { job, handle }))
            }
            Err(e) => {
                tracing::error!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Rejecting malformed job message"
                );
                channel
                    .basic_reject(delivery.delivery_tag, BasicRejectOptions { requeue: false })
                    .await?;
                Ok(None)
            }
        }
    }
}

async fn open_session(config: &QueueConfig, prefetch: u16) -> Result<Session> {
    let connection =
        Connection::connect(&config.amqp_uri(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    if prefetch > 0 {
        channel
            .basic_qos(prefetch, BasicQosOptions { global: true })
            .await?;
    }
    channel
        .queue_declare(
            &config.job_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(Session {
        connection,
        channel,
    })
}

#[async_trait]
impl JobQueue for AmqpQueue {
    async fn publish(&mut self, job: &Job) -> Result<()> {
        let payload = job::encode(job)?;
        let channel = self.channel()?;
        channel
            .basic_publish(
                "",
                &self.config.job_queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await?
            .await?;
        tracing::debug!(job_id = %job.id, batch_id = %job.batch_id, "Published job");
        Ok(())
    }

    async fn take(&mut self, max: usize) -> Result<Claim> {
        let mut jobs = Vec::new();
        if max == 0 {
            return Ok(Claim {
                jobs,
                overflow: None,
            });
        }

        let channel = self.channel()?;
        self.claims += 1;
        let consumer_tag = format!("{}-{}", self.consumer_prefix, self.claims);
        let mut consumer = channel
            .basic_consume(
                &self.config.job_queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let idle = self.config.claim_idle();
        while jobs.len() < max {
            let delivery = match tokio::time::timeout(idle, consumer.next()).await {
                // Nothing arrived within the idle window: the queue is empty
                Err(_) => break,
                // Consumer cancelled by the broker
                Ok(None) => break,
                Ok(Some(delivery)) => delivery?,
            };
            if let Some(claimed) = self.accept(&channel, delivery).await? {
                jobs.push(claimed);
            }
        }

        channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await?;

        // Anything the broker pushed before the cancel took effect is overflow
        let mut overflow_tags = Vec::new();
        while let Ok(Some(delivery)) = tokio::time::timeout(CANCEL_DRAIN, consumer.next()).await {
            overflow_tags.push(delivery?.delivery_tag);
        }
        overflow_tags.sort_unstable();

        Ok(Claim {
            jobs,
            overflow: self.ledger.overflow(overflow_tags),
        })
    }

    async fn return_overflow(&mut self, overflow: Overflow) -> Result<()> {
        if !self.ledger.is_current(overflow.generation) {
            tracing::debug!("Overflow belongs to a closed channel, nothing to return");
            return Ok(());
        }
        let channel = self.channel()?;
        match self.ledger.plan(&overflow) {
            NackPlan::Cumulative(tag) => {
                channel
                    .basic_nack(
                        tag,
                        BasicNackOptions {
                            multiple: true,
                            requeue: true,
                        },
                    )
                    .await?;
            }
            NackPlan::Individual(tags) => {
                for tag in tags {
                    channel
                        .basic_nack(
                            tag,
                            BasicNackOptions {
                                multiple: false,
                                requeue: true,
                            },
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn ack(&mut self, handle: DeliveryHandle) -> Result<AckOutcome> {
        if !self.ledger.settle(&handle) {
            return Ok(AckOutcome::Stale);
        }
        self.channel()?
            .basic_ack(handle.tag(), BasicAckOptions { multiple: false })
            .await?;
        Ok(AckOutcome::Acked)
    }

    async fn release_all(&mut self) -> Result<()> {
        let Some(last) = self.ledger.drain() else {
            return Ok(());
        };
        self.channel()?
            .basic_nack(
                last,
                BasicNackOptions {
                    multiple: true,
                    requeue: true,
                },
            )
            .await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.ledger.advance();
        if let Some(old) = self.session.take() {
            // The old connection is usually already dead; closing is best effort
            if let Err(e) = old.connection.close(REPLY_SUCCESS, "reconnecting").await {
                tracing::debug!(error = %e, "Closing stale connection failed");
            }
        }
        self.session = Some(open_session(&self.config, self.prefetch).await?);
        tracing::info!(
            queue = %self.config.job_queue,
            generation = self.ledger.generation(),
            "Reconnected to job queue"
        );
        Ok(())
    }

    async fn queue_depth(&mut self) -> Result<u32> {
        let queue = self
            .channel()?
            .queue_declare(
                &self.config.job_queue,
                QueueDeclareOptions {
                    passive: true,
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.channel.close(REPLY_SUCCESS, "bye").await?;
            session.connection.close(REPLY_SUCCESS, "bye").await?;
        }
        Ok(())
    }
}
