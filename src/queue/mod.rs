//! Durable job queue: publish plus the bounded-claim consumption protocol.
//!
//! A claim opens a streaming consumer, accepts at most `max` deliveries,
//! stops the stream and hands back whatever the client had already buffered
//! beyond `max` as an [`Overflow`] token. [`JobQueue::return_overflow`]
//! requeues those deliveries so a daemon never holds more unacknowledged
//! messages than it has slots.
//!
//! # Components
//!
//! - [`JobQueue`]: the client contract used by the daemon and the producer
//! - [`amqp::AmqpQueue`]: AMQP 0-9-1 implementation
//! - [`memory::MemoryBroker`]: in-process broker with the same ack/nack
//!   semantics and fault injection
//!
//! # Delivery handles
//!
//! Every claimed job carries a [`DeliveryHandle`]. Handles are move-only and
//! are consumed by [`JobQueue::ack`]. A handle remembers the channel
//! generation it was delivered on; once the client reconnects, handles from
//! the old channel are stale because the broker has already requeued their
//! messages, and acking them is a no-op.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::Job;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpQueue;
pub use memory::{MemoryBroker, MemoryQueue};

/// Broker-assigned, per-channel, monotonically increasing delivery id.
pub type DeliveryTag = u64;

/// Persistent delivery mode for published jobs.
pub const PERSISTENT: u8 = 2;

/// Correlates a claimed job with the queue message it came from.
#[derive(Debug, PartialEq, Eq)]
pub struct DeliveryHandle {
    generation: u64,
    tag: DeliveryTag,
}

impl DeliveryHandle {
    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
pub struct ClaimedJob {
    pub job: Job,
    pub handle: DeliveryHandle,
}

/// Deliveries buffered beyond a claim's limit, pending return to the queue.
#[derive(Debug, PartialEq, Eq)]
pub struct Overflow {
    generation: u64,
    /// Ascending
    tags: Vec<DeliveryTag>,
}

impl Overflow {
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn first(&self) -> Option<DeliveryTag> {
        self.tags.first().copied()
    }

    pub fn last(&self) -> Option<DeliveryTag> {
        self.tags.last().copied()
    }
}

/// Result of [`JobQueue::take`].
#[derive(Debug)]
pub struct Claim {
    pub jobs: Vec<ClaimedJob>,
    pub overflow: Option<Overflow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    /// The handle belonged to a channel that has since been replaced; the
    /// broker requeued the message when that channel closed.
    Stale,
}

/// How an overflow is handed back to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackPlan {
    /// One `basic.nack(tag, multiple = true, requeue = true)`.
    Cumulative(DeliveryTag),
    /// One `basic.nack(tag, multiple = false, requeue = true)` per tag.
    Individual(Vec<DeliveryTag>),
}

/// Choose how to return `overflow`.
///
/// A cumulative nack also covers every earlier unacknowledged delivery on
/// the channel. It is only used when none of those is still retained for a
/// running job; otherwise each overflow tag is nacked on its own.
pub fn plan_overflow_return(retained: &BTreeSet<DeliveryTag>, overflow: &Overflow) -> NackPlan {
    match overflow.last() {
        Some(last) if retained.range(..=last).next().is_none() => NackPlan::Cumulative(last),
        _ => NackPlan::Individual(overflow.tags.clone()),
    }
}

/// Client-side record of the deliveries a queue client still holds.
#[derive(Debug, Default)]
pub(crate) struct DeliveryLedger {
    generation: u64,
    retained: BTreeSet<DeliveryTag>,
}

impl DeliveryLedger {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Record a delivery the caller will keep and return its handle.
    pub(crate) fn retain(&mut self, tag: DeliveryTag) -> DeliveryHandle {
        self.retained.insert(tag);
        DeliveryHandle {
            generation: self.generation,
            tag,
        }
    }

    pub(crate) fn overflow(&self, tags: Vec<DeliveryTag>) -> Option<Overflow> {
        if tags.is_empty() {
            None
        } else {
            Some(Overflow {
                generation: self.generation,
                tags,
            })
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Forget `handle`. Returns false when it came from an earlier channel.
    pub(crate) fn settle(&mut self, handle: &DeliveryHandle) -> bool {
        if !self.is_current(handle.generation) {
            return false;
        }
        self.retained.remove(&handle.tag);
        true
    }

    pub(crate) fn plan(&self, overflow: &Overflow) -> NackPlan {
        plan_overflow_return(&self.retained, overflow)
    }

    /// Forget every retained delivery, returning the highest tag.
    pub(crate) fn drain(&mut self) -> Option<DeliveryTag> {
        let last = self.retained.iter().next_back().copied();
        self.retained.clear();
        last
    }

    /// Start a new channel generation; every outstanding handle goes stale.
    pub(crate) fn advance(&mut self) {
        self.generation += 1;
        self.retained.clear();
    }
}

/// Client contract for the durable job queue.
///
/// Implementations own their connection exclusively and are driven from a
/// single task, so they take `&mut self`.
#[async_trait]
pub trait JobQueue: Send {
    /// Publish `job` with persistent delivery to the job queue.
    async fn publish(&mut self, job: &Job) -> Result<()>;

    /// Accept up to `max` jobs, stop consuming, and report anything buffered
    /// beyond `max` as overflow.
    async fn take(&mut self, max: usize) -> Result<Claim>;

    /// Requeue an overflow reported by [`JobQueue::take`].
    async fn return_overflow(&mut self, overflow: Overflow) -> Result<()>;

    /// Acknowledge exactly one delivery.
    async fn ack(&mut self, handle: DeliveryHandle) -> Result<AckOutcome>;

    /// Requeue every delivery this client still holds (cumulative nack).
    async fn release_all(&mut self) -> Result<()>;

    /// Tear down and rebuild connection, channel and queue declaration.
    ///
    /// Outstanding handles become stale even if the rebuild fails.
    async fn reconnect(&mut self) -> Result<()>;

    /// Number of ready messages on the job queue.
    async fn queue_depth(&mut self) -> Result<u32>;

    async fn close(&mut self) -> Result<()>;

    /// Claim up to `max` jobs, returning any overflow to the queue.
    async fn claim(&mut self, max: usize) -> Result<Vec<ClaimedJob>> {
        let Claim { jobs, overflow } = self.take(max).await?;
        if let Some(overflow) = overflow {
            tracing::debug!(
                claimed = jobs.len(),
                overflow = overflow.len(),
                "Returning over-claimed deliveries"
            );
            self.return_overflow(overflow).await?;
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overflow(tags: &[DeliveryTag]) -> Overflow {
        Overflow {
            generation: 0,
            tags: tags.to_vec(),
        }
    }

    #[test]
    fn cumulative_when_nothing_older_is_retained() {
        let retained = BTreeSet::new();
        assert_eq!(
            plan_overflow_return(&retained, &overflow(&[4, 5, 6])),
            NackPlan::Cumulative(6)
        );
    }

    #[test]
    fn individual_when_running_jobs_hold_older_tags() {
        let retained: BTreeSet<_> = [1, 2].into_iter().collect();
        assert_eq!(
            plan_overflow_return(&retained, &overflow(&[3, 4])),
            NackPlan::Individual(vec![3, 4])
        );
    }

    #[test]
    fn newer_retained_tags_do_not_block_cumulative() {
        let retained: BTreeSet<_> = [9].into_iter().collect();
        assert_eq!(
            plan_overflow_return(&retained, &overflow(&[3, 4])),
            NackPlan::Cumulative(4)
        );
    }

    #[test]
    fn ledger_settles_current_handles_only() {
        let mut ledger = DeliveryLedger::default();
        let old = ledger.retain(1);
        ledger.advance();
        let fresh = ledger.retain(1);

        assert!(!ledger.settle(&old));
        assert!(ledger.settle(&fresh));
        assert_eq!(ledger.drain(), None);
    }

    #[test]
    fn ledger_drain_reports_highest_tag() {
        let mut ledger = DeliveryLedger::default();
        ledger.retain(3);
        ledger.retain(7);
        ledger.retain(5);
        assert_eq!(ledger.drain(), Some(7));
        assert_eq!(ledger.drain(), None);
    }

    #[test]
    fn empty_overflow_is_none() {
        let ledger = DeliveryLedger::default();
        assert!(ledger.overflow(Vec::new()).is_none());
        assert_eq!(ledger.overflow(vec![2, 3]).unwrap().len(), 2);
    }
}
