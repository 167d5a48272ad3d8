//! In-process broker with AMQP acknowledgement semantics.
//!
//! [`MemoryBroker`] holds one durable queue. Each [`MemoryQueue`] client is
//! a connection with its own channel: delivery tags are per channel, acks and
//! nacks follow AMQP rules (a `multiple` nack covers every earlier unacked
//! delivery on the channel), and when a connection dies all of its unacked
//! deliveries are requeued. Faults can be injected at publish, claim or ack
//! to exercise reconnection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{BatchError, Result};
use crate::job::{self, Job};
use crate::queue::{
    AckOutcome, Claim, ClaimedJob, DeliveryHandle, DeliveryLedger, DeliveryTag, JobQueue,
    NackPlan, Overflow,
};

/// Operation at which an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Publish,
    Claim,
    Ack,
}

/// A `basic.nack` as the broker received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackRecord {
    pub tag: DeliveryTag,
    pub multiple: bool,
}

#[derive(Debug, Default)]
struct ChannelState {
    next_tag: DeliveryTag,
    unacked: BTreeMap<DeliveryTag, Vec<u8>>,
}

/// A fault that fires once `skip` more matching operations have passed.
#[derive(Debug)]
struct ArmedFault {
    point: FaultPoint,
    skip: usize,
}

#[derive(Debug, Default)]
struct BrokerState {
    ready: VecDeque<Vec<u8>>,
    channels: HashMap<u64, ChannelState>,
    next_connection: u64,
    faults: Vec<ArmedFault>,
    refused_connects: usize,
    acked: Vec<Vec<u8>>,
    rejected: usize,
    nacks: Vec<NackRecord>,
}

fn closed() -> BatchError {
    BatchError::Transport("connection closed".into())
}

impl BrokerState {
    fn open(&mut self) -> Result<u64> {
        if self.refused_connects > 0 {
            self.refused_connects -= 1;
            return Err(BatchError::Transport("connection refused".into()));
        }
        self.next_connection += 1;
        self.channels
            .insert(self.next_connection, ChannelState::default());
        Ok(self.next_connection)
    }

    /// Drop a connection, requeueing its unacked deliveries.
    fn kill(&mut self, connection: u64) {
        if let Some(channel) = self.channels.remove(&connection) {
            self.requeue(channel.unacked.into_values().collect());
        }
    }

    /// Put bodies back at the head of the queue, keeping their order.
    fn requeue(&mut self, bodies: Vec<Vec<u8>>) {
        for body in bodies.into_iter().rev() {
            self.ready.push_front(body);
        }
    }

    /// Fail the operation if a fault is armed for `point`. A firing fault
    /// kills the connection the way a dropped socket would.
    fn trip(&mut self, point: FaultPoint, connection: u64) -> Result<()> {
        if let Some(pos) = self.faults.iter().position(|f| f.point == point) {
            if self.faults[pos].skip > 0 {
                self.faults[pos].skip -= 1;
            } else {
                self.faults.remove(pos);
                self.kill(connection);
                return Err(BatchError::Transport(format!(
                    "injected fault during {:?}",
                    point
                )));
            }
        }
        if self.channels.contains_key(&connection) {
            Ok(())
        } else {
            Err(closed())
        }
    }

    /// `basic.nack(tag, multiple = true, requeue = true)`
    fn nack_multiple(&mut self, connection: u64, tag: DeliveryTag) -> Result<()> {
        let channel = self.channels.get_mut(&connection).ok_or_else(closed)?;
        let rest = channel.unacked.split_off(&(tag + 1));
        let bodies: Vec<Vec<u8>> = std::mem::replace(&mut channel.unacked, rest)
            .into_values()
            .collect();
        if bodies.is_empty() {
            return Err(self.unknown_tag(connection, tag));
        }
        self.nacks.push(NackRecord {
            tag,
            multiple: true,
        });
        self.requeue(bodies);
        Ok(())
    }

    /// One `basic.nack(tag, multiple = false, requeue = true)` per tag.
    /// Requeued messages keep their relative order.
    fn nack_each(&mut self, connection: u64, tags: &[DeliveryTag]) -> Result<()> {
        let mut bodies = Vec::with_capacity(tags.len());
        for &tag in tags {
            let channel = self.channels.get_mut(&connection).ok_or_else(closed)?;
            match channel.unacked.remove(&tag) {
                Some(body) => bodies.push(body),
                None => {
                    self.requeue(bodies);
                    return Err(self.unknown_tag(connection, tag));
                }
            }
            self.nacks.push(NackRecord {
                tag,
                multiple: false,
            });
        }
        self.requeue(bodies);
        Ok(())
    }

    /// PRECONDITION_FAILED: an unknown delivery tag closes the channel.
    fn unknown_tag(&mut self, connection: u64, tag: DeliveryTag) -> BatchError {
        self.kill(connection);
        BatchError::Transport(format!("unknown delivery tag {}", tag))
    }
}

/// Shared handle to an in-process broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a client connection with the given channel-wide prefetch
    /// (0 = unlimited).
    pub fn connect(&self, prefetch: u16) -> Result<MemoryQueue> {
        let connection = self.lock().open()?;
        Ok(MemoryQueue {
            broker: self.clone(),
            connection: Some(connection),
            prefetch: prefetch as usize,
            ledger: DeliveryLedger::default(),
        })
    }

    /// Enqueue a raw message body, bypassing job encoding.
    pub fn publish_raw(&self, body: impl Into<Vec<u8>>) {
        self.lock().ready.push_back(body.into());
    }

    /// Ready (deliverable) messages.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Delivered but not yet acknowledged messages across all connections.
    pub fn unacked_len(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn ack_count(&self) -> usize {
        self.lock().acked.len()
    }

    /// Jobs that have been acknowledged, in ack order.
    pub fn acked_jobs(&self) -> Vec<Job> {
        self.lock()
            .acked
            .iter()
            .filter_map(|body| job::decode(body).ok())
            .collect()
    }

    pub fn rejected_count(&self) -> usize {
        self.lock().rejected
    }

    pub fn nacks(&self) -> Vec<NackRecord> {
        self.lock().nacks.clone()
    }

    /// Make the next operation of kind `point` fail with a transport error
    /// and kill the connection it ran on.
    pub fn fail_next(&self, point: FaultPoint) {
        self.fail_after(point, 0);
    }

    /// Like [`MemoryBroker::fail_next`], but let `skip` operations of kind
    /// `point` succeed first. Armed faults fire in the order they were armed.
    pub fn fail_after(&self, point: FaultPoint, skip: usize) {
        self.lock().faults.push(ArmedFault { point, skip });
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connects(&self, count: usize) {
        self.lock().refused_connects = count;
    }

    /// Kill every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.kill(id);
        }
    }
}

/// One client connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryQueue {
    broker: MemoryBroker,
    connection: Option<u64>,
    prefetch: usize,
    ledger: DeliveryLedger,
}

impl MemoryQueue {
    fn connection(&self) -> Result<u64> {
        self.connection.ok_or_else(closed)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&mut self, job: &Job) -> Result<()> {
        let connection = self.connection()?;
        let body = job::encode(job)?;
        let mut state = self.broker.lock();
        state.trip(FaultPoint::Publish, connection)?;
        state.ready.push_back(body);
        Ok(())
    }

    async fn take(&mut self, max: usize) -> Result<Claim> {
        let connection = self.connection()?;
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        state.trip(FaultPoint::Claim, connection)?;

        // The broker pushes up to the prefetch window as soon as the
        // consumer starts, regardless of how many the client wants.
        let channel = state.channels.get_mut(&connection).ok_or_else(closed)?;
        let window = if self.prefetch == 0 {
            usize::MAX
        } else {
            self.prefetch.saturating_sub(channel.unacked.len())
        };
        let mut pushed = Vec::new();
        while pushed.len() < window {
            let Some(body) = state.ready.pop_front() else {
                break;
            };
            channel.next_tag += 1;
            channel.unacked.insert(channel.next_tag, body.clone());
            pushed.push((channel.next_tag, body));
        }

        let mut jobs = Vec::new();
        let mut overflow_tags = Vec::new();
        for (tag, body) in pushed {
            if jobs.len() >= max {
                overflow_tags.push(tag);
                continue;
            }
            match job::decode(&body) {
                Ok(job) => jobs.push(ClaimedJob {
                    job,
                    handle: self.ledger.retain(tag),
                }),
                Err(e) => {
                    tracing::error!(delivery_tag = tag, error = %e, "Rejecting malformed job message");
                    channel.unacked.remove(&tag);
                    state.rejected += 1;
                }
            }
        }

        Ok(Claim {
            jobs,
            overflow: self.ledger.overflow(overflow_tags),
        })
    }

    async fn return_overflow(&mut self, overflow: Overflow) -> Result<()> {
        if !self.ledger.is_current(overflow.generation) {
            return Ok(());
        }
        let connection = self.connection()?;
        let plan = self.ledger.plan(&overflow);
        let mut state = self.broker.lock();
        match plan {
            NackPlan::Cumulative(tag) => state.nack_multiple(connection, tag),
            NackPlan::Individual(tags) => state.nack_each(connection, &tags),
        }
    }

    async fn ack(&mut self, handle: DeliveryHandle) -> Result<AckOutcome> {
        if !self.ledger.settle(&handle) {
            return Ok(AckOutcome::Stale);
        }
        let connection = self.connection()?;
        let mut guard = self.broker.lock();
        let state = &mut *guard;
        state.trip(FaultPoint::Ack, connection)?;
        let channel = state.channels.get_mut(&connection).ok_or_else(closed)?;
        match channel.unacked.remove(&handle.tag) {
            Some(body) => {
                state.acked.push(body);
                Ok(AckOutcome::Acked)
            }
            None => Err(state.unknown_tag(connection, handle.tag)),
        }
    }

    async fn release_all(&mut self) -> Result<()> {
        let Some(last) = self.ledger.drain() else {
            return Ok(());
        };
        let connection = self.connection()?;
        self.broker.lock().nack_multiple(connection, last)
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.ledger.advance();
        let mut state = self.broker.lock();
        if let Some(old) = self.connection.take() {
            state.kill(old);
        }
        self.connection = Some(state.open()?);
        Ok(())
    }

    async fn queue_depth(&mut self) -> Result<u32> {
        let connection = self.connection()?;
        let state = self.broker.lock();
        if !state.channels.contains_key(&connection) {
            return Err(closed());
        }
        Ok(state.ready.len() as u32)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            self.broker.lock().kill(connection);
        }
        Ok(())
    }
}
