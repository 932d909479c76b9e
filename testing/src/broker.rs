//! In-memory broker with durable queue groups and ack-wait redelivery.
//!
//! Behaves like the production bus where the runtime can observe it:
//!
//! - every publish is stored in a per-subject log and gets a sequence number
//! - each `(subject, durable name)` pair is one durable queue group; every
//!   message goes to exactly one live member of the group
//! - a delivery that is nacked, dropped or not settled within `ack_wait` goes
//!   to the back of the group's queue once the ack wait has elapsed
//! - a group outlives its members, so resubscribing under the same durable
//!   name resumes with whatever was not acknowledged
//!
//! Each member holds at most `max_in_flight` unsettled deliveries (default 1).
//!
//! Fault injection: [`InMemoryBroker::swallow_publish_acks`],
//! [`InMemoryBroker::fail_next_publishes`], [`InMemoryBroker::inject_raw`] and
//! [`InMemoryBroker::disconnect_subscribers`].

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap on poisoned locks
#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketbus_core::envelope::Envelope;
use ticketbus_core::event_bus::{
    AckDecision, AckHandle, BusError, BusFuture, Delivery, DeliveryStream, EventBus, PublishAck,
    RawMessage, StartPosition, SubscriptionOptions,
};
use ticketbus_core::events::DomainEvent;
use ticketbus_core::subject::Subject;
use ticketbus_runtime::connection::{ConnectionOptions, Connector};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

type GroupKey = (Subject, String);
type MemberTx = mpsc::UnboundedSender<Result<Delivery, BusError>>;

#[derive(Clone)]
struct Stored {
    sequence: u64,
    data: Vec<u8>,
}

#[derive(Clone, Copy, Debug)]
struct Ready {
    index: usize,
    attempt: u32,
}

struct Member {
    id: u64,
    tx: MemberTx,
    in_flight: usize,
}

struct Group {
    ack_wait: Duration,
    ready: VecDeque<Ready>,
    members: Vec<Member>,
    next_member: usize,
    in_flight: usize,
    acked: Vec<u64>,
    deliveries: HashMap<u64, u32>,
}

#[derive(Default)]
struct State {
    closed: bool,
    next_sequence: u64,
    next_member_id: u64,
    logs: HashMap<Subject, Vec<Stored>>,
    groups: HashMap<GroupKey, Group>,
    swallow_acks: usize,
    fail_publishes: usize,
}

impl State {
    fn append(&mut self, subject: Subject, data: Vec<u8>) -> u64 {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let log = self.logs.entry(subject).or_default();
        log.push(Stored { sequence, data });
        let index = log.len() - 1;
        for ((group_subject, _), group) in &mut self.groups {
            if *group_subject == subject {
                group.ready.push_back(Ready { index, attempt: 1 });
            }
        }
        sequence
    }
}

/// Shared in-memory broker. Clones share state.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    max_in_flight: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("InMemoryBroker")
            .field("messages", &state.next_sequence)
            .field("groups", &state.groups.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            max_in_flight: 1,
        }
    }

    /// Allow up to `max_in_flight` unsettled deliveries per member.
    #[must_use]
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Persist (and deliver) the next `count` publishes without ever
    /// acknowledging them to the publisher.
    pub fn swallow_publish_acks(&self, count: usize) {
        self.state.lock().unwrap().swallow_acks = count;
    }

    /// Reject the next `count` publishes without persisting them.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().unwrap().fail_publishes = count;
    }

    /// Append arbitrary bytes to `subject` as if a publisher had sent them.
    pub fn inject_raw(&self, subject: Subject, data: Vec<u8>) -> u64 {
        let sequence = self.state.lock().unwrap().append(subject, data);
        self.pump_all();
        sequence
    }

    /// End every open delivery stream; unsettled deliveries are requeued
    /// after their ack wait, as if the consumers had crashed.
    pub fn disconnect_subscribers(&self) {
        let mut state = self.state.lock().unwrap();
        for group in state.groups.values_mut() {
            group.members.clear();
            group.next_member = 0;
        }
    }

    /// Envelopes persisted on `subject`, in publish order. Injected bytes
    /// that do not decode are skipped.
    #[must_use]
    pub fn published(&self, subject: Subject) -> Vec<Envelope> {
        let state = self.state.lock().unwrap();
        state
            .logs
            .get(&subject)
            .map(|log| {
                log.iter()
                    .filter_map(|stored| Envelope::decode(&stored.data).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Decoded events persisted on `subject`, in publish order.
    #[must_use]
    pub fn published_events(&self, subject: Subject) -> Vec<DomainEvent> {
        self.published(subject)
            .iter()
            .filter_map(|envelope| DomainEvent::decode(envelope.subject, &envelope.data).ok())
            .collect()
    }

    /// Number of messages persisted on `subject`.
    #[must_use]
    pub fn message_count(&self, subject: Subject) -> usize {
        self.state
            .lock()
            .unwrap()
            .logs
            .get(&subject)
            .map_or(0, Vec::len)
    }

    /// Sequences acknowledged by the group, in acknowledgment order.
    #[must_use]
    pub fn acked(&self, subject: Subject, durable_name: &str) -> Vec<u64> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(&(subject, durable_name.to_string()))
            .map(|group| group.acked.clone())
            .unwrap_or_default()
    }

    /// How many times `sequence` has been handed to the group.
    #[must_use]
    pub fn delivery_count(&self, subject: Subject, durable_name: &str, sequence: u64) -> u32 {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(&(subject, durable_name.to_string()))
            .and_then(|group| group.deliveries.get(&sequence).copied())
            .unwrap_or(0)
    }

    /// Whether every group has nothing queued and nothing in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .groups
            .values()
            .all(|group| group.ready.is_empty() && group.in_flight == 0)
    }

    /// Wait until [`is_idle`](Self::is_idle) holds, for at most `timeout`.
    /// Returns whether the broker went idle.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the group has acknowledged at least `count` messages, for
    /// at most `timeout`. Returns whether it got there.
    pub async fn wait_for_acks(
        &self,
        subject: Subject,
        durable_name: &str,
        count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acked(subject, durable_name).len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn pump_all(&self) {
        let keys: Vec<GroupKey> = self.state.lock().unwrap().groups.keys().cloned().collect();
        for key in keys {
            self.pump(&key);
        }
    }

    /// Hand queued messages to members with spare capacity, round-robin.
    fn pump(&self, key: &GroupKey) {
        let mut state = self.state.lock().unwrap();
        let State { logs, groups, .. } = &mut *state;
        let Some(group) = groups.get_mut(key) else {
            return;
        };
        let log = logs.get(&key.0).map_or(&[][..], Vec::as_slice);

        while let Some(ready) = group.ready.front().copied() {
            group.members.retain(|member| !member.tx.is_closed());
            let count = group.members.len();
            if count == 0 {
                return;
            }

            let Some(offset) = (0..count).find(|i| {
                group.members[(group.next_member + i) % count].in_flight < self.max_in_flight
            }) else {
                return;
            };
            let slot = (group.next_member + offset) % count;
            group.next_member = (slot + 1) % count;
            group.ready.pop_front();

            let Some(stored) = log.get(ready.index) else {
                continue;
            };
            let (ack, rx) = AckHandle::pair();
            let delivery = Delivery {
                message: RawMessage {
                    subject: key.0.as_str().to_string(),
                    sequence: stored.sequence,
                    attempt: ready.attempt,
                    data: stored.data.clone(),
                },
                ack,
            };

            let member = &mut group.members[slot];
            if member.tx.send(Ok(delivery)).is_err() {
                group.ready.push_front(ready);
                continue;
            }
            member.in_flight += 1;
            group.in_flight += 1;
            *group.deliveries.entry(stored.sequence).or_default() += 1;

            let broker = self.clone();
            let watch_key = key.clone();
            let member_id = member.id;
            let sequence = stored.sequence;
            let ack_wait = group.ack_wait;
            tokio::spawn(async move {
                broker
                    .watch(watch_key, member_id, sequence, ready, ack_wait, rx)
                    .await;
            });
        }
    }

    /// Wait for the verdict on one delivery and requeue it unless acked.
    async fn watch(
        &self,
        key: GroupKey,
        member_id: u64,
        sequence: u64,
        ready: Ready,
        ack_wait: Duration,
        rx: oneshot::Receiver<AckDecision>,
    ) {
        let deadline = Instant::now() + ack_wait;
        let acked = matches!(
            tokio::time::timeout_at(deadline, rx).await,
            Ok(Ok(AckDecision::Ack))
        );
        if !acked {
            tokio::time::sleep_until(deadline).await;
        }

        {
            let mut state = self.state.lock().unwrap();
            let Some(group) = state.groups.get_mut(&key) else {
                return;
            };
            group.in_flight = group.in_flight.saturating_sub(1);
            if let Some(member) = group.members.iter_mut().find(|m| m.id == member_id) {
                member.in_flight = member.in_flight.saturating_sub(1);
            }
            if acked {
                group.acked.push(sequence);
            } else {
                group.ready.push_back(Ready {
                    index: ready.index,
                    attempt: ready.attempt + 1,
                });
            }
        }

        self.pump(&key);
    }
}

impl EventBus for InMemoryBroker {
    fn publish(&self, envelope: &Envelope) -> BusFuture<'_, PublishAck> {
        let encoded = envelope.encode();
        let subject = envelope.subject;
        Box::pin(async move {
            let data = encoded.map_err(|e| BusError::PublishFailed {
                subject,
                reason: e.to_string(),
            })?;

            let (sequence, swallow) = {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(BusError::Closed);
                }
                if state.fail_publishes > 0 {
                    state.fail_publishes -= 1;
                    return Err(BusError::PublishFailed {
                        subject,
                        reason: "injected failure".to_string(),
                    });
                }
                let swallow = state.swallow_acks > 0;
                if swallow {
                    state.swallow_acks -= 1;
                }
                (state.append(subject, data), swallow)
            };

            self.pump_all();
            if swallow {
                std::future::pending::<()>().await;
            }
            Ok(PublishAck { sequence })
        })
    }

    fn subscribe(&self, options: &SubscriptionOptions) -> BusFuture<'_, DeliveryStream> {
        let options = options.clone();
        Box::pin(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let key = (options.subject, options.durable_name.clone());
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(BusError::Closed);
                }
                state.next_member_id += 1;
                let id = state.next_member_id;
                let backlog = match options.start {
                    StartPosition::AllAvailable => {
                        state.logs.get(&options.subject).map_or(0, Vec::len)
                    }
                    StartPosition::NewOnly => 0,
                };
                let group = state.groups.entry(key.clone()).or_insert_with(|| Group {
                    ack_wait: options.ack_wait,
                    ready: (0..backlog).map(|index| Ready { index, attempt: 1 }).collect(),
                    members: Vec::new(),
                    next_member: 0,
                    in_flight: 0,
                    acked: Vec::new(),
                    deliveries: HashMap::new(),
                });
                group.ack_wait = options.ack_wait;
                group.members.push(Member {
                    id,
                    tx,
                    in_flight: 0,
                });
            }

            self.pump(&key);
            let stream = async_stream::stream! {
                while let Some(delivery) = rx.recv().await {
                    yield delivery;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(&self) -> BusFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            for group in state.groups.values_mut() {
                group.members.clear();
            }
            Ok(())
        })
    }
}

/// [`Connector`] handing out one shared [`InMemoryBroker`], optionally
/// failing the first few attempts.
#[derive(Debug)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

impl InMemoryConnector {
    /// Connector for `broker`.
    #[must_use]
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` connection attempts.
    #[must_use]
    pub fn fail_connects(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Connection attempts made so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for InMemoryConnector {
    fn connect<'a>(&'a self, options: &'a ConnectionOptions) -> BusFuture<'a, Arc<dyn EventBus>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BusError::ConnectionFailed(format!(
                    "{} refused connection",
                    options.url
                )));
            }
            Ok(Arc::new(self.broker.clone()) as Arc<dyn EventBus>)
        })
    }
}
