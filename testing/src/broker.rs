//! In-memory broker for tests.
//!
//! Every topic is a single partition (0) whose offsets are indices into the
//! topic's log. Each consumer reads every message of its subscribed topics
//! from the beginning, in global publish order. Failures can be injected for
//! publish, subscribe, and poll.

use pharmonico_core::broker::{BrokerError, BrokerFuture, BrokerMessage, Consumer, Producer};
use pharmonico_core::envelope::Envelope;
use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    message: BrokerMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    logs: HashMap<String, Vec<LogEntry>>,
    next_seq: u64,
    committed: HashMap<String, i64>,
    commit_count: usize,
    failing_polls: usize,
    failing_publishes: usize,
    rejected_topics: HashSet<String>,
    reject_subscribe: bool,
    shut_down: bool,
    producer_closed: bool,
    consumers_closed: usize,
}

/// Shared in-memory log. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer handle.
    #[must_use]
    pub fn producer(&self) -> InMemoryProducer {
        InMemoryProducer {
            broker: self.clone(),
        }
    }

    /// New consumer reading from offset 0 of every subscribed topic.
    #[must_use]
    pub fn consumer(&self) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            topics: Vec::new(),
            positions: HashMap::new(),
            subscribed: false,
            closed: false,
        }
    }

    /// Append a message directly, as if an external producer had published it.
    pub fn inject(&self, topic: &str, key: &[u8], value: &[u8]) -> BrokerMessage {
        let message = {
            let mut state = self.lock();
            Self::append(&mut state, topic, key, value)
        };
        self.notify.notify_waiters();
        message
    }

    /// All messages published to `topic`.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<BrokerMessage> {
        self.lock()
            .logs
            .get(topic)
            .map(|log| log.iter().map(|entry| entry.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages on `topic` decoded as envelopes; undecodable messages are skipped.
    #[must_use]
    pub fn envelopes(&self, topic: &str) -> Vec<Envelope> {
        self.published(topic)
            .iter()
            .filter_map(|message| Envelope::decode(&message.value).ok())
            .collect()
    }

    /// Highest committed offset of `topic`.
    #[must_use]
    pub fn committed_offset(&self, topic: &str) -> Option<i64> {
        self.lock().committed.get(topic).copied()
    }

    /// Total number of commits.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.lock().commit_count
    }

    /// Fail the next `n` polls with a transport error.
    pub fn fail_next_polls(&self, n: usize) {
        self.lock().failing_polls = n;
    }

    /// Fail the next `n` publishes, whatever the topic.
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().failing_publishes = n;
    }

    /// Reject every publish to `topic`.
    pub fn reject_topic(&self, topic: &str) {
        self.lock().rejected_topics.insert(topic.to_string());
    }

    /// Reject subscriptions.
    pub fn reject_subscribe(&self, reject: bool) {
        self.lock().reject_subscribe = reject;
    }

    /// Make every subsequent poll return [`BrokerError::Closed`].
    pub fn shut_down(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    /// Whether a producer was closed.
    #[must_use]
    pub fn producer_closed(&self) -> bool {
        self.lock().producer_closed
    }

    /// Number of consumers that called `close`.
    #[must_use]
    pub fn consumers_closed(&self) -> usize {
        self.lock().consumers_closed
    }

    /// Wait until `topic` holds at least `count` messages.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for(&self, topic: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            if self.lock().logs.get(topic).map_or(0, Vec::len) >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().logs.get(topic).map_or(0, Vec::len) >= count;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(state: &mut BrokerState, topic: &str, key: &[u8], value: &[u8]) -> BrokerMessage {
        let seq = state.next_seq;
        state.next_seq += 1;
        let log = state.logs.entry(topic.to_string()).or_default();
        #[allow(clippy::cast_possible_wrap)]
        let offset = log.len() as i64;
        let message = BrokerMessage::new(topic, key, value).at(0, offset);
        log.push(LogEntry {
            seq,
            message: message.clone(),
        });
        message
    }
}

/// Producer side of [`InMemoryBroker`].
#[derive(Debug, Clone)]
pub struct InMemoryProducer {
    broker: InMemoryBroker,
}

impl Producer for InMemoryProducer {
    fn publish<'a>(&'a self, topic: &'a str, key: &'a [u8], value: &'a [u8]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut state = self.broker.lock();
                if state.rejected_topics.contains(topic) {
                    return Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: "topic rejected".to_string(),
                    });
                }
                if state.failing_publishes > 0 {
                    state.failing_publishes -= 1;
                    return Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: "injected publish failure".to_string(),
                    });
                }
                InMemoryBroker::append(&mut state, topic, key, value);
            }
            self.broker.notify.notify_waiters();
            Ok(())
        })
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.broker.lock().producer_closed = true;
            Ok(())
        })
    }
}

/// Consumer side of [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topics: Vec<String>,
    positions: HashMap<String, usize>,
    subscribed: bool,
    closed: bool,
}

impl InMemoryConsumer {
    fn next_ready(&mut self) -> Result<Option<BrokerMessage>, BrokerError> {
        let mut state = self.broker.lock();
        if self.closed || state.shut_down {
            return Err(BrokerError::Closed);
        }
        if !self.subscribed {
            return Err(BrokerError::NotSubscribed);
        }
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(BrokerError::Transport("injected poll failure".to_string()));
        }

        let next = self
            .topics
            .iter()
            .filter_map(|topic| {
                let position = self.positions.get(topic).copied().unwrap_or(0);
                state
                    .logs
                    .get(topic)
                    .and_then(|log| log.get(position))
                    .map(|entry| (entry.seq, topic.clone(), entry.message.clone()))
            })
            .min_by_key(|(seq, _, _)| *seq);

        Ok(next.map(|(_, topic, message)| {
            *self.positions.entry(topic).or_insert(0) += 1;
            message
        }))
    }
}

impl Consumer for InMemoryConsumer {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        if self.broker.lock().reject_subscribe {
            return Err(BrokerError::SubscriptionFailed {
                topics: topics.to_vec(),
                reason: "injected subscribe failure".to_string(),
            });
        }
        self.topics = topics.to_vec();
        self.subscribed = true;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<BrokerMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let notify = Arc::clone(&self.broker.notify);
        loop {
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();

            if let Some(message) = self.next_ready()? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let committed = state.committed.entry(message.topic.clone()).or_insert(-1);
        *committed = (*committed).max(message.offset);
        state.commit_count += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if !self.closed {
            self.closed = true;
            self.broker.lock().consumers_closed += 1;
        }
        Ok(())
    }
}
