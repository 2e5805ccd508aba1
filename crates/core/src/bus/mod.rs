//! # Message Bus
//!
//! Central publish/subscribe registry for agent traffic: ordered message
//! history, per-kind subscriptions with a wildcard, correlation waiters for
//! request/response exchanges, and an optional day-partitioned journal.
//!
//! The bus is an explicit instance shared as `Arc<MessageBus>` and injected
//! into every endpoint at startup. A single mutex guards the in-memory
//! state; it is never held across an await. Fan-out runs after the lock is
//! released, so a subscriber may publish a reply from inside its callback
//! without deadlocking.

pub mod journal;

pub use journal::Journal;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::config::BusConfig;
use crate::message::{Message, MessageId, MessageKind, Topic};

/// Oldest faults drop first once the diagnostic list reaches this size.
const FAULT_CAP: usize = 256;

/// A participant in bus fan-out.
///
/// Errors are isolated per subscriber: a failing callback is recorded as a
/// [`BusFault`] and never stops delivery to the remaining subscribers.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn on_message(&self, message: &Message) -> Result<()>;
}

/// Criteria for querying bus history. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub kind: Option<MessageKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub in_reply_to: Option<MessageId>,
    pub limit: Option<usize>,
}

impl QueryFilter {
    /// Match messages from this sender.
    pub fn from_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Match messages addressed to this recipient.
    pub fn to_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Match messages of this kind.
    pub fn of_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Match messages at or after this time.
    pub fn since(mut self, time: DateTime<Utc>) -> Self {
        self.since = Some(time);
        self
    }

    /// Match messages at or before this time.
    pub fn until(mut self, time: DateTime<Utc>) -> Self {
        self.until = Some(time);
        self
    }

    /// Match replies to this message.
    pub fn replying_to(mut self, id: MessageId) -> Self {
        self.in_reply_to = Some(id);
        self
    }

    /// Cap the number of returned messages.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, message: &Message) -> bool {
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if message.recipient.as_deref() != Some(recipient.as_str()) {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if &message.kind != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if message.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if message.timestamp > until {
                return false;
            }
        }
        if let Some(original) = self.in_reply_to {
            if message.in_reply_to != Some(original) {
                return false;
            }
        }
        true
    }
}

/// What kind of failure a [`BusFault`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCategory {
    /// A subscriber callback returned an error during fan-out
    Subscriber,
    /// A journal append failed; delivery was unaffected
    Journal,
    /// A publish reused an id already accepted by this bus
    DuplicateId,
    /// Journal replay skipped records it could not parse
    MalformedRecord,
}

/// A failure the bus swallowed, kept for inspection.
///
/// Faults never propagate to the publisher; they surface here and through
/// `tracing` so tests and operators can see what delivery degraded.
#[derive(Debug, Clone, Serialize)]
pub struct BusFault {
    pub category: FaultCategory,
    pub message_id: Option<MessageId>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl BusFault {
    fn new(category: FaultCategory, message_id: Option<MessageId>, detail: impl Into<String>) -> Self {
        Self {
            category,
            message_id,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Default)]
struct BusState {
    /// All accepted messages, in accept order (chronological after replay)
    messages: Vec<Message>,
    /// Ids accepted so far, for duplicate and replay dedup
    seen: HashSet<MessageId>,
    /// Registration order is delivery order within a topic
    subscriptions: HashMap<Topic, Vec<Arc<dyn Subscriber>>>,
    /// Correlation waiters, woken by the first matching reply
    waiters: HashMap<MessageId, Vec<oneshot::Sender<Message>>>,
    faults: VecDeque<BusFault>,
    last_accepted: Option<DateTime<Utc>>,
}

impl BusState {
    fn push_fault(&mut self, fault: BusFault) {
        if self.faults.len() == FAULT_CAP {
            self.faults.pop_front();
        }
        self.faults.push_back(fault);
    }
}

/// The shared message bus.
pub struct MessageBus {
    state: Mutex<BusState>,
    journal: Option<Journal>,
}

impl MessageBus {
    /// A bus with no durable journal.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            journal: None,
        }
    }

    /// A bus journaling every published message under `dir`.
    pub async fn with_journal(dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(BusState::default()),
            journal: Some(Journal::open(dir).await?),
        })
    }

    /// Build a bus from configuration, honoring the storage override.
    pub async fn from_config(config: &BusConfig) -> Result<Self> {
        match config.resolved_storage_dir() {
            Some(dir) => Self::with_journal(dir).await,
            None => Ok(Self::in_memory()),
        }
    }

    /// The journal, when persistence is configured.
    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BusState>> {
        self.state.lock().map_err(|e| anyhow::anyhow!("Bus lock error: {}", e))
    }

    fn record_fault(&self, fault: BusFault) {
        if let Ok(mut state) = self.state.lock() {
            state.push_fault(fault);
        }
    }

    /// Publish a message: record it, journal it, wake correlation waiters,
    /// then fan out to kind subscribers followed by wildcard subscribers.
    ///
    /// Subscriber and journal failures are recorded as faults and never
    /// reach the caller. A duplicate id is rejected without delivery and
    /// the existing id is returned. `Err` only on a poisoned lock.
    #[tracing::instrument(skip(self, message), fields(id = %message.id, kind = %message.kind, sender = %message.sender))]
    pub async fn publish(&self, message: Message) -> Result<MessageId> {
        let mut message = message;
        let id = message.id;

        let delivery = {
            let mut state = self.lock_state()?;
            if !state.seen.insert(id) {
                state.push_fault(BusFault::new(
                    FaultCategory::DuplicateId,
                    Some(id),
                    "message id already accepted; delivery skipped",
                ));
                None
            } else {
                // Accept order defines the clock: never let a stale creation
                // time move history backwards.
                if let Some(last) = state.last_accepted {
                    if message.timestamp < last {
                        message.timestamp = last;
                    }
                }
                state.last_accepted = Some(message.timestamp);

                let mut targets: Vec<Arc<dyn Subscriber>> = Vec::new();
                if let Some(subs) = state.subscriptions.get(&Topic::Kind(message.kind.clone())) {
                    targets.extend(subs.iter().cloned());
                }
                if let Some(subs) = state.subscriptions.get(&Topic::Any) {
                    targets.extend(subs.iter().cloned());
                }
                let waiters = match message.in_reply_to {
                    Some(original) => state.waiters.remove(&original).unwrap_or_default(),
                    None => Vec::new(),
                };
                state.messages.push(message.clone());
                Some((targets, waiters))
            }
        };

        let Some((targets, waiters)) = delivery else {
            tracing::warn!("duplicate message id rejected");
            return Ok(id);
        };

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&message).await {
                tracing::warn!("journal append failed: {}", e);
                self.record_fault(BusFault::new(
                    FaultCategory::Journal,
                    Some(id),
                    format!("append failed: {}", e),
                ));
            }
        }

        for waiter in waiters {
            let _ = waiter.send(message.clone());
        }

        for subscriber in targets {
            if let Err(e) = subscriber.on_message(&message).await {
                tracing::error!("subscriber failed: {}", e);
                self.record_fault(BusFault::new(
                    FaultCategory::Subscriber,
                    Some(id),
                    format!("subscriber failed: {}", e),
                ));
            }
        }

        tracing::debug!("delivered");
        Ok(id)
    }

    /// Register a subscriber for a topic. The same subscriber may be
    /// registered more than once and is then invoked once per registration.
    pub fn subscribe(&self, topic: Topic, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        let mut state = self.lock_state()?;
        state.subscriptions.entry(topic).or_default().push(subscriber);
        Ok(())
    }

    /// Remove one registration, matched by `Arc` identity. Returns whether
    /// a removal occurred.
    pub fn unsubscribe(&self, topic: &Topic, subscriber: &Arc<dyn Subscriber>) -> Result<bool> {
        let mut state = self.lock_state()?;
        let Some(subs) = state.subscriptions.get_mut(topic) else {
            return Ok(false);
        };
        match subs.iter().position(|s| Arc::ptr_eq(s, subscriber)) {
            Some(position) => {
                subs.remove(position);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Messages matching `filter`, newest first.
    ///
    /// History is stored in accept order and timestamps are clamped
    /// monotonic, so reversing storage order is newest-first with ties
    /// broken by acceptance.
    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<Message>> {
        let state = self.lock_state()?;
        let mut matches: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        matches.reverse();
        if let Some(limit) = filter.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    /// Point lookup by id.
    pub fn get(&self, id: MessageId) -> Result<Option<Message>> {
        let state = self.lock_state()?;
        Ok(state.messages.iter().find(|m| m.id == id).cloned())
    }

    /// All replies to `id`, in publish order. Empty when the id was never
    /// published or nothing answered it.
    pub fn replies_to(&self, id: MessageId) -> Result<Vec<Message>> {
        let state = self.lock_state()?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.in_reply_to == Some(id))
            .cloned()
            .collect())
    }

    /// Register a correlation waiter for replies to `id`.
    ///
    /// The receiver resolves with the first matching reply, immediately if
    /// one is already in history. Register before publishing the request so
    /// a reply produced during inline fan-out cannot be missed.
    pub fn wait_for_reply(&self, id: MessageId) -> Result<oneshot::Receiver<Message>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock_state()?;
        if let Some(existing) = state.messages.iter().find(|m| m.in_reply_to == Some(id)).cloned() {
            let _ = tx.send(existing);
            return Ok(rx);
        }
        state.waiters.entry(id).or_default().push(tx);
        Ok(rx)
    }

    /// Drop waiters for `id` whose receiver has given up.
    pub fn forget_reply_waiters(&self, id: MessageId) {
        if let Ok(mut state) = self.state.lock() {
            let abandoned = match state.waiters.get_mut(&id) {
                Some(waiters) => {
                    waiters.retain(|tx| !tx.is_closed());
                    waiters.is_empty()
                }
                None => false,
            };
            if abandoned {
                state.waiters.remove(&id);
            }
        }
    }

    /// Rebuild in-memory history from the journal, skipping ids already
    /// present. Returns the number of newly loaded messages. Replay fills
    /// history only; nothing is re-delivered to subscribers.
    pub async fn load_from_log(&self) -> Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let (records, skipped) = journal.load_all().await?;

        let mut state = self.lock_state()?;
        if skipped > 0 {
            state.push_fault(BusFault::new(
                FaultCategory::MalformedRecord,
                None,
                format!("{} malformed journal lines skipped", skipped),
            ));
        }
        let mut loaded = 0;
        for message in records {
            if state.seen.insert(message.id) {
                state.messages.push(message);
                loaded += 1;
            }
        }
        // Partitions come back in directory order; restore chronology.
        state.messages.sort_by_key(|m| m.timestamp);
        state.last_accepted = state.messages.last().map(|m| m.timestamp);
        tracing::info!(loaded, "history restored from journal");
        Ok(loaded)
    }

    /// Swallowed failures, oldest first.
    pub fn faults(&self) -> Result<Vec<BusFault>> {
        let state = self.lock_state()?;
        Ok(state.faults.iter().cloned().collect())
    }
}
