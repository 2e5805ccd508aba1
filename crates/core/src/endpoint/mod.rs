//! # Agent Endpoints
//!
//! Bridge between a named pipeline participant and the shared bus.
//! Supplies per-kind handler dispatch and request/response helpers with
//! deadlines on top of the bus's broadcast fan-out.
//!
//! ## Exchange Flow
//!
//! ```text
//! Dev ── send(query) ──▶ Bus ── fan-out ──▶ Arch dispatcher ── handler
//!  ▲                                                             │
//!  └────────── reply (in_reply_to = query.id) ◀──────────────────┘
//! ```
//!
//! Every endpoint subscribes to the wildcard topic and discards messages
//! not addressed to it. The bus stays a trivially correct broadcaster;
//! recipient filtering is the endpoint's job.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::bus::{MessageBus, QueryFilter, Subscriber};
use crate::config::BusConfig;
use crate::message::{Message, MessageId, MessageKind, Topic};

/// Business logic for one message kind.
///
/// Returning `Ok(Some(body))` makes the endpoint publish `body` back to the
/// original sender as an automatic reply; `Ok(None)` stays silent. Errors
/// are converted into an error-kind message to the sender, never propagated
/// into bus fan-out.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Option<String>>;
}

/// Adapt a plain closure into a [`Handler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&Message) -> Result<Option<String>> + Send + Sync + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F> Handler for FnHandler<F>
    where
        F: Fn(&Message) -> Result<Option<String>> + Send + Sync + 'static,
    {
        async fn handle(&self, message: &Message) -> Result<Option<String>> {
            (self.0)(message)
        }
    }

    Arc::new(FnHandler(f))
}

/// A named participant's adapter onto the shared bus.
pub struct AgentEndpoint {
    name: String,
    bus: Arc<MessageBus>,
    handlers: Mutex<HashMap<MessageKind, Arc<dyn Handler>>>,
    default_reply_timeout: Duration,
}

impl AgentEndpoint {
    /// Attach a participant to the bus, subscribed to the wildcard topic.
    pub fn attach(name: impl Into<String>, bus: Arc<MessageBus>) -> Result<Arc<Self>> {
        Self::attach_with_timeout(name, bus, BusConfig::default().default_reply_timeout())
    }

    /// Attach with the reply deadline taken from configuration.
    pub fn attach_with_config(
        name: impl Into<String>,
        bus: Arc<MessageBus>,
        config: &BusConfig,
    ) -> Result<Arc<Self>> {
        Self::attach_with_timeout(name, bus, config.default_reply_timeout())
    }

    /// Attach with an explicit default deadline for [`AgentEndpoint::ask`].
    pub fn attach_with_timeout(
        name: impl Into<String>,
        bus: Arc<MessageBus>,
        default_reply_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let endpoint = Arc::new(Self {
            name: name.into(),
            bus,
            handlers: Mutex::new(HashMap::new()),
            default_reply_timeout,
        });
        let subscriber: Arc<dyn Subscriber> = endpoint.clone();
        endpoint.bus.subscribe(Topic::Any, subscriber)?;
        Ok(endpoint)
    }

    /// The participant name messages must carry to reach this endpoint.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove this endpoint's wildcard registration. Returns whether a
    /// registration was still present.
    pub fn detach(self: &Arc<Self>) -> Result<bool> {
        let subscriber: Arc<dyn Subscriber> = self.clone();
        self.bus.unsubscribe(&Topic::Any, &subscriber)
    }

    /// Register the handler for a kind, replacing any previous one.
    pub fn register_handler(&self, kind: MessageKind, handler: Arc<dyn Handler>) -> Result<()> {
        self.lock_handlers()?.insert(kind, handler);
        Ok(())
    }

    /// Start a message from this endpoint; chain builder calls to address it.
    pub fn compose(&self, kind: MessageKind, payload: impl Into<String>) -> Message {
        Message::new(&self.name, kind, payload)
    }

    /// Publish fire-and-forget; returns the new message's id.
    pub async fn send(&self, message: Message) -> Result<MessageId> {
        self.bus.publish(message).await
    }

    /// Publish, then wait up to `timeout` for the first correlated reply.
    ///
    /// The waiter is registered before publishing, so a reply produced
    /// during inline fan-out is never missed. Returns `None` once the
    /// deadline passes with no reply; any retry is the caller's business.
    pub async fn send_and_wait(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Option<Message>> {
        let id = message.id;
        let waiter = self.bus.wait_for_reply(id)?;
        self.bus.publish(message).await?;

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            // The bus dropped our waiter without sending; treat as no reply.
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                self.bus.forget_reply_waiters(id);
                tracing::debug!(%id, "reply deadline passed for {}", self.name);
                Ok(None)
            }
        }
    }

    /// Ask another participant a question and wait for the answer text,
    /// with the endpoint's default deadline.
    pub async fn ask(&self, recipient: &str, text: &str) -> Result<Option<String>> {
        self.ask_with_timeout(recipient, text, self.default_reply_timeout)
            .await
    }

    /// Ask with an explicit deadline.
    pub async fn ask_with_timeout(
        &self,
        recipient: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let query = self.compose(MessageKind::Query, text).to(recipient);
        Ok(self
            .send_and_wait(query, timeout)
            .await?
            .map(|reply| reply.payload))
    }

    /// Recent bus traffic, newest first, optionally narrowed to the given
    /// kinds and to messages sent by or addressed to this endpoint.
    pub fn history(
        &self,
        limit: usize,
        kinds: &[MessageKind],
        only_own: bool,
    ) -> Result<Vec<Message>> {
        let mut messages = self.bus.query(&QueryFilter::default())?;
        if only_own {
            messages.retain(|m| {
                m.sender == self.name || m.recipient.as_deref() == Some(self.name.as_str())
            });
        }
        if !kinds.is_empty() {
            messages.retain(|m| kinds.contains(&m.kind));
        }
        messages.truncate(limit);
        Ok(messages)
    }

    fn lock_handlers(&self) -> Result<MutexGuard<'_, HashMap<MessageKind, Arc<dyn Handler>>>> {
        self.handlers
            .lock()
            .map_err(|e| anyhow::anyhow!("Handler table lock error: {}", e))
    }
}

#[async_trait]
impl Subscriber for AgentEndpoint {
    async fn on_message(&self, message: &Message) -> Result<()> {
        if message.recipient.as_deref() != Some(self.name.as_str()) {
            return Ok(());
        }
        tracing::debug!("{} received: {}", self.name, message);

        let handler = self.lock_handlers()?.get(&message.kind).cloned();
        let Some(handler) = handler else {
            tracing::debug!("{}: no handler for kind {}", self.name, message.kind);
            return Ok(());
        };

        match handler.handle(message).await {
            Ok(Some(body)) => {
                let reply = self
                    .compose(MessageKind::reply_to(&message.kind), body)
                    .to(&message.sender)
                    .replying_to(message.id)
                    .with_meta("auto_reply", true.into());
                self.bus.publish(reply).await?;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("{}: handler for {} failed: {}", self.name, message.kind, e);
                let notice = self
                    .compose(
                        MessageKind::Error,
                        format!("Error handling {} message: {}", message.kind, e),
                    )
                    .to(&message.sender)
                    .replying_to(message.id)
                    .with_meta("error", true.into());
                self.bus.publish(notice).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FaultCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn wired() -> (Arc<MessageBus>, Arc<AgentEndpoint>, Arc<AgentEndpoint>) {
        let bus = Arc::new(MessageBus::in_memory());
        let dev = AgentEndpoint::attach("Dev", bus.clone()).unwrap();
        let arch = AgentEndpoint::attach("Arch", bus.clone()).unwrap();
        (bus, dev, arch)
    }

    #[tokio::test]
    async fn test_request_reply_exchange() {
        let (_bus, dev, arch) = wired();
        arch.register_handler(
            MessageKind::Query,
            handler_fn(|msg| Ok(Some(format!("answer to: {}", msg.payload)))),
        )
        .unwrap();

        let query = dev.compose(MessageKind::Query, "which storage engine?").to("Arch");
        let query_id = query.id;
        let reply = dev
            .send_and_wait(query, Duration::from_secs(1))
            .await
            .unwrap()
            .expect("handler replied in time");

        assert_eq!(reply.in_reply_to, Some(query_id));
        assert_eq!(reply.sender, "Arch");
        assert_eq!(reply.payload, "answer to: which storage engine?");
        assert_eq!(reply.kind, MessageKind::reply_to(&MessageKind::Query));
        assert_eq!(reply.metadata.get("auto_reply"), Some(&true.into()));
    }

    #[tokio::test]
    async fn test_ask_returns_reply_payload() {
        let (_bus, dev, arch) = wired();
        arch.register_handler(MessageKind::Query, handler_fn(|_| Ok(Some("sqlite".to_string()))))
            .unwrap();

        let answer = dev
            .ask_with_timeout("Arch", "storage?", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(answer.as_deref(), Some("sqlite"));
    }

    #[tokio::test]
    async fn test_unhandled_query_times_out_after_deadline() {
        let (_bus, dev, _arch) = wired();

        let started = Instant::now();
        let answer = dev
            .ask_with_timeout("Arch", "anyone home?", Duration::from_millis(200))
            .await
            .unwrap();

        assert!(answer.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_message() {
        let (bus, dev, arch) = wired();
        arch.register_handler(
            MessageKind::Query,
            handler_fn(|_| anyhow::bail!("backend exploded")),
        )
        .unwrap();

        // Another subscriber of the same kind still runs after the failure.
        struct Count(AtomicUsize);
        #[async_trait]
        impl Subscriber for Count {
            async fn on_message(&self, _message: &Message) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let count = Arc::new(Count(AtomicUsize::new(0)));
        bus.subscribe(Topic::Any, count.clone()).unwrap();

        let query = dev.compose(MessageKind::Query, "boom?").to("Arch");
        let query_id = dev.send(query).await.unwrap();

        let errors = bus
            .query(&QueryFilter::default().of_kind(MessageKind::Error))
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].in_reply_to, Some(query_id));
        assert_eq!(errors[0].recipient.as_deref(), Some("Dev"));
        assert!(errors[0].payload.contains("backend exploded"));

        // Both the query and the error notice passed through the wildcard.
        assert_eq!(count.0.load(Ordering::SeqCst), 2);
        // Handler failures become bus traffic, not swallowed faults.
        assert!(bus
            .faults()
            .unwrap()
            .iter()
            .all(|f| f.category != FaultCategory::Subscriber));
    }

    #[tokio::test]
    async fn test_messages_for_other_recipients_ignored() {
        let (_bus, dev, arch) = wired();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        arch.register_handler(
            MessageKind::Status,
            handler_fn(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        )
        .unwrap();

        dev.send(dev.compose(MessageKind::Status, "for dev only").to("Dev"))
            .await
            .unwrap();
        dev.send(dev.compose(MessageKind::Status, "broadcast"))
            .await
            .unwrap();
        dev.send(dev.compose(MessageKind::Status, "for arch").to("Arch"))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_silent_handler_sends_nothing() {
        let (bus, dev, arch) = wired();
        arch.register_handler(MessageKind::Status, handler_fn(|_| Ok(None)))
            .unwrap();

        let notice = dev.compose(MessageKind::Status, "fyi").to("Arch");
        let id = dev.send(notice).await.unwrap();

        assert!(bus.replies_to(id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_scopes_and_caps() {
        let (_bus, dev, arch) = wired();

        dev.send(dev.compose(MessageKind::Status, "s1").to("Arch"))
            .await
            .unwrap();
        arch.send(arch.compose(MessageKind::Status, "s2").to("Dev"))
            .await
            .unwrap();
        arch.send(arch.compose(MessageKind::Artifact, "a1").to("Other"))
            .await
            .unwrap();

        let own = dev.history(10, &[], true).unwrap();
        assert_eq!(own.len(), 2);

        let status_only = dev.history(10, &[MessageKind::Status], false).unwrap();
        assert_eq!(status_only.len(), 2);

        let capped = dev.history(1, &[], false).unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].payload, "a1");
    }

    #[tokio::test]
    async fn test_detached_endpoint_stops_handling() {
        let (_bus, dev, arch) = wired();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        arch.register_handler(
            MessageKind::Status,
            handler_fn(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }),
        )
        .unwrap();

        assert!(arch.detach().unwrap());
        dev.send(dev.compose(MessageKind::Status, "anyone?").to("Arch"))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
