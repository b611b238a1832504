//! An in-process `Bus` test double (spec-ambient: see SPEC_FULL.md §2).
//!
//! Backs the end-to-end scenarios in spec §8 without requiring a running
//! NATS server: subjects are matched verbatim (no wildcard support is
//! needed by this crate — the core never subscribes on wildcards), queue
//! groups pick one subscriber round-robin, and `request` publishes then
//! waits on a one-shot inbox the way a real bus would.

use super::{Bus, Message, SubscribeLimits, Subscription};
use crate::error::{Error, Result};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct Subscriber {
    id: u64,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Broker {
    subscribers: HashMap<String, Vec<Subscriber>>,
    round_robin: HashMap<String, usize>,
}

impl Broker {
    fn remove(&mut self, subject: &str, id: u64) {
        if let Some(subs) = self.subscribers.get_mut(subject) {
            subs.retain(|sub| sub.id != id);
            if subs.is_empty() {
                self.subscribers.remove(subject);
            }
        }
    }
}

/// An in-memory [`Bus`] for unit tests. Cloning shares the same broker
/// state, exactly like cloning a real `async-nats` client shares one
/// connection.
#[derive(Clone)]
pub struct MockBus {
    broker: Arc<Mutex<Broker>>,
    inbox_seq: Arc<AtomicU64>,
    sub_seq: Arc<AtomicU64>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    /// Create an empty bus with no subscribers.
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Mutex::new(Broker::default())),
            inbox_seq: Arc::new(AtomicU64::new(0)),
            sub_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn deliver(&self, subject: &str, message: Message) {
        let mut broker = self.broker.lock().unwrap();
        let Some(subs) = broker.subscribers.get(subject) else {
            return;
        };
        if subs.is_empty() {
            return;
        }
        // Partition into direct (no queue group) and per-queue-group subscribers.
        let mut direct = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, sub) in subs.iter().enumerate() {
            match &sub.queue_group {
                None => direct.push(idx),
                Some(group) => groups.entry(group.clone()).or_default().push(idx),
            }
        }
        let mut targets = direct;
        for (group, members) in groups {
            let counter = broker.round_robin.entry(group).or_insert(0);
            let chosen = members[*counter % members.len()];
            *counter = counter.wrapping_add(1);
            targets.push(chosen);
        }
        let subs = broker.subscribers.get(subject).unwrap();
        for idx in targets {
            let _ = subs[idx].sender.send(message.clone());
        }
    }

    fn no_responders(subject: &str) -> Message {
        Message {
            subject: subject.to_string().into(),
            reply: None,
            payload: Bytes::new(),
            headers: None,
            status: Some(async_nats::StatusCode::NO_RESPONDERS),
            description: None,
            length: 0,
        }
    }

    pub(crate) fn has_subscribers(&self, subject: &str) -> bool {
        self.broker
            .lock()
            .unwrap()
            .subscribers
            .get(subject)
            .is_some_and(|subs| !subs.is_empty())
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        self.deliver(
            subject,
            Message {
                subject: subject.to_string().into(),
                reply: None,
                payload,
                headers,
                status: None,
                description: None,
                length: 0,
            },
        );
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        self.deliver(
            subject,
            Message {
                subject: subject.to_string().into(),
                reply: Some(reply.to_string().into()),
                payload,
                headers,
                status: None,
                description: None,
                length: 0,
            },
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        _limits: SubscribeLimits,
    ) -> Result<Box<dyn Subscription>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.sub_seq.fetch_add(1, Ordering::Relaxed);
        self.broker
            .lock()
            .unwrap()
            .subscribers
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                id,
                queue_group: queue_group.map(str::to_string),
                sender,
            });
        Ok(Box::new(MockSubscription {
            receiver,
            broker: self.broker.clone(),
            subject: subject.to_string(),
            id,
        }))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
        timeout: Duration,
    ) -> Result<Message> {
        if !self.has_subscribers(subject) {
            return Ok(Self::no_responders(subject));
        }
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox, None, SubscribeLimits::default()).await?;
        self.deliver(
            subject,
            Message {
                subject: subject.to_string().into(),
                reply: Some(inbox.clone().into()),
                payload,
                headers,
                status: None,
                description: None,
                length: 0,
            },
        );
        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) | Err(_) => Err(Error::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }

    fn new_inbox(&self) -> String {
        format!("_INBOX.{}", self.inbox_seq.fetch_add(1, Ordering::Relaxed))
    }
}

struct MockSubscription {
    receiver: mpsc::UnboundedReceiver<Message>,
    broker: Arc<Mutex<Broker>>,
    subject: String,
    id: u64,
}

impl MockSubscription {
    fn deregister(&self) {
        self.broker.lock().unwrap().remove(&self.subject, self.id);
    }
}

impl Drop for MockSubscription {
    /// Guarantees unsubscribe on every exit path, including the consumer
    /// simply dropping the stream early (spec §4.H), matching
    /// `async_nats::Subscriber`'s own `Drop` behavior that the production
    /// `NatsBus` path already relies on.
    fn drop(&mut self) {
        self.deregister();
    }
}

#[async_trait]
impl Subscription for MockSubscription {
    async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.deregister();
        self.receiver.close();
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        // Stop accepting new messages but let already-queued ones flow
        // through `next()`: `close()` only blocks further sends.
        self.deregister();
        self.receiver.close();
        Ok(())
    }
}
