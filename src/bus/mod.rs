//! Bus Interface (spec §4.B): the contract the core requires from the
//! underlying pub/sub transport. The core never talks to a NATS connection
//! directly — it only ever sees a `Box<dyn Bus>` / `Box<dyn Subscription>`.

pub mod mock;
pub mod nats;

use crate::error::{self, Result};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use dyn_clonable::clonable;
use std::time::Duration;

pub use async_nats::Message;

/// A freshly-allocated unique reply subject, see [`Bus::new_inbox`].
pub type Inbox = String;

/// Per-subscription flow-control caps (spec §4.B, §6).
#[derive(Clone, Copy, Debug, Default)]
pub struct SubscribeLimits {
    /// Soft cap on the number of buffered, undelivered messages.
    pub pending_msgs_limit: Option<u64>,
    /// Soft cap on the total bytes of buffered, undelivered messages.
    pub pending_bytes_limit: Option<u64>,
}

/// A live subscription: a lazy sequence of [`Message`]s plus
/// `unsubscribe`/`drain` lifecycle operations (spec §4.B).
#[async_trait]
pub trait Subscription: Send {
    /// Wait for and return the next message, or `None` once the
    /// subscription has been drained/unsubscribed and has no more
    /// messages buffered.
    async fn next(&mut self) -> Option<Message>;

    /// Stop accepting new messages and immediately discard anything
    /// still buffered.
    async fn unsubscribe(&mut self) -> Result<()>;

    /// Stop accepting new messages, but let any already-buffered or
    /// in-flight messages be delivered before the sequence ends.
    async fn drain(&mut self) -> Result<()>;
}

/// Messaging Bus trait with publish and request/reply semantics
/// (spec §4.B). Implementations must be safe for concurrent use: the same
/// `Bus` is shared by every [`crate::service::Service`], [`crate::endpoint::Endpoint`]
/// and discovery client in a process (spec §5).
#[async_trait]
#[clonable]
pub trait Bus: Clone + Send + Sync {
    /// Publish a message with no delivery guarantees.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<()>;

    /// Publish a message carrying an explicit `reply` subject, without
    /// waiting for any response. Used by the request-many executor
    /// (spec §4.H), which wants many replies on one inbox rather than the
    /// single reply `request` waits for.
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<()>;

    /// Subscribe to `subject`, optionally within a queue group, with
    /// advisory pending message/byte caps.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        limits: SubscribeLimits,
    ) -> Result<Box<dyn Subscription>>;

    /// Publish a request and wait up to `timeout` for a single reply.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
        timeout: Duration,
    ) -> Result<Message>;

    /// Allocate a fresh, unique reply subject.
    fn new_inbox(&self) -> Inbox;
}

/// `true` if `message` is the bus's "no responders" sentinel: an empty
/// payload carrying a `503` status (spec §6).
pub fn is_no_responders(message: &Message) -> bool {
    message.status == Some(async_nats::StatusCode::NO_RESPONDERS) && message.payload.is_empty()
}

pub(crate) fn bus_failure<E: Into<async_nats::Error>>(source: E) -> error::Error {
    error::Error::BusFailure {
        source: source.into(),
    }
}
