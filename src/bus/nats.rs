//! `Bus` implementation backed by a real `async-nats` connection.
//!
//! Grounded on the teacher's `NatsMessageBus` (`mbus_nats.rs`), which wraps
//! a concrete connection behind the same `Bus` trait it defines in
//! `lib.rs`. The teacher's `nats` 0.8 crate predates header support, so
//! this implementation is built on `async-nats` instead (see DESIGN.md).

use super::{bus_failure, Bus, Message, SubscribeLimits, Subscription};
use crate::error::{Error, Result};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::warn;

/// A [`Bus`] backed by a connected [`async_nats::Client`].
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Wrap an already-connected client.
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    /// Connect to `url` and wrap the resulting client.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url).await.map_err(bus_failure)?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        match headers {
            Some(headers) => self
                .client
                .publish_with_headers(subject.to_string(), headers, payload)
                .await
                .map_err(bus_failure),
            None => self
                .client
                .publish(subject.to_string(), payload)
                .await
                .map_err(bus_failure),
        }
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        match headers {
            Some(headers) => self
                .client
                .publish_with_reply_and_headers(subject.to_string(), reply.to_string(), headers, payload)
                .await
                .map_err(bus_failure),
            None => self
                .client
                .publish_with_reply(subject.to_string(), reply.to_string(), payload)
                .await
                .map_err(bus_failure),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        limits: SubscribeLimits,
    ) -> Result<Box<dyn Subscription>> {
        let subscriber = match queue_group {
            Some(queue_group) => self
                .client
                .queue_subscribe(subject.to_string(), queue_group.to_string())
                .await
                .map_err(bus_failure)?,
            None => self
                .client
                .subscribe(subject.to_string())
                .await
                .map_err(bus_failure)?,
        };
        Ok(Box::new(NatsSubscription {
            inner: subscriber,
            limits,
            delivered_msgs: 0,
            delivered_bytes: 0,
            capped: false,
        }))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
        timeout: Duration,
    ) -> Result<Message> {
        let mut request = async_nats::Request::new().payload(payload).timeout(Some(timeout));
        if let Some(headers) = headers {
            request = request.headers(headers);
        }
        self.client
            .send_request(subject.to_string(), request)
            .await
            .map_err(|source| match source.kind() {
                async_nats::RequestErrorKind::TimedOut => Error::Timeout {
                    subject: subject.to_string(),
                    timeout,
                },
                _ => bus_failure(source),
            })
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }
}

/// Wraps an [`async_nats::Subscriber`] and enforces the advisory
/// `pending_msgs_limit`/`pending_bytes_limit` caps from spec §4.B/§6.
///
/// `async-nats` only exposes a connection-wide subscription buffer
/// capacity, not a per-subscription one (see DESIGN.md), so these limits
/// are enforced here: once exceeded, the subscription is proactively
/// unsubscribed and the sequence ends, rather than silently back-pressuring
/// the server.
struct NatsSubscription {
    inner: async_nats::Subscriber,
    limits: SubscribeLimits,
    delivered_msgs: u64,
    delivered_bytes: u64,
    capped: bool,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<Message> {
        use futures::StreamExt;
        if self.capped {
            return None;
        }
        let message = self.inner.next().await?;
        self.delivered_msgs += 1;
        self.delivered_bytes += message.payload.len() as u64;
        if self
            .limits
            .pending_msgs_limit
            .is_some_and(|limit| self.delivered_msgs > limit)
            || self
                .limits
                .pending_bytes_limit
                .is_some_and(|limit| self.delivered_bytes > limit)
        {
            warn!(
                subject = %message.subject,
                "subscription exceeded its pending limit, unsubscribing"
            );
            self.capped = true;
            let _ = self.inner.unsubscribe().await;
        }
        Some(message)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.inner.unsubscribe().await.map_err(bus_failure)
    }

    async fn drain(&mut self) -> Result<()> {
        self.inner.drain().await.map_err(bus_failure)
    }
}
