//! Request-Many Executor (spec §4.H): one request that may collect many
//! replies from many responders, bounded by `max_wait`/`max_count`/
//! `max_interval`. Backs the Discovery Client's `ping`/`info`/`stats`
//! fan-out (spec §4.I).

use crate::bus::{is_no_responders, Bus, Message, SubscribeLimits, Subscription};
use crate::error::Result;
use async_nats::HeaderMap;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Termination bounds for one request-many call (spec §4.H).
#[derive(Clone, Copy, Debug)]
pub struct RequestManyConfig {
    /// Overall deadline from the initial request. Defaults to 500ms.
    pub max_wait: Duration,
    /// Stop once this many replies have been collected.
    pub max_count: Option<u64>,
    /// Stop if the gap since the last reply (or the initial request)
    /// exceeds this.
    pub max_interval: Option<Duration>,
}

impl Default for RequestManyConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_millis(500),
            max_count: None,
            max_interval: None,
        }
    }
}

/// The lazy, streaming form: call [`RequestMany::next`] repeatedly, the
/// same termination rules applying on every call. Unsubscribes on every
/// exit path, including the consumer simply dropping the stream early,
/// because dropping the underlying subscription is itself enough to stop
/// delivery (spec §4.H).
pub struct RequestMany {
    subscription: Box<dyn Subscription>,
    deadline: Instant,
    max_count: Option<u64>,
    max_interval: Option<Duration>,
    last_rx: Instant,
    count: u64,
    done: bool,
}

impl RequestMany {
    /// Allocate a fresh inbox, subscribe to it, and publish `payload` on
    /// `subject` with `reply` set to that inbox (spec §4.H steps 1-2).
    pub(crate) async fn start(
        bus: &dyn Bus,
        subject: &str,
        payload: Bytes,
        headers: Option<HeaderMap>,
        config: RequestManyConfig,
    ) -> Result<Self> {
        let inbox = bus.new_inbox();
        let subscription = bus.subscribe(&inbox, None, SubscribeLimits::default()).await?;
        bus.publish_with_reply(subject, &inbox, payload, headers).await?;
        let now = Instant::now();
        Ok(Self {
            subscription,
            deadline: now + config.max_wait,
            max_count: config.max_count,
            max_interval: config.max_interval,
            last_rx: now,
            count: 0,
            done: false,
        })
    }

    /// The next reply, or `None` once any termination condition has been
    /// hit. Never errors on timeout termination (spec §4.H).
    pub async fn next(&mut self) -> Option<Message> {
        if self.done {
            return None;
        }

        let interval_deadline = self.max_interval.map(|interval| self.last_rx + interval);
        let bound = match interval_deadline {
            Some(interval_deadline) => interval_deadline.min(self.deadline),
            None => self.deadline,
        };
        let now = Instant::now();
        if now >= bound {
            self.finish().await;
            return None;
        }

        match tokio::time::timeout(bound - now, self.subscription.next()).await {
            Err(_elapsed) => {
                self.finish().await;
                None
            }
            Ok(None) => {
                self.finish().await;
                None
            }
            Ok(Some(message)) if is_no_responders(&message) => {
                self.finish().await;
                None
            }
            Ok(Some(message)) => {
                self.last_rx = Instant::now();
                self.count += 1;
                if self.max_count.is_some_and(|max| self.count >= max) {
                    self.finish().await;
                }
                Some(message)
            }
        }
    }

    async fn finish(&mut self) {
        self.done = true;
        let _ = self.subscription.unsubscribe().await;
    }

    /// The eager form: drain every reply until termination (spec §4.H).
    pub async fn collect(mut self) -> Vec<Message> {
        let mut results = Vec::new();
        while let Some(message) = self.next().await {
            results.push(message);
        }
        results
    }
}

/// Eagerly collect every reply to a request-many on `subject` (spec §4.H).
pub async fn request_many(
    bus: &dyn Bus,
    subject: &str,
    payload: Bytes,
    headers: Option<HeaderMap>,
    config: RequestManyConfig,
) -> Result<Vec<Message>> {
    Ok(RequestMany::start(bus, subject, payload, headers, config)
        .await?
        .collect()
        .await)
}

/// The lazy, streaming form of [`request_many`] (spec §4.H).
pub async fn request_many_stream(
    bus: &dyn Bus,
    subject: &str,
    payload: Bytes,
    headers: Option<HeaderMap>,
    config: RequestManyConfig,
) -> Result<RequestMany> {
    RequestMany::start(bus, subject, payload, headers, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;

    async fn responder(bus: MockBus, subject: &'static str, replies: Vec<&'static str>) {
        let mut sub = bus
            .subscribe(subject, None, SubscribeLimits::default())
            .await
            .unwrap();
        let message = sub.next().await.unwrap();
        let reply = message.reply.unwrap();
        for body in replies {
            bus.publish(reply.as_str(), Bytes::from_static(body.as_bytes()), None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn collects_replies_until_max_count() {
        let bus = MockBus::new();
        tokio::spawn(responder(bus.clone(), "multi", vec!["a", "b", "c"]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let replies = request_many(
            &bus,
            "multi",
            Bytes::new(),
            None,
            RequestManyConfig {
                max_wait: Duration::from_millis(200),
                max_count: Some(2),
                max_interval: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].payload, Bytes::from_static(b"a"));
        assert_eq!(replies[1].payload, Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn no_responders_terminates_with_zero_results() {
        let bus = MockBus::new();
        let replies = request_many(
            &bus,
            "nobody-home",
            Bytes::new(),
            None,
            RequestManyConfig::default(),
        )
        .await
        .unwrap();
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn max_wait_bounds_total_time_with_no_max_count() {
        let bus = MockBus::new();
        tokio::spawn(responder(bus.clone(), "slow", vec!["only"]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let replies = request_many(
            &bus,
            "slow",
            Bytes::new(),
            None,
            RequestManyConfig {
                max_wait: Duration::from_millis(80),
                max_count: None,
                max_interval: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(replies.len(), 1);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn streaming_form_can_be_abandoned_early() {
        let bus = MockBus::new();
        tokio::spawn(responder(bus.clone(), "stream", vec!["a", "b"]));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut stream = request_many_stream(
            &bus,
            "stream",
            Bytes::new(),
            None,
            RequestManyConfig {
                max_wait: Duration::from_millis(200),
                max_count: None,
                max_interval: None,
            },
        )
        .await
        .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"a"));
        drop(stream);

        // The only inbox allocated in this test; dropping the stream early
        // must still unsubscribe it, or it leaks in `Broker::subscribers`
        // forever (spec §4.H).
        assert!(!bus.has_subscribers("_INBOX.0"));
    }
}
