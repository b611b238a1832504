//! Endpoint (spec §4.D): one subscription + handler + live statistics.

use crate::bus::{Bus, SubscribeLimits};
use crate::error::Result;
use crate::request::Request;
use crate::shutdown::{self, StopHandle};
use crate::stats::{EndpointStats, Stats};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// A user-supplied endpoint handler.
///
/// Handlers that return `Ok(())` without calling `respond`/`respond_error`
/// on the `Request` are *not* auto-replied, but still count as a
/// successful request (spec §4.C). Handlers that return `Err` are
/// treated as an unhandled error: if no reply has been sent yet, the
/// endpoint automatically sends `respond_error(500, "<error text>")`
/// (spec §4.C, Open Question resolved per spec.md §9).
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one request. The handler borrows the request so that the
    /// endpoint retains the ability to auto-reply after the handler
    /// returns an error (spec §4.C).
    async fn handle(&self, request: &Request) -> std::result::Result<(), String>;
}

/// Configuration for one endpoint (spec §6).
pub struct EndpointConfig {
    /// Endpoint name; unique within its owning service.
    pub name: String,
    /// Handler invoked for each request.
    pub handler: Arc<dyn Handler>,
    /// Subject to subscribe on, relative to the owning group, if any.
    /// Defaults to `name`.
    pub subject: Option<String>,
    /// Queue group; inherited from the enclosing group/service if unset.
    pub queue_group: Option<String>,
    /// User-defined metadata, reported verbatim by `info()`.
    pub metadata: HashMap<String, String>,
    /// Advisory subscription pending-message cap.
    pub pending_msgs_limit: Option<u64>,
    /// Advisory subscription pending-byte cap.
    pub pending_bytes_limit: Option<u64>,
}

impl EndpointConfig {
    /// Start building a config for `name`/`handler` with no overrides.
    pub fn new(name: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            handler,
            subject: None,
            queue_group: None,
            metadata: HashMap::new(),
            pending_msgs_limit: None,
            pending_bytes_limit: None,
        }
    }

    /// Override the subscribed subject (defaults to the endpoint name).
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Override the queue group (defaults to the enclosing queue group).
    pub fn queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }

    /// Attach endpoint metadata, reported in `info()`.
    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A description of an endpoint as it is served (spec §3): its name,
/// fully composed subject, effective queue group and metadata.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EndpointInfo {
    /// Endpoint name.
    pub name: String,
    /// Fully composed subscription subject.
    pub subject: String,
    /// Effective queue group.
    pub queue_group: String,
    /// User-defined metadata.
    pub metadata: HashMap<String, String>,
}

/// One subscription, handler and live statistics block (spec §4.D).
pub struct Endpoint {
    info: EndpointInfo,
    stats: Arc<Stats>,
    stop: StopHandle,
}

impl Endpoint {
    /// Bind a subscription for `config` under `subject`/`queue_group`
    /// (already composed by the owning [`crate::group::Group`]/
    /// [`crate::service::Service`]) and start its serve loop.
    pub(crate) async fn start(
        bus: Box<dyn Bus>,
        subject: String,
        queue_group: String,
        config: EndpointConfig,
    ) -> Result<Self> {
        let limits = SubscribeLimits {
            pending_msgs_limit: config.pending_msgs_limit,
            pending_bytes_limit: config.pending_bytes_limit,
        };
        let mut subscription = bus
            .subscribe(&subject, Some(&queue_group), limits)
            .await?;

        let info = EndpointInfo {
            name: config.name.clone(),
            subject,
            queue_group,
            metadata: config.metadata,
        };
        let stats = Arc::new(Stats::default());

        let (stop, shutdown::StopSignal { mut stop_rx, done_tx }) = shutdown::pair();

        let handler = config.handler;
        let serve_stats = stats.clone();
        let serve_name = info.name.clone();
        tokio::spawn(async move {
            // Tracks every in-flight handler invocation so `stop()` can wait
            // for them to actually finish before unblocking (spec §5:
            // "in-flight handlers run to completion, then unsubscribe").
            let mut handlers = tokio::task::JoinSet::new();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        let _ = subscription.drain().await;
                        while let Some(message) = subscription.next().await {
                            spawn_serve_one(&mut handlers, bus.clone(), handler.clone(), serve_stats.clone(), serve_name.clone(), message);
                        }
                        break;
                    }
                    message = subscription.next() => {
                        match message {
                            Some(message) => spawn_serve_one(&mut handlers, bus.clone(), handler.clone(), serve_stats.clone(), serve_name.clone(), message),
                            None => break,
                        }
                    }
                    // Reap finished handlers opportunistically so `handlers`
                    // doesn't grow unbounded over a long-lived endpoint.
                    Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                }
            }
            while handlers.join_next().await.is_some() {}
            let _ = done_tx.send(());
        });

        Ok(Self { info, stats, stop })
    }

    /// This endpoint's descriptor, for `Service::info()`.
    pub fn info(&self) -> EndpointInfo {
        self.info.clone()
    }

    /// A consistent snapshot of this endpoint's live counters.
    pub fn stats(&self) -> EndpointStats {
        self.stats.snapshot()
    }

    /// Zero this endpoint's counters; safe to call concurrently with the
    /// serve loop (spec §4.D).
    pub fn reset(&self) {
        self.stats.reset();
    }

    /// Drain and unsubscribe; idempotent (spec §4.D). Returns once no
    /// further messages will be delivered to this endpoint (invariant 5).
    pub(crate) async fn stop(&self) {
        self.stop.stop().await;
    }
}

fn spawn_serve_one(
    handlers: &mut tokio::task::JoinSet<()>,
    bus: Box<dyn Bus>,
    handler: Arc<dyn Handler>,
    stats: Arc<Stats>,
    endpoint_name: String,
    message: async_nats::Message,
) {
    handlers.spawn(async move {
        serve_one(bus, handler, stats, endpoint_name, message).await;
    });
}

async fn serve_one(
    bus: Box<dyn Bus>,
    handler: Arc<dyn Handler>,
    stats: Arc<Stats>,
    endpoint_name: String,
    message: async_nats::Message,
) {
    let request = Request::new(bus, message);
    let started = Instant::now();
    let outcome = handler.handle(&request).await;
    let elapsed_ns = started.elapsed().as_nanos() as u64;

    let error_text = match outcome {
        Ok(()) => request.state().error_reply(),
        Err(message) => {
            if !request.has_replied() {
                if let Err(respond_err) = request.respond_error(500, &message, None, None).await {
                    error!(
                        endpoint = %endpoint_name,
                        error = %respond_err,
                        "failed to auto-reply with a 500 after a handler error"
                    );
                }
            } else {
                warn!(
                    endpoint = %endpoint_name,
                    %message,
                    "handler errored after already replying"
                );
            }
            Some(message)
        }
    };

    stats.record(elapsed_ns, error_text.as_deref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use bytes::Bytes;
    use std::time::Duration;

    struct Echo;
    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, request: &Request) -> std::result::Result<(), String> {
            request.respond(Bytes::from_static(b"pong"), None).await.unwrap();
            Ok(())
        }
    }

    struct Failing;
    #[async_trait]
    impl Handler for Failing {
        async fn handle(&self, _request: &Request) -> std::result::Result<(), String> {
            Err("boom".to_string())
        }
    }

    #[tokio::test]
    async fn handler_reply_is_observed_by_requester() {
        let bus = MockBus::new();
        let endpoint = Endpoint::start(
            Box::new(bus.clone()),
            "endpoint1".to_string(),
            "q".to_string(),
            EndpointConfig::new("endpoint1", Arc::new(Echo)),
        )
        .await
        .unwrap();

        let reply = bus
            .request("endpoint1", Bytes::new(), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"pong"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = endpoint.stats();
        assert_eq!(stats.num_requests, 1);
        assert_eq!(stats.num_errors, 0);
    }

    #[tokio::test]
    async fn handler_error_auto_replies_500() {
        let bus = MockBus::new();
        let endpoint = Endpoint::start(
            Box::new(bus.clone()),
            "endpoint1".to_string(),
            "q".to_string(),
            EndpointConfig::new("endpoint1", Arc::new(Failing)),
        )
        .await
        .unwrap();

        let reply = bus
            .request("endpoint1", Bytes::new(), None, Duration::from_secs(1))
            .await
            .unwrap();
        let headers = reply.headers.unwrap();
        assert_eq!(
            headers.get("Nats-Service-Error-Code").unwrap().as_str(),
            "500"
        );
        assert_eq!(
            headers.get("Nats-Service-Error").unwrap().as_str(),
            "boom"
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = endpoint.stats();
        assert_eq!(stats.num_requests, 1);
        assert_eq!(stats.num_errors, 1);
        assert_eq!(stats.last_error, "boom");
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_handler_to_finish() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Slow(Arc<AtomicBool>);
        #[async_trait]
        impl Handler for Slow {
            async fn handle(&self, _request: &Request) -> std::result::Result<(), String> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.0.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let bus = MockBus::new();
        let completed = Arc::new(AtomicBool::new(false));
        let endpoint = Endpoint::start(
            Box::new(bus.clone()),
            "endpoint1".to_string(),
            "q".to_string(),
            EndpointConfig::new("endpoint1", Arc::new(Slow(completed.clone()))),
        )
        .await
        .unwrap();

        bus.publish("endpoint1", Bytes::new(), None).await.unwrap();
        endpoint.stop().await;

        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_prevents_further_delivery() {
        let bus = MockBus::new();
        let endpoint = Endpoint::start(
            Box::new(bus.clone()),
            "endpoint1".to_string(),
            "q".to_string(),
            EndpointConfig::new("endpoint1", Arc::new(Echo)),
        )
        .await
        .unwrap();

        endpoint.stop().await;
        endpoint.stop().await; // idempotent

        let result = bus
            .request("endpoint1", Bytes::new(), None, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(crate::bus::is_no_responders(&result));
    }
}
