//! Discovery Client (spec §4.I): `ping`/`info`/`stats` fan-out over the
//! request-many executor, plus single-instance direct requests and a thin
//! request wrapper that turns `Nats-Service-Error-Code` reply headers
//! into [`Error::ServiceError`].

use crate::bus::Bus;
use crate::control::{PingInfo, ServiceInfo, ServiceStats};
use crate::error::{Error, Result};
use crate::request_many::{request_many, request_many_stream, RequestManyConfig};
use crate::subject::{self, Verb};
use async_nats::{HeaderMap, Message};
use bytes::Bytes;
use std::marker::PhantomData;
use std::time::Duration;

/// Optional overrides for one discovery call; any field left `None` falls
/// back to [`RequestManyConfig::default`] (spec §4.H/§4.I).
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscoveryOptions {
    /// Overall deadline.
    pub max_wait: Option<Duration>,
    /// Stop once this many replies have arrived.
    pub max_count: Option<u64>,
    /// Stop once the inter-arrival gap exceeds this.
    pub max_interval: Option<Duration>,
}

impl DiscoveryOptions {
    fn resolve(self) -> RequestManyConfig {
        let default = RequestManyConfig::default();
        RequestManyConfig {
            max_wait: self.max_wait.unwrap_or(default.max_wait),
            max_count: self.max_count,
            max_interval: self.max_interval,
        }
    }
}

/// A handle for discovering and addressing services over a [`Bus`]
/// (spec §4.I).
#[derive(Clone)]
pub struct Client {
    bus: Box<dyn Bus>,
    api_prefix: String,
}

impl Client {
    /// Build a client with the default `$SRV` control-plane prefix.
    pub fn new(bus: Box<dyn Bus>) -> Self {
        Self::with_api_prefix(bus, subject::DEFAULT_API_PREFIX)
    }

    /// Build a client addressing a non-default control-plane prefix.
    pub fn with_api_prefix(bus: Box<dyn Bus>, api_prefix: impl Into<String>) -> Self {
        Self {
            bus,
            api_prefix: api_prefix.into(),
        }
    }

    /// Send a request and get the response, translating
    /// `Nats-Service-Error-Code`/`Nats-Service-Error` reply headers into
    /// an [`Error::ServiceError`] (spec §4.I). Prefer this over
    /// `Bus::request` directly for exactly that reason.
    pub async fn request(
        &self,
        subject: &str,
        data: Bytes,
        headers: Option<HeaderMap>,
        timeout: Duration,
    ) -> Result<Message> {
        let response = self.bus.request(subject, data, headers, timeout).await?;
        reject_service_error(response)
    }

    /// Ping every instance of `service` (or every service, if `None`),
    /// fanning out via the request-many executor (spec §4.I).
    pub async fn ping(&self, service: Option<&str>, options: DiscoveryOptions) -> Result<Vec<PingInfo>> {
        self.fan_out(Verb::Ping, service, options).await
    }

    /// Fetch `ServiceInfo` from every matching instance.
    pub async fn info(&self, service: Option<&str>, options: DiscoveryOptions) -> Result<Vec<ServiceInfo>> {
        self.fan_out(Verb::Info, service, options).await
    }

    /// Fetch `ServiceStats` from every matching instance.
    pub async fn stats(&self, service: Option<&str>, options: DiscoveryOptions) -> Result<Vec<ServiceStats>> {
        self.fan_out(Verb::Stats, service, options).await
    }

    /// The lazy, streaming form of [`Client::ping`]: yields one `PingInfo`
    /// at a time under the same termination rules, so a caller can stop
    /// consuming early without waiting for `max_wait` to elapse.
    pub async fn ping_stream(
        &self,
        service: Option<&str>,
        options: DiscoveryOptions,
    ) -> Result<DiscoveryStream<PingInfo>> {
        self.fan_out_stream(Verb::Ping, service, options).await
    }

    /// The lazy, streaming form of [`Client::info`].
    pub async fn info_stream(
        &self,
        service: Option<&str>,
        options: DiscoveryOptions,
    ) -> Result<DiscoveryStream<ServiceInfo>> {
        self.fan_out_stream(Verb::Info, service, options).await
    }

    /// The lazy, streaming form of [`Client::stats`].
    pub async fn stats_stream(
        &self,
        service: Option<&str>,
        options: DiscoveryOptions,
    ) -> Result<DiscoveryStream<ServiceStats>> {
        self.fan_out_stream(Verb::Stats, service, options).await
    }

    async fn fan_out_stream<T: serde::de::DeserializeOwned>(
        &self,
        verb: Verb,
        service: Option<&str>,
        options: DiscoveryOptions,
    ) -> Result<DiscoveryStream<T>> {
        let subject = subject::control_subject(verb, service, None, &self.api_prefix)?;
        let inner =
            request_many_stream(self.bus.as_ref(), &subject, Bytes::new(), None, options.resolve())
                .await?;
        Ok(DiscoveryStream {
            inner,
            _marker: PhantomData,
        })
    }

    async fn fan_out<T: serde::de::DeserializeOwned>(
        &self,
        verb: Verb,
        service: Option<&str>,
        options: DiscoveryOptions,
    ) -> Result<Vec<T>> {
        let subject = subject::control_subject(verb, service, None, &self.api_prefix)?;
        let replies = request_many(
            self.bus.as_ref(),
            &subject,
            Bytes::new(),
            None,
            options.resolve(),
        )
        .await?;
        // Lenient: one malformed/older-version responder must not fail
        // discovery for the rest of the fleet (spec §7 — per-reply parse
        // errors only surface once zero valid replies remain), matching
        // `DiscoveryStream::next`'s per-item-not-fatal behavior above.
        let mut parsed = Vec::with_capacity(replies.len());
        let mut last_error = None;
        for message in replies {
            match serde_json::from_slice(&message.payload) {
                Ok(value) => parsed.push(value),
                Err(source) => last_error = Some(source.to_string()),
            }
        }
        if parsed.is_empty() {
            if let Some(message) = last_error {
                return Err(Error::ProtocolError { message });
            }
        }
        Ok(parsed)
    }

    /// A curried view scoped to one service name (spec §4.I).
    pub fn service(&self, name: impl Into<String>) -> ServiceView {
        ServiceView {
            client: self.clone(),
            service: name.into(),
        }
    }

    /// A view addressing a single service instance directly, bypassing
    /// the request-many executor (spec §4.I).
    pub fn instance(&self, service: impl Into<String>, id: impl Into<String>) -> InstanceView {
        InstanceView {
            client: self.clone(),
            service: service.into(),
            id: id.into(),
        }
    }
}

/// The lazy, streaming form shared by [`Client::ping_stream`]/`info_stream`/
/// `stats_stream`: each [`DiscoveryStream::next`] call parses the next raw
/// request-many reply as `T`, under the same termination rules as the
/// eager form (spec §4.H/§4.I; original `RequestManyIterator`/`transform`
/// in `client/client.py`).
pub struct DiscoveryStream<T> {
    inner: crate::request_many::RequestMany,
    _marker: PhantomData<T>,
}

impl<T: serde::de::DeserializeOwned> DiscoveryStream<T> {
    /// The next parsed reply, or `None` once the request-many has
    /// terminated. A reply that fails to parse surfaces as `Some(Err(_))`
    /// rather than ending the stream.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let message = self.inner.next().await?;
        Some(
            serde_json::from_slice(&message.payload).map_err(|source| Error::ProtocolError {
                message: source.to_string(),
            }),
        )
    }
}

/// [`Client::ping`]/`info`/`stats` curried to one service name.
#[derive(Clone)]
pub struct ServiceView {
    client: Client,
    service: String,
}

impl ServiceView {
    /// Ping every instance of this service.
    pub async fn ping(&self, options: DiscoveryOptions) -> Result<Vec<PingInfo>> {
        self.client.ping(Some(&self.service), options).await
    }

    /// Fetch `ServiceInfo` from every instance of this service.
    pub async fn info(&self, options: DiscoveryOptions) -> Result<Vec<ServiceInfo>> {
        self.client.info(Some(&self.service), options).await
    }

    /// Fetch `ServiceStats` from every instance of this service.
    pub async fn stats(&self, options: DiscoveryOptions) -> Result<Vec<ServiceStats>> {
        self.client.stats(Some(&self.service), options).await
    }

    /// A view addressing a single instance of this service.
    pub fn instance(&self, id: impl Into<String>) -> InstanceView {
        self.client.instance(self.service.clone(), id)
    }

    /// The streaming form of [`ServiceView::ping`].
    pub async fn ping_stream(&self, options: DiscoveryOptions) -> Result<DiscoveryStream<PingInfo>> {
        self.client.ping_stream(Some(&self.service), options).await
    }

    /// The streaming form of [`ServiceView::info`].
    pub async fn info_stream(&self, options: DiscoveryOptions) -> Result<DiscoveryStream<ServiceInfo>> {
        self.client.info_stream(Some(&self.service), options).await
    }

    /// The streaming form of [`ServiceView::stats`].
    pub async fn stats_stream(
        &self,
        options: DiscoveryOptions,
    ) -> Result<DiscoveryStream<ServiceStats>> {
        self.client.stats_stream(Some(&self.service), options).await
    }
}

/// Addresses exactly one service instance via plain, single-reply
/// requests rather than request-many fan-out (spec §4.I).
#[derive(Clone)]
pub struct InstanceView {
    client: Client,
    service: String,
    id: String,
}

const DEFAULT_INSTANCE_TIMEOUT: Duration = Duration::from_millis(500);

impl InstanceView {
    /// Ping this instance with an ordinary request/timeout.
    pub async fn ping(&self) -> Result<PingInfo> {
        self.request(Verb::Ping).await
    }

    /// Fetch this instance's `ServiceInfo`.
    pub async fn info(&self) -> Result<ServiceInfo> {
        self.request(Verb::Info).await
    }

    /// Fetch this instance's `ServiceStats`.
    pub async fn stats(&self) -> Result<ServiceStats> {
        self.request(Verb::Stats).await
    }

    async fn request<T: serde::de::DeserializeOwned>(&self, verb: Verb) -> Result<T> {
        let subject = subject::control_subject(
            verb,
            Some(&self.service),
            Some(&self.id),
            &self.client.api_prefix,
        )?;
        let response = self
            .client
            .request(&subject, Bytes::new(), None, DEFAULT_INSTANCE_TIMEOUT)
            .await?;
        serde_json::from_slice(&response.payload).map_err(|source| Error::ProtocolError {
            message: source.to_string(),
        })
    }
}

fn reject_service_error(message: Message) -> Result<Message> {
    if let Some(headers) = &message.headers {
        if let Some(code) = headers.get(crate::request::ERROR_CODE_HEADER) {
            let code: u16 = code.as_str().parse().unwrap_or(0);
            let description = headers
                .get(crate::request::ERROR_DESCRIPTION_HEADER)
                .map(|value| value.as_str().to_string())
                .unwrap_or_default();
            return Err(Error::ServiceError { code, description });
        }
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::endpoint::{EndpointConfig, Handler};
    use crate::request::Request;
    use crate::service::{Service, ServiceConfig};
    use async_trait::async_trait;
    use std::sync::Arc;

    #[tokio::test]
    async fn ping_discovers_one_service() {
        let bus = MockBus::new();
        let service = Service::start(Box::new(bus.clone()), ServiceConfig::new("service1", "0.0.1"))
            .await
            .unwrap();

        let client = Client::new(Box::new(bus));
        let results = client
            .ping(
                None,
                DiscoveryOptions {
                    max_count: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "service1");
        assert_eq!(results[0].id, service.id());
    }

    #[tokio::test]
    async fn instance_view_issues_a_single_direct_request() {
        let bus = MockBus::new();
        let service = Service::start(Box::new(bus.clone()), ServiceConfig::new("service1", "0.0.1"))
            .await
            .unwrap();

        let client = Client::new(Box::new(bus));
        let ping = client.instance("service1", service.id()).ping().await.unwrap();
        assert_eq!(ping.id, service.id());
    }

    #[tokio::test]
    async fn ping_tolerates_one_malformed_reply_among_many() {
        use crate::bus::{Bus as _, SubscribeLimits};

        let bus = MockBus::new();
        Service::start(Box::new(bus.clone()), ServiceConfig::new("service1", "0.0.1"))
            .await
            .unwrap();

        // A second "responder" on the same scope that replies with garbage.
        let mut garbage_sub = bus
            .subscribe("$SRV.PING", None, SubscribeLimits::default())
            .await
            .unwrap();
        let garbage_bus = bus.clone();
        tokio::spawn(async move {
            let message = garbage_sub.next().await.unwrap();
            if let Some(reply) = message.reply {
                let _ = garbage_bus
                    .publish(reply.as_str(), Bytes::from_static(b"not json"), None)
                    .await;
            }
        });

        let client = Client::new(Box::new(bus));
        let results = client
            .ping(
                None,
                DiscoveryOptions {
                    max_count: Some(2),
                    max_wait: Some(Duration::from_millis(100)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "service1");
    }

    #[tokio::test]
    async fn ping_stream_yields_replies_lazily() {
        let bus = MockBus::new();
        let service = Service::start(Box::new(bus.clone()), ServiceConfig::new("service1", "0.0.1"))
            .await
            .unwrap();

        let client = Client::new(Box::new(bus));
        let mut stream = client
            .ping_stream(
                None,
                DiscoveryOptions {
                    max_count: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id, service.id());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn service_error_headers_become_service_error() {
        let bus = MockBus::new();
        let service = Service::start(Box::new(bus.clone()), ServiceConfig::new("svc", "0.0.1"))
            .await
            .unwrap();
        struct Failing;
        #[async_trait]
        impl Handler for Failing {
            async fn handle(&self, _request: &Request) -> std::result::Result<(), String> {
                Err("nope".to_string())
            }
        }
        service
            .add_endpoint(EndpointConfig::new("e1", Arc::new(Failing)))
            .await
            .unwrap();

        let client = Client::new(Box::new(bus));
        let err = client
            .request("e1", Bytes::new(), None, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            Error::ServiceError { code, description } => {
                assert_eq!(code, 500);
                assert_eq!(description, "nope");
            }
            other => panic!("expected ServiceError, got {:?}", other),
        }
    }
}
