//! Service (spec §4.F): the top-level handle a process holds. Owns a set
//! of endpoints plus the nine control-plane subscriptions that answer
//! PING/INFO/STATS at every addressable scope.

use crate::bus::{Bus, Message, SubscribeLimits};
use crate::control::{EndpointStatsEntry, PingInfo, ServiceInfo, ServiceStats};
use crate::endpoint::{Endpoint, EndpointConfig, EndpointInfo};
use crate::error::{Error, Result};
use crate::group::Group;
use crate::shutdown::{self, StopHandle};
use crate::subject::{self, Verb};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

// CREATED is transient: `Service::start` never returns a handle before the
// state is already STARTED, so there's no observable CREATED value.
const STARTED: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// Configuration for one service instance (spec §6).
pub struct ServiceConfig {
    name: String,
    version: String,
    description: Option<String>,
    metadata: HashMap<String, String>,
    queue_group: String,
    pending_msgs_limit_by_endpoint: Option<u64>,
    pending_bytes_limit_by_endpoint: Option<u64>,
    api_prefix: String,
    now: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    generate_id: Arc<dyn Fn() -> String + Send + Sync>,
}

impl ServiceConfig {
    /// Start building a config for `name`/`version`, both validated on
    /// [`Service::start`] (spec §6: name/version must be non-empty legal
    /// subject tokens; version must look like a semantic version).
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            metadata: HashMap::new(),
            queue_group: "q".to_string(),
            pending_msgs_limit_by_endpoint: None,
            pending_bytes_limit_by_endpoint: None,
            api_prefix: subject::DEFAULT_API_PREFIX.to_string(),
            now: Arc::new(Utc::now),
            generate_id: Arc::new(|| Uuid::new_v4().to_string()),
        }
    }

    /// Human-readable description, reported by `info()`.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Service-level metadata, reported by `info()`/`stats()`.
    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Default queue group inherited by every endpoint/group that doesn't
    /// override it (spec §4.E/§8 invariant 7). Defaults to `"q"`.
    pub fn queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = queue_group.into();
        self
    }

    /// Default advisory pending-message cap applied to every endpoint
    /// that doesn't set its own.
    pub fn pending_msgs_limit_by_endpoint(mut self, limit: u64) -> Self {
        self.pending_msgs_limit_by_endpoint = Some(limit);
        self
    }

    /// Default advisory pending-byte cap applied to every endpoint that
    /// doesn't set its own.
    pub fn pending_bytes_limit_by_endpoint(mut self, limit: u64) -> Self {
        self.pending_bytes_limit_by_endpoint = Some(limit);
        self
    }

    /// Override the control-plane subject prefix (defaults to `$SRV`).
    pub fn api_prefix(mut self, api_prefix: impl Into<String>) -> Self {
        self.api_prefix = api_prefix.into();
        self
    }

    /// Inject the clock used to stamp `started_at`. Tests use this to get
    /// a deterministic `stats().started`.
    pub fn now(mut self, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.now = Arc::new(now);
        self
    }

    /// Inject the instance-id generator, in place of the default
    /// random v4 UUID.
    pub fn generate_id(mut self, generate_id: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.generate_id = Arc::new(generate_id);
        self
    }
}

struct ControlSubscriptions {
    handles: Vec<StopHandle>,
}

impl ControlSubscriptions {
    async fn stop(&self) {
        for handle in &self.handles {
            handle.stop().await;
        }
    }
}

struct Inner {
    bus: Box<dyn Bus>,
    name: String,
    version: String,
    description: String,
    metadata: HashMap<String, String>,
    id: String,
    started_at: DateTime<Utc>,
    default_queue_group: String,
    default_pending_msgs_limit: Option<u64>,
    default_pending_bytes_limit: Option<u64>,
    state: AtomicU8,
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
    // Names claimed by an `add_endpoint` call that is still awaiting
    // `Endpoint::start`, so a concurrent call for the same name can be
    // rejected before the first has pushed into `endpoints` (spec §3:
    // "(service, endpoint-name) pair must be unique").
    pending_endpoint_names: Mutex<HashSet<String>>,
    control: Mutex<Option<ControlSubscriptions>>,
}

/// A running service instance (spec §4.F): a cheap, `Clone`-able handle
/// shared by every [`Group`]/[`Endpoint`] it owns and by the control-plane
/// tasks answering discovery requests.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// Validate `config`, allocate an instance id and start-time, open the
    /// nine control-plane subscriptions and return a `Started` service
    /// (spec §4.F). The service starts with no endpoints.
    pub async fn start(bus: Box<dyn Bus>, config: ServiceConfig) -> Result<Self> {
        subject::validate_token("service name", &config.name)?;
        validate_version(&config.version)?;

        let id = (config.generate_id)();
        subject::validate_token("instance id", &id)?;
        let started_at = (config.now)();

        let inner = Arc::new(Inner {
            bus,
            name: config.name,
            version: config.version,
            description: config.description.unwrap_or_default(),
            metadata: config.metadata,
            id,
            started_at,
            default_queue_group: config.queue_group,
            default_pending_msgs_limit: config.pending_msgs_limit_by_endpoint,
            default_pending_bytes_limit: config.pending_bytes_limit_by_endpoint,
            state: AtomicU8::new(STARTED),
            endpoints: Mutex::new(Vec::new()),
            pending_endpoint_names: Mutex::new(HashSet::new()),
            control: Mutex::new(None),
        });

        let service = Self { inner };
        let control = service.start_control_subscriptions(&config.api_prefix).await?;
        *service.inner.control.lock().unwrap() = Some(control);
        Ok(service)
    }

    async fn start_control_subscriptions(&self, api_prefix: &str) -> Result<ControlSubscriptions> {
        let scopes: [(Option<&str>, Option<&str>); 3] = [
            (None, None),
            (Some(self.inner.name.as_str()), None),
            (Some(self.inner.name.as_str()), Some(self.inner.id.as_str())),
        ];
        let verbs = [Verb::Ping, Verb::Info, Verb::Stats];

        let mut handles = Vec::with_capacity(9);
        for verb in verbs {
            for (service, id) in scopes {
                let subject = subject::control_subject(verb, service, id, api_prefix)?;
                let subscription = self
                    .inner
                    .bus
                    .subscribe(&subject, None, SubscribeLimits::default())
                    .await?;
                handles.push(self.spawn_control_loop(verb, subscription));
            }
        }
        Ok(ControlSubscriptions { handles })
    }

    fn spawn_control_loop(
        &self,
        verb: Verb,
        mut subscription: Box<dyn crate::bus::Subscription>,
    ) -> StopHandle {
        let (handle, shutdown::StopSignal { mut stop_rx, done_tx }) = shutdown::pair();
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        let _ = subscription.unsubscribe().await;
                        break;
                    }
                    message = subscription.next() => {
                        match message {
                            Some(message) => service.reply_control(verb, message).await,
                            None => break,
                        }
                    }
                }
            }
            let _ = done_tx.send(());
        });
        handle
    }

    async fn reply_control(&self, verb: Verb, message: Message) {
        let Some(reply) = message.reply.clone() else {
            return;
        };
        let payload = match verb {
            Verb::Ping => serde_json::to_vec(&self.ping_info()),
            Verb::Info => serde_json::to_vec(&self.info().await),
            Verb::Stats => serde_json::to_vec(&self.stats().await),
        };
        let payload = match payload {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%verb, %error, "failed to serialize control-plane reply");
                return;
            }
        };
        if let Err(error) = self
            .inner
            .bus
            .publish(reply.as_str(), Bytes::from(payload), None)
            .await
        {
            warn!(%verb, %error, "failed to publish control-plane reply");
        }
    }

    fn require_started(&self) -> Result<()> {
        if self.inner.state.load(Ordering::SeqCst) == STARTED {
            Ok(())
        } else {
            Err(Error::AlreadyStopped {
                name: self.inner.name.clone(),
            })
        }
    }

    /// This instance's id, as reported by `ping()`/`info()`/`stats()`.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// This service's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register a top-level endpoint (equivalent to `add_group("").add_endpoint(..)`).
    pub async fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        let subject = config.subject.clone().unwrap_or_else(|| config.name.clone());
        let queue_group = config
            .queue_group
            .clone()
            .unwrap_or_else(|| self.inner.default_queue_group.clone());
        self.add_endpoint_resolved(config, subject, Some(queue_group)).await
    }

    /// Register an endpoint whose subject/queue-group have already been
    /// fully composed by the owning [`Group`] (spec §4.E).
    pub(crate) async fn add_endpoint_resolved(
        &self,
        mut config: EndpointConfig,
        subject: String,
        queue_group: Option<String>,
    ) -> Result<()> {
        self.require_started()?;

        // Check the existing endpoints *and* reserve the name in one
        // critical section, so a second concurrent call for the same name
        // is rejected immediately instead of racing past this check while
        // `Endpoint::start` below is still in flight.
        {
            let endpoints = self.inner.endpoints.lock().unwrap();
            let mut pending = self.inner.pending_endpoint_names.lock().unwrap();
            if endpoints.iter().any(|e| e.info().name == config.name)
                || pending.contains(&config.name)
            {
                return Err(Error::DuplicateEndpoint {
                    service: self.inner.name.clone(),
                    endpoint: config.name.clone(),
                });
            }
            pending.insert(config.name.clone());
        }

        let queue_group = queue_group.unwrap_or_else(|| self.inner.default_queue_group.clone());
        if config.pending_msgs_limit.is_none() {
            config.pending_msgs_limit = self.inner.default_pending_msgs_limit;
        }
        if config.pending_bytes_limit.is_none() {
            config.pending_bytes_limit = self.inner.default_pending_bytes_limit;
        }

        let name = config.name.clone();
        let result = Endpoint::start(self.inner.bus.clone(), subject, queue_group, config).await;

        self.inner.pending_endpoint_names.lock().unwrap().remove(&name);
        let endpoint = result?;
        self.inner.endpoints.lock().unwrap().push(Arc::new(endpoint));
        Ok(())
    }

    /// Create a group rooted at `name`, inheriting `queue_group` or this
    /// service's default (spec §4.E).
    pub fn add_group(&self, name: impl Into<String>, queue_group: Option<String>) -> Group {
        Group::new(self.clone(), name.into(), queue_group)
    }

    /// `io.nats.micro.v1.ping_response` for this instance (spec §4.G).
    pub fn ping_info(&self) -> PingInfo {
        PingInfo {
            kind: PingInfo::TYPE.to_string(),
            name: self.inner.name.clone(),
            id: self.inner.id.clone(),
            version: self.inner.version.clone(),
            metadata: self.inner.metadata.clone(),
        }
    }

    /// `io.nats.micro.v1.info_response` for this instance: the service
    /// descriptor plus every currently-registered endpoint (spec §4.G).
    pub async fn info(&self) -> ServiceInfo {
        let endpoints: Vec<EndpointInfo> = self
            .inner
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.info())
            .collect();
        ServiceInfo {
            kind: ServiceInfo::TYPE.to_string(),
            name: self.inner.name.clone(),
            id: self.inner.id.clone(),
            version: self.inner.version.clone(),
            description: self.inner.description.clone(),
            metadata: self.inner.metadata.clone(),
            endpoints,
        }
    }

    /// `io.nats.micro.v1.stats_response` for this instance: every
    /// endpoint's live counters (spec §4.G).
    pub async fn stats(&self) -> ServiceStats {
        let endpoints: Vec<EndpointStatsEntry> = self
            .inner
            .endpoints
            .lock()
            .unwrap()
            .iter()
            .map(|e| {
                let info = e.info();
                EndpointStatsEntry {
                    name: info.name,
                    subject: info.subject,
                    queue_group: info.queue_group,
                    stats: e.stats(),
                }
            })
            .collect();
        ServiceStats {
            kind: ServiceStats::TYPE.to_string(),
            name: self.inner.name.clone(),
            id: self.inner.id.clone(),
            version: self.inner.version.clone(),
            metadata: self.inner.metadata.clone(),
            started: self.inner.started_at,
            endpoints,
        }
    }

    /// Zero every endpoint's counters. `started_at` is left unchanged
    /// (spec.md §9 Open Question, resolved in DESIGN.md). Legal only while
    /// `Started` (spec §4.F).
    pub fn reset(&self) -> Result<()> {
        self.require_started()?;
        for endpoint in self.inner.endpoints.lock().unwrap().iter() {
            endpoint.reset();
        }
        Ok(())
    }

    /// Drain every endpoint, then the control-plane subscriptions, then
    /// transition to `Stopped`. Idempotent (spec §4.F, invariant 5).
    pub async fn stop(&self) {
        if self
            .inner
            .state
            .compare_exchange(STARTED, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let endpoints = self.inner.endpoints.lock().unwrap().clone();
        for endpoint in endpoints {
            endpoint.stop().await;
        }

        let control = self.inner.control.lock().unwrap().take();
        if let Some(control) = control {
            control.stop().await;
        }

        self.inner.state.store(STOPPED, Ordering::SeqCst);
    }
}

fn validate_version(version: &str) -> Result<()> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() < 2
        || parts
            .iter()
            .any(|part| part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(Error::invalid_argument(format!(
            "version '{}' must be a dotted numeric version such as '1.0.0'",
            version
        )));
    }
    Ok(())
}
