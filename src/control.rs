//! Control Plane descriptors (spec §3, §4.G): the JSON payloads served by
//! every service instance for PING/INFO/STATS.

use crate::endpoint::EndpointInfo;
use crate::stats::EndpointStats;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// `io.nats.micro.v1.ping_response` (spec §3).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PingInfo {
    /// Always [`PingInfo::TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Service name.
    pub name: String,
    /// This instance's unique id.
    pub id: String,
    /// Service version.
    pub version: String,
    /// Service-level metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PingInfo {
    pub(crate) const TYPE: &'static str = "io.nats.micro.v1.ping_response";
}

/// `io.nats.micro.v1.info_response` (spec §3).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceInfo {
    /// Always [`ServiceInfo::TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Service name.
    pub name: String,
    /// This instance's unique id.
    pub id: String,
    /// Service version.
    pub version: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Service-level metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Every endpoint currently registered on this instance.
    pub endpoints: Vec<EndpointInfo>,
}

impl ServiceInfo {
    pub(crate) const TYPE: &'static str = "io.nats.micro.v1.info_response";
}

/// `io.nats.micro.v1.stats_response` (spec §3).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceStats {
    /// Always [`ServiceStats::TYPE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Service name.
    pub name: String,
    /// This instance's unique id.
    pub id: String,
    /// Service version.
    pub version: String,
    /// Service-level metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// When this instance started serving.
    pub started: DateTime<Utc>,
    /// Per-endpoint counters, in registration order.
    pub endpoints: Vec<EndpointStatsEntry>,
}

impl ServiceStats {
    pub(crate) const TYPE: &'static str = "io.nats.micro.v1.stats_response";
}

/// One endpoint's stats as reported inside [`ServiceStats`]: the
/// endpoint's identity plus its live counters (spec §3).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EndpointStatsEntry {
    /// Endpoint name.
    pub name: String,
    /// Fully composed subject this endpoint is bound to.
    pub subject: String,
    /// Effective queue group this endpoint subscribes under.
    pub queue_group: String,
    /// The live counters themselves.
    #[serde(flatten)]
    pub stats: EndpointStats,
}
