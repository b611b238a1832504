#![warn(missing_docs)]
//! A service-hosting core for subject-based pub/sub message buses.
//!
//! Host programs connect a [`bus::Bus`] (an `async-nats` connection in
//! production, [`bus::mock::MockBus`] in tests) and use [`service::Service`]
//! to register endpoints and groups; the control plane (PING/INFO/STATS),
//! live statistics and graceful drain/stop are all handled here. The
//! [`client::Client`] discovers and addresses running services from the
//! other side of the bus.
//!
//! Establishing the bus connection itself, process entrypoint/signal
//! handling, and any declarative service-description sugar are left to
//! the host program.

pub mod bus;
pub mod client;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod group;
pub mod request;
pub mod request_many;
pub mod service;
pub mod stats;
pub mod subject;

mod shutdown;

pub use bus::Bus;
pub use client::Client;
pub use endpoint::{EndpointConfig, Handler};
pub use error::{Error, ErrorChain, Result};
pub use group::Group;
pub use request::Request;
pub use service::{Service, ServiceConfig};
