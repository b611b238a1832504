//! Group (spec §4.E): a subject-prefix + queue-group namespace for
//! building hierarchical endpoint layouts. Purely a builder — it holds no
//! subscriptions of its own.

use crate::endpoint::EndpointConfig;
use crate::error::Result;
use crate::service::Service;

/// A namespace node producing endpoints under a composed subject prefix
/// and an inherited queue group (spec §4.E).
#[derive(Clone)]
pub struct Group {
    service: Service,
    subject_prefix: String,
    queue_group: Option<String>,
}

impl Group {
    pub(crate) fn new(service: Service, subject_prefix: String, queue_group: Option<String>) -> Self {
        Self {
            service,
            subject_prefix,
            queue_group,
        }
    }

    /// This group's subject prefix.
    pub fn subject_prefix(&self) -> &str {
        &self.subject_prefix
    }

    /// Create a nested group whose subject prefix is
    /// `self.subject_prefix + "." + name` (or just `name` at the root),
    /// inheriting `self`'s queue group unless `queue_group` overrides it
    /// (spec §4.E).
    pub fn add_group(&self, name: impl Into<String>, queue_group: Option<String>) -> Group {
        let name = name.into();
        Group::new(
            self.service.clone(),
            crate::subject::join_subject(&self.subject_prefix, &name),
            queue_group.or_else(|| self.queue_group.clone()),
        )
    }

    /// Add an endpoint under this group, composing its subject with the
    /// group's prefix and resolving its queue group per spec §4.E/§8
    /// invariant 7: `endpoint.queue_group ?? group.queue_group ?? ... ??
    /// service.queue_group ?? "q"`.
    pub async fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        let subject = crate::subject::join_subject(
            &self.subject_prefix,
            config.subject.as_deref().unwrap_or(&config.name),
        );
        let queue_group = config.queue_group.clone().or_else(|| self.queue_group.clone());
        self.service.add_endpoint_resolved(config, subject, queue_group).await
    }
}
