//! Subject Namer (spec §4.A): computes control-plane subjects from
//! `(verb, service?, id?, prefix)`.

use crate::error::{Error, Result};

/// Default control-plane subject prefix (`$SRV`).
pub const DEFAULT_API_PREFIX: &str = "$SRV";

/// The three control-plane verbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Verb {
    /// Liveness probe.
    Ping,
    /// Service descriptor.
    Info,
    /// Accumulated endpoint statistics.
    Stats,
}

/// Compute the control-plane subject for `verb`, optionally scoped to a
/// `service` and, within that service, to a specific instance `id`.
///
/// `id` without `service` is invalid (spec §4.A) and fails with
/// [`Error::IdWithoutService`].
pub fn control_subject(
    verb: Verb,
    service: Option<&str>,
    id: Option<&str>,
    prefix: &str,
) -> Result<String> {
    match (service, id) {
        (None, Some(_)) => Err(Error::IdWithoutService { verb }),
        (None, None) => Ok(format!("{}.{}", prefix, verb)),
        (Some(service), None) => Ok(format!("{}.{}.{}", prefix, verb, service)),
        (Some(service), Some(id)) => Ok(format!("{}.{}.{}.{}", prefix, verb, service, id)),
    }
}

/// Validate that a service name or instance id is a legal subject token:
/// non-empty, no `.` and no whitespace (spec §6).
pub fn validate_token(kind: &str, token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::invalid_argument(format!("{} must not be empty", kind)));
    }
    if token.contains('.') || token.chars().any(char::is_whitespace) {
        return Err(Error::invalid_argument(format!(
            "{} '{}' must not contain '.' or whitespace",
            kind, token
        )));
    }
    Ok(())
}

/// Compose a subject prefix with a child segment, `.`-joining non-empty
/// parents the way nested [`crate::group::Group`]s do (spec §3, §4.E).
pub fn join_subject(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}.{}", parent, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_verb() {
        assert_eq!(
            control_subject(Verb::Ping, None, None, DEFAULT_API_PREFIX).unwrap(),
            "$SRV.PING"
        );
    }

    #[test]
    fn scoped_by_service() {
        assert_eq!(
            control_subject(Verb::Info, Some("svc"), None, DEFAULT_API_PREFIX).unwrap(),
            "$SRV.INFO.svc"
        );
    }

    #[test]
    fn scoped_by_service_and_id() {
        assert_eq!(
            control_subject(Verb::Stats, Some("svc"), Some("i1"), DEFAULT_API_PREFIX).unwrap(),
            "$SRV.STATS.svc.i1"
        );
    }

    #[test]
    fn id_without_service_is_invalid() {
        assert!(control_subject(Verb::Ping, None, Some("i1"), DEFAULT_API_PREFIX).is_err());
    }

    #[test]
    fn namer_is_injective_on_valid_inputs() {
        let a = control_subject(Verb::Ping, Some("svc-a"), None, DEFAULT_API_PREFIX).unwrap();
        let b = control_subject(Verb::Ping, Some("svc-b"), None, DEFAULT_API_PREFIX).unwrap();
        let c = control_subject(Verb::Ping, Some("svc-a"), Some("1"), DEFAULT_API_PREFIX).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn join_subject_roots_at_empty_prefix() {
        assert_eq!(join_subject("", "endpoint1"), "endpoint1");
        assert_eq!(join_subject("group1", "endpoint1"), "group1.endpoint1");
    }

    #[test]
    fn token_validation_rejects_dots_and_whitespace() {
        assert!(validate_token("service", "svc.one").is_err());
        assert!(validate_token("service", "svc one").is_err());
        assert!(validate_token("service", "").is_err());
        assert!(validate_token("service", "svc-one").is_ok());
    }
}
