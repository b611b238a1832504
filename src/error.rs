//! Error taxonomy for the service-hosting core (see spec §7).

use crate::subject::Verb;
use snafu::Snafu;
use std::time::Duration;

/// Result wrapper used throughout the core.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the service-hosting core and discovery client.
#[derive(Debug, Snafu, strum_macros::AsRefStr)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid argument: {}", message))]
    InvalidArgument { message: String },

    #[snafu(display(
        "subject namer cannot build a {:?} subject with an id but no service",
        verb
    ))]
    IdWithoutService { verb: Verb },

    #[snafu(display("service '{}' has already stopped", name))]
    AlreadyStopped { name: String },

    #[snafu(display(
        "endpoint '{}' is already registered on service '{}'",
        endpoint,
        service
    ))]
    DuplicateEndpoint { service: String, endpoint: String },

    #[snafu(display("request has no reply subject to respond on"))]
    NoReplySubject,

    #[snafu(display("message bus operation failed: {}", source))]
    BusFailure { source: async_nats::Error },

    #[snafu(display("request on '{}' timed out after {:?}", subject, timeout))]
    Timeout { subject: String, timeout: Duration },

    #[snafu(display("malformed protocol payload: {}", message))]
    ProtocolError { message: String },

    #[snafu(display("service replied with error {}: {}", code, description))]
    ServiceError { code: u16, description: String },
}

impl Error {
    /// Build an [`Error::InvalidArgument`].
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Report the full error chain as a single string, joined by ": ".
///
/// Mirrors the teacher crate's `ErrorChain` helper so callers get one-line
/// log statements instead of re-walking `source()` by hand.
pub trait ErrorChain {
    /// Full error chain as a single string.
    fn full_string(&self) -> String;
}

impl<T> ErrorChain for T
where
    T: std::error::Error,
{
    fn full_string(&self) -> String {
        let mut msg = format!("{}", self);
        let mut opt_source = self.source();
        while let Some(source) = opt_source {
            msg = format!("{}: {}", msg, source);
            opt_source = source.source();
        }
        msg
    }
}
