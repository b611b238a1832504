//! Request Object (spec §4.C): wraps one incoming bus [`Message`] and is
//! handed to user handlers.

use crate::bus::{Bus, Message};
use crate::error::{Error, Result};
use async_nats::HeaderMap;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) const ERROR_CODE_HEADER: &str = "Nats-Service-Error-Code";
pub(crate) const ERROR_DESCRIPTION_HEADER: &str = "Nats-Service-Error";

/// Tracks, independently of the `Request` itself, whether a reply was
/// sent and whether it was an error reply. The endpoint serve loop keeps
/// a clone of this around so it can inspect the outcome after the
/// handler has consumed the `Request` by value (spec §4.D's statistics
/// update rule needs exactly this: did we reply, and was it an error).
#[derive(Default)]
pub(crate) struct ReplyState {
    replied: AtomicBool,
    error: std::sync::Mutex<Option<String>>,
}

impl ReplyState {
    pub(crate) fn has_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    /// The description of the error reply that was sent, if any.
    pub(crate) fn error_reply(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }
}

/// One in-flight request handed to user code.
///
/// `respond`/`respond_error` are idempotent with respect to statistics:
/// only whether *any* reply was sent, and whether that reply was an
/// error reply, matters to the endpoint's counters (spec §4.D).
pub struct Request {
    bus: Box<dyn Bus>,
    message: Message,
    state: Arc<ReplyState>,
}

impl Request {
    pub(crate) fn new(bus: Box<dyn Bus>, message: Message) -> Self {
        Self::with_state(bus, message, Arc::new(ReplyState::default()))
    }

    pub(crate) fn with_state(bus: Box<dyn Bus>, message: Message, state: Arc<ReplyState>) -> Self {
        Self { bus, message, state }
    }

    pub(crate) fn state(&self) -> Arc<ReplyState> {
        self.state.clone()
    }

    /// The raw request payload.
    pub fn data(&self) -> &[u8] {
        &self.message.payload
    }

    /// The request headers, if any were sent.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.message.headers.as_ref()
    }

    /// The subject this request was delivered on.
    pub fn subject(&self) -> &str {
        self.message.subject.as_str()
    }

    /// Whether a reply (success or error) has already been sent.
    pub fn has_replied(&self) -> bool {
        self.state.has_replied()
    }

    /// Reply with `data`, preserving any `headers` the caller supplies.
    /// Fails with [`Error::NoReplySubject`] when the source message
    /// carried no reply subject.
    pub async fn respond(&self, data: Bytes, headers: Option<HeaderMap>) -> Result<()> {
        let reply = self.message.reply.as_ref().ok_or(Error::NoReplySubject)?;
        self.bus.publish(reply.as_str(), data, headers).await?;
        self.state.replied.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Reply with a service error: `code` is carried in the
    /// `Nats-Service-Error-Code` header and `description` in
    /// `Nats-Service-Error`, alongside any `data`/user `headers`
    /// (spec §4.C). Counts as an error for endpoint statistics.
    pub async fn respond_error(
        &self,
        code: u16,
        description: &str,
        data: Option<Bytes>,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        let mut headers = headers.unwrap_or_default();
        headers.insert(ERROR_CODE_HEADER, code.to_string().as_str());
        headers.insert(ERROR_DESCRIPTION_HEADER, description);
        self.respond(data.unwrap_or_default(), Some(headers)).await?;
        *self.state.error.lock().unwrap() = Some(description.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::bus::SubscribeLimits;

    fn message(reply: Option<&str>) -> Message {
        Message {
            subject: "endpoint1".to_string().into(),
            reply: reply.map(|r| r.to_string().into()),
            payload: Bytes::from_static(b"hello"),
            headers: None,
            status: None,
            description: None,
            length: 0,
        }
    }

    #[tokio::test]
    async fn respond_without_reply_subject_fails() {
        let bus: Box<dyn Bus> = Box::new(MockBus::new());
        let request = Request::new(bus, message(None));
        let err = request.respond(Bytes::new(), None).await.unwrap_err();
        assert!(matches!(err, Error::NoReplySubject));
    }

    #[tokio::test]
    async fn respond_publishes_to_reply_subject() {
        let bus = MockBus::new();
        let mut sub = bus
            .subscribe("reply.1", None, SubscribeLimits::default())
            .await
            .unwrap();
        let request = Request::new(Box::new(bus), message(Some("reply.1")));
        request.respond(Bytes::from_static(b"ok"), None).await.unwrap();
        let received = sub.next().await.unwrap();
        assert_eq!(received.payload, Bytes::from_static(b"ok"));
        assert!(request.has_replied());
    }

    #[tokio::test]
    async fn respond_error_sets_headers() {
        let bus = MockBus::new();
        let mut sub = bus
            .subscribe("reply.2", None, SubscribeLimits::default())
            .await
            .unwrap();
        let request = Request::new(Box::new(bus), message(Some("reply.2")));
        request
            .respond_error(400, "bad", None, None)
            .await
            .unwrap();
        let received = sub.next().await.unwrap();
        let headers = received.headers.unwrap();
        assert_eq!(
            headers.get(ERROR_CODE_HEADER).unwrap().as_str(),
            "400"
        );
        assert_eq!(
            headers.get(ERROR_DESCRIPTION_HEADER).unwrap().as_str(),
            "bad"
        );
    }
}
