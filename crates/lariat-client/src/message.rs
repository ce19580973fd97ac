// Inbound message value handed to subscribers.
use bytes::Bytes;
use lariat_wire::HeaderMap;

/// A message delivered to a subscription. The subject is the concrete
/// subject the broker matched, which can differ from the subscription
/// pattern under wildcards. The payload is opaque bytes.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    pub headers: Option<HeaderMap>,
    // Subscription the broker delivered this on.
    pub(crate) sid: u64,
}

impl Message {
    /// Assemble a message for [`publish_msg`](crate::Connection::publish_msg).
    pub fn new(
        subject: impl Into<String>,
        reply: Option<String>,
        payload: impl Into<Bytes>,
        headers: Option<HeaderMap>,
    ) -> Self {
        Self {
            subject: subject.into(),
            reply,
            payload: payload.into(),
            headers,
            sid: 0,
        }
    }

    /// Status code from the header version line, when present. A `503`
    /// marks a no-responders reply.
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().and_then(|h| h.status())
    }
}
