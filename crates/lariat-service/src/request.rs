// Request wrapper handed to endpoint handlers.
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::Serialize;

use lariat_client::{Connection, Message};
use lariat_wire::HeaderMap;
use lariat_wire::headers::{ERROR_CODE_HEADER, ERROR_HEADER};

use crate::endpoint::EndpointInner;
use crate::errors::{Error, Result};

/// One inbound service request. Responding through this wrapper keeps
/// the endpoint counters and latency accounting consistent.
pub struct Request {
    conn: Connection,
    endpoint: Arc<EndpointInner>,
    msg: Message,
    received: Instant,
}

impl Request {
    pub(crate) fn new(conn: Connection, endpoint: Arc<EndpointInner>, msg: Message) -> Self {
        Self {
            conn,
            endpoint,
            msg,
            received: Instant::now(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.msg.payload
    }

    pub fn headers(&self) -> Option<&HeaderMap> {
        self.msg.headers.as_ref()
    }

    /// The concrete subject the request arrived on.
    pub fn subject(&self) -> &str {
        &self.msg.subject
    }

    pub fn reply(&self) -> Option<&str> {
        self.msg.reply.as_deref()
    }

    /// Send a reply payload. Accumulates handler latency into the
    /// endpoint's processing time.
    pub fn respond(&self, payload: &[u8]) -> Result<()> {
        self.respond_with_headers(None, payload)
    }

    pub fn respond_with_headers(
        &self,
        headers: Option<&HeaderMap>,
        payload: &[u8],
    ) -> Result<()> {
        let Some(reply) = self.reply() else {
            self.endpoint.record_error("no reply subject");
            return Err(Error::Respond);
        };
        match headers {
            Some(headers) => self.conn.publish_with_headers(reply, headers, payload)?,
            None => self.conn.publish(reply, payload)?,
        }
        let elapsed = self.received.elapsed().as_nanos() as u64;
        self.endpoint
            .cells
            .processing_time_ns
            .fetch_add(elapsed, Ordering::SeqCst);
        Ok(())
    }

    /// Serialize `value` as JSON and reply with it.
    pub fn respond_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            self.endpoint.record_error("response marshal failed");
            Error::MarshalResponse(err.to_string())
        })?;
        self.respond(&payload)
    }

    /// Reply with a service error. Both `code` and `description` are
    /// required; they travel in the reserved error headers.
    pub fn error(&self, code: &str, description: &str, data: Option<&[u8]>) -> Result<()> {
        if code.is_empty() {
            return Err(Error::ArgRequired("error code"));
        }
        if description.is_empty() {
            return Err(Error::ArgRequired("error description"));
        }
        let Some(reply) = self.reply() else {
            self.endpoint.record_error("no reply subject");
            return Err(Error::Respond);
        };
        let mut headers = HeaderMap::new();
        headers.insert(ERROR_HEADER, description);
        headers.insert(ERROR_CODE_HEADER, code);
        self.conn
            .publish_with_headers(reply, &headers, data.unwrap_or_default())?;
        self.endpoint
            .record_error(&format!("{code}:{description}"));
        Ok(())
    }
}
