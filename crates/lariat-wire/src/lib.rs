// Text wire protocol model for the lariat broker dialect.
//
// Control lines are CRLF-terminated ASCII; message payloads are opaque
// bytes of a length declared on the control line. This crate holds the
// pure parsing and encoding layer only; socket I/O lives in the client.
use bytes::BytesMut;

pub mod headers;
pub mod info;
pub mod subject;

pub use headers::HeaderMap;
pub use info::{ConnectInfo, ServerInfo};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid protocol line: {0}")]
    Protocol(String),
    #[error("invalid header block: {0}")]
    Header(String),
    #[error("invalid subject: {0}")]
    BadSubject(String),
}

// Server-sent operation names.
pub const OP_INFO: &str = "INFO";
pub const OP_MSG: &str = "MSG";
pub const OP_HMSG: &str = "HMSG";
pub const OP_PING: &str = "PING";
pub const OP_PONG: &str = "PONG";
pub const OP_OK: &str = "+OK";
pub const OP_ERR: &str = "-ERR";

pub const CRLF: &[u8] = b"\r\n";
pub const PING_PROTO: &[u8] = b"PING\r\n";
pub const PONG_PROTO: &[u8] = b"PONG\r\n";

/// A parsed control line: the operation name and its raw arguments.
///
/// ```
/// use lariat_wire::ControlLine;
///
/// let line = ControlLine::parse("MSG foo 1 5");
/// assert_eq!(line.op, "MSG");
/// assert_eq!(line.args, "foo 1 5");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlLine {
    pub op: String,
    pub args: String,
}

impl ControlLine {
    // Split on the first space; both halves are trimmed.
    pub fn parse(line: &str) -> Self {
        match line.split_once(' ') {
            Some((op, args)) => Self {
                op: op.trim().to_string(),
                args: args.trim().to_string(),
            },
            None => Self {
                op: line.trim().to_string(),
                args: String::new(),
            },
        }
    }
}

/// Arguments of a `MSG` control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgArgs {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub payload_len: usize,
}

impl MsgArgs {
    // MSG <subject> <sid> [reply] <size>
    pub fn parse(args: &str) -> Result<Self> {
        let toks: Vec<&str> = args.split_ascii_whitespace().collect();
        let (subject, sid, reply, size) = match toks.as_slice() {
            [subject, sid, size] => (*subject, *sid, None, *size),
            [subject, sid, reply, size] => (*subject, *sid, Some(reply.to_string()), *size),
            _ => return Err(Error::Protocol(format!("MSG {args}"))),
        };
        Ok(Self {
            subject: subject.to_string(),
            sid: parse_u64(sid, args)?,
            reply,
            payload_len: parse_usize(size, args)?,
        })
    }
}

/// Arguments of an `HMSG` control line.
///
/// `total_len` covers the header block and the payload together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmsgArgs {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub header_len: usize,
    pub total_len: usize,
}

impl HmsgArgs {
    // HMSG <subject> <sid> [reply] <header-size> <total-size>
    pub fn parse(args: &str) -> Result<Self> {
        let toks: Vec<&str> = args.split_ascii_whitespace().collect();
        let (subject, sid, reply, hdr, total) = match toks.as_slice() {
            [subject, sid, hdr, total] => (*subject, *sid, None, *hdr, *total),
            [subject, sid, reply, hdr, total] => {
                (*subject, *sid, Some(reply.to_string()), *hdr, *total)
            }
            _ => return Err(Error::Protocol(format!("HMSG {args}"))),
        };
        let header_len = parse_usize(hdr, args)?;
        let total_len = parse_usize(total, args)?;
        if header_len > total_len {
            return Err(Error::Protocol(format!(
                "HMSG header size {header_len} exceeds total {total_len}"
            )));
        }
        Ok(Self {
            subject: subject.to_string(),
            sid: parse_u64(sid, args)?,
            reply,
            header_len,
            total_len,
        })
    }
}

fn parse_u64(tok: &str, line: &str) -> Result<u64> {
    tok.parse()
        .map_err(|_| Error::Protocol(format!("bad number {tok:?} in {line:?}")))
}

fn parse_usize(tok: &str, line: &str) -> Result<usize> {
    tok.parse()
        .map_err(|_| Error::Protocol(format!("bad number {tok:?} in {line:?}")))
}

// Outbound encoders. Each appends one complete protocol unit so a single
// buffer write stays atomic with respect to the wire.

pub fn encode_connect(buf: &mut BytesMut, json: &str) {
    buf.extend_from_slice(b"CONNECT ");
    buf.extend_from_slice(json.as_bytes());
    buf.extend_from_slice(CRLF);
}

pub fn encode_pub(buf: &mut BytesMut, subject: &str, reply: Option<&str>, payload: &[u8]) {
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

pub fn encode_hpub(
    buf: &mut BytesMut,
    subject: &str,
    reply: Option<&str>,
    headers: &HeaderMap,
    payload: &[u8],
) {
    let mut block = BytesMut::new();
    headers.encode(&mut block);
    buf.extend_from_slice(b"HPUB ");
    buf.extend_from_slice(subject.as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(block.len().to_string().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice((block.len() + payload.len()).to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(&block);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

pub fn encode_sub(buf: &mut BytesMut, subject: &str, queue: &str, sid: u64) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    if !queue.is_empty() {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(queue.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(sid.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

pub fn encode_unsub(buf: &mut BytesMut, sid: u64, max: Option<u64>) {
    buf.extend_from_slice(b"UNSUB ");
    buf.extend_from_slice(sid.to_string().as_bytes());
    if let Some(max) = max {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(max.to_string().as_bytes());
    }
    buf.extend_from_slice(CRLF);
}

// Server-side encoders, used by the in-process test broker.

pub fn encode_msg(buf: &mut BytesMut, subject: &str, sid: u64, reply: Option<&str>, payload: &[u8]) {
    buf.extend_from_slice(b"MSG ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(sid.to_string().as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

pub fn encode_hmsg(
    buf: &mut BytesMut,
    subject: &str,
    sid: u64,
    reply: Option<&str>,
    headers: &HeaderMap,
    payload: &[u8],
) {
    let mut block = BytesMut::new();
    headers.encode(&mut block);
    buf.extend_from_slice(b"HMSG ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(sid.to_string().as_bytes());
    if let Some(reply) = reply {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(reply.as_bytes());
    }
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(block.len().to_string().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice((block.len() + payload.len()).to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(&block);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

pub fn encode_info(buf: &mut BytesMut, json: &str) {
    buf.extend_from_slice(b"INFO ");
    buf.extend_from_slice(json.as_bytes());
    buf.extend_from_slice(CRLF);
}

pub fn encode_err(buf: &mut BytesMut, message: &str) {
    buf.extend_from_slice(b"-ERR '");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"'");
    buf.extend_from_slice(CRLF);
}
