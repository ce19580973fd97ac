// Header block encode/decode.
//
// A block is an HTTP-style set of `Name: Value` lines introduced by a
// `NATS/1.0` version line that may carry a status code and description,
// and terminated by an empty line.
use bytes::BytesMut;

use crate::{Error, Result};

pub const HEADER_VERSION: &str = "NATS/1.0";

// Reserved names used by the service layer for error replies.
pub const ERROR_HEADER: &str = "Nats-Service-Error";
pub const ERROR_CODE_HEADER: &str = "Nats-Service-Error-Code";

// Status carried on replies when no subscription matched the request.
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Message headers: a name to list-of-values map with case-insensitive
/// lookup, plus the optional status line of inbound blocks.
///
/// ```
/// use lariat_wire::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("Content-Type", "text/plain");
/// headers.append("content-type", "charset=utf8");
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
/// assert_eq!(headers.get_all("Content-Type").len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<u16>,
    description: Option<String>,
    // Insertion order preserved; lookups scan with ASCII case folding.
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.status.is_none()
    }

    /// Status code from the version line of a decoded block, if any.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn set_status(&mut self, status: u16, description: Option<&str>) {
        self.status = Some(status);
        self.description = description.map(|d| d.to_string());
    }

    /// Replace all values for `name` with `value`.
    pub fn insert(&mut self, name: &str, value: &str) {
        if let Some((_, values)) = self.entry_mut(name) {
            values.clear();
            values.push(value.to_string());
        } else {
            self.entries
                .push((name.to_string(), vec![value.to_string()]));
        }
    }

    /// Add `value` to the list for `name`, keeping existing values.
    pub fn append(&mut self, name: &str, value: &str) {
        if let Some((_, values)) = self.entry_mut(name) {
            values.push(value.to_string());
        } else {
            self.entries
                .push((name.to_string(), vec![value.to_string()]));
        }
    }

    /// First value for `name`, matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first().map(String::as_str))
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, values)| (k.as_str(), values.as_slice()))
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut (String, Vec<String>)> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Append the encoded block, including the terminating blank line.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(HEADER_VERSION.as_bytes());
        if let Some(status) = self.status {
            buf.extend_from_slice(b" ");
            buf.extend_from_slice(status.to_string().as_bytes());
            if let Some(description) = &self.description {
                buf.extend_from_slice(b" ");
                buf.extend_from_slice(description.as_bytes());
            }
        }
        buf.extend_from_slice(b"\r\n");
        for (name, values) in &self.entries {
            for value in values {
                buf.extend_from_slice(name.as_bytes());
                buf.extend_from_slice(b": ");
                buf.extend_from_slice(value.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        }
        buf.extend_from_slice(b"\r\n");
    }

    /// Decode a complete block, version line through terminating blank line.
    pub fn decode(block: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(block)
            .map_err(|_| Error::Header("block is not valid UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");
        let version = lines
            .next()
            .ok_or_else(|| Error::Header("empty block".to_string()))?;
        let rest = version
            .strip_prefix(HEADER_VERSION)
            .ok_or_else(|| Error::Header(format!("bad version line {version:?}")))?;

        let mut map = Self::new();
        let rest = rest.trim();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, description)) => (code, Some(description.trim())),
                None => (rest, None),
            };
            let status = code
                .parse::<u16>()
                .map_err(|_| Error::Header(format!("bad status {code:?}")))?;
            map.status = Some(status);
            map.description = description.filter(|d| !d.is_empty()).map(str::to_string);
        }

        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Header(format!("bad header line {line:?}")))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Header(format!("empty header name in {line:?}")));
            }
            map.append(name, value.trim());
        }
        Ok(map)
    }
}
