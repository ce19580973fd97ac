// Control-plane subjects and monitoring response envelopes.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub const API_PREFIX: &str = "$SRV";

pub const PING_RESPONSE_TYPE: &str = "io.nats.micro.v1.ping_response";
pub const INFO_RESPONSE_TYPE: &str = "io.nats.micro.v1.info_response";
pub const STATS_RESPONSE_TYPE: &str = "io.nats.micro.v1.stats_response";

/// Monitoring verbs served by every running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Ping,
    Info,
    Stats,
}

impl Verb {
    pub const ALL: [Verb; 3] = [Verb::Ping, Verb::Info, Verb::Stats];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Ping => "PING",
            Verb::Info => "INFO",
            Verb::Stats => "STATS",
        }
    }
}

/// Build a control subject: `$SRV.<VERB>[.<name>[.<id>]]`. An id
/// without a name is rejected.
pub fn control_subject(verb: Verb, name: Option<&str>, id: Option<&str>) -> Result<String> {
    match (name, id) {
        (None, Some(_)) => Err(Error::ArgRequired("service name")),
        (None, None) => Ok(format!("{API_PREFIX}.{}", verb.as_str())),
        (Some(name), None) => Ok(format!("{API_PREFIX}.{}.{name}", verb.as_str())),
        (Some(name), Some(id)) => Ok(format!("{API_PREFIX}.{}.{name}.{id}", verb.as_str())),
    }
}

/// Response to `$SRV.PING`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Response to `$SRV.INFO`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
    pub endpoints: Vec<EndpointInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub name: String,
    pub subject: String,
    pub queue_group: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Response to `$SRV.STATS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub started: chrono::DateTime<chrono::Utc>,
    pub endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStats {
    pub name: String,
    pub subject: String,
    pub queue_group: String,
    pub num_requests: u64,
    pub num_errors: u64,
    #[serde(default)]
    pub last_error: String,
    // Nanoseconds, cumulative and per-request.
    pub processing_time: u64,
    pub average_processing_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}
