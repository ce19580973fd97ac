// JSON envelopes exchanged during the connection handshake.
use serde::{Deserialize, Serialize};

/// Server properties advertised in the initial `INFO` line and in
/// mid-session topology updates.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default, alias = "ssl_required")]
    pub tls_required: bool,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_max_payload() -> usize {
    1024 * 1024
}

/// Client properties sent in `CONNECT`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: &'static str,
    pub version: &'static str,
    // Advertise header and no-responders support so the broker will
    // deliver HMSG frames and 503 replies to this client.
    pub headers: bool,
    pub no_responders: bool,
}

impl ConnectInfo {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_parses_broker_json() {
        let json = r#"{"server_id":"s1","host":"0.0.0.0","port":4222,
            "version":"2.10.0","auth_required":false,"tls_required":true,
            "max_payload":1048576}"#;
        let info: ServerInfo = serde_json::from_str(json).expect("parse");
        assert_eq!(info.server_id, "s1");
        assert_eq!(info.port, 4222);
        assert!(info.tls_required);
        assert_eq!(info.max_payload, 1048576);
    }

    #[test]
    fn server_info_accepts_legacy_ssl_field() {
        let info: ServerInfo =
            serde_json::from_str(r#"{"ssl_required":true}"#).expect("parse");
        assert!(info.tls_required);
    }

    #[test]
    fn server_info_defaults_are_lenient() {
        let info: ServerInfo = serde_json::from_str("{}").expect("parse");
        assert_eq!(info.max_payload, 1024 * 1024);
        assert!(!info.auth_required);
    }

    #[test]
    fn connect_info_omits_absent_credentials() {
        let connect = ConnectInfo {
            verbose: false,
            pedantic: false,
            user: None,
            pass: None,
            tls_required: false,
            name: None,
            lang: "rust",
            version: "0.3.0",
            headers: true,
            no_responders: true,
        };
        let json = connect.to_json().expect("json");
        assert!(!json.contains("user"));
        assert!(!json.contains("pass"));
        assert!(json.contains("\"headers\":true"));
    }
}
