//! RPC service framework layered on the lariat client.
//!
//! # Purpose
//! A service is a registry of named, versioned endpoints grouped by
//! subject prefix. Each service answers the standardized control-plane
//! subjects (`$SRV.PING`, `$SRV.INFO`, `$SRV.STATS`) for monitoring and
//! keeps per-endpoint request counters and latency accounting.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;

use lariat_client::{Connection, ErrorCallback, Subscription};
use lariat_wire::subject;

mod endpoint;
mod errors;
mod group;
mod monitoring;
mod request;

pub use endpoint::{Endpoint, EndpointConfig, ServiceHandler};
pub use errors::{Error, Result};
pub use group::Group;
pub use monitoring::{
    API_PREFIX, EndpointInfo, EndpointStats, INFO_RESPONSE_TYPE, InfoResponse,
    PING_RESPONSE_TYPE, PingResponse, STATS_RESPONSE_TYPE, StatsResponse, Verb, control_subject,
};
pub use request::Request;

use endpoint::EndpointInner;
use group::{effective_queue_group, join_prefix};

/// Queue group endpoints land in when neither the endpoint, its
/// groups, nor the service config name one.
pub const DEFAULT_QUEUE_GROUP: &str = "q";

const INSTANCE_ID_LEN: usize = 22;

pub type DoneHandler = Arc<dyn Fn(&Service) + Send + Sync>;
pub type StatsHandler = Arc<dyn Fn(&Endpoint) -> serde_json::Value + Send + Sync>;
pub type ServiceErrorHandler = Arc<dyn Fn(&Service, &ServiceError) + Send + Sync>;

/// An asynchronous connection error attributed to this service.
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub subject: String,
    pub message: String,
}

/// Configuration consumed by [`add_service`].
#[derive(Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
    // Default queue group for endpoints that do not name one.
    pub queue_group: Option<String>,
    pub endpoint: Option<EndpointConfig>,
    pub stats_handler: Option<StatsHandler>,
    pub done_handler: Option<DoneHandler>,
    pub error_handler: Option<ServiceErrorHandler>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            metadata: HashMap::new(),
            queue_group: None,
            endpoint: None,
            stats_handler: None,
            done_handler: None,
            error_handler: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }

    /// The base endpoint registered at service creation.
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn stats_handler(
        mut self,
        handler: impl Fn(&Endpoint) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.stats_handler = Some(Arc::new(handler));
        self
    }

    pub fn done_handler(mut self, handler: impl Fn(&Service) + Send + Sync + 'static) -> Self {
        self.done_handler = Some(Arc::new(handler));
        self
    }

    pub fn error_handler(
        mut self,
        handler: impl Fn(&Service, &ServiceError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}

pub(crate) struct ServiceState {
    endpoints: Vec<Arc<EndpointInner>>,
    verb_subs: Vec<Subscription>,
    prev_error_cb: Option<ErrorCallback>,
}

pub(crate) struct ServiceInner {
    conn: Connection,
    name: String,
    id: String,
    version: String,
    description: String,
    metadata: HashMap<String, String>,
    started: chrono::DateTime<chrono::Utc>,
    base_queue_group: String,
    stats_handler: Option<StatsHandler>,
    done_handler: Option<DoneHandler>,
    error_handler: Option<ServiceErrorHandler>,
    stopped: AtomicBool,
    state: Mutex<ServiceState>,
}

/// A running service instance. Clones share the instance.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("version", &self.inner.version)
            .finish_non_exhaustive()
    }
}

/// Create a service over `conn` and install its monitoring and base
/// endpoint subscriptions.
pub async fn add_service(conn: &Connection, config: ServiceConfig) -> Result<Service> {
    validate_config(&config)?;
    let base_queue_group = config
        .queue_group
        .clone()
        .unwrap_or_else(|| DEFAULT_QUEUE_GROUP.to_string());
    let inner = Arc::new(ServiceInner {
        conn: conn.clone(),
        name: config.name.clone(),
        id: new_instance_id(),
        version: config.version.clone(),
        description: config.description.clone(),
        metadata: config.metadata.clone(),
        started: chrono::Utc::now(),
        base_queue_group,
        stats_handler: config.stats_handler.clone(),
        done_handler: config.done_handler.clone(),
        error_handler: config.error_handler.clone(),
        stopped: AtomicBool::new(false),
        state: Mutex::new(ServiceState {
            endpoints: Vec::new(),
            verb_subs: Vec::new(),
            prev_error_cb: None,
        }),
    });
    let service = Service {
        inner: Arc::clone(&inner),
    };

    // Chain any error handler the connection already had: it keeps
    // running first, then errors on our subjects reach this service.
    let prev = conn.set_error_handler(None);
    {
        let mut state = inner.lock_state();
        state.prev_error_cb = prev.clone();
    }
    let weak = Arc::downgrade(&inner);
    let chained: ErrorCallback = Arc::new(move |conn, sub, err| {
        if let Some(prev) = &prev {
            prev(conn, sub, err);
        }
        let Some(inner) = weak.upgrade() else { return };
        let Some(sub) = sub else { return };
        if !inner.owns_subject(sub.subject()) {
            return;
        }
        inner.record_async_error(sub.subject(), &err.to_string());
        if let Some(handler) = &inner.error_handler {
            let service = Service {
                inner: Arc::clone(&inner),
            };
            handler(
                &service,
                &ServiceError {
                    subject: sub.subject().to_string(),
                    message: err.to_string(),
                },
            );
        }
    });
    conn.set_error_handler(Some(chained));

    if let Err(err) = install_monitoring(conn, &inner).await {
        service.teardown_on_error().await;
        return Err(err);
    }
    if let Some(endpoint) = config.endpoint.clone() {
        if let Err(err) = service.add_endpoint(endpoint).await {
            service.teardown_on_error().await;
            return Err(err);
        }
    }
    Ok(service)
}

async fn install_monitoring(conn: &Connection, inner: &Arc<ServiceInner>) -> Result<()> {
    for verb in Verb::ALL {
        let subjects = [
            control_subject(verb, None, None)?,
            control_subject(verb, Some(inner.name.as_str()), None)?,
            control_subject(verb, Some(inner.name.as_str()), Some(inner.id.as_str()))?,
        ];
        for subj in subjects {
            let weak = Arc::downgrade(inner);
            let reply_conn = conn.clone();
            let sub = conn
                .subscribe(&subj, move |msg| {
                    let Some(inner) = weak.upgrade() else { return };
                    let Some(reply) = msg.reply.as_deref() else {
                        return;
                    };
                    let body = match verb {
                        Verb::Ping => serde_json::to_vec(&inner.ping_response()),
                        Verb::Info => serde_json::to_vec(&inner.info_response()),
                        Verb::Stats => serde_json::to_vec(&inner.stats_response()),
                    };
                    match body {
                        Ok(body) => {
                            let _ = reply_conn.publish(reply, &body);
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, verb = verb.as_str(), "monitoring response failed");
                        }
                    }
                })
                .await?;
            inner.lock_state().verb_subs.push(sub);
        }
    }
    Ok(())
}

impl Service {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Unique instance id, distinct per running service instance.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Register an endpoint at the service root.
    pub async fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        self.inner
            .add_endpoint_at("", &self.inner.base_queue_group, config)
            .await
    }

    /// Open a subject-prefix group. `queue_group: None` inherits the
    /// service default.
    pub fn add_group(&self, name: &str, queue_group: Option<&str>) -> Group {
        Group {
            service: Arc::clone(&self.inner),
            prefix: join_prefix("", name),
            queue_group: effective_queue_group(queue_group, &self.inner.base_queue_group),
        }
    }

    pub fn info(&self) -> InfoResponse {
        self.inner.info_response()
    }

    pub fn stats(&self) -> StatsResponse {
        self.inner.stats_response()
    }

    /// Zero all endpoint counters.
    pub fn reset(&self) {
        let state = self.inner.lock_state();
        for endpoint in &state.endpoints {
            endpoint.reset();
        }
    }

    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Drain all internal subscriptions, restore the connection's prior
    /// error handler, and fire the done handler exactly once.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (subs, prev) = {
            let mut state = self.inner.lock_state();
            let mut subs = std::mem::take(&mut state.verb_subs);
            for endpoint in &state.endpoints {
                if let Some(sub) = endpoint
                    .subscription
                    .lock()
                    .expect("endpoint subscription lock")
                    .take()
                {
                    subs.push(sub);
                }
            }
            (subs, state.prev_error_cb.take())
        };
        for sub in subs {
            if let Err(err) = sub.drain().await {
                tracing::debug!(error = %err, subject = sub.subject(), "service subscription drain failed");
            }
        }
        self.inner.conn.set_error_handler(prev);
        if let Some(done) = &self.inner.done_handler {
            done(self);
        }
        Ok(())
    }

    async fn teardown_on_error(&self) {
        let _ = self.stop().await;
    }
}

impl ServiceInner {
    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().expect("service state lock")
    }

    pub(crate) async fn add_endpoint_at(
        self: &Arc<Self>,
        prefix: &str,
        parent_queue_group: &str,
        config: EndpointConfig,
    ) -> Result<()> {
        if !valid_name(&config.name) {
            return Err(Error::ConfigValidation(format!(
                "invalid endpoint name {:?}",
                config.name
            )));
        }
        let local = config
            .subject
            .clone()
            .unwrap_or_else(|| config.name.clone());
        let full_subject = join_prefix(prefix, &local);
        if !subject::valid_subject(&full_subject) {
            return Err(Error::ConfigValidation(format!(
                "invalid endpoint subject {full_subject:?}"
            )));
        }
        let queue_group =
            effective_queue_group(config.queue_group.as_deref(), parent_queue_group);
        if !subject::valid_token(&queue_group) {
            return Err(Error::ConfigValidation(format!(
                "invalid queue group {queue_group:?}"
            )));
        }
        {
            let state = self.lock_state();
            if state.endpoints.iter().any(|e| e.name == config.name) {
                return Err(Error::ConfigValidation(format!(
                    "duplicate endpoint name {:?}",
                    config.name
                )));
            }
        }

        let endpoint = Arc::new(EndpointInner::new(
            config.name.clone(),
            full_subject.clone(),
            queue_group.clone(),
            config.metadata.clone(),
        ));
        let handler = config.handler.clone();
        let request_conn = self.conn.clone();
        let request_endpoint = Arc::clone(&endpoint);
        let sub = self
            .conn
            .queue_subscribe(&full_subject, &queue_group, move |msg| {
                request_endpoint
                    .cells
                    .num_requests
                    .fetch_add(1, Ordering::SeqCst);
                let request =
                    Request::new(request_conn.clone(), Arc::clone(&request_endpoint), msg);
                handler(request);
            })
            .await?;
        *endpoint
            .subscription
            .lock()
            .expect("endpoint subscription lock") = Some(sub);
        self.lock_state().endpoints.push(endpoint);
        Ok(())
    }

    fn ping_response(&self) -> PingResponse {
        PingResponse {
            kind: PING_RESPONSE_TYPE.to_string(),
            name: self.name.clone(),
            id: self.id.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
        }
    }

    fn info_response(&self) -> InfoResponse {
        let state = self.lock_state();
        InfoResponse {
            kind: INFO_RESPONSE_TYPE.to_string(),
            name: self.name.clone(),
            id: self.id.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            description: self.description.clone(),
            endpoints: state.endpoints.iter().map(|e| e.info()).collect(),
        }
    }

    fn stats_response(&self) -> StatsResponse {
        let state = self.lock_state();
        let endpoints = state
            .endpoints
            .iter()
            .map(|inner| {
                let data = self.stats_handler.as_ref().map(|handler| {
                    handler(&Endpoint {
                        inner: Arc::clone(inner),
                    })
                });
                inner.stats(data)
            })
            .collect();
        StatsResponse {
            kind: STATS_RESPONSE_TYPE.to_string(),
            name: self.name.clone(),
            id: self.id.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            started: self.started,
            endpoints,
        }
    }

    // True when a failing subscription subject belongs to this service:
    // an endpoint subject or one of the monitoring subjects.
    fn owns_subject(&self, failing: &str) -> bool {
        let state = self.lock_state();
        if state
            .endpoints
            .iter()
            .any(|e| e.subject == failing || subject::matches(&e.subject, failing))
        {
            return true;
        }
        state
            .verb_subs
            .iter()
            .any(|s| s.subject() == failing || subject::matches(s.subject(), failing))
    }

    fn record_async_error(&self, failing: &str, message: &str) {
        let state = self.lock_state();
        for endpoint in &state.endpoints {
            if endpoint.subject == failing || subject::matches(&endpoint.subject, failing) {
                endpoint.record_error(message);
            }
        }
    }
}

fn validate_config(config: &ServiceConfig) -> Result<()> {
    if !valid_name(&config.name) {
        return Err(Error::ConfigValidation(format!(
            "invalid service name {:?}",
            config.name
        )));
    }
    if !valid_semver(&config.version) {
        return Err(Error::ConfigValidation(format!(
            "invalid service version {:?}",
            config.version
        )));
    }
    if let Some(queue_group) = &config.queue_group {
        if !queue_group.is_empty() && !subject::valid_token(queue_group) {
            return Err(Error::ConfigValidation(format!(
                "invalid queue group {queue_group:?}"
            )));
        }
    }
    Ok(())
}

// Service and endpoint names: letters, digits, dash, underscore.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// Semantic version: numeric major.minor.patch with optional
// -prerelease and +build suffixes.
fn valid_semver(version: &str) -> bool {
    let version = version.split('+').next().unwrap_or_default();
    let core = version.split('-').next().unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

fn new_instance_id() -> String {
    let mut rng = rand::rng();
    (0..INSTANCE_ID_LEN)
        .map(|_| {
            // Digits and uppercase letters, NUID style.
            const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
            ALPHABET[rng.random_range(0..ALPHABET.len())] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_name("calc-service_2"));
        assert!(!valid_name(""));
        assert!(!valid_name("calc.service"));
        assert!(!valid_name("calc service"));
        assert!(!valid_name("calc!"));
    }

    #[test]
    fn semver_validation() {
        assert!(valid_semver("1.0.0"));
        assert!(valid_semver("0.12.3-beta.1"));
        assert!(valid_semver("2.0.0+build5"));
        assert!(!valid_semver("1.0"));
        assert!(!valid_semver("abc"));
        assert!(!valid_semver("1.0.x"));
    }

    #[test]
    fn instance_ids_are_unique_and_sized() {
        let a = new_instance_id();
        let b = new_instance_id();
        assert_eq!(a.len(), INSTANCE_ID_LEN);
        assert_ne!(a, b);
    }
}
