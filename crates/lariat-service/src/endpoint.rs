// Endpoint registration and per-endpoint accounting.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lariat_client::Subscription;

use crate::monitoring::{EndpointInfo, EndpointStats};
use crate::request::Request;

/// Handler invoked for each request arriving on an endpoint subject.
pub type ServiceHandler = Arc<dyn Fn(Request) + Send + Sync>;

/// Configuration for one endpoint.
#[derive(Clone)]
pub struct EndpointConfig {
    pub name: String,
    // Defaults to the endpoint name when unset.
    pub subject: Option<String>,
    // None inherits from the group/service; an explicit empty string
    // resolves to the parent's effective queue group as well.
    pub queue_group: Option<String>,
    pub metadata: HashMap<String, String>,
    pub handler: ServiceHandler,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, handler: impl Fn(Request) + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            subject: None,
            queue_group: None,
            metadata: HashMap::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn queue_group(mut self, queue_group: impl Into<String>) -> Self {
        self.queue_group = Some(queue_group.into());
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

pub(crate) struct EndpointCells {
    pub(crate) num_requests: AtomicU64,
    pub(crate) num_errors: AtomicU64,
    pub(crate) processing_time_ns: AtomicU64,
    pub(crate) last_error: Mutex<String>,
}

pub(crate) struct EndpointInner {
    pub(crate) name: String,
    pub(crate) subject: String,
    pub(crate) queue_group: String,
    pub(crate) metadata: HashMap<String, String>,
    pub(crate) cells: EndpointCells,
    pub(crate) subscription: Mutex<Option<Subscription>>,
}

impl EndpointInner {
    pub(crate) fn new(
        name: String,
        subject: String,
        queue_group: String,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            name,
            subject,
            queue_group,
            metadata,
            cells: EndpointCells {
                num_requests: AtomicU64::new(0),
                num_errors: AtomicU64::new(0),
                processing_time_ns: AtomicU64::new(0),
                last_error: Mutex::new(String::new()),
            },
            subscription: Mutex::new(None),
        }
    }

    pub(crate) fn reset(&self) {
        self.cells.num_requests.store(0, Ordering::SeqCst);
        self.cells.num_errors.store(0, Ordering::SeqCst);
        self.cells.processing_time_ns.store(0, Ordering::SeqCst);
        self.cells.last_error.lock().expect("last error lock").clear();
    }

    pub(crate) fn record_error(&self, description: &str) {
        self.cells.num_errors.fetch_add(1, Ordering::SeqCst);
        let mut last = self.cells.last_error.lock().expect("last error lock");
        *last = description.to_string();
    }

    pub(crate) fn info(&self) -> EndpointInfo {
        EndpointInfo {
            name: self.name.clone(),
            subject: self.subject.clone(),
            queue_group: self.queue_group.clone(),
            metadata: self.metadata.clone(),
        }
    }

    pub(crate) fn stats(&self, data: Option<serde_json::Value>) -> EndpointStats {
        let num_requests = self.cells.num_requests.load(Ordering::SeqCst);
        let processing_time = self.cells.processing_time_ns.load(Ordering::SeqCst);
        let average = if num_requests > 0 {
            processing_time / num_requests
        } else {
            0
        };
        EndpointStats {
            name: self.name.clone(),
            subject: self.subject.clone(),
            queue_group: self.queue_group.clone(),
            num_requests,
            num_errors: self.cells.num_errors.load(Ordering::SeqCst),
            last_error: self
                .cells
                .last_error
                .lock()
                .expect("last error lock")
                .clone(),
            processing_time,
            average_processing_time: average,
            data,
        }
    }
}

/// Read-only handle to a registered endpoint, handed to stats handlers.
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn subject(&self) -> &str {
        &self.inner.subject
    }

    pub fn queue_group(&self) -> &str {
        &self.inner.queue_group
    }

    pub fn num_requests(&self) -> u64 {
        self.inner.cells.num_requests.load(Ordering::SeqCst)
    }

    pub fn num_errors(&self) -> u64 {
        self.inner.cells.num_errors.load(Ordering::SeqCst)
    }
}
