// Subject-prefix groups with queue-group inheritance.
use std::sync::Arc;

use crate::ServiceInner;
use crate::endpoint::EndpointConfig;
use crate::errors::Result;

/// A subject-prefix scope within a service. Nested groups join their
/// names with `.`; empty names are skipped. Each group carries the
/// effective queue group its endpoints inherit.
#[derive(Clone)]
pub struct Group {
    pub(crate) service: Arc<ServiceInner>,
    pub(crate) prefix: String,
    pub(crate) queue_group: String,
}

impl Group {
    /// Extend the prefix. `queue_group: None` (or an empty override)
    /// inherits this group's effective queue group.
    pub fn add_group(&self, name: &str, queue_group: Option<&str>) -> Group {
        Group {
            service: Arc::clone(&self.service),
            prefix: join_prefix(&self.prefix, name),
            queue_group: effective_queue_group(queue_group, &self.queue_group),
        }
    }

    /// Register an endpoint under this group's prefix.
    pub async fn add_endpoint(&self, config: EndpointConfig) -> Result<()> {
        self.service
            .add_endpoint_at(&self.prefix, &self.queue_group, config)
            .await
    }

    /// The dotted concatenation of non-empty ancestor names.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue_group(&self) -> &str {
        &self.queue_group
    }
}

pub(crate) fn join_prefix(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (_, true) => prefix.to_string(),
        (true, false) => name.to_string(),
        (false, false) => format!("{prefix}.{name}"),
    }
}

pub(crate) fn effective_queue_group(explicit: Option<&str>, parent: &str) -> String {
    match explicit {
        Some(qg) if !qg.is_empty() => qg.to_string(),
        _ => parent.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_join_with_dots_and_skip_empties() {
        assert_eq!(join_prefix("", "v1"), "v1");
        assert_eq!(join_prefix("v1", "math"), "v1.math");
        assert_eq!(join_prefix("v1", ""), "v1");
        assert_eq!(join_prefix("", ""), "");
    }

    #[test]
    fn queue_groups_inherit_unless_overridden() {
        assert_eq!(effective_queue_group(None, "q"), "q");
        assert_eq!(effective_queue_group(Some(""), "workers"), "workers");
        assert_eq!(effective_queue_group(Some("fast"), "q"), "fast");
    }
}
