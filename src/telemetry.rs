use crate::apply::ApplyProgress;
use std::collections::HashMap;

/// Namespace-qualified counters and gauges for health checks and export.
#[derive(Debug)]
pub struct MetricsRegistry {
    namespace: String,
    counters: HashMap<String, u64>,
    gauges: HashMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: HashMap::new(),
            gauges: HashMap::new(),
        }
    }

    pub fn inc_counter(&mut self, name: impl Into<String>, delta: u64) -> u64 {
        let key = self.qualify(name.into());
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn set_counter(&mut self, name: impl Into<String>, value: u64) {
        let key = self.qualify(name.into());
        self.counters.insert(key, value);
    }

    pub fn set_gauge(&mut self, name: impl Into<String>, value: u64) {
        let key = self.qualify(name.into());
        self.gauges.insert(key, value);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
        }
    }

    fn qualify(&self, name: String) -> String {
        let namespace = if self.namespace.ends_with('.') {
            self.namespace.clone()
        } else {
            format!("{}.", self.namespace)
        };
        if name.starts_with(&namespace) {
            name
        } else {
            format!("{}{}", namespace, name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

/// Exports the applier's watermarks and counters into a registry.
#[derive(Debug, Default)]
pub struct ApplierMetricsPublisher;

impl ApplierMetricsPublisher {
    pub fn new() -> Self {
        Self
    }

    pub fn publish(&mut self, registry: &mut MetricsRegistry, progress: &ApplyProgress) {
        registry.set_gauge("apply.last_applied", progress.last_applied);
        registry.set_gauge("apply.last_flushed", progress.last_flushed);
        registry.set_gauge("apply.last_seen_commit", progress.last_seen_commit);
        registry.set_counter("apply.duplicates_dropped_total", progress.duplicates_dropped);
        registry.set_counter("apply.flush_total", progress.flushes);
    }
}
