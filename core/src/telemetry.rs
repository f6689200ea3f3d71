use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    init_tracing_with("pipeline_core=info");
}

/// Like [`init_tracing`], with the filter used when `RUST_LOG` is unset.
pub fn init_tracing_with(default_directives: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directives.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Narrow metrics capability the pipeline reports through. The backend that
/// exports the values lives outside this crate.
pub trait Metrics: Send + Sync {
    /// Adds `value` to the counter `name`.
    fn increment_by(&self, name: &str, value: u64);

    /// Records a single observation (payload size, latency, gauge reading).
    fn record(&self, name: &str, value: f64);

    fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn increment_by(&self, _name: &str, _value: u64) {}

    fn record(&self, _name: &str, _value: f64) {}
}

/// Summary of the observations recorded under one name.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Distribution {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub last: f64,
}

impl Distribution {
    fn observe(&mut self, value: f64) {
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.sum += value;
        self.last = value;
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub distributions: BTreeMap<String, Distribution>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn distribution(&self, name: &str) -> Option<&Distribution> {
        self.distributions.get(name)
    }
}

/// Process-local metrics store, useful for runners that report a summary at
/// the end of an invocation and for assertions in tests.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    prefix: Option<String>,
    state: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every name is stored as `<prefix>.<name>`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            state: Mutex::default(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.lock().clone()
    }

    fn key(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        }
    }
}

impl Metrics for InMemoryMetrics {
    fn increment_by(&self, name: &str, value: u64) {
        let key = self.key(name);
        *self.state.lock().counters.entry(key).or_default() += value;
    }

    fn record(&self, name: &str, value: f64) {
        let key = self.key(name);
        self.state
            .lock()
            .distributions
            .entry(key)
            .or_default()
            .observe(value);
    }
}
