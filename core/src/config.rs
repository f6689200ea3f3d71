use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::{self, ConfigError};

pub const CONFIG_ENV_VAR: &str = "PIPELINE_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub acknowledgements: AcknowledgementConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    pub batch_size: usize,
    /// How long the worker waits on an empty buffer before looping.
    pub read_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 12800,
            batch_size: 200,
            read_timeout_ms: 1000,
        }
    }
}

impl BufferConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourcesConfig {
    pub http: Option<HttpSourceConfig>,
    pub otel_trace: Option<TraceSourceConfig>,
    pub sqs: Option<SqsSourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpSourceConfig {
    pub port: u16,
    pub path: String,
    /// Also the buffer write timeout for one request.
    pub request_timeout_ms: u64,
    pub max_pending_requests: usize,
    /// Largest accepted request body, in bytes.
    pub max_request_length: usize,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            port: 2021,
            path: "/log/ingest".to_string(),
            request_timeout_ms: 10_000,
            max_pending_requests: 1024,
            max_request_length: 10 * 1024 * 1024,
        }
    }
}

impl HttpSourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Settings for a trace export service hosted by an external gRPC server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TraceSourceConfig {
    /// Also the buffer write timeout for one export request.
    pub request_timeout_ms: u64,
}

impl Default for TraceSourceConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
        }
    }
}

impl TraceSourceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqsSourceConfig {
    pub queue_url: String,
    #[serde(default = "default_sqs_buffer_timeout_ms")]
    pub buffer_timeout_ms: u64,
    /// Track each message with an acknowledgement set and only report it
    /// processed once every derived record has been acknowledged.
    #[serde(default = "default_true")]
    pub acknowledgements: bool,
}

impl SqsSourceConfig {
    pub fn buffer_timeout(&self) -> Duration {
        Duration::from_millis(self.buffer_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorConfig {
    pub batch_invoke: BatchInvokeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchInvokeConfig {
    pub function_name: String,
    /// Base URL the HTTP invoker posts to. The function name is appended as
    /// the last path segment.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub response_events_match: bool,
    #[serde(default = "default_tags_on_failure")]
    pub tags_on_failure: Vec<String>,
    #[serde(default = "default_invoke_timeout_ms")]
    pub invoke_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub batch: BatchOptions,
}

impl BatchInvokeConfig {
    pub fn new(function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            endpoint: None,
            response_events_match: false,
            tags_on_failure: default_tags_on_failure(),
            invoke_timeout_ms: default_invoke_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            batch: BatchOptions::default(),
        }
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Wraps the request array as `{"<key_name>": [...]}`. `None` sends a bare
    /// JSON array.
    pub key_name: Option<String>,
    pub max_events: usize,
    pub max_bytes: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            key_name: Some("events".to_string()),
            max_events: 100,
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AcknowledgementConfig {
    pub timeout_ms: u64,
    pub monitor_interval_ms: u64,
}

impl Default for AcknowledgementConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            monitor_interval_ms: 1_000,
        }
    }
}

impl AcknowledgementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sqs_buffer_timeout_ms() -> u64 {
    10_000
}

fn default_tags_on_failure() -> Vec<String> {
    vec!["lambda_failure".to_string()]
}

fn default_invoke_timeout_ms() -> u64 {
    60_000
}

fn default_max_concurrency() -> usize {
    4
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<PipelineConfig> {
    let config = match config_path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load pipeline config from {path}"))?,
        None => PipelineConfig::from_env()
            .with_context(|| format!("failed to load pipeline config from {CONFIG_ENV_VAR}"))?,
    };
    config.validate().context("invalid pipeline config")?;
    Ok(config)
}

impl PipelineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> errors::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> errors::Result<Self> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: CONFIG_ENV_VAR.to_string(),
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> errors::Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(invalid("buffer.capacity must be greater than 0"));
        }
        if self.buffer.batch_size == 0 {
            return Err(invalid("buffer.batch_size must be greater than 0"));
        }
        if self.buffer.batch_size > self.buffer.capacity {
            return Err(invalid("buffer.batch_size cannot exceed buffer.capacity"));
        }

        let invoke = &self.processor.batch_invoke;
        if invoke.function_name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "processor.batch_invoke.function_name".to_string(),
            });
        }
        if invoke.batch.max_events == 0 || invoke.batch.max_bytes == 0 {
            return Err(invalid("batch thresholds must be greater than 0"));
        }
        if invoke.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be greater than 0"));
        }
        if invoke.invoke_timeout_ms == 0 {
            return Err(invalid("invoke_timeout_ms must be greater than 0"));
        }

        if let Some(http) = &self.sources.http {
            if !http.path.starts_with('/') {
                return Err(invalid("sources.http.path must start with '/'"));
            }
            if http.max_pending_requests == 0 {
                return Err(invalid("sources.http.max_pending_requests must be greater than 0"));
            }
        }
        if let Some(trace) = &self.sources.otel_trace {
            if trace.request_timeout_ms == 0 {
                return Err(invalid("sources.otel_trace.request_timeout_ms must be greater than 0"));
            }
        }
        if let Some(sqs) = &self.sources.sqs {
            if sqs.queue_url.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "sources.sqs.queue_url".to_string(),
                });
            }
        }
        if self.acknowledgements.monitor_interval_ms == 0 {
            return Err(invalid("acknowledgements.monitor_interval_ms must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.to_string(),
    }
}
