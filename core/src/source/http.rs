use std::sync::Arc;

use http::StatusCode;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffer::BoundedBuffer;
use crate::config::HttpSourceConfig;
use crate::errors::BufferError;
use crate::record::{Event, Record};
use crate::telemetry::Metrics;

pub const REQUESTS_RECEIVED: &str = "requests_received";
pub const SUCCESS_REQUESTS: &str = "success_requests";
pub const BAD_REQUESTS: &str = "bad_requests";
pub const REQUEST_TIMEOUTS: &str = "request_timeouts";
pub const REQUESTS_REJECTED: &str = "requests_rejected";
pub const REQUESTS_TOO_LARGE: &str = "requests_too_large";
pub const PAYLOAD_SIZE: &str = "payload_size";
pub const REQUEST_PROCESS_DURATION_MS: &str = "request_process_duration_ms";

/// Turns HTTP log requests into buffered records. Routing and the listener
/// belong to whichever server hosts the service.
pub struct LogHttpService {
    buffer: Arc<BoundedBuffer<Record<Event>>>,
    config: HttpSourceConfig,
    pending: Semaphore,
    metrics: Arc<dyn Metrics>,
}

impl LogHttpService {
    pub fn new(
        buffer: Arc<BoundedBuffer<Record<Event>>>,
        config: HttpSourceConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let pending = Semaphore::new(config.max_pending_requests);
        Self {
            buffer,
            config,
            pending,
            metrics,
        }
    }

    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    /// Handles one request body: a JSON array of objects, one record each.
    /// The whole request is buffered or none of it is.
    pub async fn handle(&self, body: &[u8]) -> StatusCode {
        self.metrics.increment(REQUESTS_RECEIVED);
        let Ok(_permit) = self.pending.try_acquire() else {
            self.metrics.increment(REQUESTS_REJECTED);
            debug!("too many pending requests, rejecting");
            return StatusCode::TOO_MANY_REQUESTS;
        };

        let started = Instant::now();
        let status = self.process(body).await;
        self.metrics.record(
            REQUEST_PROCESS_DURATION_MS,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        status
    }

    async fn process(&self, body: &[u8]) -> StatusCode {
        self.metrics.record(PAYLOAD_SIZE, body.len() as f64);
        if body.len() > self.config.max_request_length {
            self.metrics.increment(REQUESTS_TOO_LARGE);
            return StatusCode::PAYLOAD_TOO_LARGE;
        }

        let events: Vec<Map<String, Value>> = match serde_json::from_slice(body) {
            Ok(events) => events,
            Err(err) => {
                self.metrics.increment(BAD_REQUESTS);
                debug!(error = %err, "failed to parse request body");
                return StatusCode::BAD_REQUEST;
            }
        };

        let records = events
            .into_iter()
            .map(|event| Record::new(Value::Object(event)))
            .collect();

        match self
            .buffer
            .write_all(records, self.config.request_timeout())
            .await
        {
            Ok(()) => {
                self.metrics.increment(SUCCESS_REQUESTS);
                StatusCode::OK
            }
            Err(err) => match err.kind() {
                BufferError::Timeout { .. } => {
                    self.metrics.increment(REQUEST_TIMEOUTS);
                    StatusCode::REQUEST_TIMEOUT
                }
                BufferError::SizeOverflow { requested, capacity } => {
                    warn!(requested, capacity, "request holds more records than the buffer can");
                    self.metrics.increment(REQUESTS_TOO_LARGE);
                    StatusCode::PAYLOAD_TOO_LARGE
                }
                BufferError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }
}
