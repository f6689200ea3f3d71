use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::buffer::BoundedBuffer;
use crate::config::TraceSourceConfig;
use crate::errors::BufferError;
use crate::record::Record;
use crate::telemetry::Metrics;

pub const RECORDS_WRITTEN: &str = "records_written";
pub const REQUEST_TIMEOUTS: &str = "request_timeouts";
pub const BUFFER_SIZE: &str = "buffer_size";

pub const BUFFER_FULL_MESSAGE: &str = "Buffer is full, request timed out.";

/// Empty acknowledgement of an export request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportTraceResponse;

/// Trace collector endpoint: each export request becomes one buffered record.
/// `R` is the decoded export request type of the hosting gRPC server.
pub struct TraceExportService<R> {
    buffer: Arc<BoundedBuffer<Record<R>>>,
    write_timeout: Duration,
    metrics: Arc<dyn Metrics>,
}

impl<R: Send> TraceExportService<R> {
    pub fn new(
        buffer: Arc<BoundedBuffer<Record<R>>>,
        config: &TraceSourceConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            buffer,
            write_timeout: config.request_timeout(),
            metrics,
        }
    }

    pub async fn export(&self, request: Request<R>) -> Result<Response<ExportTraceResponse>, Status> {
        let record = Record::new(request.into_inner());
        let result = self.buffer.write(record, self.write_timeout).await;
        self.metrics.record(BUFFER_SIZE, self.buffer.size() as f64);

        match result {
            Ok(()) => {
                self.metrics.increment(RECORDS_WRITTEN);
                Ok(Response::new(ExportTraceResponse))
            }
            Err(err) => match err.kind() {
                BufferError::Timeout { .. } => {
                    self.metrics.increment(REQUEST_TIMEOUTS);
                    debug!(timeout = ?self.write_timeout, "trace export timed out on full buffer");
                    Err(Status::resource_exhausted(BUFFER_FULL_MESSAGE))
                }
                BufferError::Closed => Err(Status::unavailable("Buffer is closed")),
                BufferError::SizeOverflow { .. } => {
                    Err(Status::resource_exhausted(err.to_string()))
                }
            },
        }
    }
}
