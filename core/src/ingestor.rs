use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acknowledgement::AcknowledgementSetManager;
use crate::buffer::BoundedBuffer;
use crate::errors::{self, PipelineError};
use crate::invoke::{BatchInvokeProcessor, RemoteInvoker, RequestCodec, ResponseCodec};
use crate::record::Record;
use crate::sink::Sink;
use crate::telemetry::{Metrics, NoopMetrics};

pub const BATCHES_PROCESSED: &str = "batches_processed";
pub const RECORDS_READ: &str = "records_read";

/// The ingestor orchestrates the data flow buffer -> processor -> sink.
pub struct Ingestor<T, I, C, S> {
    buffer: Arc<BoundedBuffer<Record<T>>>,
    processor: BatchInvokeProcessor<T, I, C>,
    sink: S,
    acknowledgements: Arc<AcknowledgementSetManager>,
    read_timeout: Duration,
    metrics: Arc<dyn Metrics>,
}

impl<T, I, C, S> Ingestor<T, I, C, S>
where
    T: Send + Sync + 'static,
    I: RemoteInvoker,
    C: RequestCodec<T> + ResponseCodec<T>,
    S: Sink<T>,
{
    pub fn new(
        buffer: Arc<BoundedBuffer<Record<T>>>,
        processor: BatchInvokeProcessor<T, I, C>,
        sink: S,
        acknowledgements: Arc<AcknowledgementSetManager>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            buffer,
            processor,
            sink,
            acknowledgements,
            read_timeout,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn buffer(&self) -> &Arc<BoundedBuffer<Record<T>>> {
        &self.buffer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs a single read-process-output cycle and returns the number of
    /// records read from the buffer.
    ///
    /// 1. Read one batch, waiting at most the read timeout.
    /// 2. Invoke the remote function on it.
    /// 3. Hand the output to the sink, which acknowledges it.
    ///
    /// A strict-mode mismatch still delivers the tagged records to the sink
    /// before the error is returned.
    pub async fn run_once(&self) -> errors::Result<usize> {
        let batch = self.buffer.read(self.read_timeout).await;
        if batch.is_empty() {
            return Ok(0);
        }
        self.process_batch(batch).await
    }

    async fn process_batch(&self, batch: Vec<Record<T>>) -> errors::Result<usize> {
        let read = batch.len();
        self.metrics.increment_by(RECORDS_READ, read as u64);

        let result = match self.processor.process(batch).await {
            Ok(records) => {
                self.sink.output(records).await?;
                Ok(read)
            }
            Err(mismatch) => {
                let err = mismatch.reconciliation_error();
                error!(
                    buffer = %self.buffer.name(),
                    error = %err,
                    records = mismatch.records().len(),
                    "strict reconciliation failed, delivering tagged records"
                );
                self.sink.output(mismatch.into_records()).await?;
                Err(PipelineError::Reconciliation(err))
            }
        };
        self.metrics.increment(BATCHES_PROCESSED);
        result
    }

    /// Loops over [`Self::run_once`] until `ct` is cancelled. Cancellation is
    /// only observed while waiting on the buffer, so a batch already read is
    /// always processed.
    pub async fn run(&self, ct: CancellationToken) -> errors::Result<()> {
        info!(buffer = %self.buffer.name(), "ingestor started");
        loop {
            let batch = tokio::select! {
                _ = ct.cancelled() => break,
                batch = self.buffer.read(self.read_timeout) => batch,
            };
            if batch.is_empty() {
                continue;
            }

            match self.process_batch(batch).await {
                Ok(_) => {}
                // the records already reached the sink
                Err(PipelineError::Reconciliation(_)) => {}
                Err(err) if err.is_retryable() => {
                    let delay = Duration::from_millis(err.get_retry_delay_ms());
                    warn!(error = %err, ?delay, "batch failed, backing off");
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    error!(error = %err, "ingestor stopping on unrecoverable error");
                    return Err(err);
                }
            }
        }
        info!(buffer = %self.buffer.name(), "ingestor stopped");
        Ok(())
    }

    /// Processes everything still buffered and releases remaining
    /// acknowledgement sets. This MUST be called during a graceful shutdown.
    ///
    /// 1. Close the buffer so producers stop writing.
    /// 2. Drain and process what is left, batch by batch.
    /// 3. Flush the sink.
    /// 4. Expire acknowledgement sets that are still pending.
    ///
    /// Every batch is attempted; the first error is returned at the end.
    pub async fn shutdown(&self) -> errors::Result<usize> {
        self.buffer.close();

        let mut processed = 0;
        let mut first_error = None;
        loop {
            let batch = self.buffer.read(Duration::ZERO).await;
            if batch.is_empty() {
                break;
            }
            match self.process_batch(batch).await {
                Ok(n) => processed += n,
                Err(err) => {
                    warn!(error = %err, "batch failed during shutdown");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Err(err) = self.sink.shutdown().await {
            first_error.get_or_insert(err);
        }
        let expired = self.acknowledgements.shutdown();
        info!(processed, expired, "ingestor shut down");

        match first_error {
            Some(err) => Err(err),
            None => Ok(processed),
        }
    }
}
