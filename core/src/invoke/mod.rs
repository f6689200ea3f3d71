//! Batch invocation of a remote function over buffered records.

pub mod codec;
pub mod http;

pub use codec::{JsonCodec, RequestCodec, ResponseCodec};
pub use http::HttpInvoker;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::BatchInvokeConfig;
use crate::errors::{InvocationError, PipelineError, ReconciliationError};
use crate::record::{Record, RecordMetadata};
use crate::telemetry::{Metrics, NoopMetrics};

pub const RECORDS_SUCCESS: &str = "records_success";
pub const RECORDS_FAILED: &str = "records_failed";
pub const REQUESTS_SUCCESS: &str = "requests_success";
pub const REQUESTS_FAILED: &str = "requests_failed";
pub const REQUEST_PAYLOAD_BYTES: &str = "request_payload_bytes";
pub const RESPONSE_PAYLOAD_BYTES: &str = "response_payload_bytes";
pub const INVOKE_LATENCY_MS: &str = "invoke_latency_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeResponse {
    pub status_code: u16,
    pub payload: Option<Vec<u8>>,
}

impl InvokeResponse {
    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status_code: 200,
            payload: Some(payload.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Transport to the remote function. Retry and backoff, if any, live behind
/// this seam.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(
        &self,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<InvokeResponse, InvocationError>;
}

#[async_trait]
impl<I: RemoteInvoker + ?Sized> RemoteInvoker for Arc<I> {
    async fn invoke(
        &self,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<InvokeResponse, InvocationError> {
        (**self).invoke(payload, deadline).await
    }
}

/// Selects the records a processor acts on. Records it rejects pass through.
pub type RecordPredicate<T> = Arc<dyn Fn(&Record<T>) -> bool + Send + Sync>;

#[derive(Error)]
pub enum BatchInvokeError<T> {
    /// Strict mode saw a response whose record count differs from the batch.
    /// `records` holds everything the call would otherwise have returned, with
    /// the mismatched originals tagged as failed.
    #[error("Remote function returned {actual} records for a batch of {expected}")]
    ReconciliationMismatch {
        expected: usize,
        actual: usize,
        records: Vec<Record<T>>,
    },
}

impl<T> BatchInvokeError<T> {
    pub fn records(&self) -> &[Record<T>] {
        match self {
            BatchInvokeError::ReconciliationMismatch { records, .. } => records,
        }
    }

    pub fn into_records(self) -> Vec<Record<T>> {
        match self {
            BatchInvokeError::ReconciliationMismatch { records, .. } => records,
        }
    }

    pub fn reconciliation_error(&self) -> ReconciliationError {
        match self {
            BatchInvokeError::ReconciliationMismatch {
                expected, actual, ..
            } => ReconciliationError::Mismatch {
                expected: *expected,
                actual: *actual,
            },
        }
    }
}

impl<T> fmt::Debug for BatchInvokeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchInvokeError::ReconciliationMismatch {
                expected,
                actual,
                records,
            } => f
                .debug_struct("ReconciliationMismatch")
                .field("expected", expected)
                .field("actual", actual)
                .field("records", &records.len())
                .finish(),
        }
    }
}

impl<T> From<BatchInvokeError<T>> for PipelineError {
    fn from(err: BatchInvokeError<T>) -> Self {
        PipelineError::Reconciliation(err.reconciliation_error())
    }
}

enum BatchOutcome<T> {
    Done(Vec<Record<T>>),
    Mismatch {
        expected: usize,
        actual: usize,
        records: Vec<Record<T>>,
    },
}

/// Sends records to a remote function in batches and reconciles the response
/// back into the record stream.
pub struct BatchInvokeProcessor<T, I, C> {
    invoker: I,
    codec: C,
    config: BatchInvokeConfig,
    predicate: Option<RecordPredicate<T>>,
    metrics: Arc<dyn Metrics>,
}

impl<T, I, C> BatchInvokeProcessor<T, I, C>
where
    T: Send + Sync,
    I: RemoteInvoker,
    C: RequestCodec<T> + ResponseCodec<T>,
{
    pub fn new(invoker: I, codec: C, config: BatchInvokeConfig) -> Self {
        Self {
            invoker,
            codec,
            config,
            predicate: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_predicate(mut self, predicate: RecordPredicate<T>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &BatchInvokeConfig {
        &self.config
    }

    /// Invokes the remote function on every selected record.
    ///
    /// Records the predicate rejects come first in the output, unchanged, then
    /// the output of each batch in order. Failed batches come back as their
    /// tagged originals, so only a strict-mode count mismatch is an error.
    pub async fn process(
        &self,
        records: Vec<Record<T>>,
    ) -> Result<Vec<Record<T>>, BatchInvokeError<T>> {
        if records.is_empty() {
            return Ok(records);
        }

        let (mut output, selected): (Vec<_>, Vec<_>) = match &self.predicate {
            Some(predicate) => records.into_iter().partition(|record| !predicate(record)),
            None => (Vec::new(), records),
        };
        if selected.is_empty() {
            return Ok(output);
        }

        let batches = self.build_batches(selected);
        debug!(
            function = %self.config.function_name,
            batches = batches.len(),
            passthrough = output.len(),
            "invoking remote function"
        );

        let outcomes: Vec<BatchOutcome<T>> = stream::iter(batches)
            .map(|batch| self.invoke_batch(batch))
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut mismatch = None;
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Done(records) => output.extend(records),
                BatchOutcome::Mismatch {
                    expected,
                    actual,
                    records,
                } => {
                    output.extend(records);
                    mismatch.get_or_insert((expected, actual));
                }
            }
        }

        match mismatch {
            Some((expected, actual)) => Err(BatchInvokeError::ReconciliationMismatch {
                expected,
                actual,
                records: output,
            }),
            None => Ok(output),
        }
    }

    /// Cuts `records` into batches of at most `max_events` records and, where
    /// possible, `max_bytes` of payload. A single record larger than
    /// `max_bytes` still gets a batch of its own.
    fn build_batches(&self, records: Vec<Record<T>>) -> Vec<Vec<Record<T>>> {
        let max_events = self.config.batch.max_events.max(1);
        let max_bytes = self.config.batch.max_bytes;

        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_bytes: usize = 0;
        for record in records {
            let size = self.codec.encoded_len(&record);
            if !current.is_empty()
                && (current.len() >= max_events || current_bytes.saturating_add(size) > max_bytes)
            {
                batches.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes = current_bytes.saturating_add(size);
            current.push(record);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    async fn invoke_batch(&self, batch: Vec<Record<T>>) -> BatchOutcome<T> {
        let payload = match self.codec.encode(&batch) {
            Ok(payload) => payload,
            Err(err) => {
                let err = InvocationError::Encode {
                    reason: err.to_string(),
                };
                return BatchOutcome::Done(self.fail(batch, &err));
            }
        };
        self.metrics
            .record(REQUEST_PAYLOAD_BYTES, payload.len() as f64);

        let deadline = self.config.invoke_timeout();
        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, self.invoker.invoke(payload, deadline)).await
        {
            Ok(result) => result,
            Err(_) => Err(InvocationError::Timeout { deadline }),
        };
        self.metrics
            .record(INVOKE_LATENCY_MS, started.elapsed().as_secs_f64() * 1000.0);

        match result.and_then(|response| self.decode_response(response)) {
            Ok(outputs) => self.reconcile(batch, outputs),
            Err(err) => BatchOutcome::Done(self.fail(batch, &err)),
        }
    }

    fn decode_response(&self, response: InvokeResponse) -> Result<Vec<Record<T>>, InvocationError> {
        if !response.is_success() {
            return Err(InvocationError::Status {
                status_code: response.status_code,
            });
        }
        let payload = match response.payload {
            Some(payload) if !payload.iter().all(u8::is_ascii_whitespace) => payload,
            _ => return Err(InvocationError::EmptyPayload),
        };
        self.metrics
            .record(RESPONSE_PAYLOAD_BYTES, payload.len() as f64);
        Ok(self.codec.decode(&payload)?)
    }

    fn reconcile(&self, originals: Vec<Record<T>>, outputs: Vec<Record<T>>) -> BatchOutcome<T> {
        let expected = originals.len();
        let actual = outputs.len();
        self.metrics.increment(REQUESTS_SUCCESS);

        if self.config.response_events_match && actual != expected {
            self.metrics.increment_by(RECORDS_FAILED, expected as u64);
            error!(
                function = %self.config.function_name,
                expected,
                actual,
                "response record count does not match the request in strict mode"
            );
            let records = self.tag_failed(originals);
            return BatchOutcome::Mismatch {
                expected,
                actual,
                records,
            };
        }

        self.metrics.increment_by(RECORDS_SUCCESS, expected as u64);
        for original in &originals {
            original.acknowledge();
        }

        if !self.config.response_events_match {
            return BatchOutcome::Done(outputs);
        }

        let inherited = originals
            .into_iter()
            .zip(outputs)
            .map(|(original, output)| {
                let (data, output_metadata) = output.into_parts();
                let mut metadata = RecordMetadata::received_at(original.metadata().time_received());
                metadata.add_tags(original.metadata().tags().iter().cloned());
                metadata.add_tags(output_metadata.tags().iter().cloned());
                Record::with_metadata(data, metadata)
            })
            .collect();
        BatchOutcome::Done(inherited)
    }

    fn fail(&self, batch: Vec<Record<T>>, err: &InvocationError) -> Vec<Record<T>> {
        warn!(
            function = %self.config.function_name,
            records = batch.len(),
            error = %err,
            "remote invocation failed, returning tagged originals"
        );
        self.metrics.increment(REQUESTS_FAILED);
        self.metrics.increment_by(RECORDS_FAILED, batch.len() as u64);
        self.tag_failed(batch)
    }

    fn tag_failed(&self, mut batch: Vec<Record<T>>) -> Vec<Record<T>> {
        for record in &mut batch {
            record.add_tags(self.config.tags_on_failure.iter().cloned());
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledgement::AcknowledgementSetManager;
    use crate::record::Event;
    use crate::telemetry::InMemoryMetrics;
    use mockall::predicate::always;
    use parking_lot::Mutex;
    use serde_json::json;

    fn invoke_config(strict: bool) -> BatchInvokeConfig {
        let mut config = BatchInvokeConfig::new("enrich");
        config.response_events_match = strict;
        config
    }

    fn records(n: usize) -> Vec<Record<Event>> {
        (0..n).map(|i| Record::new(json!({"id": i}))).collect()
    }

    fn responding(payload: Option<&'static str>, status_code: u16) -> MockRemoteInvoker {
        let mut invoker = MockRemoteInvoker::new();
        invoker.expect_invoke().returning(move |_, _| {
            Ok(InvokeResponse {
                status_code,
                payload: payload.map(|p| p.as_bytes().to_vec()),
            })
        });
        invoker
    }

    fn build(
        invoker: MockRemoteInvoker,
        config: BatchInvokeConfig,
    ) -> (
        BatchInvokeProcessor<Event, MockRemoteInvoker, JsonCodec>,
        Arc<InMemoryMetrics>,
    ) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let codec = JsonCodec::new(config.batch.key_name.clone());
        let processor =
            BatchInvokeProcessor::new(invoker, codec, config).with_metrics(metrics.clone());
        (processor, metrics)
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_call() {
        let mut invoker = MockRemoteInvoker::new();
        invoker.expect_invoke().never();
        let (processor, metrics) = build(invoker, invoke_config(false));

        let output = processor.process(Vec::new()).await.unwrap();

        assert!(output.is_empty());
        assert!(metrics.snapshot().counters.is_empty());
    }

    #[tokio::test]
    async fn test_null_payload_returns_tagged_originals() {
        let (processor, metrics) = build(responding(None, 200), invoke_config(false));

        let output = processor.process(records(3)).await.unwrap();

        assert_eq!(output.len(), 3);
        for (i, record) in output.iter().enumerate() {
            assert_eq!(record.data(), &json!({"id": i}));
            assert!(record.metadata().has_tag("lambda_failure"));
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(RECORDS_FAILED), 3);
        assert_eq!(snapshot.counter(REQUESTS_FAILED), 1);
        assert_eq!(snapshot.counter(RECORDS_SUCCESS), 0);
    }

    #[tokio::test]
    async fn test_error_status_and_transport_failure_take_failure_path() {
        let (processor, metrics) = build(responding(Some("[]"), 500), invoke_config(false));
        let output = processor.process(records(2)).await.unwrap();
        assert!(output.iter().all(|r| r.metadata().has_tag("lambda_failure")));
        assert_eq!(metrics.snapshot().counter(REQUESTS_FAILED), 1);

        let mut invoker = MockRemoteInvoker::new();
        invoker.expect_invoke().returning(|_, _| {
            Err(InvocationError::Transport {
                reason: "connection refused".to_string(),
            })
        });
        let mut config = invoke_config(false);
        config.tags_on_failure = vec!["invoke_failed".to_string(), "retry".to_string()];
        let (processor, _) = build(invoker, config);
        let output = processor.process(records(1)).await.unwrap();
        assert_eq!(output[0].metadata().tags(), ["invoke_failed", "retry"]);
    }

    #[tokio::test]
    async fn test_undecodable_payload_takes_failure_path() {
        let (processor, metrics) = build(responding(Some("{oops"), 200), invoke_config(false));

        let output = processor.process(records(2)).await.unwrap();

        assert_eq!(output.len(), 2);
        assert!(output.iter().all(|r| r.metadata().has_tag("lambda_failure")));
        assert_eq!(metrics.snapshot().counter(RECORDS_FAILED), 2);
    }

    #[tokio::test]
    async fn test_lenient_mode_returns_decoded_records_and_acks_originals() {
        let acked = Arc::new(Mutex::new(Vec::new()));
        let manager = AcknowledgementSetManager::default();
        let sink = acked.clone();
        let set = manager.create(2, Duration::from_secs(60), move |ok| sink.lock().push(ok));

        let mut input = records(2);
        for record in &mut input {
            record.metadata_mut().set_event_handle(set.handle());
        }

        let (processor, metrics) = build(
            responding(Some(r#"[{"r":1},{"r":2},{"r":3}]"#), 200),
            invoke_config(false),
        );
        let output = processor.process(input).await.unwrap();

        assert_eq!(output.len(), 3);
        assert!(output.iter().all(|r| r.event_handle().is_none()));
        assert_eq!(*acked.lock(), vec![true]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(RECORDS_SUCCESS), 2);
        assert_eq!(snapshot.counter(REQUESTS_SUCCESS), 1);
        assert!(snapshot.distribution(REQUEST_PAYLOAD_BYTES).is_some());
        assert!(snapshot.distribution(RESPONSE_PAYLOAD_BYTES).is_some());
        assert!(snapshot.distribution(INVOKE_LATENCY_MS).is_some());
    }

    #[tokio::test]
    async fn test_lenient_mode_accepts_zero_outputs() {
        let (processor, metrics) = build(responding(Some("{}"), 200), invoke_config(false));

        let output = processor.process(records(4)).await.unwrap();

        assert!(output.is_empty());
        assert_eq!(metrics.snapshot().counter(RECORDS_SUCCESS), 4);
    }

    #[tokio::test]
    async fn test_strict_mode_outputs_inherit_original_metadata() {
        let mut input = records(2);
        input[0].add_tags(["from_http"]);
        let received = input[1].metadata().time_received();

        let (processor, _) = build(
            responding(Some(r#"{"events":[{"r":"a"},{"r":"b"}]}"#), 200),
            invoke_config(true),
        );
        let output = processor.process(input).await.unwrap();

        assert_eq!(output[0].data(), &json!({"r": "a"}));
        assert_eq!(output[0].metadata().tags(), ["from_http"]);
        assert_eq!(output[1].metadata().time_received(), received);
    }

    #[tokio::test]
    async fn test_strict_mode_mismatch_is_an_error_carrying_records() {
        let acked = Arc::new(Mutex::new(Vec::new()));
        let manager = AcknowledgementSetManager::default();
        let sink = acked.clone();
        let set = manager.create(3, Duration::from_secs(60), move |ok| sink.lock().push(ok));
        let mut input = records(3);
        for record in &mut input {
            record.metadata_mut().set_event_handle(set.handle());
        }

        let (processor, metrics) =
            build(responding(Some(r#"[{"r":1},{"r":2}]"#), 200), invoke_config(true));
        let err = processor.process(input).await.unwrap_err();

        assert_eq!(
            err.reconciliation_error(),
            ReconciliationError::Mismatch {
                expected: 3,
                actual: 2
            }
        );
        let records = err.into_records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.metadata().has_tag("lambda_failure")));
        assert!(records.iter().all(|r| r.event_handle().is_some()));
        // not acknowledged by the processor
        assert!(acked.lock().is_empty());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(REQUESTS_SUCCESS), 1);
        assert_eq!(snapshot.counter(RECORDS_FAILED), 3);
        assert_eq!(snapshot.counter(RECORDS_SUCCESS), 0);
    }

    #[tokio::test]
    async fn test_predicate_passes_records_through_uncounted() {
        let mut invoker = MockRemoteInvoker::new();
        invoker
            .expect_invoke()
            .with(always(), always())
            .times(1)
            .returning(|payload, _| {
                let sent: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                assert_eq!(sent, json!({"events": [{"id": 1}]}));
                Ok(InvokeResponse::ok(r#"[{"id": 1, "enriched": true}]"#))
            });
        let (processor, metrics) = build(invoker, invoke_config(false));
        let processor = processor.with_predicate(Arc::new(|record: &Record<Event>| {
            record.data()["id"] == json!(1)
        }));

        let output = processor.process(records(3)).await.unwrap();

        assert_eq!(
            output.iter().map(|r| r.data().clone()).collect::<Vec<_>>(),
            vec![
                json!({"id": 0}),
                json!({"id": 2}),
                json!({"id": 1, "enriched": true})
            ]
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counter(RECORDS_SUCCESS), 1);
        assert_eq!(snapshot.counter(REQUESTS_SUCCESS), 1);
    }

    #[tokio::test]
    async fn test_batches_split_by_event_count_and_bytes() {
        let mut invoker = MockRemoteInvoker::new();
        invoker
            .expect_invoke()
            .times(3)
            .returning(|payload, _| Ok(InvokeResponse::ok(payload)));
        let mut config = invoke_config(false);
        config.batch.key_name = None;
        config.batch.max_events = 2;
        let (processor, metrics) = build(invoker, config);

        let output = processor.process(records(5)).await.unwrap();

        assert_eq!(output.len(), 5);
        assert_eq!(output[4].data(), &json!({"id": 4}));
        assert_eq!(metrics.snapshot().counter(REQUESTS_SUCCESS), 3);

        let (processor, _) = processor_with_max_bytes(12);
        let batches = processor.build_batches(records(3));
        // {"id":0} is 8 bytes plus a separator, so each record fills a batch
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 1, 1]);
    }

    fn processor_with_max_bytes(
        max_bytes: usize,
    ) -> (
        BatchInvokeProcessor<Event, MockRemoteInvoker, JsonCodec>,
        Arc<InMemoryMetrics>,
    ) {
        let mut config = invoke_config(false);
        config.batch.max_bytes = max_bytes;
        build(MockRemoteInvoker::new(), config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_invoke_past_deadline_times_out() {
        struct Slow;

        #[async_trait]
        impl RemoteInvoker for Slow {
            async fn invoke(
                &self,
                _payload: Vec<u8>,
                _deadline: Duration,
            ) -> Result<InvokeResponse, InvocationError> {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(InvokeResponse::ok("[]"))
            }
        }

        let mut config = invoke_config(false);
        config.invoke_timeout_ms = 100;
        let metrics = Arc::new(InMemoryMetrics::new());
        let processor = BatchInvokeProcessor::new(Slow, JsonCodec::default(), config)
            .with_metrics(metrics.clone());

        let output = processor.process(records(1)).await.unwrap();

        assert!(output[0].metadata().has_tag("lambda_failure"));
        assert_eq!(metrics.snapshot().counter(REQUESTS_FAILED), 1);
    }
}
