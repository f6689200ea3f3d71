use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::Sink;
use crate::errors::Result;
use crate::record::{Record, RecordMetadata};
use crate::telemetry::{Metrics, NoopMetrics};

pub const RECORDS_OUT: &str = "records_out";
pub const RECORDS_DROPPED: &str = "records_dropped";

#[derive(Serialize)]
struct OutputLine<'a, T> {
    data: &'a T,
    #[serde(flatten)]
    metadata: &'a RecordMetadata,
}

/// Writes each record as one JSON line through `tracing` and acknowledges it.
pub struct LogSink {
    metrics: Arc<dyn Metrics>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl LogSink {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self { metrics }
    }

    pub fn format<T: Serialize>(record: &Record<T>) -> serde_json::Result<String> {
        serde_json::to_string(&OutputLine {
            data: record.data(),
            metadata: record.metadata(),
        })
    }
}

#[async_trait]
impl<T> Sink<T> for LogSink
where
    T: Serialize + Send + Sync + 'static,
{
    async fn output(&self, records: Vec<Record<T>>) -> Result<()> {
        for record in records {
            match Self::format(&record) {
                Ok(line) => {
                    info!(target: "pipeline_core::sink", "{line}");
                    self.metrics.increment(RECORDS_OUT);
                    record.acknowledge();
                }
                Err(err) => {
                    warn!(error = %err, "dropping record that cannot be serialized");
                    self.metrics.increment(RECORDS_DROPPED);
                    record.release(false);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledgement::AcknowledgementSetManager;
    use crate::telemetry::InMemoryMetrics;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_format_includes_tags_and_time() {
        let time = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut record = Record::with_metadata(json!({"log": "x"}), RecordMetadata::received_at(time));
        record.add_tags(["lambda_failure"]);

        let line: serde_json::Value =
            serde_json::from_str(&LogSink::format(&record).unwrap()).unwrap();

        assert_eq!(
            line,
            json!({
                "data": {"log": "x"},
                "tags": ["lambda_failure"],
                "time_received": "2024-05-01T10:00:00Z"
            })
        );
    }

    #[tokio::test]
    async fn test_output_acknowledges_each_record() {
        let manager = AcknowledgementSetManager::default();
        let outcome = Arc::new(Mutex::new(None));
        let sink_outcome = outcome.clone();
        let set = manager.create(2, Duration::from_secs(5), move |ok| {
            *sink_outcome.lock() = Some(ok);
        });
        let records: Vec<_> = (0..2)
            .map(|i| {
                let mut record = Record::new(json!({ "n": i }));
                record.metadata_mut().set_event_handle(set.handle());
                record
            })
            .collect();

        let metrics = Arc::new(InMemoryMetrics::new());
        LogSink::new(metrics.clone()).output(records).await.unwrap();

        assert_eq!(*outcome.lock(), Some(true));
        assert_eq!(metrics.snapshot().counter(RECORDS_OUT), 2);
    }
}
