use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::acknowledgement::AcknowledgementSet;
use crate::buffer::BoundedBuffer;
use crate::errors::{PipelineError, Result};
use crate::record::{Event, Record};

/// An SQS message as delivered by the queue (or an SQS-triggered Lambda).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsMessage {
    pub message_id: String,
    #[serde(default)]
    pub receipt_handle: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Converts one SQS message into records and writes them to the buffer.
/// Every record written joins `ack_set` when one is given.
#[async_trait]
pub trait SqsMessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        message: &SqsMessage,
        queue_url: &str,
        buffer: &BoundedBuffer<Record<Event>>,
        timeout: Duration,
        ack_set: Option<&Arc<AcknowledgementSet>>,
    ) -> Result<()>;
}

/// Writes each message body as a single record.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSqsMessageHandler;

#[async_trait]
impl SqsMessageHandler for RawSqsMessageHandler {
    async fn handle_message(
        &self,
        message: &SqsMessage,
        queue_url: &str,
        buffer: &BoundedBuffer<Record<Event>>,
        timeout: Duration,
        ack_set: Option<&Arc<AcknowledgementSet>>,
    ) -> Result<()> {
        let mut record = Record::new(json!({
            "message": message.body,
            "message_id": message.message_id,
        }));
        if let Some(set) = ack_set {
            set.add(&mut record);
        }

        if let Err(err) = buffer.write(record, timeout).await {
            let (kind, record) = err.into_parts();
            warn!(
                queue_url,
                message_id = %message.message_id,
                error = %kind,
                "failed to buffer SQS message"
            );
            // the record joined the set but will never reach a sink
            record.release(false);
            return Err(PipelineError::Buffer(kind));
        }
        debug!(queue_url, message_id = %message.message_id, "buffered SQS message");
        Ok(())
    }
}

/// Dispatches SQS messages to the handler for their type.
pub struct SqsEventProcessor<H> {
    handler: H,
}

impl<H: SqsMessageHandler> SqsEventProcessor<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    pub async fn add_sqs_object(
        &self,
        message: &SqsMessage,
        queue_url: &str,
        buffer: &BoundedBuffer<Record<Event>>,
        timeout: Duration,
        ack_set: Option<&Arc<AcknowledgementSet>>,
    ) -> Result<()> {
        self.handler
            .handle_message(message, queue_url, buffer, timeout, ack_set)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acknowledgement::{AckStatus, AcknowledgementSetManager};
    use crate::errors::BufferError;
    use parking_lot::Mutex;

    const QUEUE_URL: &str = "https://sqs.us-east-1.amazonaws.com/123456789012/logs";

    fn message(id: &str, body: &str) -> SqsMessage {
        SqsMessage {
            message_id: id.to_string(),
            receipt_handle: Some(format!("rh-{id}")),
            body: body.to_string(),
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn test_deserializes_lambda_sqs_record() {
        let message: SqsMessage = serde_json::from_value(json!({
            "messageId": "059f36b4",
            "receiptHandle": "AQEBwJnKyrHigUMZj6rYigCgxlaS3SLy0a",
            "body": "hello",
            "attributes": {"ApproximateReceiveCount": "1"},
            "eventSource": "aws:sqs"
        }))
        .unwrap();

        assert_eq!(message.message_id, "059f36b4");
        assert_eq!(message.body, "hello");
        assert_eq!(message.attributes["ApproximateReceiveCount"], "1");
    }

    #[tokio::test]
    async fn test_raw_handler_attaches_record_to_ack_set() {
        let buffer = BoundedBuffer::new("sqs", 4, 4).unwrap();
        let manager = AcknowledgementSetManager::default();
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        let set = manager.create_open(Duration::from_secs(30), move |ok| {
            *sink.lock() = Some(ok);
        });
        let processor = SqsEventProcessor::new(RawSqsMessageHandler);

        processor
            .add_sqs_object(
                &message("m-1", "log line"),
                QUEUE_URL,
                &buffer,
                Duration::from_millis(10),
                Some(&set),
            )
            .await
            .unwrap();
        set.seal();

        let records = buffer.read(Duration::ZERO).await;
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].data(),
            &json!({"message": "log line", "message_id": "m-1"})
        );
        assert_eq!(records[0].event_handle().unwrap().set_id(), set.id());
        assert!(outcome.lock().is_none());

        records[0].acknowledge();
        assert_eq!(*outcome.lock(), Some(true));
        assert_eq!(set.status(), AckStatus::Complete);
    }

    #[tokio::test]
    async fn test_without_ack_set_record_has_no_handle() {
        let buffer = BoundedBuffer::new("sqs", 4, 4).unwrap();
        let processor = SqsEventProcessor::new(RawSqsMessageHandler);

        processor
            .add_sqs_object(&message("m-2", "x"), QUEUE_URL, &buffer, Duration::ZERO, None)
            .await
            .unwrap();

        let records = buffer.read(Duration::ZERO).await;
        assert!(records[0].event_handle().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_timeout_fails_the_ack_set() {
        let buffer = BoundedBuffer::new("sqs", 1, 1).unwrap();
        buffer
            .write(Record::new(json!({})), Duration::ZERO)
            .await
            .unwrap();
        let manager = AcknowledgementSetManager::default();
        let outcome = Arc::new(Mutex::new(None));
        let sink = outcome.clone();
        let set = manager.create_open(Duration::from_secs(30), move |ok| {
            *sink.lock() = Some(ok);
        });
        let processor = SqsEventProcessor::new(RawSqsMessageHandler);

        let err = processor
            .add_sqs_object(
                &message("m-3", "x"),
                QUEUE_URL,
                &buffer,
                Duration::from_millis(20),
                Some(&set),
            )
            .await
            .unwrap_err();
        set.seal();

        assert!(matches!(
            err,
            PipelineError::Buffer(BufferError::Timeout { .. })
        ));
        assert_eq!(*outcome.lock(), Some(false));
    }
}
