use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use lambda_runtime::{Error, LambdaEvent, service_fn};
use parking_lot::Mutex;
use pipeline_core::acknowledgement::AcknowledgementSetManager;
use pipeline_core::buffer::BoundedBuffer;
use pipeline_core::config::{PipelineConfig, SqsSourceConfig, load_config};
use pipeline_core::ingestor::Ingestor;
use pipeline_core::invoke::{BatchInvokeProcessor, HttpInvoker, JsonCodec};
use pipeline_core::sink::LogSink;
use pipeline_core::source::{RawSqsMessageHandler, SqsEventProcessor, SqsMessage};
use pipeline_core::telemetry::{self, InMemoryMetrics};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// SQS trigger payload.
#[derive(Debug, Deserialize)]
struct SqsEvent {
    #[serde(rename = "Records", default)]
    records: Vec<SqsMessage>,
}

/// Partial batch response: only the listed messages are redelivered.
#[derive(Debug, Default, Serialize, PartialEq)]
struct SqsBatchResponse {
    #[serde(rename = "batchItemFailures")]
    batch_item_failures: Vec<BatchItemFailure>,
}

#[derive(Debug, Serialize, PartialEq)]
struct BatchItemFailure {
    #[serde(rename = "itemIdentifier")]
    item_identifier: String,
}

/// Per-process state reused across invocations. Buffers and acknowledgement
/// sets are per invocation.
struct LambdaRunner {
    config: PipelineConfig,
    sqs: SqsSourceConfig,
    invoker: Arc<HttpInvoker>,
    sqs_processor: SqsEventProcessor<RawSqsMessageHandler>,
    metrics: Arc<InMemoryMetrics>,
}

impl LambdaRunner {
    fn new(config: PipelineConfig) -> Result<Self> {
        let sqs = config
            .sources
            .sqs
            .clone()
            .context("sources.sqs is required by the lambda runner")?;
        let invoke = &config.processor.batch_invoke;
        let endpoint = invoke
            .endpoint
            .as_deref()
            .context("processor.batch_invoke.endpoint is required")?;
        let invoker = Arc::new(HttpInvoker::new(endpoint, &invoke.function_name));
        let metrics = Arc::new(InMemoryMetrics::with_prefix(config.name.as_str()));

        Ok(Self {
            sqs,
            invoker,
            sqs_processor: SqsEventProcessor::new(RawSqsMessageHandler),
            metrics,
            config,
        })
    }

    /// Buffers every message, drains the buffer through the remote function
    /// into the log sink, and reports the messages that were not fully
    /// acknowledged.
    async fn handle_batch(&self, event: SqsEvent) -> Result<SqsBatchResponse> {
        let buffer = Arc::new(BoundedBuffer::new(
            format!("{}.buffer", self.config.name),
            self.config.buffer.capacity,
            self.config.buffer.batch_size,
        )?);
        let acknowledgements = Arc::new(AcknowledgementSetManager::new(self.metrics.clone()));
        let invoke = self.config.processor.batch_invoke.clone();
        let codec = JsonCodec::new(invoke.batch.key_name.clone());
        let processor = BatchInvokeProcessor::new(self.invoker.clone(), codec, invoke)
            .with_metrics(self.metrics.clone());
        let ingestor = Ingestor::new(
            buffer.clone(),
            processor,
            LogSink::new(self.metrics.clone()),
            acknowledgements.clone(),
            self.config.buffer.read_timeout(),
        )
        .with_metrics(self.metrics.clone());

        let outcomes: Arc<Mutex<HashMap<String, bool>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut write_failures = HashSet::new();

        for message in &event.records {
            // make room rather than wait on a buffer nobody is reading yet
            while buffer.size() >= buffer.capacity() {
                if let Err(err) = ingestor.run_once().await {
                    warn!(error = %err, "batch failed while making room");
                }
            }

            let ack_set = self.sqs.acknowledgements.then(|| {
                let id = message.message_id.clone();
                let outcomes = outcomes.clone();
                acknowledgements.create_open(self.config.acknowledgements.timeout(), move |ok| {
                    outcomes.lock().insert(id, ok);
                })
            });

            let result = self
                .sqs_processor
                .add_sqs_object(
                    message,
                    &self.sqs.queue_url,
                    &buffer,
                    self.sqs.buffer_timeout(),
                    ack_set.as_ref(),
                )
                .await;
            if let Some(set) = &ack_set {
                set.seal();
            }
            if let Err(err) = result {
                warn!(message_id = %message.message_id, error = %err, "failed to buffer message");
                write_failures.insert(message.message_id.clone());
            }
        }

        let shutdown = ingestor.shutdown().await;
        if let Err(err) = &shutdown {
            warn!(error = %err, "errors while draining the buffer");
        }
        if !self.sqs.acknowledgements {
            shutdown.context("failed to process the batch")?;
        }

        let outcomes = outcomes.lock().clone();
        let response = batch_response(
            &event.records,
            &write_failures,
            self.sqs.acknowledgements.then_some(&outcomes),
        );
        info!(
            messages = event.records.len(),
            failures = response.batch_item_failures.len(),
            "sqs batch handled"
        );
        Ok(response)
    }
}

/// A message fails when it could not be buffered or, with acknowledgements
/// on, when its set did not complete successfully.
fn batch_response(
    messages: &[SqsMessage],
    write_failures: &HashSet<String>,
    outcomes: Option<&HashMap<String, bool>>,
) -> SqsBatchResponse {
    let batch_item_failures = messages
        .iter()
        .filter(|message| {
            write_failures.contains(&message.message_id)
                || outcomes.is_some_and(|outcomes| {
                    outcomes.get(&message.message_id) != Some(&true)
                })
        })
        .map(|message| BatchItemFailure {
            item_identifier: message.message_id.clone(),
        })
        .collect();
    SqsBatchResponse {
        batch_item_failures,
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    telemetry::init_tracing_with("pipeline_core=info,bootstrap=info");

    let config = load_config(None).await?;
    let runner = Arc::new(LambdaRunner::new(config)?);

    lambda_runtime::run(service_fn(move |event: LambdaEvent<SqsEvent>| {
        let runner = runner.clone();
        async move { Ok::<_, Error>(runner.handle_batch(event.payload).await?) }
    }))
    .await
}
