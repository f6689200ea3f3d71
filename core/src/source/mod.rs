//! Protocol adapters that translate inbound requests into buffered records.
//!
//! None of them own a listener or a poller: the hosting runner receives the
//! request and hands it to the adapter.

pub mod http;
pub mod sqs;
pub mod trace;

pub use http::LogHttpService;
pub use sqs::{RawSqsMessageHandler, SqsEventProcessor, SqsMessage, SqsMessageHandler};
pub use trace::{ExportTraceResponse, TraceExportService};
