pub mod log;
pub mod memory;

pub use log::LogSink;
pub use memory::MemorySink;

use async_trait::async_trait;

use crate::errors::Result;
use crate::record::Record;

/// Final destination of processed records.
///
/// A sink owns the records it is given and is responsible for releasing their
/// acknowledgement handles once the output is durable. When `output` fails it
/// must still release every handle it was given, negatively for records it
/// did not write, before returning the error. The caller no longer holds the
/// records.
#[async_trait]
pub trait Sink<T>: Send + Sync {
    async fn output(&self, records: Vec<Record<T>>) -> Result<()>;

    /// Flushes anything held back. Called once during a graceful shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
