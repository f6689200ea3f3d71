//! Fixed-capacity buffer between the adapters that produce records and the
//! worker that consumes them.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::errors::{BufferError, ConfigError};

/// A rejected write. The buffer never keeps what it could not accept, so the
/// caller gets the record (or the whole group for [`BoundedBuffer::write_all`])
/// back alongside the reason.
pub struct WriteError<R> {
    kind: BufferError,
    rejected: R,
}

impl<R> WriteError<R> {
    fn new(kind: BufferError, rejected: R) -> Self {
        Self { kind, rejected }
    }

    pub fn kind(&self) -> &BufferError {
        &self.kind
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, BufferError::Timeout { .. })
    }

    pub fn into_rejected(self) -> R {
        self.rejected
    }

    pub fn into_parts(self) -> (BufferError, R) {
        (self.kind, self.rejected)
    }
}

impl<R> fmt::Debug for WriteError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteError")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<R> fmt::Display for WriteError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl<R> std::error::Error for WriteError<R> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl<R> From<WriteError<R>> for BufferError {
    fn from(err: WriteError<R>) -> Self {
        err.kind
    }
}

/// Bounded FIFO of records with blocking-with-timeout writes and batched reads.
///
/// Free slots are semaphore permits: a writer takes a permit before pushing
/// and a reader returns one for every item it removes, so the queue never
/// holds more than `capacity` items.
pub struct BoundedBuffer<T> {
    name: String,
    capacity: usize,
    batch_size: usize,
    slots: Semaphore,
    items: Mutex<VecDeque<T>>,
    readable: Notify,
}

impl<T> fmt::Debug for BoundedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedBuffer")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("batch_size", &self.batch_size)
            .field("size", &self.size())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> BoundedBuffer<T> {
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        batch_size: usize,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid {
                message: format!("buffer capacity must be between 1 and {}", Semaphore::MAX_PERMITS),
            });
        }
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "buffer batch_size must be greater than 0".to_string(),
            });
        }
        Ok(Self {
            name: name.into(),
            capacity,
            batch_size,
            slots: Semaphore::new(capacity),
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            readable: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn size(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Writes one record, waiting up to `timeout` for a free slot.
    pub async fn write(&self, record: T, timeout: Duration) -> Result<(), WriteError<T>> {
        match tokio::time::timeout(timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.items.lock().push_back(record);
                self.readable.notify_one();
                Ok(())
            }
            Ok(Err(_)) => Err(WriteError::new(BufferError::Closed, record)),
            Err(_) => {
                debug!(buffer = %self.name, ?timeout, "buffer write timed out");
                Err(WriteError::new(BufferError::Timeout { timeout }, record))
            }
        }
    }

    /// Writes the whole group or nothing. Room for every record is reserved
    /// before any of them becomes visible to readers.
    pub async fn write_all(&self, records: Vec<T>, timeout: Duration) -> Result<(), WriteError<Vec<T>>> {
        if records.is_empty() {
            return Ok(());
        }
        let requested = records.len();
        let overflow = BufferError::SizeOverflow {
            requested,
            capacity: self.capacity,
        };
        if requested > self.capacity {
            return Err(WriteError::new(overflow, records));
        }
        let Ok(permits) = u32::try_from(requested) else {
            return Err(WriteError::new(overflow, records));
        };

        match tokio::time::timeout(timeout, self.slots.acquire_many(permits)).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.items.lock().extend(records);
                // a reader that leaves items behind wakes the next one
                self.readable.notify_one();
                Ok(())
            }
            Ok(Err(_)) => Err(WriteError::new(BufferError::Closed, records)),
            Err(_) => {
                debug!(buffer = %self.name, requested, ?timeout, "buffer group write timed out");
                Err(WriteError::new(BufferError::Timeout { timeout }, records))
            }
        }
    }

    /// Returns up to `batch_size` records as soon as at least one is
    /// available, or an empty batch once `timeout` has elapsed. A closed and
    /// empty buffer returns immediately.
    pub async fn read(&self, timeout: Duration) -> Vec<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            // register before checking so a write between the check and the
            // wait is not missed
            notified.as_mut().enable();

            let batch = self.take(self.batch_size);
            if !batch.is_empty() || self.is_closed() {
                return batch;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take(self.batch_size);
            }
        }
    }

    /// Stops accepting writes. Pending and future writers get
    /// [`BufferError::Closed`] with their record; readers keep draining.
    pub fn close(&self) {
        if !self.slots.is_closed() {
            self.slots.close();
            self.readable.notify_waiters();
            debug!(buffer = %self.name, remaining = self.size(), "buffer closed");
        }
    }

    /// Removes everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        self.take(usize::MAX)
    }

    fn take(&self, max: usize) -> Vec<T> {
        let (batch, more) = {
            let mut items = self.items.lock();
            let n = items.len().min(max);
            let batch: Vec<T> = items.drain(..n).collect();
            (batch, !items.is_empty())
        };
        if !batch.is_empty() {
            self.slots.add_permits(batch.len());
        }
        if more {
            self.readable.notify_one();
        }
        batch
    }
}
