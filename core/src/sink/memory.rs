use async_trait::async_trait;
use parking_lot::Mutex;

use super::Sink;
use crate::errors::Result;
use crate::record::Record;

/// Keeps every record it receives, acknowledging each on arrival.
#[derive(Debug)]
pub struct MemorySink<T> {
    records: Mutex<Vec<Record<T>>>,
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record<T>> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn take(&self) -> Vec<Record<T>> {
        std::mem::take(&mut *self.records.lock())
    }
}

#[async_trait]
impl<T> Sink<T> for MemorySink<T>
where
    T: Send + Sync + 'static,
{
    async fn output(&self, records: Vec<Record<T>>) -> Result<()> {
        for record in &records {
            record.acknowledge();
        }
        self.records.lock().extend(records);
        Ok(())
    }
}
