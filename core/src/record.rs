//! Records flowing through the pipeline and their per-record metadata.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::acknowledgement::EventHandle;

/// The event payload carried by every built-in adapter.
pub type Event = serde_json::Value;

/// A unit of data plus the metadata the pipeline attaches to it.
///
/// The record is owned by whichever stage currently holds it; writing it into
/// a buffer moves it there, and a failed write hands it back.
#[derive(Debug, Clone)]
pub struct Record<T> {
    data: T,
    metadata: RecordMetadata,
}

impl<T> Record<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            metadata: RecordMetadata::default(),
        }
    }

    pub fn with_metadata(data: T, metadata: RecordMetadata) -> Self {
        Self { data, metadata }
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn metadata(&self) -> &RecordMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut RecordMetadata {
        &mut self.metadata
    }

    pub fn into_parts(self) -> (T, RecordMetadata) {
        (self.data, self.metadata)
    }

    /// Shorthand for [`RecordMetadata::add_tags`].
    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.add_tags(tags);
    }

    pub fn event_handle(&self) -> Option<&EventHandle> {
        self.metadata.event_handle.as_ref()
    }

    /// Positively acknowledges the record's handle, if it has one.
    pub fn acknowledge(&self) {
        if let Some(handle) = &self.metadata.event_handle {
            handle.acknowledge();
        }
    }

    /// Releases the record's handle with the given outcome, if it has one.
    pub fn release(&self, success: bool) {
        if let Some(handle) = &self.metadata.event_handle {
            handle.release(success);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordMetadata {
    tags: Vec<String>,
    time_received: DateTime<Utc>,
    #[serde(skip)]
    event_handle: Option<EventHandle>,
}

impl Default for RecordMetadata {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            time_received: Utc::now(),
            event_handle: None,
        }
    }
}

impl RecordMetadata {
    pub fn received_at(time_received: DateTime<Utc>) -> Self {
        Self {
            time_received,
            ..Self::default()
        }
    }

    /// Tags in the order they were first added.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Appends each tag not already present. Tags are never removed.
    pub fn add_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.has_tag(&tag) {
                self.tags.push(tag);
            }
        }
    }

    pub fn time_received(&self) -> DateTime<Utc> {
        self.time_received
    }

    pub fn event_handle(&self) -> Option<&EventHandle> {
        self.event_handle.as_ref()
    }

    pub fn set_event_handle(&mut self, handle: EventHandle) {
        self.event_handle = Some(handle);
    }

    pub fn take_event_handle(&mut self) -> Option<EventHandle> {
        self.event_handle.take()
    }
}
