//! Completion tracking for groups of records derived from one input.
//!
//! A producer creates an [`AcknowledgementSet`] (through the
//! [`AcknowledgementSetManager`]), attaches its [`EventHandle`] to every record
//! derived from the input, and is told through the completion callback whether
//! all of them were acknowledged before the deadline.

mod manager;

pub use manager::AcknowledgementSetManager;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::record::Record;

pub type CompletionCallback = Box<dyn FnOnce(bool) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AckSetId(u64);

impl AckSetId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AckSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ack-set-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Pending,
    Complete,
    Expired,
}

impl AckStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AckStatus::Pending)
    }
}

struct AckState {
    expected: usize,
    acked: usize,
    sealed: bool,
    all_positive: bool,
    status: AckStatus,
    inconsistent_acks: usize,
    callback: Option<CompletionCallback>,
}

impl AckState {
    /// Moves to a terminal state and hands back the callback to fire, at most once.
    fn finish(&mut self, status: AckStatus) -> Option<CompletionCallback> {
        if self.status.is_terminal() {
            return None;
        }
        self.status = status;
        self.callback.take()
    }
}

pub struct AcknowledgementSet {
    id: AckSetId,
    deadline: Instant,
    state: Mutex<AckState>,
}

impl fmt::Debug for AcknowledgementSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AcknowledgementSet")
            .field("id", &self.id)
            .field("expected", &state.expected)
            .field("acked", &state.acked)
            .field("sealed", &state.sealed)
            .field("status", &state.status)
            .finish()
    }
}

impl AcknowledgementSet {
    fn new(
        id: AckSetId,
        expected: usize,
        sealed: bool,
        deadline: Instant,
        callback: CompletionCallback,
    ) -> Self {
        Self {
            id,
            deadline,
            state: Mutex::new(AckState {
                expected,
                acked: 0,
                sealed,
                all_positive: true,
                status: AckStatus::Pending,
                inconsistent_acks: 0,
                callback: Some(callback),
            }),
        }
    }

    pub fn id(&self) -> AckSetId {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn status(&self) -> AckStatus {
        self.state.lock().status
    }

    pub fn expected_count(&self) -> usize {
        self.state.lock().expected
    }

    pub fn acked_count(&self) -> usize {
        self.state.lock().acked
    }

    /// Acknowledgements received beyond the expected count.
    pub fn inconsistent_acks(&self) -> usize {
        self.state.lock().inconsistent_acks
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    /// A handle that refers back to this set without keeping it alive.
    pub fn handle(self: &Arc<Self>) -> EventHandle {
        EventHandle {
            set_id: self.id,
            set: Arc::downgrade(self),
        }
    }

    /// Adds `record` to an open set: the expected count grows by one and the
    /// record carries this set's handle. Returns `false` (and leaves the record
    /// untouched) once the set is sealed or terminal.
    pub fn add<T>(self: &Arc<Self>, record: &mut Record<T>) -> bool {
        {
            let mut state = self.state.lock();
            if state.sealed || state.status.is_terminal() {
                warn!(set = %self.id, "cannot add record to a sealed acknowledgement set");
                return false;
            }
            state.expected += 1;
        }
        record.metadata_mut().set_event_handle(self.handle());
        true
    }

    /// Closes the set to further additions. A sealed set completes as soon as
    /// every expected record has been released.
    pub fn seal(&self) {
        let fire = {
            let mut state = self.state.lock();
            state.sealed = true;
            Self::take_completion(&mut state)
        };
        self.fire(fire);
    }

    pub fn acknowledge(&self) {
        self.release(true);
    }

    /// Releases one record of the set. A `false` result makes the eventual
    /// completion report failure.
    pub fn release(&self, success: bool) {
        let fire = {
            let mut state = self.state.lock();
            if state.status == AckStatus::Complete || state.acked >= state.expected {
                state.inconsistent_acks += 1;
                warn!(
                    set = %self.id,
                    expected = state.expected,
                    "acknowledgement received beyond the expected count"
                );
                return;
            }
            if state.status.is_terminal() {
                debug!(set = %self.id, status = ?state.status, "ignoring release of expired acknowledgement set");
                return;
            }
            state.acked += 1;
            state.all_positive &= success;
            Self::take_completion(&mut state)
        };
        self.fire(fire);
    }

    /// Expires the set if its deadline is at or before `now`.
    pub fn expire_if_due(&self, now: Instant) -> bool {
        if now < self.deadline {
            return false;
        }
        self.expire()
    }

    /// Expires the set regardless of its deadline. Returns `true` if this call
    /// moved the set out of `Pending`.
    pub fn expire(&self) -> bool {
        let callback = {
            let mut state = self.state.lock();
            let callback = state.finish(AckStatus::Expired);
            if callback.is_some() {
                debug!(
                    set = %self.id,
                    acked = state.acked,
                    expected = state.expected,
                    "acknowledgement set expired"
                );
            }
            callback
        };
        match callback {
            Some(callback) => {
                callback(false);
                true
            }
            None => false,
        }
    }

    fn take_completion(state: &mut AckState) -> Option<(CompletionCallback, bool)> {
        if !state.sealed || state.acked != state.expected {
            return None;
        }
        let success = state.all_positive;
        state.finish(AckStatus::Complete).map(|cb| (cb, success))
    }

    fn fire(&self, fire: Option<(CompletionCallback, bool)>) {
        if let Some((callback, success)) = fire {
            debug!(set = %self.id, success, "acknowledgement set complete");
            callback(success);
        }
    }
}

/// Weak link from a record back to its acknowledgement set.
#[derive(Clone)]
pub struct EventHandle {
    set_id: AckSetId,
    set: Weak<AcknowledgementSet>,
}

impl fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandle")
            .field("set_id", &self.set_id)
            .finish()
    }
}

impl EventHandle {
    pub fn set_id(&self) -> AckSetId {
        self.set_id
    }

    /// The set, if anything still holds it.
    pub fn acknowledgement_set(&self) -> Option<Arc<AcknowledgementSet>> {
        self.set.upgrade()
    }

    pub fn acknowledge(&self) {
        self.release(true);
    }

    pub fn release(&self, success: bool) {
        match self.set.upgrade() {
            Some(set) => set.release(success),
            None => debug!(set = %self.set_id, "acknowledgement set already dropped"),
        }
    }
}
