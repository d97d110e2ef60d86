//! Append-only event journal.
//!
//! Modules record every side-effectful operation here, in program order.
//! Commit replays the journal forward (grouping runs of events from the
//! same module into one dispatch); rollback walks it backward one event at
//! a time. The journal stores only `(module, call, cookie)` triples; the
//! operation's arguments live in the owning module's side-table at the
//! cookie index.

use tessera_error::{ErrorCode, Result, TxError};
use tessera_types::Event;

/// Verdict of an error handler consulted when applying an event fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-dispatch the failed event.
    Retry,
    /// Skip the failed event and continue.
    Skip,
    /// Give up; the process state is unknown.
    Abort,
}

/// Handler consulted (top of stack first) when an apply dispatch fails.
pub type ErrorHandler = Box<dyn FnMut(Event) -> ErrorAction + Send>;

/// The per-transaction event table.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    #[must_use]
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Append an event, returning its journal index.
    ///
    /// Growth doubles the table; under allocation pressure it falls back
    /// to growing by single entries before giving up with an out-of-memory
    /// error.
    pub fn inject(&mut self, event: Event) -> Result<usize> {
        if self.events.len() == self.events.capacity() {
            let additional = self.events.len().max(1);
            if self.events.try_reserve(additional).is_err() {
                self.events
                    .try_reserve_exact(1)
                    .map_err(|_| TxError::code(ErrorCode::OutOfMemory))?;
            }
        }
        self.events.push(event);
        Ok(self.events.len() - 1)
    }

    /// All recorded events in program order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Discard all events. Called after apply or undo has consumed them.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
