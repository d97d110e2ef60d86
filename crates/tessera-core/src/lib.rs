//! Transaction engine, event journal, and module registry.
//!
//! This crate is the hub of the tessera runtime. User code enters through
//! [`Transaction::run`] (or the thread-local facade in [`tls`]); modules
//! plug in through the [`Module`] trait and record their operations in the
//! per-transaction [`EventLog`]. The engine drives two-phase commit across
//! the registry, replays or unwinds the journal, and decides after every
//! rolled-back attempt whether to retry, escalate to irrevocable
//! execution, or surface the fault.

#![allow(unsafe_code)] // thread-local errno access

mod journal;
mod module;
mod recovery;
pub mod tls;
mod tx;

pub use journal::{ErrorAction, ErrorHandler, EventLog};
pub use module::Module;
pub use recovery::{RecoveryStrategy, Verdict};
pub use tx::{DEFAULT_MAX_ATTEMPTS, Transaction};

pub use tessera_error::{ErrorCode, ErrorStatus, LockToken, Result, TxError};
pub use tessera_types::{Event, MAX_MODULES, ModuleId, TxMode, ValidationMode};
