//! The memory substrate as a transaction module.
//!
//! `TmModule` plugs the per-transaction page set into the engine's
//! pipelines. Validation is a no-op by construction: frames are locked as
//! the transaction executes, so reaching the commit point without a
//! conflict already implies consistency. The hook is still driven by the
//! engine for symmetry with optimistic modules.

use std::any::Any;

use tracing::trace;

use tessera_core::{Module, Transaction};
use tessera_error::Result;
use tessera_types::{Event, ModuleId};

use crate::vmem_tx::VmemTx;

/// Memory module state: one page set per transaction.
#[derive(Debug, Default)]
pub struct TmModule {
    pub(crate) vmem: VmemTx,
}

impl TmModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for TmModule {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn apply_events(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            unsafe { self.vmem.apply(event.cookie)? };
        }
        Ok(())
    }

    fn undo_events(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            unsafe { self.vmem.undo(event.cookie)? };
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        trace!(pages = self.vmem.active_pages(), "releasing frames");
        self.vmem.finish()
    }

    fn release(&mut self) {
        let _ = self.vmem.finish();
    }
}

/// Slot of the memory module, registering it on first use.
pub fn ensure_module(tx: &mut Transaction) -> Result<ModuleId> {
    if let Some(id) = tx.find_module::<TmModule>() {
        return Ok(id);
    }
    tx.register_module(Box::new(TmModule::new()))
}
