//! The per-thread transaction engine.
//!
//! [`Transaction::run`] is a trampoline: it executes the user body, and on
//! any fault rolls back every module and asks the recovery dispatcher
//! whether to re-enter the body, re-enter it in irrevocable mode, or
//! surface the error. A transaction object is thread-local state; it is
//! never shared between threads.

use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, error, info, trace};

use tessera_error::{ErrorCode, Result, TxError};
use tessera_types::{Event, MAX_MODULES, ModuleId, TxMode, ValidationMode};

use crate::journal::{ErrorAction, ErrorHandler, EventLog};
use crate::module::Module;
use crate::recovery::{self, RecoveryStrategy, Verdict};

/// Process-wide ordering lock between revocable and irrevocable
/// transactions. Revocable attempts hold it shared; an irrevocable attempt
/// holds it exclusively, so exactly one irrevocable transaction runs at a
/// time and no revocable transaction runs alongside it.
static EXCLUSION: RwLock<()> = RwLock::new(());

enum ExclusionGuard {
    Shared(parking_lot::RwLockReadGuard<'static, ()>),
    Exclusive(parking_lot::RwLockWriteGuard<'static, ()>),
}

impl ExclusionGuard {
    fn acquire(irrevocable: bool) -> Self {
        if irrevocable {
            Self::Exclusive(EXCLUSION.write())
        } else {
            Self::Shared(EXCLUSION.read())
        }
    }
}

/// Default number of conflicting attempts before the engine escalates to
/// irrevocable execution.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// A thread's transaction: module registry, event journal, error-handler
/// stack, and the restart state machine.
pub struct Transaction {
    modules: SmallVec<[Box<dyn Module>; MAX_MODULES]>,
    journal: EventLog,
    error_handlers: Vec<ErrorHandler>,
    mode: TxMode,
    validation: ValidationMode,
    recovery: RecoveryStrategy,
    max_attempts: u32,
    attempts: u32,
    escalate_next: bool,
    enomem_retried: bool,
    saved_errno: Option<i32>,
    active: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("modules", &self.modules.len())
            .field("journal_len", &self.journal.len())
            .field("mode", &self.mode)
            .field("attempts", &self.attempts)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Create an idle transaction with no modules registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: SmallVec::new(),
            journal: EventLog::new(),
            error_handlers: Vec::new(),
            mode: TxMode::Revocable,
            validation: ValidationMode::Op,
            recovery: RecoveryStrategy::Auto,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempts: 0,
            escalate_next: false,
            enomem_retried: false,
            saved_errno: None,
            active: false,
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Choose how environmental errors are handled after rollback.
    pub fn set_error_recovery(&mut self, strategy: RecoveryStrategy) {
        self.recovery = strategy;
    }

    /// Choose the validation mode consulted by optimistic modules.
    pub fn set_validation_mode(&mut self, mode: ValidationMode) {
        self.validation = mode;
    }

    /// Validation mode for optimistic modules.
    #[must_use]
    pub const fn validation_mode(&self) -> ValidationMode {
        self.validation
    }

    /// Number of conflicting attempts tolerated before escalating to
    /// irrevocable execution.
    pub fn set_max_attempts(&mut self, max_attempts: u32) {
        self.max_attempts = max_attempts.max(1);
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Execution mode of the current attempt.
    #[must_use]
    pub const fn mode(&self) -> TxMode {
        self.mode
    }

    /// Whether the current attempt runs under the process-wide exclusive
    /// lock.
    #[must_use]
    pub const fn is_irrevocable(&self) -> bool {
        matches!(self.mode, TxMode::Irrevocable)
    }

    /// 1-based attempt counter of the current execution.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempts
    }

    // -----------------------------------------------------------------------
    // Module registry
    // -----------------------------------------------------------------------

    /// Register a module, returning its slot. Registration order is the
    /// lock-acquisition order; every thread must register modules in the
    /// same sequence.
    pub fn register_module(&mut self, module: Box<dyn Module>) -> Result<ModuleId> {
        if self.modules.len() >= MAX_MODULES {
            return Err(
                TxError::code(ErrorCode::OutOfBounds).with_description("module registry is full")
            );
        }
        self.modules.push(module);
        let id = ModuleId((self.modules.len() - 1) as u16);
        debug!(module = id.0, "module registered");
        Ok(id)
    }

    /// Slot of the registered module of type `M`, if any.
    pub fn find_module<M: Module + 'static>(&mut self) -> Option<ModuleId> {
        self.modules
            .iter_mut()
            .position(|m| m.as_any_mut().is::<M>())
            .map(|i| ModuleId(i as u16))
    }

    /// Mutable access to the module in `id`'s slot, downcast to its
    /// concrete type.
    pub fn module_mut<M: Module + 'static>(&mut self, id: ModuleId) -> Result<&mut M> {
        self.modules
            .get_mut(id.0 as usize)
            .and_then(|m| m.as_any_mut().downcast_mut::<M>())
            .ok_or_else(|| {
                TxError::code(ErrorCode::OutOfBounds).with_description("no such module slot")
            })
    }

    /// Split access to a module's state and the journal, so an operation
    /// can update its side-table and inject the matching event in one call.
    pub fn module_state_and_journal<M: Module + 'static>(
        &mut self,
        id: ModuleId,
    ) -> Result<(&mut M, &mut EventLog)> {
        let Self {
            modules, journal, ..
        } = self;
        let state = modules
            .get_mut(id.0 as usize)
            .and_then(|m| m.as_any_mut().downcast_mut::<M>())
            .ok_or_else(|| {
                TxError::code(ErrorCode::OutOfBounds).with_description("no such module slot")
            })?;
        Ok((state, journal))
    }

    /// Append an event to the journal on behalf of `module`.
    pub fn inject_event(&mut self, module: ModuleId, call: u16, cookie: u32) -> Result<usize> {
        self.journal.inject(Event::new(module, call, cookie))
    }

    /// Number of journalled events in the current attempt.
    #[must_use]
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    // -----------------------------------------------------------------------
    // Error handling hooks
    // -----------------------------------------------------------------------

    /// Push a handler consulted when applying an event fails. Handlers
    /// stack; only the top one is asked.
    pub fn push_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handlers.push(handler);
    }

    /// Pop the most recently pushed error handler.
    pub fn pop_error_handler(&mut self) -> Option<ErrorHandler> {
        self.error_handlers.pop()
    }

    /// Snapshot the thread's errno for restoration on rollback.
    pub fn save_errno(&mut self) {
        if self.saved_errno.is_none() {
            self.saved_errno = Some(errno::get());
        }
    }

    /// Abort the current attempt and re-execute the body.
    ///
    /// Returns an error value for the body to propagate; the engine treats
    /// it like a conflict, so repeated restarts escalate to irrevocable
    /// execution.
    pub fn restart<T>(&self) -> Result<T> {
        Err(TxError::conflicting(None).with_description("explicit restart"))
    }

    /// Require irrevocable execution for the remainder of the transaction.
    ///
    /// Succeeds immediately when the attempt already runs irrevocably;
    /// otherwise returns the error the body must propagate so the engine
    /// can restart in irrevocable mode.
    pub fn require_irrevocable(&mut self) -> Result<()> {
        if self.is_irrevocable() {
            return Ok(());
        }
        Err(TxError::revocable())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Execute `body` transactionally until it commits or a fault is
    /// surfaced.
    ///
    /// The body may run multiple times; intermediate attempts are rolled
    /// back invisibly. Side effects must go through modules.
    ///
    /// ```
    /// use tessera_core::Transaction;
    ///
    /// let mut tx = Transaction::new();
    /// let value = tx.run(|tx| {
    ///     // First attempt restarts; the retry commits.
    ///     if tx.attempt() == 1 { tx.restart() } else { Ok(tx.attempt()) }
    /// })?;
    /// assert_eq!(value, 2);
    /// # tessera_core::Result::Ok(())
    /// ```
    pub fn run<R>(&mut self, mut body: impl FnMut(&mut Self) -> Result<R>) -> Result<R> {
        if self.active {
            return Err(TxError::code(ErrorCode::GeneralError)
                .with_description("nested transactions are not supported"));
        }

        loop {
            let irrevocable = self.escalate_next;
            let _guard = ExclusionGuard::acquire(irrevocable);
            self.begin(irrevocable);

            let result = match body(&mut *self) {
                Ok(value) => self.commit().map(|()| value),
                Err(error) => Err(error),
            };

            match result {
                Ok(value) => {
                    self.settle();
                    return Ok(value);
                }
                Err(error) => {
                    self.rollback(&error);
                    match recovery::dispatch(self.recovery, &error, &mut self.enomem_retried) {
                        Verdict::Retry => {
                            if error.is_conflicting() && self.attempts >= self.max_attempts {
                                info!(
                                    attempts = self.attempts,
                                    "conflict threshold reached; escalating to irrevocable mode"
                                );
                                self.escalate_next = true;
                            }
                        }
                        Verdict::RetryIrrevocable => {
                            debug!("restarting in irrevocable mode");
                            self.escalate_next = true;
                        }
                        Verdict::Surface => {
                            self.settle();
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Unconditional cleanup, e.g. on thread exit. Releases every module
    /// and forgets all per-transaction state.
    pub fn release(&mut self) {
        for module in self.modules.iter_mut().rev() {
            module.release();
        }
        self.modules.clear();
        self.journal.clear();
        self.error_handlers.clear();
        self.settle();
    }

    fn begin(&mut self, irrevocable: bool) {
        // The journal must already be empty here; clearing is defensive.
        self.journal.clear();
        self.attempts += 1;
        self.mode = if irrevocable {
            TxMode::Irrevocable
        } else {
            TxMode::Revocable
        };
        self.saved_errno = None;
        self.active = true;
        debug!(attempt = self.attempts, mode = ?self.mode, "begin");
    }

    /// Two-phase commit across the registry: at the commit point (`eotx`)
    /// the request/success envelope brackets validation; during a mid-run
    /// escalation the noundo notification follows it.
    fn two_phase_commit(&mut self, eotx: bool, noundo: bool) -> Result<()> {
        if eotx {
            self.for_each_forward(|m| m.tpc_request(noundo))?;
            self.for_each_forward(|m| m.validate(true))?;
            self.for_each_forward(|m| m.tpc_success(noundo))
        } else {
            self.for_each_forward(|m| m.validate(false))?;
            self.for_each_forward(|m| m.tpc_noundo(noundo))
        }
    }

    fn commit(&mut self) -> Result<()> {
        let noundo = self.mode.is_noundo();

        self.for_each_forward(|m| m.lock())?;
        self.two_phase_commit(true, noundo)?;
        self.apply_all();
        self.for_each_forward(|m| m.update_cc(noundo))?;
        self.for_each_forward(|m| m.finish())?;
        self.unlock_reverse();

        debug!(attempt = self.attempts, "commit");
        Ok(())
    }

    fn rollback(&mut self, cause: &TxError) {
        let noundo = self.mode.is_noundo();
        debug!(attempt = self.attempts, %cause, "rollback");

        if let Err(error) = self.for_each_forward(|m| m.tpc_failure(noundo)) {
            error!(%error, "module failed to acknowledge abort");
        }

        self.undo_all();

        if let Err(error) = self.for_each_forward(|m| m.clear_cc(noundo)) {
            error!(%error, "module failed to clear concurrency control");
        }
        if let Err(error) = self.for_each_forward(|m| m.finish()) {
            error!(%error, "module failed to finish after rollback");
        }
        self.unlock_reverse();

        if let Some(errno_value) = self.saved_errno.take() {
            errno::set(errno_value);
        }
        self.active = false;
    }

    /// Return to the idle state after a commit or a surfaced error.
    fn settle(&mut self) {
        self.mode = TxMode::Revocable;
        self.attempts = 0;
        self.escalate_next = false;
        self.enomem_retried = false;
        self.saved_errno = None;
        self.active = false;
    }

    // -----------------------------------------------------------------------
    // Journal replay
    // -----------------------------------------------------------------------

    /// Apply the journal in chronological order. Runs of consecutive
    /// events from the same module dispatch as one call so modules can
    /// amortize work. A failed dispatch consults the top error handler;
    /// with no handler the process aborts, because a partially applied
    /// commit cannot be rolled back.
    fn apply_all(&mut self) {
        let Self {
            modules,
            journal,
            error_handlers,
            ..
        } = self;

        let events = journal.events();
        let mut start = 0;
        while start < events.len() {
            let module_id = events[start].module;
            let mut end = start + 1;
            while end < events.len() && events[end].module == module_id {
                end += 1;
            }

            let Some(module) = modules.get_mut(module_id.0 as usize) else {
                error!(module = module_id.0, "event names an unregistered module");
                std::process::abort();
            };

            match module.apply_events(&events[start..end]) {
                Ok(()) => start = end,
                Err(apply_error) => {
                    let action = error_handlers
                        .last_mut()
                        .map_or(ErrorAction::Abort, |handler| handler(events[start]));
                    match action {
                        ErrorAction::Retry => trace!(module = module_id.0, "retrying apply"),
                        ErrorAction::Skip => start = end,
                        ErrorAction::Abort => {
                            error!(%apply_error, "apply failed with no recovery; aborting");
                            std::process::abort();
                        }
                    }
                }
            }
        }

        journal.clear();
    }

    /// Undo the journal in reverse-chronological order, one event at a
    /// time. Failure to undo leaves the process in an unknown state and is
    /// fatal.
    fn undo_all(&mut self) {
        let Self {
            modules, journal, ..
        } = self;

        for event in journal.events().iter().rev() {
            let Some(module) = modules.get_mut(event.module.0 as usize) else {
                error!(module = event.module.0, "event names an unregistered module");
                std::process::abort();
            };
            if let Err(undo_error) = module.undo_events(std::slice::from_ref(event)) {
                error!(%undo_error, "undo failed; aborting");
                std::process::abort();
            }
        }

        journal.clear();
    }

    // -----------------------------------------------------------------------
    // Registry walks
    // -----------------------------------------------------------------------

    fn for_each_forward(
        &mut self,
        mut f: impl FnMut(&mut dyn Module) -> Result<()>,
    ) -> Result<()> {
        for module in &mut self.modules {
            f(module.as_mut())?;
        }
        Ok(())
    }

    fn unlock_reverse(&mut self) {
        for module in self.modules.iter_mut().rev() {
            if let Err(error) = module.unlock() {
                error!(%error, "module failed to unlock");
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.modules.is_empty() {
            self.release();
        }
    }
}

/// Thread-local errno access.
mod errno {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn location() -> *mut i32 {
        unsafe { libc::__errno_location() }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn location() -> *mut i32 {
        unsafe { libc::__error() }
    }

    pub fn get() -> i32 {
        unsafe { *location() }
    }

    pub fn set(value: i32) {
        unsafe { *location() = value };
    }
}
