//! Command → handler table. Populated during startup, then handed to the
//! worker behind an `Arc` and never mutated again.

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::package::{Package, TriggerSource};
use crate::transaction::MultiPhaseTransaction;
use crate::worker::WorkerCtx;
use crate::{CommandId, ConnId};

/// Handler of a one-phase transaction. Runs once per inbound package.
pub type OnePhaseHandler =
    Box<dyn Fn(&mut WorkerCtx<'_>, ConnId, &Package) -> Result<()> + Send + Sync>;

/// Invoked when a handler fails; the default sends `RspError` to the origin.
pub type ErrorHandler =
    Box<dyn Fn(&mut WorkerCtx<'_>, ConnId, &TriggerSource, Error) + Send + Sync>;

/// Factory producing a fresh multi-phase transaction object per origin
/// request.
pub type MptFactory = Box<dyn Fn() -> Box<dyn MultiPhaseTransaction> + Send + Sync>;

pub enum TransactionKind {
    OnePhase(OnePhaseHandler),
    MultiPhase(MptFactory),
}

pub struct TransactionEntry {
    pub kind: TransactionKind,
    pub error_handler: Option<ErrorHandler>,
}

pub struct TransactionRegistry {
    entries: HashMap<CommandId, TransactionEntry>,
}

impl TransactionRegistry {
    pub fn new() -> TransactionRegistry {
        TransactionRegistry {
            entries: HashMap::new(),
        }
    }

    fn register(&mut self, command: CommandId, entry: TransactionEntry) -> Result<()> {
        match self.entries.entry(command) {
            Entry::Occupied(_) => Err(Error::TransactionAlreadyExist),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Associates a command with a one-phase handler. A command can only ever
    /// have one transaction.
    pub fn register_one_phase(
        &mut self,
        command: CommandId,
        handler: OnePhaseHandler,
        error_handler: Option<ErrorHandler>,
    ) -> Result<()> {
        self.register(
            command,
            TransactionEntry {
                kind: TransactionKind::OnePhase(handler),
                error_handler,
            },
        )
    }

    /// Associates a command with a multi-phase transaction factory.
    pub fn register_multi_phase(
        &mut self,
        command: CommandId,
        factory: MptFactory,
        error_handler: Option<ErrorHandler>,
    ) -> Result<()> {
        self.register(
            command,
            TransactionEntry {
                kind: TransactionKind::MultiPhase(factory),
                error_handler,
            },
        )
    }

    pub fn find(&self, command: CommandId) -> Option<&TransactionEntry> {
        self.entries.get(&command)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }
}
