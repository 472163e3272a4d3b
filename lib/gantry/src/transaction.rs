//! Long-lived multi-phase transactions. A transaction is created by an origin
//! request, may dispatch requests to peers and wait for the replies, and ends
//! once a handler returns without re-arming the wait.

use std::time::{Duration, Instant};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use plinth::logging;

use crate::error::{Error, Result};
use crate::network::Network;
use crate::package::{Package, TriggerSource};
use crate::registry::MptFactory;
use crate::schema::Message;
use crate::timer::TimerPolicy;
use crate::worker::WorkerCtx;
use crate::{CommandId, ConnId, PackageId, ServiceId, TransId, INVALID_ID};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A multi-phase transaction. `on_init` runs for the origin request;
/// `on_active` runs for every awaited reply. Both may re-arm the wait through
/// [`TransState::wait_next_phase`]; returning without doing so ends the
/// transaction.
pub trait MultiPhaseTransaction: Send {
    fn on_init(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        conn_id: ConnId,
        package: &Package,
    ) -> Result<()>;

    fn on_active(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        conn_id: ConnId,
        package: &Package,
    ) -> Result<()>;

    /// Runs when the awaited reply never arrives. The default reports the
    /// timeout to the origin; the transaction then ends unless this re-armed.
    fn on_timeout(&mut self, ctx: &mut WorkerCtx<'_>, state: &mut TransState) -> Result<()> {
        state.send_back_error(ctx.net, Error::Timeout.code());
        Ok(())
    }

    /// Runs when `on_init`/`on_active` fail. The transaction always ends
    /// afterwards.
    fn on_error(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        _conn_id: ConnId,
        err: Error,
    ) {
        state.send_back_error(ctx.net, err.code());
    }
}

/// Framework-owned state of one live transaction: the origin it answers to
/// and the binding it is waiting on.
pub struct TransState {
    pub(crate) id: TransId,
    pub(crate) phase: i32,
    pub(crate) first_conn_id: ConnId,
    pub(crate) first_trigger_source: TriggerSource,
    pub(crate) wait_conn_id: ConnId,
    pub(crate) wait_service_id: ServiceId,
    pub(crate) wait_cmd: CommandId,
    pub(crate) waiting: bool,
    pub(crate) timer_id: i32,
}

impl TransState {
    fn new(id: TransId) -> TransState {
        TransState {
            id,
            phase: 0,
            first_conn_id: INVALID_ID,
            first_trigger_source: TriggerSource::default(),
            wait_conn_id: INVALID_ID,
            wait_service_id: INVALID_ID,
            wait_cmd: 0,
            waiting: false,
            timer_id: 0,
        }
    }

    pub(crate) fn pre_on_init(&mut self, conn_id: ConnId, package: &Package) {
        self.first_conn_id = conn_id;
        self.first_trigger_source = package.get_trigger_source();
    }

    #[inline]
    pub fn transaction_id(&self) -> TransId {
        self.id
    }

    #[inline]
    pub fn current_phase(&self) -> i32 {
        self.phase
    }

    #[inline]
    pub fn first_connection_id(&self) -> ConnId {
        self.first_conn_id
    }

    #[inline]
    pub fn first_trigger_source(&self) -> &TriggerSource {
        &self.first_trigger_source
    }

    #[inline]
    pub fn waiting_connection_id(&self) -> ConnId {
        self.wait_conn_id
    }

    #[inline]
    pub fn waiting_service_id(&self) -> ServiceId {
        self.wait_service_id
    }

    #[inline]
    pub fn waiting_command(&self) -> CommandId {
        self.wait_cmd
    }

    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    #[inline]
    pub fn clear_waiting(&mut self) {
        self.waiting = false;
    }

    /// Arms the transaction to wait for `cmd` from a connection and schedules
    /// the timeout. While armed the transaction stays live.
    pub fn wait_next_phase(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        conn_id: ConnId,
        cmd: CommandId,
        phase: i32,
        timeout: Duration,
    ) {
        self.arm(ctx, conn_id, INVALID_ID, cmd, phase, timeout);
    }

    /// Arms the transaction to wait for `cmd` from a service.
    pub fn service_wait_next_phase(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        service_id: ServiceId,
        cmd: CommandId,
        phase: i32,
        timeout: Duration,
    ) {
        self.arm(ctx, INVALID_ID, service_id, cmd, phase, timeout);
    }

    fn arm(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        conn_id: ConnId,
        service_id: ServiceId,
        cmd: CommandId,
        phase: i32,
        timeout: Duration,
    ) {
        self.wait_conn_id = conn_id;
        self.wait_service_id = service_id;
        self.wait_cmd = cmd;
        self.phase = phase;
        self.waiting = true;

        if self.timer_id != 0 {
            ctx.timers.remove(self.timer_id);
        }

        // The closure captures the id only; the transaction itself may be
        // gone by the time the timer fires.
        let trans_id = self.id;
        self.timer_id = ctx.timers.register(
            Instant::now(),
            "transaction_timeout",
            timeout,
            TimerPolicy::Once,
            None,
            Box::new(move |timer_ctx: &mut WorkerCtx<'_>| {
                timeout_transaction(timer_ctx, trans_id);
            }),
        );
    }

    /// Sends a reply to the connection that started this transaction.
    pub fn send_back<M: Message>(&self, net: &Network, msg: &M) -> Result<()> {
        net.send_back_message(self.first_conn_id, msg, &self.first_trigger_source)?;
        Ok(())
    }

    /// Sends an error reply to the connection that started this transaction.
    pub fn send_back_error(&self, net: &Network, code: i32) {
        net.send_back_error(self.first_conn_id, &self.first_trigger_source, code);
    }

    /// Sends a correlated request to a connection. A reply carrying the
    /// request's `self_id` as `trigger_id` routes back to this transaction.
    pub fn send_bound<M: Message>(
        &self,
        ctx: &mut WorkerCtx<'_>,
        conn_id: ConnId,
        msg: &M,
    ) -> Result<PackageId> {
        let package_id = ctx.net.send_bound_message(conn_id, INVALID_ID, msg)?;
        ctx.mpts.bind(package_id, self.id);
        Ok(package_id)
    }

    /// Sends a correlated request to a service.
    pub fn service_send_bound<M: Message>(
        &self,
        ctx: &mut WorkerCtx<'_>,
        service_id: ServiceId,
        msg: &M,
    ) -> Result<PackageId> {
        let package_id = ctx.net.send_bound_message(INVALID_ID, service_id, msg)?;
        ctx.mpts.bind(package_id, self.id);
        Ok(package_id)
    }
}

/// A live transaction: its framework state plus the user object.
pub struct MptEntry {
    pub state: TransState,
    pub inner: Box<dyn MultiPhaseTransaction>,
}

/// Table of live multi-phase transactions and the trigger-id bindings that
/// route replies to them. Worker-thread only.
pub struct MptManager {
    next_id: TransId,
    transactions: HashMap<TransId, MptEntry>,
    bindings: HashMap<PackageId, TransId>,
}

impl MptManager {
    pub fn new() -> MptManager {
        MptManager {
            next_id: 1,
            transactions: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Instantiates a fresh transaction with the next id. The entry is only
    /// inserted into the live table once its first handler leaves it waiting.
    pub fn create(&mut self, factory: &MptFactory) -> MptEntry {
        let id = self.next_id;
        self.next_id += 1;

        MptEntry {
            state: TransState::new(id),
            inner: factory(),
        }
    }

    pub fn insert(&mut self, entry: MptEntry) -> Result<()> {
        match self.transactions.entry(entry.state.id) {
            Entry::Occupied(_) => Err(Error::MptAlreadyExist),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Detaches a live transaction for a handler invocation. The caller puts
    /// it back with [`insert`](Self::insert) if it is still waiting.
    pub fn take(&mut self, trans_id: TransId) -> Option<MptEntry> {
        self.transactions.remove(&trans_id)
    }

    /// Routes a request's correlation id to its transaction.
    pub fn bind(&mut self, package_id: PackageId, trans_id: TransId) {
        self.bindings.insert(package_id, trans_id);
    }

    pub fn find_bound(&self, package_id: PackageId) -> Option<TransId> {
        self.bindings.get(&package_id).copied()
    }

    pub fn remove_binding(&mut self, package_id: PackageId) {
        self.bindings.remove(&package_id);
    }

    /// Drops every binding still routing to an ended transaction.
    pub fn remove_bindings_of(&mut self, trans_id: TransId) {
        self.bindings.retain(|_, bound| *bound != trans_id);
    }

    pub fn size(&self) -> usize {
        self.transactions.len()
    }

    pub fn bindings_size(&self) -> usize {
        self.bindings.len()
    }
}

/// Timer callback for an armed wait. Invokes `on_timeout` with the waiting
/// flag already cleared; the transaction ends unless the handler re-armed.
pub(crate) fn timeout_transaction(ctx: &mut WorkerCtx<'_>, trans_id: TransId) {
    let mut entry = match ctx.mpts.take(trans_id) {
        Some(entry) => entry,
        None => return,
    };

    logging::debug!(ctx.log, "transaction timeout";
                    "trans_id" => trans_id,
                    "phase" => entry.state.current_phase(),
                    "waiting_conn_id" => entry.state.waiting_connection_id(),
                    "waiting_service_id" => entry.state.waiting_service_id());

    entry.state.timer_id = 0;
    entry.state.clear_waiting();

    if let Err(err) = entry.inner.on_timeout(ctx, &mut entry.state) {
        logging::error!(ctx.log, "transaction timeout handler failed";
                        "trans_id" => trans_id,
                        "error" => ?err);
        let origin = entry.state.first_connection_id();
        entry.inner.on_error(ctx, &mut entry.state, origin, err);
        entry.state.clear_waiting();
    }

    if entry.state.is_waiting() {
        if let Err(err) = ctx.mpts.insert(entry) {
            logging::error!(ctx.log, "re-armed transaction lost";
                            "trans_id" => trans_id,
                            "error" => ?err);
        }
    } else {
        logging::debug!(ctx.log, "transaction end"; "trans_id" => trans_id);
        ctx.mpts.remove_bindings_of(trans_id);
    }
}
