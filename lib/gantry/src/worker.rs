//! The worker thread: drains the inbound queue, routes packages to their
//! transactions and drives the timer wheel. All business state lives here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use plinth::logging::{self, Logger};

use crate::error::{Error, Result};
use crate::network::Network;
use crate::package::{Package, PackageHeader, TriggerSource};
use crate::queue::{InboundEntry, NetworkMsg};
use crate::registry::{TransactionKind, TransactionRegistry};
use crate::timer::{TimerPolicy, TimerWheel};
use crate::transaction::{MptEntry, MptManager};
use crate::{ConnId, TransId, INVALID_ID};

const IDLE_SLEEP: Duration = Duration::from_millis(2);
const LONG_IDLE_SLEEP: Duration = Duration::from_millis(50);
const LONG_IDLE_TIMES: u32 = 500;
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Mutable view of the worker's state handed to handlers, timer actions and
/// deferred tasks.
pub struct WorkerCtx<'a> {
    pub net: &'a Network,
    pub mpts: &'a mut MptManager,
    pub timers: &'a mut TimerWheel,
    pub log: &'a Logger,
}

/// Default error handler: reports the failure to the package's origin.
pub fn on_transaction_error(
    ctx: &mut WorkerCtx<'_>,
    conn_id: ConnId,
    trigger: &TriggerSource,
    err: Error,
) {
    ctx.net.send_back_error(conn_id, trigger, err.code());
}

pub struct Worker {
    net: Network,
    registry: Arc<TransactionRegistry>,
    mpts: MptManager,
    timers: TimerWheel,
    stop: Arc<AtomicBool>,
    log: Logger,
}

impl Worker {
    pub fn new(
        net: Network,
        registry: Arc<TransactionRegistry>,
        stop: Arc<AtomicBool>,
        log: Logger,
    ) -> Worker {
        Worker {
            net,
            registry,
            mpts: MptManager::new(),
            timers: TimerWheel::new(),
            stop,
            log,
        }
    }

    /// Blocks until the stop flag is raised.
    pub fn run(&mut self) {
        logging::info!(self.log, "running worker");

        self.register_monitor();

        let mut idle_times = 0u32;
        while !self.stop.load(Ordering::Relaxed) {
            let mut worked = false;

            if let Some(entry) = self.net.queues().inbound.pop() {
                worked = true;
                self.process_entry(entry);
            }

            if self.process_expired() > 0 {
                worked = true;
            }

            if worked {
                idle_times = 0;
                continue;
            }

            idle_times += 1;
            if idle_times > LONG_IDLE_TIMES {
                idle_times = 0;
                thread::sleep(LONG_IDLE_SLEEP);
            } else {
                thread::sleep(IDLE_SLEEP);
            }
        }

        logging::info!(self.log, "stopped worker");
    }

    /// Periodic probe over the shared tables, so slow leaks show up in logs.
    fn register_monitor(&mut self) {
        self.timers.register(
            Instant::now(),
            "monitor",
            MONITOR_INTERVAL,
            TimerPolicy::Frequent,
            None,
            Box::new(|ctx: &mut WorkerCtx<'_>| {
                logging::info!(ctx.log, "monitor";
                               "packages" => ctx.net.store().size(),
                               "timers" => ctx.timers.len(),
                               "transactions" => ctx.mpts.size(),
                               "services" => ctx.net.services().size(),
                               "inbound" => ctx.net.queues().inbound.size(),
                               "outbound" => ctx.net.queues().outbound.size());
            }),
        );
    }

    fn process_entry(&mut self, entry: InboundEntry) {
        match entry {
            InboundEntry::Task(task) => {
                logging::debug!(self.log, "run deferred task"; "caller" => task.caller);
                let mut ctx = WorkerCtx {
                    net: &self.net,
                    mpts: &mut self.mpts,
                    timers: &mut self.timers,
                    log: &self.log,
                };
                (task.action)(&mut ctx);
            }
            InboundEntry::Network(msg) => self.trigger_transaction(msg),
        }
    }

    /// Pops and runs every timer whose fire time has passed.
    fn process_expired(&mut self) -> usize {
        let mut count = 0;

        loop {
            let mut timer = match self.timers.pop_expired(Instant::now()) {
                Some(timer) => timer,
                None => break,
            };

            logging::trace!(self.log, "timer fired"; "timer_id" => timer.id, "caller" => timer.caller);

            {
                let mut ctx = WorkerCtx {
                    net: &self.net,
                    mpts: &mut self.mpts,
                    timers: &mut self.timers,
                    log: &self.log,
                };
                (timer.action)(&mut ctx);
            }

            if timer.policy == TimerPolicy::Frequent {
                self.timers.reinsert(timer, Instant::now());
            }

            count += 1;
        }

        count
    }

    /// Routes one inbound package and always frees it afterwards.
    fn trigger_transaction(&mut self, msg: NetworkMsg) {
        let package = match self.net.store().find(msg.package_id) {
            Some(package) => package,
            None => {
                logging::error!(self.log, "package already removed";
                                "conn_id" => msg.conn_id,
                                "package_id" => msg.package_id);
                return;
            }
        };

        self.route_package(&msg, &package);
        self.net.store().remove(msg.package_id);
    }

    fn route_package(&mut self, msg: &NetworkMsg, package: &Package) {
        let header = package.header();

        if header.trigger_id != 0 {
            match self.mpts.find_bound(header.trigger_id) {
                Some(trans_id) => self.dispatch_active(msg, package, &header, trans_id),
                None => {
                    logging::error!(self.log, "no transaction bound to trigger";
                                    "conn_id" => msg.conn_id,
                                    "cmd" => header.command,
                                    "trigger_id" => header.trigger_id);
                }
            }
            return;
        }

        self.dispatch_new(msg, package, &header);
    }

    fn dispatch_new(&mut self, msg: &NetworkMsg, package: &Package, header: &PackageHeader) {
        let entry = match self.registry.find(header.command) {
            Some(entry) => entry,
            None => {
                logging::error!(self.log, "unknown command";
                                "conn_id" => msg.conn_id,
                                "cmd" => header.command);
                return;
            }
        };

        // The registry borrow must end before `finish_dispatch` can run, so
        // the multi-phase outcome is carried out of the match.
        let started = match &entry.kind {
            TransactionKind::OnePhase(handler) => {
                logging::debug!(self.log, "receive package";
                                "conn_id" => msg.conn_id,
                                "cmd" => header.command,
                                "name" => self.net.commands().find_name(header.command).unwrap_or(""));

                let result = {
                    let mut ctx = WorkerCtx {
                        net: &self.net,
                        mpts: &mut self.mpts,
                        timers: &mut self.timers,
                        log: &self.log,
                    };
                    handler(&mut ctx, msg.conn_id, package)
                };

                if let Err(err) = result {
                    logging::error!(self.log, "transaction failed";
                                    "conn_id" => msg.conn_id,
                                    "cmd" => header.command,
                                    "error" => ?err);

                    let trigger = package.get_trigger_source();
                    let mut ctx = WorkerCtx {
                        net: &self.net,
                        mpts: &mut self.mpts,
                        timers: &mut self.timers,
                        log: &self.log,
                    };
                    match &entry.error_handler {
                        Some(error_handler) => error_handler(&mut ctx, msg.conn_id, &trigger, err),
                        None => on_transaction_error(&mut ctx, msg.conn_id, &trigger, err),
                    }
                }

                None
            }
            TransactionKind::MultiPhase(factory) => {
                let mut trans = self.mpts.create(factory);

                logging::debug!(self.log, "transaction start";
                                "conn_id" => msg.conn_id,
                                "cmd" => header.command,
                                "trans_id" => trans.state.transaction_id());

                trans.state.pre_on_init(msg.conn_id, package);

                let result = {
                    let mut ctx = WorkerCtx {
                        net: &self.net,
                        mpts: &mut self.mpts,
                        timers: &mut self.timers,
                        log: &self.log,
                    };
                    trans.inner.on_init(&mut ctx, &mut trans.state, msg.conn_id, package)
                };

                Some((trans, result))
            }
        };

        if let Some((trans, result)) = started {
            self.finish_dispatch(msg.conn_id, trans, result);
        }
    }

    fn dispatch_active(
        &mut self,
        msg: &NetworkMsg,
        package: &Package,
        header: &PackageHeader,
        trans_id: TransId,
    ) {
        let mut trans = match self.mpts.take(trans_id) {
            Some(trans) => trans,
            None => {
                logging::error!(self.log, "bound transaction missing";
                                "conn_id" => msg.conn_id,
                                "trans_id" => trans_id);
                self.mpts.remove_binding(header.trigger_id);
                return;
            }
        };

        // Only the peer the transaction is waiting on may resume it.
        let fit_network = if trans.state.waiting_connection_id() != INVALID_ID {
            msg.conn_id == trans.state.waiting_connection_id()
        } else {
            msg.service_id == trans.state.waiting_service_id()
        };

        if !(fit_network && header.command == trans.state.waiting_command()) {
            logging::error!(self.log, "not fit with waiting info";
                            "conn_id" => msg.conn_id,
                            "service_id" => msg.service_id,
                            "cmd" => header.command,
                            "waiting_conn_id" => trans.state.waiting_connection_id(),
                            "waiting_service_id" => trans.state.waiting_service_id(),
                            "waiting_cmd" => trans.state.waiting_command());

            if let Err(err) = self.mpts.insert(trans) {
                logging::error!(self.log, "armed transaction lost";
                                "trans_id" => trans_id,
                                "error" => ?err);
            }
            return;
        }

        self.mpts.remove_binding(header.trigger_id);
        if trans.state.timer_id != 0 {
            self.timers.remove(trans.state.timer_id);
            trans.state.timer_id = 0;
        }

        logging::debug!(self.log, "transaction active";
                        "conn_id" => msg.conn_id,
                        "cmd" => header.command,
                        "trans_id" => trans_id,
                        "phase" => trans.state.current_phase());

        trans.state.clear_waiting();

        let result = {
            let mut ctx = WorkerCtx {
                net: &self.net,
                mpts: &mut self.mpts,
                timers: &mut self.timers,
                log: &self.log,
            };
            trans.inner.on_active(&mut ctx, &mut trans.state, msg.conn_id, package)
        };

        self.finish_dispatch(msg.conn_id, trans, result);
    }

    /// Common tail of `on_init`/`on_active`: errors route to `on_error` and
    /// end the transaction; otherwise it stays live only while armed.
    fn finish_dispatch(&mut self, conn_id: ConnId, mut trans: MptEntry, result: Result<()>) {
        let trans_id = trans.state.transaction_id();

        if let Err(err) = result {
            logging::error!(self.log, "transaction failed";
                            "conn_id" => conn_id,
                            "trans_id" => trans_id,
                            "error" => ?err);

            let mut ctx = WorkerCtx {
                net: &self.net,
                mpts: &mut self.mpts,
                timers: &mut self.timers,
                log: &self.log,
            };
            trans.inner.on_error(&mut ctx, &mut trans.state, conn_id, err);
            trans.state.clear_waiting();
        }

        if trans.state.is_waiting() {
            if let Err(err) = self.mpts.insert(trans) {
                logging::error!(self.log, "waiting transaction lost";
                                "trans_id" => trans_id,
                                "error" => ?err);
            }
        } else {
            logging::debug!(self.log, "transaction end"; "conn_id" => conn_id, "trans_id" => trans_id);
            if trans.state.timer_id != 0 {
                self.timers.remove(trans.state.timer_id);
            }
            self.mpts.remove_bindings_of(trans_id);
        }
    }
}
