//! Transaction handlers. Client-facing put/get relay to the storage peer as
//! multi-phase transactions; the node-to-node commands are one-phase.

use std::time::Duration;

use plinth::logging;

use gantry::error::Result;
use gantry::node::Node;
use gantry::package::Package;
use gantry::transaction::{MultiPhaseTransaction, TransState};
use gantry::worker::WorkerCtx;
use gantry::{ConnId, ServiceId};

use crate::core::SharedFileStore;
use crate::protocol::{
    ReqGetFile, ReqNodeFetch, ReqNodeStore, ReqPing, ReqPutFile, RspGetFile, RspNodeFetch,
    RspNodeStore, RspPing, RspPutFile,
};

const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Phase markers for the relay transactions.
const WAIT_STORAGE_NODE: i32 = 1;

fn on_ping(ctx: &mut WorkerCtx<'_>, conn_id: ConnId, package: &Package) -> Result<()> {
    let req: ReqPing = package.decode()?;
    logging::debug!(ctx.log, "ping"; "conn_id" => conn_id, "text" => %req.text);

    ctx.net.send_back_message(
        conn_id,
        &RspPing { text: req.text },
        &package.get_trigger_source(),
    )?;
    Ok(())
}

/// Forwards a client put to the storage service and confirms to the client
/// once the node stored it.
struct PutFileTrans {
    storage: ServiceId,
}

impl MultiPhaseTransaction for PutFileTrans {
    fn on_init(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        _conn_id: ConnId,
        package: &Package,
    ) -> Result<()> {
        let req: ReqPutFile = package.decode()?;

        state.service_send_bound(
            ctx,
            self.storage,
            &ReqNodeStore {
                file_name: req.file_name,
                content: req.content,
            },
        )?;

        let wait_cmd = ctx.net.commands().command_of::<RspNodeStore>()?;
        state.service_wait_next_phase(ctx, self.storage, wait_cmd, WAIT_STORAGE_NODE, STORAGE_TIMEOUT);
        Ok(())
    }

    fn on_active(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        _conn_id: ConnId,
        package: &Package,
    ) -> Result<()> {
        let _confirm: RspNodeStore = package.decode()?;
        state.send_back(ctx.net, &RspPutFile {})?;
        Ok(())
    }
}

/// Fetches a file from the storage service on behalf of a client.
struct GetFileTrans {
    storage: ServiceId,
}

impl MultiPhaseTransaction for GetFileTrans {
    fn on_init(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        _conn_id: ConnId,
        package: &Package,
    ) -> Result<()> {
        let req: ReqGetFile = package.decode()?;

        state.service_send_bound(
            ctx,
            self.storage,
            &ReqNodeFetch {
                file_name: req.file_name,
            },
        )?;

        let wait_cmd = ctx.net.commands().command_of::<RspNodeFetch>()?;
        state.service_wait_next_phase(ctx, self.storage, wait_cmd, WAIT_STORAGE_NODE, STORAGE_TIMEOUT);
        Ok(())
    }

    fn on_active(
        &mut self,
        ctx: &mut WorkerCtx<'_>,
        state: &mut TransState,
        _conn_id: ConnId,
        package: &Package,
    ) -> Result<()> {
        let fetched: RspNodeFetch = package.decode()?;
        state.send_back(
            ctx.net,
            &RspGetFile {
                content: fetched.content,
            },
        )?;
        Ok(())
    }
}

/// Registers every handler. The relay transactions are only available when a
/// storage peer is configured; a node without peers still serves the
/// node-to-node commands.
pub fn register_all(node: &mut Node, files: SharedFileStore) -> Result<()> {
    node.register_one_phase::<ReqPing>(Box::new(on_ping))?;

    let store_files = files.clone();
    node.register_one_phase::<ReqNodeStore>(Box::new(move |ctx, conn_id, package| {
        let req: ReqNodeStore = package.decode()?;
        let size = req.content.len();

        let total = {
            let mut files = store_files.lock().expect("file store lock poisoned");
            files.put(&req.file_name, req.content);
            files.len()
        };

        logging::debug!(ctx.log, "store file";
                        "conn_id" => conn_id,
                        "file_name" => %req.file_name,
                        "size" => size,
                        "files" => total);

        ctx.net
            .send_back_message(conn_id, &RspNodeStore {}, &package.get_trigger_source())?;
        Ok(())
    }))?;

    node.register_one_phase::<ReqNodeFetch>(Box::new(move |ctx, conn_id, package| {
        let req: ReqNodeFetch = package.decode()?;

        let content = files
            .lock()
            .expect("file store lock poisoned")
            .get(&req.file_name)
            .unwrap_or_default();

        ctx.net.send_back_message(
            conn_id,
            &RspNodeFetch { content },
            &package.get_trigger_source(),
        )?;
        Ok(())
    }))?;

    let storage = match node.config().peers.first() {
        Some(peer) => node.find_service(&peer.ip, peer.port),
        None => None,
    };

    if let Some(storage) = storage {
        node.register_multi_phase::<ReqPutFile>(Box::new(move || {
            Box::new(PutFileTrans { storage }) as Box<dyn MultiPhaseTransaction>
        }))?;
        node.register_multi_phase::<ReqGetFile>(Box::new(move || {
            Box::new(GetFileTrans { storage }) as Box<dyn MultiPhaseTransaction>
        }))?;
    }

    Ok(())
}
