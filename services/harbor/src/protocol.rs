//! Wire messages of the file sharing service. Request/response pairs share a
//! stem so error replies can be routed under the right response command.

use gantry::error::Result;
use gantry::node::Node;
use gantry::schema::Message;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReqPing {
    pub text: String,
}

impl Message for ReqPing {
    const NAME: &'static str = "ReqPing";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RspPing {
    pub text: String,
}

impl Message for RspPing {
    const NAME: &'static str = "RspPing";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReqPutFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

impl Message for ReqPutFile {
    const NAME: &'static str = "ReqPutFile";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RspPutFile {}

impl Message for RspPutFile {
    const NAME: &'static str = "RspPutFile";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReqGetFile {
    pub file_name: String,
}

impl Message for ReqGetFile {
    const NAME: &'static str = "ReqGetFile";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RspGetFile {
    pub content: Vec<u8>,
}

impl Message for RspGetFile {
    const NAME: &'static str = "RspGetFile";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReqNodeStore {
    pub file_name: String,
    pub content: Vec<u8>,
}

impl Message for ReqNodeStore {
    const NAME: &'static str = "ReqNodeStore";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RspNodeStore {}

impl Message for RspNodeStore {
    const NAME: &'static str = "RspNodeStore";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReqNodeFetch {
    pub file_name: String,
}

impl Message for ReqNodeFetch {
    const NAME: &'static str = "ReqNodeFetch";
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RspNodeFetch {
    pub content: Vec<u8>,
}

impl Message for RspNodeFetch {
    const NAME: &'static str = "RspNodeFetch";
}

/// Registers every message. Peers must call this in the same order to agree
/// on command numbers.
pub fn register_all(node: &mut Node) -> Result<()> {
    node.register_message::<ReqPing>()?;
    node.register_message::<RspPing>()?;
    node.register_message::<ReqPutFile>()?;
    node.register_message::<RspPutFile>()?;
    node.register_message::<ReqGetFile>()?;
    node.register_message::<RspGetFile>()?;
    node.register_message::<ReqNodeStore>()?;
    node.register_message::<RspNodeStore>()?;
    node.register_message::<ReqNodeFetch>()?;
    node.register_message::<RspNodeFetch>()?;
    Ok(())
}
