//! Message schema surface: typed bodies serialized with bincode and a
//! bidirectional command/name table. Request types are named `Req*` and their
//! responses `Rsp*`; that pairing is what lets the framework rewrite an error
//! reply to the response command of whatever request failed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::CommandId;

/// A typed message body. The name keys the command table.
pub trait Message: Serialize + DeserializeOwned {
    const NAME: &'static str;
}

/// Commands reserved by the framework, below the user-assigned range.
pub mod builtin {
    use crate::CommandId;

    pub const NTF_SECURITY_SETTING: CommandId = 1;
    pub const REQ_START_CRYPTO: CommandId = 2;
    pub const RSP_START_CRYPTO: CommandId = 3;
    pub const NTF_INVALID_VERSION: CommandId = 4;
}

/// First command number handed out to user messages.
pub const USER_COMMAND_BASE: CommandId = 1000;

/// Generic error reply. Sent back under the response command paired with the
/// failed request where possible, otherwise under its own command.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RspError {
    pub result: i32,
}

impl Message for RspError {
    const NAME: &'static str = "RspError";
}

pub fn encode<M: Message>(msg: &M) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|_| Error::Parse)
}

pub fn decode<M: Message>(body: &[u8]) -> Result<M> {
    bincode::deserialize(body).map_err(|_| Error::Parse)
}

/// Command ↔ message-name table. Populated once at startup, read-only after.
pub struct CommandTable {
    next: CommandId,
    names: HashMap<CommandId, &'static str>,
    commands: HashMap<&'static str, CommandId>,
}

impl CommandTable {
    pub fn new() -> CommandTable {
        CommandTable::with_base(USER_COMMAND_BASE)
    }

    pub fn with_base(base: CommandId) -> CommandTable {
        let mut table = CommandTable {
            next: base,
            names: HashMap::new(),
            commands: HashMap::new(),
        };

        table
            .register::<RspError>()
            .expect("empty table cannot hold RspError yet");
        table
    }

    /// Assigns the next command number to the message type.
    pub fn register<M: Message>(&mut self) -> Result<CommandId> {
        if self.commands.contains_key(M::NAME) {
            return Err(Error::DuplicateCommand);
        }

        let command = self.next;
        self.next += 1;
        self.names.insert(command, M::NAME);
        self.commands.insert(M::NAME, command);

        Ok(command)
    }

    pub fn find_command(&self, name: &str) -> Option<CommandId> {
        self.commands.get(name).copied()
    }

    pub fn get_command(&self, name: &str) -> Result<CommandId> {
        self.find_command(name).ok_or(Error::CommandNotExist)
    }

    pub fn find_name(&self, command: CommandId) -> Option<&'static str> {
        self.names.get(&command).copied()
    }

    pub fn get_name(&self, command: CommandId) -> Result<&'static str> {
        self.find_name(command).ok_or(Error::NameNotExist)
    }

    #[inline]
    pub fn command_of<M: Message>(&self) -> Result<CommandId> {
        self.get_command(M::NAME)
    }

    /// Maps the command of a `Req*` message to the command of its `Rsp*`
    /// counterpart, if both are registered.
    pub fn response_command_for(&self, trigger_command: CommandId) -> Option<CommandId> {
        let name = self.find_name(trigger_command)?;
        if !name.starts_with("Req") {
            return None;
        }

        let response = format!("Rsp{}", &name[3..]);
        self.find_command(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
    struct ReqGreet {
        who: String,
        count: u32,
    }

    impl Message for ReqGreet {
        const NAME: &'static str = "ReqGreet";
    }

    #[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
    struct RspGreet {
        text: String,
    }

    impl Message for RspGreet {
        const NAME: &'static str = "RspGreet";
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = ReqGreet {
            who: "peer".to_string(),
            count: 3,
        };

        let body = encode(&msg).unwrap();
        let decoded: ReqGreet = decode(&body).unwrap();

        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_failure() {
        let result: Result<ReqGreet> = decode(&[0xff]);
        assert_eq!(result.unwrap_err(), Error::Parse);
    }

    #[test]
    fn test_table_assigns_from_base() {
        let mut table = CommandTable::with_base(500);

        // RspError is pre-registered at the base.
        assert_eq!(table.get_command(RspError::NAME).unwrap(), 500);

        let req = table.register::<ReqGreet>().unwrap();
        let rsp = table.register::<RspGreet>().unwrap();

        assert_eq!(req, 501);
        assert_eq!(rsp, 502);
        assert_eq!(table.find_name(501), Some("ReqGreet"));
        assert_eq!(table.command_of::<RspGreet>().unwrap(), 502);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut table = CommandTable::new();
        table.register::<ReqGreet>().unwrap();
        assert_eq!(table.register::<ReqGreet>().unwrap_err(), Error::DuplicateCommand);
    }

    #[test]
    fn test_missing_lookups() {
        let table = CommandTable::new();
        assert_eq!(table.get_command("ReqNothing").unwrap_err(), Error::CommandNotExist);
        assert_eq!(table.get_name(9999).unwrap_err(), Error::NameNotExist);
    }

    #[test]
    fn test_response_command_pairing() {
        let mut table = CommandTable::new();
        let req = table.register::<ReqGreet>().unwrap();
        let rsp = table.register::<RspGreet>().unwrap();

        assert_eq!(table.response_command_for(req), Some(rsp));
        // A response command has no response of its own.
        assert_eq!(table.response_command_for(rsp), None);
        assert_eq!(table.response_command_for(9999), None);
    }
}
