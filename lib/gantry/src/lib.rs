//! Typed-package transport and transaction framework.
//!
//! A single reactor thread owns every socket and a single worker thread owns
//! all business state; the two sides exchange package handles through a pair
//! of locked queues backed by a shared package store. Handlers are registered
//! per command as either one-phase callbacks or long-lived multi-phase
//! transactions that can dispatch requests to peers and wait for the replies.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

use serde_derive::{Deserialize, Serialize};

pub mod config;
pub mod connection;
pub mod error;
pub mod network;
pub mod node;
pub mod package;
pub mod queue;
pub mod reactor;
pub mod registry;
pub mod schema;
pub mod secure;
pub mod service;
pub mod store;
pub mod timer;
pub mod transaction;
pub mod worker;

pub type ConnId = i32;
pub type ServiceId = i32;
pub type PackageId = i32;
pub type TimerId = i32;
pub type TransId = i32;
pub type CommandId = i32;

/// Protocol version carried in every package header.
pub const PACKAGE_VERSION: u16 = 1;

/// Zero is reserved as the invalid value for every id space.
pub const INVALID_ID: i32 = 0;

/// Whether a listener upgrades its connections to the encrypted channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecuritySetting {
    Close,
    Open,
}

impl SecuritySetting {
    #[inline]
    pub fn to_wire(self) -> u8 {
        match self {
            SecuritySetting::Close => 0,
            SecuritySetting::Open => 1,
        }
    }

    #[inline]
    pub fn from_wire(byte: u8) -> Option<SecuritySetting> {
        match byte {
            0 => Some(SecuritySetting::Close),
            1 => Some(SecuritySetting::Open),
            _ => None,
        }
    }
}
