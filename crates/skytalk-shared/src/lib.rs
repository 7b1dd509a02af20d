//! # skytalk-shared
//!
//! Types shared by every SkyTalk crate: identifiers, the realtime wire
//! protocol, the relay error taxonomy and the client reconnect policy.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod reconnect;
pub mod types;

pub use error::RelayError;
pub use types::{MessageId, MessageKind, Participant, UserId};
