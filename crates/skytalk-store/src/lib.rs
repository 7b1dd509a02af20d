//! # skytalk-store
//!
//! Durable state for SkyTalk, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users, the
//! friendship edge list and messages. Async callers are expected to move
//! calls onto a blocking thread.

pub mod database;
pub mod friendships;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
