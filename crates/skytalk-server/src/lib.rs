//! # skytalk-server
//!
//! Realtime core of SkyTalk: a WebSocket session manager with an in-memory
//! presence registry, a friendship-gated message relay, and the small HTTP
//! surface around it (credential refresh, conversation history, attachment
//! upload).

pub mod api;
pub mod auth;
pub mod blob_store;
pub mod config;
pub mod error;
pub mod presence;
pub mod rate_limit;
pub mod relay;
pub mod session;
pub mod store;
