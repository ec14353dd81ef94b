//! Session dispatch engine for chat-platform bots.
//!
//! Every conversation gets its own long-lived handler instance (a session).
//! Inbound updates are routed to the session of their conversation and run on a
//! worker pool, strictly in arrival order per conversation. Idle sessions are
//! reaped in the background.
//!
//! This crate is framework-agnostic: the chat platform lives behind
//! [`messaging::port::MessagingPort`], implemented in adapter crates.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod messaging;
pub mod reaper;
pub mod registry;
mod router;
pub mod session;
pub mod store;
pub mod table;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::Engine;
pub use errors::{Error, HandlerResult, Result};
pub use futures::future::BoxFuture;
