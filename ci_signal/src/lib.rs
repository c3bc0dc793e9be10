//! Relay CI signaling core.
//!
//! Decides whether a trigger (push, pull request, poll tick or manual
//! request) becomes a build, resolves the credentials and build config
//! it needs exactly once, writes the durable build summary and hands a
//! [`models::task::WerkerTask`] to the task queue.
//!
//! Everything outside the decision logic is reached through the
//! capability traits in [`store`] and [`vcs`]: the relational store, the
//! secret store, the task queue and the VCS handlers. The server crate
//! provides the production implementations; [`memory`] provides
//! in-process ones.

pub mod buildconf;
pub mod builds;
pub mod credentials;
pub mod cron;
pub mod error;
pub mod memory;
pub mod models;
pub mod poll;
pub mod repos;
pub mod signaler;
pub mod store;
pub mod trigger;
pub mod vcs;
pub mod viability;
pub mod webhook;

pub use error::{Error, Result};

