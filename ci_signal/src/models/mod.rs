//! Domain models for signaling: credentials, build configs, triggers,
//! build summaries and the task handed to workers.

pub mod build_config;
pub mod credential;
pub mod poll;
pub mod summary;
pub mod task;
pub mod trigger;
