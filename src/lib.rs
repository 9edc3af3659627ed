//! # notes-queue
//!
//! Worker for a signed job queue kept in a shared remote document.
//!
//! Producers append HMAC-signed job lines to a queue document. The worker
//! polls it, runs every job through a fixed sequence of security checks,
//! creates the requested note through an [`executor::Executor`], remembers
//! the job id in a local SQLite [`storage::IdempotencyStore`] and appends
//! one result line per job to a results document.

pub mod codec;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gate;
pub mod model;
pub mod sink;
pub mod storage;
pub mod telemetry;
