//! # proxymod-dispatcher
//!
//! Durable, idempotent dispatch of proxy-model receive tasks.
//!
//! An HTTP receiver fingerprints each incoming event descriptor and
//! creates at most one task per fingerprint in a Postgres task store. Task
//! ids travel over a pgmq queue with at-least-once delivery; workers claim
//! tasks through conditional state transitions, so a redelivered message
//! never runs a task twice concurrently and a finished task never runs again.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod processor;
pub mod queue;
pub mod receiver;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod worker;
