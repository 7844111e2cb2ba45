//! Payment verification and reconciliation engine for membership dues.
//!
//! Slips (uploaded transfer evidence) come in at one end; verified,
//! matched, and notified payments come out the other. Everything in
//! between — provider verification with retry and a circuit breaker,
//! deterministic matching, the one-way payment state machine,
//! notification dispatch, and the daily/monthly reconciliation sweeps —
//! lives in this crate, persisted in a single SQLite database.

pub mod breaker;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod ingest;
pub mod matcher;
pub mod notifier;
pub mod payment;
pub mod ports;
pub mod provider;
pub mod rng;
pub mod scheduler;
pub mod slip;
pub mod store;
pub mod types;
