//! Shared primitive types used across the engine.

/// A stable, unique identifier for any entity (payment, slip, task, run).
pub type EntityId = String;

/// A money amount in integer minor units (cents). Matching compares
/// these exactly; there is no floating-point money anywhere.
pub type AmountCents = i64;

/// A point in time as unix seconds. This is the persisted form;
/// in-memory code works with `chrono::DateTime<Utc>`.
pub type UnixTime = i64;
