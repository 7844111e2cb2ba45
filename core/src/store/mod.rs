//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database. Engine components call
//! store methods — they never execute SQL directly.
//!
//! All mutating payment writes are conditional: either on the current
//! `version` (matching) or on the current status set (sweep
//! transitions). There is no cross-call lock anywhere; the conditional
//! writes are what serializes concurrent matchers.

mod notification;
mod reconciliation;
mod slip;

use crate::error::{EngineError, EngineResult};
use crate::event::EventLogEntry;
use crate::payment::{PaymentRecord, PaymentStatus};
use crate::types::{AmountCents, EntityId, UnixTime};
use rusqlite::{params, Connection, Row};

pub struct EngineStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
}

impl EngineStore {
    pub fn open(path: &str) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only matters for real files; :memory: ignores it.
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests and demo mode).
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> EngineResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        Ok(())
    }

    /// Run several writes as one atomic unit. Terminal payment
    /// transitions use this so the payment write, the slip update, and
    /// the notification task land together or not at all.
    pub fn transaction<T>(&self, f: impl FnOnce() -> EngineResult<T>) -> EngineResult<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        match f() {
            Ok(value) => {
                self.conn.execute_batch("COMMIT;")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK;") {
                    log::error!("transaction rollback failed: {rollback_err}");
                }
                Err(e)
            }
        }
    }

    // ── Event log ──────────────────────────────────────────────

    pub fn append_event(&self, entry: &EventLogEntry) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO event_log (component, event_type, payload, at)
             VALUES (?1, ?2, ?3, ?4)",
            params![entry.component, entry.event_type, entry.payload, entry.at],
        )?;
        Ok(())
    }

    /// Serialize and append one engine event.
    pub fn record_event(
        &self,
        component: &str,
        event: &crate::event::EngineEvent,
        at: UnixTime,
    ) -> EngineResult<()> {
        self.append_event(&EventLogEntry {
            id: None,
            component: component.to_string(),
            event_type: event.event_type().to_string(),
            payload: serde_json::to_string(event)?,
            at,
        })
    }

    pub fn events_of_type(&self, event_type: &str) -> EngineResult<Vec<EventLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, component, event_type, payload, at
             FROM event_log WHERE event_type = ?1
             ORDER BY id ASC",
        )?;
        let entries = stmt
            .query_map(params![event_type], |row| {
                Ok(EventLogEntry {
                    id: Some(row.get(0)?),
                    component: row.get(1)?,
                    event_type: row.get(2)?,
                    payload: row.get(3)?,
                    at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn event_count(&self, event_type: &str) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM event_log WHERE event_type = ?1",
                params![event_type],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    // ── Payment ────────────────────────────────────────────────

    pub fn insert_payment(&self, p: &PaymentRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO payment (
                payment_id, member_id, cohort_id, expected_amount_cents,
                currency, due_at, status, version, matched_slip_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                p.payment_id,
                p.member_id,
                p.cohort_id,
                p.expected_amount_cents,
                p.currency,
                p.due_at,
                p.status.as_str(),
                p.version,
                p.matched_slip_id,
                p.created_at,
                p.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_payment(&self, payment_id: &str) -> EngineResult<PaymentRecord> {
        self.conn
            .query_row(
                "SELECT payment_id, member_id, cohort_id, expected_amount_cents,
                        currency, due_at, status, version, matched_slip_id,
                        created_at, updated_at
                 FROM payment WHERE payment_id = ?1",
                params![payment_id],
                map_payment_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound {
                    entity: "payment",
                    id: payment_id.to_string(),
                },
                other => other.into(),
            })
    }

    /// Candidate dues for a matcher: outstanding payments of one
    /// member whose amount is within tolerance of the verified amount
    /// and whose due date falls inside the settlement window.
    pub fn candidate_payments(
        &self,
        member_id: &str,
        amount_cents: AmountCents,
        tolerance_cents: AmountCents,
        window_start: UnixTime,
        window_end: UnixTime,
    ) -> EngineResult<Vec<PaymentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_id, member_id, cohort_id, expected_amount_cents,
                    currency, due_at, status, version, matched_slip_id,
                    created_at, updated_at
             FROM payment
             WHERE member_id = ?1
               AND status IN ('pending', 'awaiting_verification')
               AND ABS(expected_amount_cents - ?2) <= ?3
               AND due_at >= ?4 AND due_at <= ?5
             ORDER BY due_at ASC",
        )?;
        let rows = stmt
            .query_map(
                params![member_id, amount_cents, tolerance_cents, window_start, window_end],
                map_payment_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move a member's pending dues to awaiting_verification when a
    /// slip claiming that payer arrives. Idempotent: dues already past
    /// pending are untouched.
    pub fn mark_member_awaiting(&self, member_id: &str, now: UnixTime) -> EngineResult<usize> {
        let changed = self.conn.execute(
            "UPDATE payment
             SET status = 'awaiting_verification', version = version + 1, updated_at = ?1
             WHERE member_id = ?2 AND status = 'pending'",
            params![now, member_id],
        )?;
        Ok(changed)
    }

    /// The matching write: settle one payment with one slip, guarded
    /// by the version read during candidate selection. Zero rows
    /// changed means another slip won the race.
    pub fn try_match_payment(
        &self,
        payment_id: &str,
        slip_id: &str,
        expected_version: i64,
        now: UnixTime,
    ) -> EngineResult<()> {
        let changed = self.conn.execute(
            "UPDATE payment
             SET status = 'matched', matched_slip_id = ?1,
                 version = version + 1, updated_at = ?2
             WHERE payment_id = ?3 AND version = ?4
               AND status IN ('pending', 'awaiting_verification')",
            params![slip_id, now, payment_id, expected_version],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(EngineError::VersionConflict {
                payment_id: payment_id.to_string(),
                expected: expected_version,
            })
        }
    }

    /// Sweep transition to a terminal state, conditional on the
    /// payment still being outstanding. Returns whether it applied —
    /// false means someone else already moved it, which the caller
    /// treats as "nothing to do".
    pub fn transition_if_outstanding(
        &self,
        payment_id: &str,
        to: PaymentStatus,
        now: UnixTime,
    ) -> EngineResult<bool> {
        let changed = self.conn.execute(
            "UPDATE payment
             SET status = ?1, version = version + 1, updated_at = ?2
             WHERE payment_id = ?3
               AND status IN ('pending', 'awaiting_verification')",
            params![to.as_str(), now, payment_id],
        )?;
        Ok(changed == 1)
    }

    /// Outstanding payments whose grace period has fully elapsed.
    pub fn payments_overdue(&self, cutoff: UnixTime) -> EngineResult<Vec<PaymentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT payment_id, member_id, cohort_id, expected_amount_cents,
                    currency, due_at, status, version, matched_slip_id,
                    created_at, updated_at
             FROM payment
             WHERE status IN ('pending', 'awaiting_verification')
               AND due_at <= ?1
             ORDER BY due_at ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], map_payment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count and amount total of payments that reached `status` inside
    /// [period_start, period_end). Used by the monthly sweep.
    pub fn terminal_aggregate(
        &self,
        status: PaymentStatus,
        period_start: UnixTime,
        period_end: UnixTime,
    ) -> EngineResult<(i64, AmountCents)> {
        self.conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(expected_amount_cents), 0)
                 FROM payment
                 WHERE status = ?1 AND updated_at >= ?2 AND updated_at < ?3",
                params![status.as_str(), period_start, period_end],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(Into::into)
    }

    pub fn payment_version(&self, payment_id: &str) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT version FROM payment WHERE payment_id = ?1",
                params![payment_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    pub fn payment_count_by_status(&self, status: PaymentStatus) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM payment WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

fn map_payment_row(row: &Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let status_str: String = row.get(6)?;
    Ok(PaymentRecord {
        payment_id: row.get(0)?,
        member_id: row.get(1)?,
        cohort_id: row.get(2)?,
        expected_amount_cents: row.get(3)?,
        currency: row.get(4)?,
        due_at: row.get(5)?,
        status: PaymentStatus::parse(&status_str).unwrap_or(PaymentStatus::Failed),
        version: row.get(7)?,
        matched_slip_id: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub(crate) fn entity_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}
