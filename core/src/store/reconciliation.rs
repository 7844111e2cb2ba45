use super::EngineStore;
use crate::error::{EngineError, EngineResult};
use crate::scheduler::{MonthlySummary, ReconciliationRunRecord, RunKind};
use crate::types::UnixTime;
use rusqlite::{params, OptionalExtension, Row};

impl EngineStore {
    /// Open a new run of the given kind, refusing if one is already
    /// active. This single-active-run check is the overlap guard for
    /// concurrent cron invocations.
    pub fn begin_run(&self, run_id: &str, kind: RunKind, now: UnixTime) -> EngineResult<()> {
        let active: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM reconciliation_run
             WHERE kind = ?1 AND completed_at IS NULL",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(EngineError::RunAlreadyActive {
                kind: kind.as_str().to_string(),
            });
        }
        self.conn.execute(
            "INSERT INTO reconciliation_run (run_id, kind, started_at)
             VALUES (?1, ?2, ?3)",
            params![run_id, kind.as_str(), now],
        )?;
        Ok(())
    }

    /// Close a run. Completed runs are immutable; this is the only
    /// write that ever touches one.
    pub fn complete_run(
        &self,
        run_id: &str,
        now: UnixTime,
        items_processed: i64,
        items_failed: i64,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE reconciliation_run
             SET completed_at = ?1, items_processed = ?2, items_failed = ?3
             WHERE run_id = ?4 AND completed_at IS NULL",
            params![now, items_processed, items_failed, run_id],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> EngineResult<ReconciliationRunRecord> {
        self.conn
            .query_row(
                "SELECT run_id, kind, started_at, completed_at,
                        items_processed, items_failed
                 FROM reconciliation_run WHERE run_id = ?1",
                params![run_id],
                map_run_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound {
                    entity: "reconciliation_run",
                    id: run_id.to_string(),
                },
                other => other.into(),
            })
    }

    pub fn run_count(&self, kind: RunKind) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM reconciliation_run WHERE kind = ?1",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }

    // ── Monthly summaries ──────────────────────────────────────

    pub fn insert_monthly_summary(&self, s: &MonthlySummary) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO monthly_summary (
                period, run_id,
                matched_count, matched_amount_cents,
                mismatched_count, mismatched_amount_cents,
                expired_count, expired_amount_cents,
                computed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(period) DO UPDATE SET
                run_id = excluded.run_id,
                matched_count = excluded.matched_count,
                matched_amount_cents = excluded.matched_amount_cents,
                mismatched_count = excluded.mismatched_count,
                mismatched_amount_cents = excluded.mismatched_amount_cents,
                expired_count = excluded.expired_count,
                expired_amount_cents = excluded.expired_amount_cents,
                computed_at = excluded.computed_at",
            params![
                s.period,
                s.run_id,
                s.matched_count,
                s.matched_amount_cents,
                s.mismatched_count,
                s.mismatched_amount_cents,
                s.expired_count,
                s.expired_amount_cents,
                s.computed_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_monthly_summary(&self, period: &str) -> EngineResult<Option<MonthlySummary>> {
        self.conn
            .query_row(
                "SELECT period, run_id,
                        matched_count, matched_amount_cents,
                        mismatched_count, mismatched_amount_cents,
                        expired_count, expired_amount_cents,
                        computed_at
                 FROM monthly_summary WHERE period = ?1",
                params![period],
                |row| {
                    Ok(MonthlySummary {
                        period: row.get(0)?,
                        run_id: row.get(1)?,
                        matched_count: row.get(2)?,
                        matched_amount_cents: row.get(3)?,
                        mismatched_count: row.get(4)?,
                        mismatched_amount_cents: row.get(5)?,
                        expired_count: row.get(6)?,
                        expired_amount_cents: row.get(7)?,
                        computed_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }
}

fn map_run_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationRunRecord> {
    let kind_str: String = row.get(1)?;
    Ok(ReconciliationRunRecord {
        run_id: row.get(0)?,
        kind: RunKind::parse(&kind_str).unwrap_or(RunKind::Daily),
        started_at: row.get(2)?,
        completed_at: row.get(3)?,
        items_processed: row.get(4)?,
        items_failed: row.get(5)?,
    })
}
