use super::EngineStore;
use crate::error::{EngineError, EngineResult};
use crate::slip::{reason, SlipRecord, SlipStatus};
use crate::types::{AmountCents, UnixTime};
use rusqlite::{params, OptionalExtension, Row};

impl EngineStore {
    pub fn insert_slip(&self, s: &SlipRecord) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO slip (
                slip_id, claimed_payer_id, image_ref, uploaded_at, status,
                provider_txn_ref, verified_amount_cents, verified_at,
                settled_at, failure_reason, retry_count, matched_payment_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                s.slip_id,
                s.claimed_payer_id,
                s.image_ref,
                s.uploaded_at,
                s.status.as_str(),
                s.provider_txn_ref,
                s.verified_amount_cents,
                s.verified_at,
                s.settled_at,
                s.failure_reason,
                s.retry_count,
                s.matched_payment_id,
            ],
        )?;
        Ok(())
    }

    pub fn get_slip(&self, slip_id: &str) -> EngineResult<SlipRecord> {
        self.conn
            .query_row(
                "SELECT slip_id, claimed_payer_id, image_ref, uploaded_at, status,
                        provider_txn_ref, verified_amount_cents, verified_at,
                        settled_at, failure_reason, retry_count, matched_payment_id
                 FROM slip WHERE slip_id = ?1",
                params![slip_id],
                map_slip_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => EngineError::NotFound {
                    entity: "slip",
                    id: slip_id.to_string(),
                },
                other => other.into(),
            })
    }

    pub fn set_slip_verifying(&self, slip_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE slip SET status = 'verifying' WHERE slip_id = ?1",
            params![slip_id],
        )?;
        Ok(())
    }

    pub fn set_slip_verified(
        &self,
        slip_id: &str,
        provider_txn_ref: &str,
        amount_cents: AmountCents,
        verified_at: UnixTime,
        settled_at: UnixTime,
    ) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE slip
             SET status = 'verified', provider_txn_ref = ?1,
                 verified_amount_cents = ?2, verified_at = ?3,
                 settled_at = ?4, failure_reason = NULL
             WHERE slip_id = ?5",
            params![provider_txn_ref, amount_cents, verified_at, settled_at, slip_id],
        )?;
        Ok(())
    }

    pub fn set_slip_rejected(&self, slip_id: &str, failure_reason: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE slip SET status = 'rejected', failure_reason = ?1
             WHERE slip_id = ?2",
            params![failure_reason, slip_id],
        )?;
        Ok(())
    }

    pub fn set_slip_duplicate(&self, slip_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE slip SET status = 'duplicate' WHERE slip_id = ?1",
            params![slip_id],
        )?;
        Ok(())
    }

    pub fn set_slip_matched(&self, slip_id: &str, payment_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE slip SET status = 'matched', matched_payment_id = ?1
             WHERE slip_id = ?2",
            params![payment_id, slip_id],
        )?;
        Ok(())
    }

    pub fn increment_slip_retry(&self, slip_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE slip SET retry_count = retry_count + 1 WHERE slip_id = ?1",
            params![slip_id],
        )?;
        Ok(())
    }

    /// The dedup lookup: which verified/matched slip, if any, already
    /// holds this provider transaction reference.
    pub fn txn_ref_holder(
        &self,
        provider_txn_ref: &str,
        exclude_slip_id: &str,
    ) -> EngineResult<Option<SlipRecord>> {
        self.conn
            .query_row(
                "SELECT slip_id, claimed_payer_id, image_ref, uploaded_at, status,
                        provider_txn_ref, verified_amount_cents, verified_at,
                        settled_at, failure_reason, retry_count, matched_payment_id
                 FROM slip
                 WHERE provider_txn_ref = ?1
                   AND slip_id != ?2
                   AND status IN ('verified', 'matched')
                 LIMIT 1",
                params![provider_txn_ref, exclude_slip_id],
                map_slip_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Slips the pipeline still owes work: pending ones awaiting
    /// verification, and verified ones stranded before their match
    /// landed. Oldest first.
    pub fn unfinished_slips(&self) -> EngineResult<Vec<SlipRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT slip_id, claimed_payer_id, image_ref, uploaded_at, status,
                    provider_txn_ref, verified_amount_cents, verified_at,
                    settled_at, failure_reason, retry_count, matched_payment_id
             FROM slip WHERE status IN ('pending', 'verified')
             ORDER BY uploaded_at ASC, slip_id ASC",
        )?;
        let rows = stmt
            .query_map([], map_slip_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Slips stuck in pending/verifying since before the cutoff.
    pub fn stale_slips(&self, cutoff: UnixTime) -> EngineResult<Vec<SlipRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT slip_id, claimed_payer_id, image_ref, uploaded_at, status,
                    provider_txn_ref, verified_amount_cents, verified_at,
                    settled_at, failure_reason, retry_count, matched_payment_id
             FROM slip
             WHERE status IN ('pending', 'verifying') AND uploaded_at <= ?1
             ORDER BY uploaded_at ASC",
        )?;
        let rows = stmt
            .query_map(params![cutoff], map_slip_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Rejected-for-provider-outage slips still within their sweep
    /// retry budget.
    pub fn provider_unavailable_slips(&self, retry_budget: u32) -> EngineResult<Vec<SlipRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT slip_id, claimed_payer_id, image_ref, uploaded_at, status,
                    provider_txn_ref, verified_amount_cents, verified_at,
                    settled_at, failure_reason, retry_count, matched_payment_id
             FROM slip
             WHERE status = 'rejected'
               AND failure_reason = ?1
               AND retry_count < ?2
             ORDER BY uploaded_at ASC",
        )?;
        let rows = stmt
            .query_map(params![reason::PROVIDER_UNAVAILABLE, retry_budget], map_slip_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Put a slip back in line for verification.
    pub fn requeue_slip(&self, slip_id: &str) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE slip SET status = 'pending', failure_reason = NULL
             WHERE slip_id = ?1",
            params![slip_id],
        )?;
        Ok(())
    }

    /// Whether a payer has a slip that dead-ended in manual-resolution
    /// territory. Decides expired vs mismatched for overdue payments.
    pub fn payer_has_dead_end_slip(&self, claimed_payer_id: &str) -> EngineResult<bool> {
        self.conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM slip
                 WHERE claimed_payer_id = ?1
                   AND status = 'rejected'
                   AND failure_reason IN (?2, ?3)",
                params![
                    claimed_payer_id,
                    reason::NO_MATCHING_PAYMENT,
                    reason::AMBIGUOUS_MATCH
                ],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )
            .map_err(Into::into)
    }

    pub fn slip_count_by_status(&self, status: SlipStatus) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM slip WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

fn map_slip_row(row: &Row<'_>) -> rusqlite::Result<SlipRecord> {
    let status_str: String = row.get(4)?;
    Ok(SlipRecord {
        slip_id: row.get(0)?,
        claimed_payer_id: row.get(1)?,
        image_ref: row.get(2)?,
        uploaded_at: row.get(3)?,
        status: SlipStatus::parse(&status_str).unwrap_or(SlipStatus::Rejected),
        provider_txn_ref: row.get(5)?,
        verified_amount_cents: row.get(6)?,
        verified_at: row.get(7)?,
        settled_at: row.get(8)?,
        failure_reason: row.get(9)?,
        retry_count: row.get(10)?,
        matched_payment_id: row.get(11)?,
    })
}
