use super::EngineStore;
use crate::error::EngineResult;
use crate::notifier::{NotificationTask, TaskStatus};
use crate::types::UnixTime;
use rusqlite::{params, Row};

impl EngineStore {
    pub fn insert_notification_task(&self, t: &NotificationTask) -> EngineResult<()> {
        self.conn.execute(
            "INSERT INTO notification_task (
                task_id, payment_id, channel, payload_kind,
                attempts, status, last_attempt_at, delivered
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                t.task_id,
                t.payment_id,
                t.channel,
                t.payload_kind,
                t.attempts,
                t.status.as_str(),
                t.last_attempt_at,
                t.delivered.map(|d| if d { 1i64 } else { 0 }),
            ],
        )?;
        Ok(())
    }

    pub fn queued_tasks(&self) -> EngineResult<Vec<NotificationTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, payment_id, channel, payload_kind,
                    attempts, status, last_attempt_at, delivered
             FROM notification_task
             WHERE status = 'queued'
             ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![], map_task_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn tasks_for_payment(&self, payment_id: &str) -> EngineResult<Vec<NotificationTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT task_id, payment_id, channel, payload_kind,
                    attempts, status, last_attempt_at, delivered
             FROM notification_task
             WHERE payment_id = ?1
             ORDER BY rowid ASC",
        )?;
        let rows = stmt
            .query_map(params![payment_id], map_task_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_task_sent(&self, task_id: &str, attempts: i64, at: UnixTime) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE notification_task
             SET status = 'sent', attempts = ?1, last_attempt_at = ?2
             WHERE task_id = ?3",
            params![attempts, at, task_id],
        )?;
        Ok(())
    }

    pub fn mark_task_failed(&self, task_id: &str, attempts: i64, at: UnixTime) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE notification_task
             SET status = 'failed', attempts = ?1, last_attempt_at = ?2
             WHERE task_id = ?3",
            params![attempts, at, task_id],
        )?;
        Ok(())
    }

    /// A transient miss: task stays queued, attempt counted.
    pub fn bump_task_attempt(&self, task_id: &str, attempts: i64, at: UnixTime) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE notification_task
             SET attempts = ?1, last_attempt_at = ?2
             WHERE task_id = ?3",
            params![attempts, at, task_id],
        )?;
        Ok(())
    }

    /// Delivery receipt from the messaging channel's webhook.
    pub fn record_task_delivery(&self, task_id: &str, delivered: bool) -> EngineResult<()> {
        self.conn.execute(
            "UPDATE notification_task SET delivered = ?1 WHERE task_id = ?2",
            params![if delivered { 1i64 } else { 0 }, task_id],
        )?;
        Ok(())
    }

    pub fn task_count_by_status(&self, status: TaskStatus) -> EngineResult<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM notification_task WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )
            .map_err(Into::into)
    }
}

fn map_task_row(row: &Row<'_>) -> rusqlite::Result<NotificationTask> {
    let status_str: String = row.get(5)?;
    Ok(NotificationTask {
        task_id: row.get(0)?,
        payment_id: row.get(1)?,
        channel: row.get(2)?,
        payload_kind: row.get(3)?,
        attempts: row.get(4)?,
        status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Failed),
        last_attempt_at: row.get(6)?,
        delivered: row.get::<_, Option<i64>>(7)?.map(|d| d != 0),
    })
}
