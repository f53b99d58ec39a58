use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use super::MemorySystem;
use super::types::{ScheduleRecord, ScheduledResultRecord, from_millis};

const SCHEDULE_COLUMNS: &str = "id, user_id, agent_name, trigger_spec, prompt, enabled, created_at, \
     last_run_at, last_status, consecutive_errors";

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRecord> {
    Ok(ScheduleRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        agent_name: row.get(2)?,
        trigger_spec: row.get(3)?,
        prompt: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        created_at: from_millis(row.get(6)?),
        last_run_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        last_status: row.get(8)?,
        consecutive_errors: row.get(9)?,
    })
}

impl MemorySystem {
    /// Insert or replace a schedule definition. Run state is reset only when
    /// the schedule is new.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_schedule(
        &self,
        id: &str,
        user_id: &str,
        agent_name: &str,
        trigger_spec: &str,
        prompt: &str,
        enabled: bool,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO schedules (id, user_id, agent_name, trigger_spec, prompt, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id, agent_name = excluded.agent_name,
                trigger_spec = excluded.trigger_spec, prompt = excluded.prompt,
                enabled = excluded.enabled",
            params![
                id,
                user_id,
                agent_name,
                trigger_spec,
                prompt,
                enabled as i64,
                created_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<ScheduleRecord>> {
        let db = self.db.lock().await;
        let sql = format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS);
        Ok(db.query_row(&sql, params![id], schedule_from_row).optional()?)
    }

    pub async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT {} FROM schedules WHERE enabled = 1 ORDER BY id ASC",
            SCHEDULE_COLUMNS
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map([], schedule_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE schedules SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, id],
        )?;
        Ok(rows > 0)
    }

    /// Compare-and-set `last_run_at` from `expected` to `now`. Returns false
    /// when another tick already claimed this window (or the schedule was
    /// disabled meanwhile).
    pub async fn claim_schedule_run(
        &self,
        id: &str,
        expected: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE schedules SET last_run_at = ?1
             WHERE id = ?2 AND enabled = 1 AND last_run_at IS ?3",
            params![
                now.timestamp_millis(),
                id,
                expected.map(|t| t.timestamp_millis())
            ],
        )?;
        Ok(rows == 1)
    }

    /// Record how a run ended. Returns the consecutive error count and whether
    /// the schedule got disabled because of it.
    pub async fn record_schedule_outcome(
        &self,
        id: &str,
        status: &str,
        success: bool,
        max_consecutive_errors: u32,
    ) -> Result<(u32, bool)> {
        let db = self.db.lock().await;
        if success {
            db.execute(
                "UPDATE schedules SET last_status = ?1, consecutive_errors = 0 WHERE id = ?2",
                params![status, id],
            )?;
            return Ok((0, false));
        }

        db.execute(
            "UPDATE schedules SET last_status = ?1, consecutive_errors = consecutive_errors + 1
             WHERE id = ?2",
            params![status, id],
        )?;
        let errors: u32 = db
            .query_row(
                "SELECT consecutive_errors FROM schedules WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let disable = max_consecutive_errors > 0 && errors >= max_consecutive_errors;
        if disable {
            db.execute("UPDATE schedules SET enabled = 0 WHERE id = ?1", params![id])?;
        }
        Ok((errors, disable))
    }

    pub async fn insert_scheduled_result(
        &self,
        schedule: &ScheduleRecord,
        success: bool,
        payload: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO scheduled_results (schedule_id, user_id, agent_name, created_at, success, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                schedule.id,
                schedule.user_id,
                schedule.agent_name,
                created_at.timestamp_millis(),
                success as i64,
                payload
            ],
        )?;
        Ok(db.last_insert_rowid())
    }

    /// Newest results for a user first.
    pub async fn list_scheduled_results(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ScheduledResultRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, schedule_id, user_id, agent_name, created_at, success, payload
             FROM scheduled_results WHERE user_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok(ScheduledResultRecord {
                id: row.get(0)?,
                schedule_id: row.get(1)?,
                user_id: row.get(2)?,
                agent_name: row.get(3)?,
                created_at: from_millis(row.get(4)?),
                success: row.get::<_, i64>(5)? != 0,
                payload: row.get(6)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
