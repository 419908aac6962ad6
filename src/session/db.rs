use super::types::{Session, SessionStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

const SESSION_TIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S%.3f";
// Persisted session times are always rendered at UTC+05:30.
const SESSION_UTC_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

fn session_offset() -> FixedOffset {
    FixedOffset::east_opt(SESSION_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

pub fn format_session_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&session_offset())
        .format(SESSION_TIME_FORMAT)
        .to_string()
}

pub fn parse_session_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), SESSION_TIME_FORMAT).ok()?;
    naive
        .and_local_timezone(session_offset())
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url {database_url}"))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .context("connect session database")?;
    Ok(pool)
}

/// Key-by-patient session rows. Writes are insert-or-replace on start and
/// update-by-key afterwards; rows are never deleted.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitoring_sessions (
                patient_id TEXT PRIMARY KEY,
                device_id TEXT,
                status TEXT NOT NULL,
                facility_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                last_streamed_time TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("create monitoring_sessions")?;
        Ok(())
    }

    pub async fn start_session(
        &self,
        patient_id: &str,
        facility_id: &str,
        device_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO monitoring_sessions
                (patient_id, device_id, status, facility_id, start_time, end_time, last_streamed_time)
            VALUES (?, ?, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(patient_id)
        .bind(device_id)
        .bind(SessionStatus::Running.as_str())
        .bind(facility_id)
        .bind(format_session_time(started_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("start session for patient {patient_id}"))?;
        Ok(())
    }

    pub async fn stop_session(&self, patient_id: &str, ended_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE monitoring_sessions SET status = ?, end_time = ? WHERE patient_id = ?")
            .bind(SessionStatus::Stopped.as_str())
            .bind(format_session_time(ended_at))
            .bind(patient_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("stop session for patient {patient_id}"))?;
        Ok(())
    }

    /// Writes every pending last-streamed time in one transaction. Any failing
    /// row rolls the whole batch back.
    pub async fn update_last_streamed(
        &self,
        updates: &HashMap<String, DateTime<Utc>>,
    ) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context("begin last_streamed update")?;
        for (patient_id, streamed_at) in updates {
            let result = sqlx::query(
                "UPDATE monitoring_sessions SET last_streamed_time = ? WHERE patient_id = ?",
            )
            .bind(format_session_time(*streamed_at))
            .bind(patient_id)
            .execute(&mut *tx)
            .await;
            if let Err(err) = result {
                tracing::warn!(
                    patient = %patient_id,
                    error = %err,
                    "last_streamed update failed; rolling back batch"
                );
                tx.rollback().await.context("roll back last_streamed update")?;
                return Err(err).context("update last_streamed_time");
            }
        }
        tx.commit().await.context("commit last_streamed update")?;
        Ok(updates.len())
    }

    pub async fn load_running(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            r#"
            SELECT patient_id, device_id, status, facility_id, start_time, end_time, last_streamed_time
            FROM monitoring_sessions
            WHERE status = ?
            "#,
        )
        .bind(SessionStatus::Running.as_str())
        .fetch_all(&self.pool)
        .await
        .context("load running sessions")?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(session) = session_from_row(&row)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    #[cfg(test)]
    pub async fn load_session(&self, patient_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT patient_id, device_id, status, facility_id, start_time, end_time, last_streamed_time
            FROM monitoring_sessions
            WHERE patient_id = ?
            "#,
        )
        .bind(patient_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => session_from_row(&row),
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn session_from_row(row: &SqliteRow) -> Result<Option<Session>> {
    let patient_id = row.try_get::<String, _>("patient_id")?;
    let start_raw = row.try_get::<String, _>("start_time")?;
    let Some(start_time) = parse_session_time(&start_raw) else {
        tracing::warn!(
            patient = %patient_id,
            start_time = %start_raw,
            "could not parse start_time from session row; skipping"
        );
        return Ok(None);
    };
    let status_raw = row.try_get::<String, _>("status")?;
    let Some(status) = SessionStatus::parse(&status_raw) else {
        tracing::warn!(patient = %patient_id, status = %status_raw, "unknown session status; skipping");
        return Ok(None);
    };

    Ok(Some(Session {
        device_id: row
            .try_get::<Option<String>, _>("device_id")?
            .unwrap_or_default(),
        facility_id: row.try_get::<String, _>("facility_id")?,
        status,
        start_time,
        end_time: row
            .try_get::<Option<String>, _>("end_time")?
            .as_deref()
            .and_then(parse_session_time),
        last_streamed_time: row
            .try_get::<Option<String>, _>("last_streamed_time")?
            .as_deref()
            .and_then(parse_session_time),
        patient_id,
    }))
}
