//! # Election Log Repository
//!
//! Append-only history of leadership transitions. One row per actual
//! transition: a re-election that keeps the incumbent writes nothing.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::DbResult;
use fleet_core::ElectionRecord;

/// Repository for election log rows.
#[derive(Debug, Clone)]
pub struct ElectionLogRepository {
    pool: SqlitePool,
}

impl ElectionLogRepository {
    /// Creates a new ElectionLogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ElectionLogRepository { pool }
    }

    /// Appends a leadership transition record.
    pub async fn append(
        &self,
        conn: &mut SqliteConnection,
        record: &ElectionRecord,
    ) -> DbResult<()> {
        debug!(
            previous_leader = ?record.previous_leader,
            new_leader = %record.new_leader,
            reason = %record.reason,
            "Recording leadership transition"
        );

        sqlx::query(
            r#"
            INSERT INTO election_log
                (id, previous_leader, new_leader, reason, participant_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&record.id)
        .bind(&record.previous_leader)
        .bind(&record.new_leader)
        .bind(record.reason)
        .bind(record.participant_count)
        .bind(record.created_at)
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Returns the most recent transitions, newest first.
    pub async fn list_recent(&self, limit: i64) -> DbResult<Vec<ElectionRecord>> {
        let records = sqlx::query_as::<_, ElectionRecord>(
            "SELECT * FROM election_log ORDER BY created_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
