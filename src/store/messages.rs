//! Message rows and the flag bookkeeping around them.
//!
//! Flag changes carry a direction. `flags_dirty = 1` marks a local change
//! that still has to be pushed to the server; while a row is dirty, a
//! server-observed value never overwrites it. The reconciler pushes the
//! local value, clears the bit, and only then does the server win again.

use std::collections::HashSet;

use sqlx::FromRow;

use super::Store;
use crate::codec::NormalizedMessage;
use crate::error::SyncError;

/// Values per IN clause; keeps the bound-parameter count well under
/// SQLite's limit.
const DELETE_CHUNK: usize = 500;

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchOutcome {
    pub written: usize,
    pub new: usize,
}

/// The slice of one message row the flag reconciler works on.
#[derive(Debug, Clone, FromRow)]
pub struct LocalFlagRow {
    pub id: i64,
    pub uid: i64,
    pub seen: bool,
    pub flagged: bool,
    pub flags_dirty: bool,
}

/// A dirty row joined with its folder path, for the account-wide flush.
#[derive(Debug, Clone, FromRow)]
pub struct DirtyFlagRow {
    pub id: i64,
    pub uid: i64,
    pub seen: bool,
    pub flagged: bool,
    pub folder_id: i64,
    pub server_path: String,
}

impl Store {
    /// Write one batch of normalized messages in a single transaction.
    /// Rows already present (same account, folder, uid) get their flags
    /// refreshed unless a local change is still pending push; bodies are
    /// never re-written.
    pub async fn upsert_batch(
        &self,
        account_id: i64,
        folder_id: i64,
        batch: &[NormalizedMessage],
    ) -> Result<BatchOutcome, SyncError> {
        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let existing = self.existing_uids(folder_id, batch).await?;
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();

        for msg in batch {
            // The dedup key is positional: same account, folder and server
            // UID always map to the same row.
            let message_key = format!("{}:{}:{}", account_id, folder_id, msg.uid);
            sqlx::query(
                "INSERT INTO messages (
                     account_id, folder_id, uid, message_key, message_id, subject,
                     from_addrs, to_addrs, cc_addrs, date, preview,
                     body_text, body_html, seen, flagged,
                     has_attachments, attachments, in_reply_to, size
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(account_id, folder_id, uid) DO UPDATE SET
                     seen = CASE WHEN flags_dirty = 1 THEN seen ELSE excluded.seen END,
                     flagged = CASE WHEN flags_dirty = 1 THEN flagged ELSE excluded.flagged END,
                     updated_at = CURRENT_TIMESTAMP",
            )
            .bind(account_id)
            .bind(folder_id)
            .bind(msg.uid as i64)
            .bind(&message_key)
            .bind(&msg.message_id)
            .bind(&msg.subject)
            .bind(serde_json::to_string(&msg.from)?)
            .bind(serde_json::to_string(&msg.to)?)
            .bind(serde_json::to_string(&msg.cc)?)
            .bind(msg.date)
            .bind(&msg.preview)
            .bind(&msg.body_text)
            .bind(&msg.body_html)
            .bind(msg.seen)
            .bind(msg.flagged)
            .bind(msg.has_attachments)
            .bind(serde_json::to_string(&msg.attachments)?)
            .bind(&msg.in_reply_to)
            .bind(msg.size)
            .execute(&mut *tx)
            .await?;

            outcome.written += 1;
            if !existing.contains(&msg.uid) {
                outcome.new += 1;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn existing_uids(
        &self,
        folder_id: i64,
        batch: &[NormalizedMessage],
    ) -> Result<HashSet<u32>, sqlx::Error> {
        let mut found = HashSet::new();
        for chunk in batch.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "SELECT uid FROM messages WHERE folder_id = ? AND uid IN ({})",
                placeholders
            );
            let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(folder_id);
            for msg in chunk {
                query = query.bind(msg.uid as i64);
            }
            for uid in query.fetch_all(&self.pool).await? {
                found.insert(uid as u32);
            }
        }
        Ok(found)
    }

    /// All UIDs currently stored for a folder. Rows without a real server
    /// UID are invisible here, so reconciliation never targets them.
    pub async fn local_uid_set(&self, folder_id: i64) -> Result<HashSet<u32>, sqlx::Error> {
        let uids = sqlx::query_scalar::<_, i64>(
            "SELECT uid FROM messages WHERE folder_id = ? AND uid > 0",
        )
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(uids.into_iter().map(|u| u as u32).collect())
    }

    /// Every message's flag state for one folder, for the reconciler's
    /// in-memory comparison against the server sweep.
    pub async fn flag_rows(&self, folder_id: i64) -> Result<Vec<LocalFlagRow>, sqlx::Error> {
        sqlx::query_as::<_, LocalFlagRow>(
            "SELECT id, uid, seen, flagged, flags_dirty FROM messages WHERE folder_id = ?",
        )
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Record a local-origin flag change: the row is marked dirty until the
    /// reconciler pushes it to the server.
    pub async fn set_seen_local(&self, message_id: i64, seen: bool) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE messages SET seen = ?, flags_dirty = 1, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?",
        )
        .bind(seen)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Adopt a server-observed seen value. A no-op while the row is dirty,
    /// so pending local changes are never clobbered.
    pub async fn apply_server_seen(
        &self,
        message_id: i64,
        seen: bool,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE messages SET seen = ?, updated_at = CURRENT_TIMESTAMP
             WHERE id = ? AND flags_dirty = 0",
        )
        .bind(seen)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear the dirty bit once the local value has been stored server-side.
    pub async fn clear_dirty(&self, message_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE messages SET flags_dirty = 0 WHERE id = ?")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every dirty row for an account, ordered by folder so the flush can
    /// open each mailbox exactly once. Rows without a real server UID have
    /// nothing to push and are excluded.
    pub async fn dirty_rows(&self, account_id: i64) -> Result<Vec<DirtyFlagRow>, sqlx::Error> {
        sqlx::query_as::<_, DirtyFlagRow>(
            "SELECT m.id, m.uid, m.seen, m.flagged, m.folder_id, f.server_path
             FROM messages m JOIN folders f ON f.id = m.folder_id
             WHERE m.account_id = ? AND m.flags_dirty = 1 AND m.uid > 0
             ORDER BY m.folder_id, m.uid",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Drop the dirty bit on rows without a real server UID. There is
    /// nothing to push for them, so a flush treats them as already flushed.
    pub async fn clear_dirty_nonpositive(&self, account_id: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE messages SET flags_dirty = 0
             WHERE account_id = ? AND flags_dirty = 1 AND uid <= 0",
        )
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Clear the dirty bit for a set of rows, chunked.
    pub async fn clear_dirty_bulk(&self, message_ids: &[i64]) -> Result<(), sqlx::Error> {
        for chunk in message_ids.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "UPDATE messages SET flags_dirty = 0 WHERE id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            query.execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Delete rows whose UIDs no longer exist on the server. Chunked so
    /// arbitrarily large ghost sets stay within bind limits.
    pub async fn delete_uids(&self, folder_id: i64, uids: &[u32]) -> Result<u64, sqlx::Error> {
        let mut deleted = 0;
        for chunk in uids.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let sql = format!(
                "DELETE FROM messages WHERE folder_id = ? AND uid IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(folder_id);
            for uid in chunk {
                query = query.bind(*uid as i64);
            }
            deleted += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    /// Local (total, unseen) counts; the authoritative source for the
    /// folder counters after any local mutation.
    pub async fn folder_counts(&self, folder_id: i64) -> Result<(i64, i64), sqlx::Error> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN seen = 0 THEN 1 ELSE 0 END), 0)
             FROM messages WHERE folder_id = ?",
        )
        .bind(folder_id)
        .fetch_one(&self.pool)
        .await
    }
}
