//! Folder rows: server paths, classification, per-folder sync state.
//!
//! The `last_seen_uid` column is the folder's watermark. It only ever moves
//! forward; `advance_watermark` enforces that in SQL so no code path can
//! rewind it by accident.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Store;

#[derive(Debug, Clone, FromRow)]
pub struct FolderRecord {
    pub id: i64,
    pub account_id: i64,
    pub server_path: String,
    pub folder_type: String,
    pub sort_order: i64,
    pub last_seen_uid: i64,
    pub uid_next: i64,
    pub uid_validity: i64,
    pub message_count: i64,
    pub unseen_count: i64,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub last_flag_synced_at: Option<DateTime<Utc>>,
}

impl FolderRecord {
    pub fn watermark(&self) -> u32 {
        self.last_seen_uid.max(0) as u32
    }

    /// A folder that has never recorded a uidNext has not completed its
    /// first full pass.
    pub fn needs_initial(&self) -> bool {
        self.uid_next == 0
    }
}

/// Map a server path onto a well-known folder type. Matching is on the last
/// path segment, case-insensitive, so `[Gmail]/Sent Mail` and `INBOX.Sent`
/// both classify as sent.
pub fn classify_folder(server_path: &str) -> &'static str {
    let leaf = server_path
        .rsplit(['/', '.'])
        .next()
        .unwrap_or(server_path)
        .to_lowercase();
    match leaf.as_str() {
        "inbox" => "inbox",
        "sent" | "sent mail" | "sent items" | "sent messages" => "sent",
        "drafts" | "draft" => "drafts",
        "trash" | "deleted" | "deleted items" | "bin" => "trash",
        "spam" | "junk" | "junk mail" | "bulk mail" => "spam",
        "archive" | "all mail" | "archives" => "archive",
        _ => "custom",
    }
}

fn sort_order_for(folder_type: &str) -> i64 {
    match folder_type {
        "inbox" => 0,
        "drafts" => 10,
        "sent" => 20,
        "archive" => 30,
        "spam" => 40,
        "trash" => 50,
        _ => 100,
    }
}

const FOLDER_COLUMNS: &str = "id, account_id, server_path, folder_type, sort_order,
    last_seen_uid, uid_next, uid_validity, message_count, unseen_count,
    last_reconciled_at, last_flag_synced_at";

impl Store {
    /// Get or create the row for one server folder, classifying it on first
    /// sight.
    pub async fn register_folder(
        &self,
        account_id: i64,
        server_path: &str,
    ) -> Result<FolderRecord, sqlx::Error> {
        let folder_type = classify_folder(server_path);
        sqlx::query_as::<_, FolderRecord>(&format!(
            "INSERT INTO folders (account_id, server_path, folder_type, sort_order)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account_id, server_path) DO UPDATE SET server_path = excluded.server_path
             RETURNING {FOLDER_COLUMNS}"
        ))
        .bind(account_id)
        .bind(server_path)
        .bind(folder_type)
        .bind(sort_order_for(folder_type))
        .fetch_one(&self.pool)
        .await
    }

    pub async fn folders_for_account(
        &self,
        account_id: i64,
    ) -> Result<Vec<FolderRecord>, sqlx::Error> {
        sqlx::query_as::<_, FolderRecord>(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders
             WHERE account_id = ? ORDER BY sort_order, server_path"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Record the server counters observed for a folder.
    pub async fn update_folder_counters(
        &self,
        folder_id: i64,
        uid_next: u32,
        uid_validity: u32,
        message_count: i64,
        unseen_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE folders SET uid_next = ?, uid_validity = ?,
                 message_count = ?, unseen_count = ?
             WHERE id = ?",
        )
        .bind(uid_next as i64)
        .bind(uid_validity as i64)
        .bind(message_count)
        .bind(unseen_count)
        .bind(folder_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move the watermark forward, never back.
    pub async fn advance_watermark(&self, folder_id: i64, uid: u32) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET last_seen_uid = MAX(last_seen_uid, ?) WHERE id = ?")
            .bind(uid as i64)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Invalidate everything cached for a folder. Called when the server's
    /// uidValidity changes, which voids every stored UID.
    pub async fn reset_folder(&self, folder_id: i64, new_validity: u32) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE folder_id = ?")
            .bind(folder_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE folders SET last_seen_uid = 0, uid_next = 0, uid_validity = ?,
                 message_count = 0, unseen_count = 0,
                 last_reconciled_at = NULL, last_flag_synced_at = NULL
             WHERE id = ?",
        )
        .bind(new_validity as i64)
        .bind(folder_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    /// Update only the local-derived counts, leaving the protocol state
    /// (watermark, uidNext, uidValidity) untouched. Used after flag pulls
    /// and ghost deletions, where the local rows are the authority.
    pub async fn update_local_counts(
        &self,
        folder_id: i64,
        message_count: i64,
        unseen_count: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET message_count = ?, unseen_count = ? WHERE id = ?")
            .bind(message_count)
            .bind(unseen_count)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_flag_synced(&self, folder_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET last_flag_synced_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_reconciled(&self, folder_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE folders SET last_reconciled_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_common_paths() {
        assert_eq!(classify_folder("INBOX"), "inbox");
        assert_eq!(classify_folder("[Gmail]/Sent Mail"), "sent");
        assert_eq!(classify_folder("INBOX.Junk"), "spam");
        assert_eq!(classify_folder("Deleted Items"), "trash");
        assert_eq!(classify_folder("[Gmail]/All Mail"), "archive");
        assert_eq!(classify_folder("Receipts/2024"), "custom");
    }

    #[test]
    fn test_inbox_sorts_first() {
        assert!(sort_order_for("inbox") < sort_order_for("sent"));
        assert!(sort_order_for("trash") < sort_order_for("custom"));
    }
}
