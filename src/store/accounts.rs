//! Account rows: connection parameters plus the stored credential container.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Store;

#[derive(Debug, Clone, FromRow)]
pub struct AccountRecord {
    pub id: i64,
    pub email: String,
    pub imap_host: String,
    pub imap_port: i64,
    pub imap_user: String,
    pub imap_secret: String,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Store {
    pub async fn active_accounts(&self) -> Result<Vec<AccountRecord>, sqlx::Error> {
        sqlx::query_as::<_, AccountRecord>(
            "SELECT id, email, imap_host, imap_port, imap_user, imap_secret,
                    is_active, last_sync_at
             FROM accounts WHERE is_active = 1 ORDER BY email",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn account_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountRecord>, sqlx::Error> {
        sqlx::query_as::<_, AccountRecord>(
            "SELECT id, email, imap_host, imap_port, imap_user, imap_secret,
                    is_active, last_sync_at
             FROM accounts WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// Insert or refresh an account's connection parameters. The stored
    /// secret is whatever container the caller hands over; decryption happens
    /// at connect time.
    pub async fn upsert_account(
        &self,
        email: &str,
        host: &str,
        port: u16,
        user: &str,
        secret: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO accounts (email, imap_host, imap_port, imap_user, imap_secret)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET
                 imap_host = excluded.imap_host,
                 imap_port = excluded.imap_port,
                 imap_user = excluded.imap_user,
                 imap_secret = excluded.imap_secret,
                 is_active = 1
             RETURNING id",
        )
        .bind(email)
        .bind(host)
        .bind(port as i64)
        .bind(user)
        .bind(secret)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn mark_account_synced(&self, account_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET last_sync_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn deactivate_account(&self, account_id: i64) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE accounts SET is_active = 0 WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
