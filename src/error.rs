use thiserror::Error;

use crate::imap::error::ImapError;
use crate::secret::SecretError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IMAP error: {0}")]
    Imap(#[from] ImapError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Account not found: {0}")]
    AccountNotFound(String),
}

impl SyncError {
    /// True when retrying the same account with the same inputs is pointless
    /// (bad credentials, missing account). Transient network and server
    /// errors return false.
    pub fn is_permanent(&self) -> bool {
        match self {
            SyncError::Imap(e) => e.is_auth(),
            SyncError::AccountNotFound(_) | SyncError::Secret(_) | SyncError::Config(_) => true,
            _ => false,
        }
    }

    /// Map low-level failures onto a short message fit for an end user,
    /// matching on the usual substrings network stacks produce.
    pub fn user_message(&self) -> &'static str {
        match self {
            SyncError::Imap(ImapError::Auth(_)) => {
                "Sign-in failed. Check the account's username and password."
            }
            SyncError::Imap(ImapError::Timeout(_)) => {
                "The mail server took too long to respond. Try again later."
            }
            SyncError::Imap(ImapError::Connection(msg)) | SyncError::Imap(ImapError::Tls(msg)) => {
                let msg = msg.to_lowercase();
                if msg.contains("refused") {
                    "Could not reach the mail server. Check the host and port."
                } else if msg.contains("timed out") || msg.contains("timeout") {
                    "The mail server took too long to respond. Try again later."
                } else {
                    "Lost the connection to the mail server. Try again later."
                }
            }
            SyncError::AccountNotFound(_) => "That account is not registered.",
            _ => "Synchronization failed. See the sync log for details.",
        }
    }

    /// Short category label recorded on failed sync runs so operators can
    /// group failures without parsing message text.
    pub fn category(&self) -> &'static str {
        match self {
            SyncError::Imap(ImapError::Auth(_)) => "auth",
            SyncError::Imap(ImapError::Connection(_)) | SyncError::Imap(ImapError::Tls(_)) => {
                "network"
            }
            SyncError::Imap(ImapError::Timeout(_)) => "timeout",
            SyncError::Imap(_) => "imap",
            SyncError::Database(_) | SyncError::Migration(_) => "storage",
            SyncError::Secret(_) => "secret",
            SyncError::Config(_) => "config",
            SyncError::Serialization(_) => "serialization",
            SyncError::AccountNotFound(_) => "account",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_permanent() {
        let err = SyncError::Imap(ImapError::Auth("LOGIN failed".into()));
        assert!(err.is_permanent());
        assert_eq!(err.category(), "auth");
    }

    #[test]
    fn test_network_errors_are_transient() {
        let err = SyncError::Imap(ImapError::Connection("reset by peer".into()));
        assert!(!err.is_permanent());
        assert_eq!(err.category(), "network");
    }

    #[test]
    fn test_user_message_classifies_refused_connections() {
        let err = SyncError::Imap(ImapError::Connection(
            "Connection refused (os error 111)".into(),
        ));
        assert!(err.user_message().contains("host and port"));

        let err = SyncError::Imap(ImapError::Connection("connection timed out".into()));
        assert!(err.user_message().contains("too long"));
    }

    #[test]
    fn test_user_message_for_auth() {
        let err = SyncError::Imap(ImapError::Auth("[AUTHENTICATIONFAILED]".into()));
        assert!(err.user_message().contains("username and password"));
    }
}
