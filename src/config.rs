//! Runtime configuration.
//!
//! Defaults are compiled in; everything is overridable through the
//! environment with the `MAILSYNC_` prefix (`MAILSYNC_SYNC__INITIAL_BATCH`
//! style for nested fields). Settings are built once at startup and injected
//! into the services that need them.

use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_url: String,
    /// 64-char hex AES-256 key for stored credentials. Empty disables
    /// decryption (plaintext secrets only).
    pub encryption_key: String,
    pub sync: SyncSettings,
}

/// Tunables for the sync engine. The defaults are sized for a periodic
/// scheduler tick; a one-shot CLI invocation can raise the budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Messages written per store batch during a first full sync.
    pub initial_batch: usize,
    /// Messages written per store batch during incremental catch-up.
    pub incremental_batch: usize,
    /// Wall-clock budget for one initial sync run, seconds.
    pub initial_budget_secs: u64,
    /// Wall-clock budget for one incremental sync run, seconds.
    pub incremental_budget_secs: u64,
    /// Hard cap on a single body part download, seconds.
    pub body_timeout_secs: u64,
    /// Delay before retrying a folder after a dropped connection, seconds.
    pub reconnect_backoff_secs: u64,
    /// Minimum gap between flag reconciliation passes over one folder.
    pub flag_cooldown_secs: u64,
    /// Minimum gap between ghost reconciliation passes over one folder.
    pub ghost_cooldown_secs: u64,
    /// Folders flag-reconciled per incremental run.
    pub flag_folders_per_run: usize,
    /// Folders ghost-reconciled per incremental run.
    pub ghost_folders_per_run: usize,
    /// Folders above this message count are skipped by flag reconciliation.
    pub flag_folder_ceiling: u32,
    /// Folders above this message count are skipped by ghost reconciliation.
    pub ghost_folder_ceiling: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            initial_batch: 100,
            incremental_batch: 50,
            initial_budget_secs: 300,
            incremental_budget_secs: 60,
            body_timeout_secs: 10,
            reconnect_backoff_secs: 2,
            flag_cooldown_secs: 2 * 3600,
            ghost_cooldown_secs: 3600,
            flag_folders_per_run: 5,
            ghost_folders_per_run: 3,
            flag_folder_ceiling: 5_000,
            ghost_folder_ceiling: 10_000,
        }
    }
}

impl SyncSettings {
    pub fn initial_budget(&self) -> Duration {
        Duration::from_secs(self.initial_budget_secs)
    }

    pub fn incremental_budget(&self) -> Duration {
        Duration::from_secs(self.incremental_budget_secs)
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_secs(self.body_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = SyncSettings::default();
        let builder = Config::builder()
            .set_default("database_url", "sqlite:mailsync.db")?
            .set_default("encryption_key", "")?
            .set_default("sync.initial_batch", defaults.initial_batch as i64)?
            .set_default("sync.incremental_batch", defaults.incremental_batch as i64)?
            .set_default("sync.initial_budget_secs", defaults.initial_budget_secs as i64)?
            .set_default(
                "sync.incremental_budget_secs",
                defaults.incremental_budget_secs as i64,
            )?
            .set_default("sync.body_timeout_secs", defaults.body_timeout_secs as i64)?
            .set_default(
                "sync.reconnect_backoff_secs",
                defaults.reconnect_backoff_secs as i64,
            )?
            .set_default("sync.flag_cooldown_secs", defaults.flag_cooldown_secs as i64)?
            .set_default("sync.ghost_cooldown_secs", defaults.ghost_cooldown_secs as i64)?
            .set_default(
                "sync.flag_folders_per_run",
                defaults.flag_folders_per_run as i64,
            )?
            .set_default(
                "sync.ghost_folders_per_run",
                defaults.ghost_folders_per_run as i64,
            )?
            .set_default("sync.flag_folder_ceiling", defaults.flag_folder_ceiling as i64)?
            .set_default("sync.ghost_folder_ceiling", defaults.ghost_folder_ceiling as i64)?
            .add_source(Environment::with_prefix("MAILSYNC").separator("__"));

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let settings = Settings::load().unwrap();
        assert_eq!(settings.sync.initial_batch, 100);
        assert_eq!(settings.sync.incremental_batch, 50);
        assert_eq!(settings.sync.flag_folders_per_run, 5);
        assert_eq!(settings.sync.ghost_folder_ceiling, 10_000);
    }

    #[test]
    fn test_duration_helpers() {
        let sync = SyncSettings::default();
        assert_eq!(sync.body_timeout(), Duration::from_secs(10));
        assert_eq!(sync.incremental_budget(), Duration::from_secs(60));
    }
}
