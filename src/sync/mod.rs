//! Sync orchestration.
//!
//! A run is deadline-bounded: the engine picks a wall-clock budget up front
//! and checks it between folders and between batches. Hitting the deadline
//! never leaves inconsistent state; each batch commits atomically and moves
//! the folder watermark, so a `partial` run simply resumes on the next tick.
//!
//! Incremental run order matters: dirty local flags are flushed to the
//! server before anything reads server flag state, then folders are classed
//! and synced off one STATUS read each, then the capped flag-pull and ghost
//! passes handle the folders that classification queued.

pub mod flags;
pub mod ghosts;
pub mod incremental;
pub mod initial;

use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::codec::{MessageCodec, NormalizedMessage};
use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::imap::error::ImapError;
use crate::imap::session::{FolderLock, MailSession};
use crate::imap::types::RawMessage;
use crate::secret::SecretBox;
use crate::store::accounts::AccountRecord;
use crate::store::folders::FolderRecord;
use crate::store::runs::RunStatus;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Initial,
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Initial => "initial",
            SyncMode::Incremental => "incremental",
        }
    }
}

/// What one folder pass accomplished.
#[derive(Debug, Default, Clone, Copy)]
pub struct FolderOutcome {
    pub processed: usize,
    pub new_messages: usize,
    /// False when the deadline cut the folder short.
    pub completed: bool,
}

/// Aggregate result of one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: i64,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub processed: usize,
    pub new_messages: usize,
    pub folders_synced: usize,
}

/// Mutable run-scoped state threaded through the folder loop.
struct RunState {
    report: RunReport,
    total_expected: i64,
    /// True when the total was summed up front (initial mode) instead of
    /// accumulated per folder.
    upfront_total: bool,
    flag_queue: Vec<FolderRecord>,
    ghost_queue: Vec<FolderRecord>,
}

pub struct SyncEngine {
    store: Store,
    settings: SyncSettings,
    secrets: Option<SecretBox>,
    codec: MessageCodec,
}

impl SyncEngine {
    pub fn new(store: Store, settings: SyncSettings, secrets: Option<SecretBox>) -> Self {
        let codec = MessageCodec::new(settings.body_timeout());
        Self {
            store,
            settings,
            secrets,
            codec,
        }
    }

    /// Sync every active account in turn. One account failing does not stop
    /// the others.
    pub async fn sync_all(&self) -> Result<Vec<RunReport>, SyncError> {
        let accounts = self.store.active_accounts().await?;
        let mut reports = Vec::with_capacity(accounts.len());
        for account in &accounts {
            match self.sync_account(account, None).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Account {} failed to sync: {}", account.email, e),
            }
        }
        Ok(reports)
    }

    /// Run one sync pass for one account. With `mode` unset, any folder that
    /// has never completed a full pass forces the initial strategy and its
    /// larger budget.
    pub async fn sync_account(
        &self,
        account: &AccountRecord,
        mode: Option<SyncMode>,
    ) -> Result<RunReport, SyncError> {
        let mode = match mode {
            Some(mode) => mode,
            None => {
                let known = self.store.folders_for_account(account.id).await?;
                if known.is_empty() || known.iter().any(|f| f.needs_initial()) {
                    SyncMode::Initial
                } else {
                    SyncMode::Incremental
                }
            }
        };
        let budget = match mode {
            SyncMode::Initial => self.settings.initial_budget(),
            SyncMode::Incremental => self.settings.incremental_budget(),
        };
        let deadline = Instant::now() + budget;

        let run_id = self.store.start_run(account.id, mode.as_str()).await?;
        info!(
            "Starting {} sync for {} (run {})",
            mode.as_str(),
            account.email,
            run_id
        );

        match self.run_account(account, run_id, mode, deadline).await {
            Ok(report) => {
                self.store.finish_run(run_id, report.status, None).await?;
                self.store.mark_account_synced(account.id).await?;
                info!(
                    "Run {} for {} finished {}: {} processed, {} new",
                    run_id,
                    account.email,
                    report.status.as_str(),
                    report.processed,
                    report.new_messages
                );
                Ok(report)
            }
            Err(e) => {
                let detail = format!("{}: {}", e.category(), e);
                self.store
                    .finish_run(run_id, RunStatus::Failed, Some(&detail))
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_account(
        &self,
        account: &AccountRecord,
        run_id: i64,
        mode: SyncMode,
        deadline: Instant,
    ) -> Result<RunReport, SyncError> {
        let mut session = self.connect_with_retry(account).await?;

        let mut state = RunState {
            report: RunReport {
                run_id,
                mode,
                status: RunStatus::Completed,
                processed: 0,
                new_messages: 0,
                folders_synced: 0,
            },
            total_expected: 0,
            upfront_total: mode == SyncMode::Initial,
            flag_queue: Vec::new(),
            ghost_queue: Vec::new(),
        };

        let result = self
            .drive_run(account, run_id, mode, deadline, &mut session, &mut state)
            .await;

        // The session closes on every exit path; a logout failure is logged
        // and never masks the run's own outcome.
        if let Err(e) = session.logout().await {
            warn!("Logout for {} failed: {}", account.email, e);
        }
        result.map(|()| state.report)
    }

    async fn drive_run(
        &self,
        account: &AccountRecord,
        run_id: i64,
        mode: SyncMode,
        deadline: Instant,
        session: &mut MailSession,
        state: &mut RunState,
    ) -> Result<(), SyncError> {
        // Dirty local flags go out before anything reads server flag state,
        // so the pull later in the run cannot clobber a pending change.
        if mode == SyncMode::Incremental {
            let flush = flags::flush_dirty(&self.store, session, account.id).await?;
            if flush.pushed > 0 || flush.failed > 0 {
                info!(
                    "Flushed {} dirty flag(s) for {} ({} failed)",
                    flush.pushed, account.email, flush.failed
                );
            }
        }

        // Register every selectable server folder before touching any of
        // them, so newly appeared folders join this run.
        let mut folders = Vec::new();
        for path in session.list_folders().await? {
            folders.push(self.store.register_folder(account.id, &path).await?);
        }
        folders.sort_by(|a, b| {
            a.sort_order
                .cmp(&b.sort_order)
                .then_with(|| a.server_path.cmp(&b.server_path))
        });

        // Initial mode sums the expected total up front so callers can
        // render progress against a stable denominator.
        if state.upfront_total {
            for folder in &folders {
                match session.folder_status(&folder.server_path).await {
                    Ok(status) => state.total_expected += status.messages as i64,
                    Err(e) => warn!(
                        "Could not size folder {}: {}",
                        folder.server_path, e
                    ),
                }
            }
            self.store
                .update_run_progress(run_id, 0, 0, state.total_expected, None)
                .await?;
        }

        // One mid-run reconnect for the whole run; a flapping server fails
        // the run instead of looping through reconnects.
        let mut reconnected = false;

        for folder in &folders {
            if Instant::now() >= deadline {
                state.report.status = RunStatus::Partial;
                break;
            }

            let attempt = self
                .sync_folder(session, account, folder, deadline, state)
                .await;
            match attempt {
                Ok(()) => {}
                Err(SyncError::Imap(e)) if is_connection_error(&e) && !reconnected => {
                    reconnected = true;
                    warn!(
                        "Connection lost on {} ({}); reconnecting and retrying once",
                        folder.server_path, e
                    );
                    tokio::time::sleep(self.settings.reconnect_backoff()).await;
                    *session = self.connect(account).await?;
                    self.sync_folder(session, account, folder, deadline, state)
                        .await?;
                }
                Err(SyncError::Imap(e)) if !e.is_auth() && !is_connection_error(&e) => {
                    // Folder-scoped failure; the rest of the account still
                    // gets its pass.
                    warn!("Skipping folder {}: {}", folder.server_path, e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            self.store
                .update_run_progress(
                    run_id,
                    state.report.processed as i64,
                    state.report.new_messages as i64,
                    state.total_expected,
                    Some(&folder.server_path),
                )
                .await?;
        }

        // Maintenance only runs on incremental ticks; an initial run has
        // just written fresh flags and has no history to reconcile.
        if mode == SyncMode::Incremental {
            self.run_maintenance(session, account, deadline, state).await?;
        }
        Ok(())
    }

    /// STATUS one folder, classify it, run the per-folder strategy, persist
    /// the refreshed counters, and queue maintenance work.
    async fn sync_folder(
        &self,
        session: &MailSession,
        account: &AccountRecord,
        folder: &FolderRecord,
        deadline: Instant,
        state: &mut RunState,
    ) -> Result<(), SyncError> {
        let status = session.folder_status(&folder.server_path).await?;

        // A changed uidValidity voids every UID we have stored for the
        // folder; drop the cache and rebuild from scratch.
        let folder = if folder.uid_validity != 0
            && folder.uid_validity != status.uid_validity as i64
        {
            warn!(
                "uidValidity changed for {} ({} -> {}), resetting folder",
                folder.server_path, folder.uid_validity, status.uid_validity
            );
            self.store
                .reset_folder(folder.id, status.uid_validity)
                .await?;
            self.store
                .register_folder(account.id, &folder.server_path)
                .await?
        } else {
            folder.clone()
        };

        // Classification for the maintenance passes uses the stored values,
        // before this run refreshes them. Folders doing their first full
        // pass have nothing to reconcile yet.
        if state.report.mode == SyncMode::Incremental && !folder.needs_initial() {
            let server_count = status.messages as i64;
            let server_unseen = status.unseen as i64;

            if server_count <= self.settings.flag_folder_ceiling as i64
                && (server_unseen != folder.unseen_count
                    || cooldown_expired(
                        folder.last_flag_synced_at,
                        self.settings.flag_cooldown_secs,
                    ))
            {
                state.flag_queue.push(folder.clone());
            }

            if server_count < folder.message_count
                && server_count <= self.settings.ghost_folder_ceiling as i64
                && cooldown_expired(
                    folder.last_reconciled_at,
                    self.settings.ghost_cooldown_secs,
                )
            {
                state.ghost_queue.push(folder.clone());
            }
        }

        if !state.upfront_total {
            let estimate = (status.uid_next as i64 - 1 - folder.last_seen_uid).max(0);
            state.total_expected += estimate;
        }

        let progress = RunProgress {
            run_id: state.report.run_id,
            processed_before: state.report.processed as i64,
            new_before: state.report.new_messages as i64,
            total_expected: state.total_expected,
        };

        let outcome = if folder.needs_initial() {
            initial::sync_folder(
                &self.store,
                &self.codec,
                session,
                account.id,
                &folder,
                &status,
                self.settings.initial_batch,
                progress,
                deadline,
            )
            .await?
        } else {
            incremental::sync_folder(
                &self.store,
                &self.codec,
                session,
                account.id,
                &folder,
                &status,
                self.settings.incremental_batch,
                progress,
                deadline,
            )
            .await?
        };

        // Server counters are persisted for every folder, changed or not,
        // so displayed counts stay fresh without a deep sync. The uidNext,
        // though, only moves once the pass finished; recording the fresh
        // value after a cut would let the unchanged-uidNext skip hide the
        // UIDs that were never written.
        self.store
            .update_folder_counters(
                folder.id,
                persisted_uid_next(folder.uid_next, status.uid_next, outcome.completed),
                status.uid_validity,
                status.messages as i64,
                status.unseen as i64,
            )
            .await?;

        state.report.processed += outcome.processed;
        state.report.new_messages += outcome.new_messages;
        state.report.folders_synced += 1;
        if !outcome.completed {
            state.report.status = RunStatus::Partial;
        }
        Ok(())
    }

    async fn run_maintenance(
        &self,
        session: &MailSession,
        account: &AccountRecord,
        deadline: Instant,
        state: &mut RunState,
    ) -> Result<(), SyncError> {
        let mut flag_queue = std::mem::take(&mut state.flag_queue);
        let mut ghost_queue = std::mem::take(&mut state.ghost_queue);
        flag_queue.truncate(self.settings.flag_folders_per_run);
        ghost_queue.truncate(self.settings.ghost_folders_per_run);

        for folder in &flag_queue {
            if Instant::now() >= deadline {
                state.report.status = RunStatus::Partial;
                return Ok(());
            }
            match flags::pull_folder(&self.store, session, folder).await {
                Ok(outcome) if outcome.adopted > 0 => info!(
                    "Flag pull on {}: adopted {}",
                    folder.server_path, outcome.adopted
                ),
                Ok(_) => {}
                Err(SyncError::Imap(e)) if !e.is_auth() => {
                    warn!("Flag pull on {} skipped: {}", folder.server_path, e)
                }
                Err(e) => return Err(e),
            }
        }

        for folder in &ghost_queue {
            if Instant::now() >= deadline {
                state.report.status = RunStatus::Partial;
                return Ok(());
            }
            match ghosts::reconcile_folder(
                &self.store,
                &self.codec,
                session,
                account.id,
                folder,
                self.settings.incremental_batch,
                deadline,
            )
            .await
            {
                Ok(outcome) => {
                    if outcome.removed > 0 || outcome.backfilled > 0 {
                        info!(
                            "Ghost pass on {}: removed {}, backfilled {}",
                            folder.server_path, outcome.removed, outcome.backfilled
                        );
                    }
                    state.report.new_messages += outcome.backfilled;
                }
                Err(SyncError::Imap(e)) if !e.is_auth() => {
                    warn!("Ghost pass on {} skipped: {}", folder.server_path, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Open the account session, retrying once after a fixed backoff when
    /// the failure is connection-level. Auth failures never retry.
    async fn connect_with_retry(&self, account: &AccountRecord) -> Result<MailSession, SyncError> {
        let first = self.connect(account).await;
        match first {
            Err(SyncError::Imap(e)) if is_connection_error(&e) => {
                warn!(
                    "Connecting to {} failed ({}); retrying once",
                    account.email, e
                );
                tokio::time::sleep(self.settings.reconnect_backoff()).await;
                self.connect(account).await
            }
            other => other,
        }
    }

    async fn connect(&self, account: &AccountRecord) -> Result<MailSession, SyncError> {
        let secret = match &self.secrets {
            Some(sb) => sb.reveal(&account.imap_secret)?,
            None => account.imap_secret.clone(),
        };
        let session = MailSession::connect(
            &account.imap_host,
            account.imap_port as u16,
            &account.imap_user,
            &secret,
        )
        .await?;
        Ok(session)
    }
}

fn is_connection_error(e: &ImapError) -> bool {
    matches!(e, ImapError::Connection(_) | ImapError::Tls(_))
}

/// True when the timestamp is absent or older than the cooldown window.
fn cooldown_expired(last: Option<DateTime<Utc>>, cooldown_secs: u64) -> bool {
    match last {
        None => true,
        Some(ts) => {
            let elapsed = Utc::now().signed_duration_since(ts);
            elapsed.num_seconds() >= cooldown_secs as i64
        }
    }
}

/// The uidNext to record after a folder pass. An incomplete pass keeps the
/// stored value so the next run re-enters the folder instead of skipping it
/// on an unchanged uidNext.
fn persisted_uid_next(stored: i64, fresh: u32, completed: bool) -> u32 {
    if completed {
        fresh
    } else {
        stored.max(0) as u32
    }
}

/// Between-batch deadline check. A cut marks the outcome incomplete so the
/// run finalizes as partial, never as an error.
pub(crate) fn deadline_cut(deadline: Instant, outcome: &mut FolderOutcome) -> bool {
    if Instant::now() >= deadline {
        outcome.completed = false;
        true
    } else {
        false
    }
}

/// Run-log coordinates for mid-folder progress updates: the run-wide counts
/// accumulated before this folder started, so each committed batch reports
/// a running total.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunProgress {
    pub run_id: i64,
    pub processed_before: i64,
    pub new_before: i64,
    pub total_expected: i64,
}

/// Normalize and write a sorted set of fetched messages in batches, moving
/// the watermark after every committed batch. Stops early at the deadline.
pub(crate) async fn write_batches(
    store: &Store,
    codec: &MessageCodec,
    lock: &mut FolderLock,
    account_id: i64,
    folder_id: i64,
    mut raws: Vec<RawMessage>,
    batch_size: usize,
    progress: Option<RunProgress>,
    deadline: Instant,
) -> Result<FolderOutcome, SyncError> {
    raws.sort_by_key(|r| r.uid);

    let mut outcome = FolderOutcome {
        completed: true,
        ..Default::default()
    };

    for chunk in raws.chunks(batch_size.max(1)) {
        if deadline_cut(deadline, &mut outcome) {
            break;
        }

        let mut batch: Vec<NormalizedMessage> = Vec::with_capacity(chunk.len());
        for raw in chunk {
            batch.push(codec.normalize(lock, raw).await?);
        }

        // The chunk is sorted, so its last UID is the candidate high-water
        // mark.
        let high_uid = chunk.last().map(|r| r.uid).unwrap_or(0);
        let committed = persist_batch(
            store,
            account_id,
            folder_id,
            &lock.path,
            &batch,
            high_uid,
            progress,
            &mut outcome,
        )
        .await?;
        if !committed {
            break;
        }
    }

    Ok(outcome)
}

/// Commit one normalized batch and advance the watermark to its highest
/// UID. Returns false when the write failed; the caller must stop so the
/// watermark never moves past UIDs that did not land.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn persist_batch(
    store: &Store,
    account_id: i64,
    folder_id: i64,
    path: &str,
    batch: &[NormalizedMessage],
    high_uid: u32,
    progress: Option<RunProgress>,
    outcome: &mut FolderOutcome,
) -> Result<bool, SyncError> {
    let written = match store.upsert_batch(account_id, folder_id, batch).await {
        Ok(written) => written,
        Err(e) => {
            warn!(
                "Batch write of {} message(s) in {} failed: {}",
                batch.len(),
                path,
                e
            );
            outcome.completed = false;
            return Ok(false);
        }
    };

    store.advance_watermark(folder_id, high_uid).await?;
    outcome.processed += written.written;
    outcome.new_messages += written.new;

    if let Some(p) = progress {
        store
            .update_run_progress(
                p.run_id,
                p.processed_before + outcome.processed as i64,
                p.new_before + outcome.new_messages as i64,
                p.total_expected,
                Some(path),
            )
            .await?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn mem_store() -> Store {
        // Single connection keeps every query on the same in-memory
        // database; foreign keys on, as in a real open.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        Store::from_pool(pool).await.unwrap()
    }

    async fn seeded_folder(store: &Store) -> (i64, i64) {
        let account_id = store
            .upsert_account(
                "sync@example.com",
                "imap.example.com",
                993,
                "sync@example.com",
                "pw",
            )
            .await
            .unwrap();
        let folder = store.register_folder(account_id, "INBOX").await.unwrap();
        (account_id, folder.id)
    }

    fn plain_message(uid: u32) -> NormalizedMessage {
        NormalizedMessage {
            uid,
            message_id: None,
            subject: Some(format!("Message {}", uid)),
            from: vec![],
            to: vec![],
            cc: vec![],
            date: None,
            preview: None,
            body_text: None,
            body_html: None,
            seen: false,
            flagged: false,
            has_attachments: false,
            attachments: vec![],
            in_reply_to: None,
            size: 0,
        }
    }

    #[tokio::test]
    async fn test_failed_batch_stops_watermark() {
        let store = mem_store().await;
        let (account_id, folder_id) = seeded_folder(&store).await;

        let mut outcome = FolderOutcome {
            completed: true,
            ..Default::default()
        };
        let batch = vec![plain_message(1), plain_message(2)];
        let committed = persist_batch(
            &store, account_id, folder_id, "INBOX", &batch, 2, None, &mut outcome,
        )
        .await
        .unwrap();
        assert!(committed);

        // A batch that cannot commit (here: an unknown folder) leaves the
        // watermark where the last committed batch put it and stops the
        // loop, so its UIDs stay fetchable on the next run.
        let bad = vec![plain_message(3)];
        let committed = persist_batch(
            &store,
            account_id,
            folder_id + 100,
            "INBOX",
            &bad,
            3,
            None,
            &mut outcome,
        )
        .await
        .unwrap();
        assert!(!committed);
        assert!(!outcome.completed);
        assert_eq!(outcome.processed, 2);

        let folder = &store.folders_for_account(account_id).await.unwrap()[0];
        assert_eq!(folder.watermark(), 2);
    }

    #[tokio::test]
    async fn test_batch_commit_reports_run_progress() {
        let store = mem_store().await;
        let (account_id, folder_id) = seeded_folder(&store).await;
        let run_id = store.start_run(account_id, "initial").await.unwrap();

        let progress = RunProgress {
            run_id,
            processed_before: 10,
            new_before: 4,
            total_expected: 100,
        };
        let mut outcome = FolderOutcome {
            completed: true,
            ..Default::default()
        };
        let batch = vec![plain_message(1), plain_message(2)];
        persist_batch(
            &store,
            account_id,
            folder_id,
            "INBOX",
            &batch,
            2,
            Some(progress),
            &mut outcome,
        )
        .await
        .unwrap();

        let run = store.latest_run(account_id).await.unwrap().unwrap();
        assert_eq!(run.processed, 12);
        assert_eq!(run.new_messages, 6);
        assert_eq!(run.total_expected, 100);
        assert_eq!(run.current_folder.as_deref(), Some("INBOX"));
    }

    #[test]
    fn test_deadline_cut_is_partial_not_error() {
        let mut outcome = FolderOutcome {
            completed: true,
            ..Default::default()
        };
        let future = Instant::now() + std::time::Duration::from_secs(60);
        assert!(!deadline_cut(future, &mut outcome));
        assert!(outcome.completed);

        let expired = Instant::now();
        assert!(deadline_cut(expired, &mut outcome));
        assert!(!outcome.completed);
    }

    #[test]
    fn test_incomplete_pass_keeps_stored_uid_next() {
        assert_eq!(persisted_uid_next(100, 205, true), 205);
        assert_eq!(persisted_uid_next(100, 205, false), 100);
        // A cut-short first pass stays in initial mode.
        assert_eq!(persisted_uid_next(0, 205, false), 0);
    }

    #[test]
    fn test_only_connection_errors_gate_reconnects() {
        assert!(is_connection_error(&ImapError::Connection("reset".into())));
        assert!(is_connection_error(&ImapError::Tls("handshake".into())));
        assert!(!is_connection_error(&ImapError::Auth("denied".into())));
        assert!(!is_connection_error(&ImapError::Operation("no".into())));
    }

    #[test]
    fn test_cooldown_never_run_is_expired() {
        assert!(cooldown_expired(None, 3600));
    }

    #[test]
    fn test_cooldown_recent_pass_blocks() {
        let just_now = Utc::now() - Duration::seconds(10);
        assert!(!cooldown_expired(Some(just_now), 3600));
    }

    #[test]
    fn test_cooldown_elapsed_window_allows() {
        let old = Utc::now() - Duration::seconds(7200);
        assert!(cooldown_expired(Some(old), 3600));
    }

    #[test]
    fn test_mode_labels() {
        assert_eq!(SyncMode::Initial.as_str(), "initial");
        assert_eq!(SyncMode::Incremental.as_str(), "incremental");
    }
}
