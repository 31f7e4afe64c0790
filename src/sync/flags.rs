//! Flag reconciliation, in two never-conflated directions.
//!
//! Push first: every dirty row carries a local change the server has not
//! seen, and it is flushed before anything reads server flag state, so a
//! pull cannot clobber a pending local change. Pull second: the server is
//! the authority for clean rows, and a lightweight sweep brings them in
//! line.

use std::collections::HashMap;

use log::{debug, warn};

use crate::error::SyncError;
use crate::imap::session::{MailSession, ServerFlags};
use crate::store::folders::FolderRecord;
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy)]
pub struct FlushOutcome {
    pub pushed: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PullOutcome {
    pub adopted: usize,
}

/// Push every dirty flag for the account to the server, opening each folder
/// exactly once. One message failing to store is logged and skipped; its
/// dirty bit stays set for the next flush.
pub async fn flush_dirty(
    store: &Store,
    session: &MailSession,
    account_id: i64,
) -> Result<FlushOutcome, SyncError> {
    // Rows that never received a server UID cannot be pushed; their dirty
    // bit is dropped as flushed.
    let dropped = store.clear_dirty_nonpositive(account_id).await?;
    if dropped > 0 {
        debug!(
            "Dropped {} unpushable dirty row(s) for account {}",
            dropped, account_id
        );
    }

    let rows = store.dirty_rows(account_id).await?;
    if rows.is_empty() {
        return Ok(FlushOutcome::default());
    }

    let mut outcome = FlushOutcome::default();
    let mut flushed_ids = Vec::with_capacity(rows.len());

    // Rows arrive ordered by folder, so consecutive runs share one lock.
    let mut index = 0;
    while index < rows.len() {
        let folder_id = rows[index].folder_id;
        let server_path = rows[index].server_path.clone();
        let mut lock = session.lock_folder(&server_path).await?;

        while index < rows.len() && rows[index].folder_id == folder_id {
            let row = &rows[index];
            index += 1;
            let uid = row.uid as u32;

            let seen_push = lock.store_flag(uid, "\\Seen", row.seen).await;
            let flagged_push = lock.store_flag(uid, "\\Flagged", row.flagged).await;
            match seen_push.and(flagged_push) {
                Ok(()) => flushed_ids.push(row.id),
                Err(e) => {
                    warn!(
                        "Flag push for uid {} in {} failed: {}",
                        uid, server_path, e
                    );
                    outcome.failed += 1;
                }
            }
        }
    }

    outcome.pushed = flushed_ids.len();
    store.clear_dirty_bulk(&flushed_ids).await?;

    debug!(
        "Dirty flush for account {}: {} pushed, {} failed",
        account_id, outcome.pushed, outcome.failed
    );
    Ok(outcome)
}

/// Pull server seen-state into the local rows for one folder, then refresh
/// the folder's counts from the rows actually stored.
pub async fn pull_folder(
    store: &Store,
    session: &MailSession,
    folder: &FolderRecord,
) -> Result<PullOutcome, SyncError> {
    let mut lock = session.lock_folder(&folder.server_path).await?;
    let sweep: HashMap<u32, ServerFlags> = lock
        .fetch_flag_sweep()
        .await?
        .into_iter()
        .map(|f| (f.uid, f))
        .collect();
    drop(lock);

    let mut outcome = PullOutcome::default();
    for row in store.flag_rows(folder.id).await? {
        // Gone from the server; the ghost pass owns deletion.
        let Some(server) = sweep.get(&(row.uid as u32)) else {
            continue;
        };
        if !row.flags_dirty && row.seen != server.seen {
            // apply_server_seen re-checks the dirty bit in SQL, so a local
            // change landing after the read above still wins.
            if store.apply_server_seen(row.id, server.seen).await? {
                outcome.adopted += 1;
            }
        }
    }

    let (total, unseen) = store.folder_counts(folder.id).await?;
    store.update_local_counts(folder.id, total, unseen).await?;
    store.touch_flag_synced(folder.id).await?;

    debug!(
        "Flag pull for {}: {} adopted",
        folder.server_path, outcome.adopted
    );
    Ok(outcome)
}
