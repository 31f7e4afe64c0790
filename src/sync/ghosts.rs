//! Ghost reconciliation: converging the local UID set on the server's.
//!
//! A ghost is a local row whose UID no longer exists on the server (the
//! message was deleted or moved elsewhere). The inverse also happens: a UID
//! below the watermark that the server has but we never stored, typically a
//! message moved into the folder with an old-looking UID. One UID SEARCH ALL
//! gives both diffs; ghosts are deleted and a bounded number of holes are
//! backfilled per pass.

use std::time::Instant;

use log::debug;

use super::write_batches;
use crate::codec::MessageCodec;
use crate::error::SyncError;
use crate::imap::session::MailSession;
use crate::store::folders::FolderRecord;
use crate::store::Store;

#[derive(Debug, Default, Clone, Copy)]
pub struct GhostOutcome {
    pub removed: u64,
    pub backfilled: usize,
}

#[allow(clippy::too_many_arguments)]
pub async fn reconcile_folder(
    store: &Store,
    codec: &MessageCodec,
    session: &MailSession,
    account_id: i64,
    folder: &FolderRecord,
    backfill_cap: usize,
    deadline: Instant,
) -> Result<GhostOutcome, SyncError> {
    let mut lock = session.lock_folder(&folder.server_path).await?;
    let server_uids = lock.fetch_all_uids().await?;
    let local_uids = store.local_uid_set(folder.id).await?;

    let ghosts: Vec<u32> = local_uids.difference(&server_uids).copied().collect();

    // Only holes below the watermark count; anything above it belongs to
    // the next incremental pass.
    let watermark = folder.watermark();
    let mut holes: Vec<u32> = server_uids
        .difference(&local_uids)
        .copied()
        .filter(|uid| *uid <= watermark)
        .collect();
    holes.sort_unstable();
    holes.truncate(backfill_cap);

    let mut outcome = GhostOutcome::default();

    if !ghosts.is_empty() {
        outcome.removed = store.delete_uids(folder.id, &ghosts).await?;
    }

    if !holes.is_empty() {
        let raws = lock.fetch_meta_uids(&holes).await?;
        let written = write_batches(
            store,
            codec,
            &mut lock,
            account_id,
            folder.id,
            raws,
            backfill_cap.max(1),
            None,
            deadline,
        )
        .await?;
        outcome.backfilled = written.new_messages;
    }

    drop(lock);

    let (total, unseen) = store.folder_counts(folder.id).await?;
    store.update_local_counts(folder.id, total, unseen).await?;
    store.touch_reconciled(folder.id).await?;

    debug!(
        "Ghost reconciliation for {}: {} removed, {} backfilled",
        folder.server_path, outcome.removed, outcome.backfilled
    );
    Ok(outcome)
}
