//! Catch-up pass over an already-synced folder.
//!
//! Uses the server's uidNext against the stored one to skip folders with no
//! new mail without selecting them, then fetches only UIDs past the
//! watermark. The `start:*` fetch range echoes the mailbox's last message
//! even when nothing is new, so everything at or below the watermark is
//! filtered out before writing.

use std::time::Instant;

use log::debug;

use super::{write_batches, FolderOutcome, RunProgress};
use crate::codec::MessageCodec;
use crate::error::SyncError;
use crate::imap::session::MailSession;
use crate::imap::types::FolderStatus;
use crate::store::folders::FolderRecord;
use crate::store::Store;

#[allow(clippy::too_many_arguments)]
pub async fn sync_folder(
    store: &Store,
    codec: &MessageCodec,
    session: &MailSession,
    account_id: i64,
    folder: &FolderRecord,
    status: &FolderStatus,
    batch_size: usize,
    progress: RunProgress,
    deadline: Instant,
) -> Result<FolderOutcome, SyncError> {
    // uidNext unchanged means no message has been added since last time;
    // skip without a SELECT round trip.
    if status.uid_next as i64 <= folder.uid_next {
        debug!(
            "Folder {} unchanged (uidNext {}), skipping",
            folder.server_path, status.uid_next
        );
        return Ok(FolderOutcome {
            completed: true,
            ..Default::default()
        });
    }

    let mut lock = session.lock_folder(&folder.server_path).await?;

    let watermark = folder.watermark();
    let raws: Vec<_> = lock
        .fetch_meta_from(watermark + 1)
        .await?
        .into_iter()
        .filter(|r| r.uid > watermark)
        .collect();

    if raws.is_empty() {
        debug!("Folder {} had no fetchable new messages", folder.server_path);
        return Ok(FolderOutcome {
            completed: true,
            ..Default::default()
        });
    }

    debug!(
        "Incremental pass on {}: {} new messages",
        folder.server_path,
        raws.len()
    );

    write_batches(
        store,
        codec,
        &mut lock,
        account_id,
        folder.id,
        raws,
        batch_size,
        Some(progress),
        deadline,
    )
    .await
}
