//! First full pass over a folder.
//!
//! Fetches metadata for the entire mailbox, then downloads and writes in
//! ascending-UID batches. Because the watermark advances after every batch,
//! a deadline cut-off resumes exactly where it stopped; the resumed run
//! re-enters here (the folder still has no recorded uidNext) and the fetch
//! starts past the watermark instead of at 1.

use std::time::Instant;

use log::{debug, info};

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
    if status.messages == 0 {
        debug!("Folder {} is empty, nothing to fetch", folder.server_path);
        return Ok(FolderOutcome {
            completed: true,
            ..Default::default()
        });
    }

    let mut lock = session.lock_folder(&folder.server_path).await?;

    // A resumed partial run picks up past the watermark.
    let start_uid = folder.watermark() + 1;
    let watermark = folder.watermark();
    let raws: Vec<_> = lock
        .fetch_meta_from(start_uid)
        .await?
        .into_iter()
        .filter(|r| r.uid > watermark)
        .collect();

    info!(
        "Initial pass on {}: {} messages to ingest",
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
