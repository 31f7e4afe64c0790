//! Store-level behavior on an in-memory database: batch idempotency,
//! watermark movement, the dirty-flag protocol, ghost deletion and folder
//! scheduling.

use sqlx::sqlite::SqlitePoolOptions;

use mailsync::codec::NormalizedMessage;
use mailsync::imap::types::MailAddress;
use mailsync::store::runs::RunStatus;
use mailsync::store::Store;

async fn test_store() -> Store {
    // A single connection so every query sees the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    Store::from_pool(pool).await.unwrap()
}

async fn seed(store: &Store) -> (i64, i64) {
    let account_id = store
        .upsert_account("a@example.com", "imap.example.com", 993, "a@example.com", "pw")
        .await
        .unwrap();
    let folder = store.register_folder(account_id, "INBOX").await.unwrap();
    (account_id, folder.id)
}

fn message(uid: u32, seen: bool) -> NormalizedMessage {
    NormalizedMessage {
        uid,
        message_id: Some(format!("<{}@example.com>", uid)),
        subject: Some(format!("Message {}", uid)),
        from: vec![MailAddress {
            name: Some("Sender".to_string()),
            address: "sender@example.com".to_string(),
        }],
        to: vec![],
        cc: vec![],
        date: None,
        preview: Some("hello".to_string()),
        body_text: Some("hello".to_string()),
        body_html: None,
        seen,
        flagged: false,
        has_attachments: false,
        attachments: vec![],
        in_reply_to: None,
        size: 1024,
    }
}

#[tokio::test]
async fn upsert_batch_is_idempotent() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;

    let batch: Vec<_> = (1..=3).map(|uid| message(uid, false)).collect();
    let first = store.upsert_batch(account_id, folder_id, &batch).await.unwrap();
    assert_eq!(first.written, 3);
    assert_eq!(first.new, 3);

    // Re-ingesting the same UIDs writes but creates nothing.
    let second = store.upsert_batch(account_id, folder_id, &batch).await.unwrap();
    assert_eq!(second.written, 3);
    assert_eq!(second.new, 0);

    let (total, unseen) = store.folder_counts(folder_id).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(unseen, 3);
}

#[tokio::test]
async fn reingest_refreshes_flags() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;

    store
        .upsert_batch(account_id, folder_id, &[message(1, false)])
        .await
        .unwrap();
    store
        .upsert_batch(account_id, folder_id, &[message(1, true)])
        .await
        .unwrap();

    let rows = store.flag_rows(folder_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].seen);
    assert!(!rows[0].flags_dirty);
}

#[tokio::test]
async fn reingest_preserves_unflushed_local_flags() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;

    store
        .upsert_batch(account_id, folder_id, &[message(5, false)])
        .await
        .unwrap();
    let row_id = store.flag_rows(folder_id).await.unwrap()[0].id;
    store.set_seen_local(row_id, true).await.unwrap();

    // Re-ingesting the same UID must not clobber the pending local change.
    store
        .upsert_batch(account_id, folder_id, &[message(5, false)])
        .await
        .unwrap();
    let row = &store.flag_rows(folder_id).await.unwrap()[0];
    assert!(row.seen && row.flags_dirty);

    // Once flushed, server-observed values apply again.
    store.clear_dirty(row_id).await.unwrap();
    store
        .upsert_batch(account_id, folder_id, &[message(5, false)])
        .await
        .unwrap();
    let row = &store.flag_rows(folder_id).await.unwrap()[0];
    assert!(!row.seen && !row.flags_dirty);
}

#[tokio::test]
async fn placeholder_uids_stay_out_of_reconciliation() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;
    store
        .upsert_batch(account_id, folder_id, &[message(0, false), message(1, false)])
        .await
        .unwrap();

    // UID 0 rows never join the set the ghost pass diffs against.
    let expected: std::collections::HashSet<u32> = [1].into_iter().collect();
    assert_eq!(store.local_uid_set(folder_id).await.unwrap(), expected);

    // A dirty placeholder has nothing to push and never surfaces for the
    // flush; it is dropped as flushed instead of lingering forever.
    let rows = store.flag_rows(folder_id).await.unwrap();
    let placeholder = rows.iter().find(|r| r.uid == 0).unwrap();
    store.set_seen_local(placeholder.id, true).await.unwrap();
    assert!(store.dirty_rows(account_id).await.unwrap().is_empty());

    assert_eq!(store.clear_dirty_nonpositive(account_id).await.unwrap(), 1);
    let rows = store.flag_rows(folder_id).await.unwrap();
    assert!(rows.iter().all(|r| !r.flags_dirty));
}

#[tokio::test]
async fn watermark_only_moves_forward() {
    let store = test_store().await;
    let (account_id, _) = seed(&store).await;
    let folder = store.register_folder(account_id, "INBOX").await.unwrap();

    store.advance_watermark(folder.id, 40).await.unwrap();
    store.advance_watermark(folder.id, 25).await.unwrap();

    let folders = store.folders_for_account(account_id).await.unwrap();
    assert_eq!(folders[0].watermark(), 40);

    store.advance_watermark(folder.id, 41).await.unwrap();
    let folders = store.folders_for_account(account_id).await.unwrap();
    assert_eq!(folders[0].watermark(), 41);
}

#[tokio::test]
async fn dirty_rows_resist_server_values() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;
    store
        .upsert_batch(account_id, folder_id, &[message(1, false)])
        .await
        .unwrap();
    let row_id = store.flag_rows(folder_id).await.unwrap()[0].id;

    // A local change marks the row dirty.
    store.set_seen_local(row_id, true).await.unwrap();
    let row = &store.flag_rows(folder_id).await.unwrap()[0];
    assert!(row.seen && row.flags_dirty);

    // Server-observed state bounces off a dirty row.
    assert!(!store.apply_server_seen(row_id, false).await.unwrap());
    assert!(store.flag_rows(folder_id).await.unwrap()[0].seen);

    // Once pushed, the server wins again.
    store.clear_dirty(row_id).await.unwrap();
    assert!(store.apply_server_seen(row_id, false).await.unwrap());
    let row = &store.flag_rows(folder_id).await.unwrap()[0];
    assert!(!row.seen && !row.flags_dirty);
}

#[tokio::test]
async fn ghost_deletion_converges_uid_sets() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;
    let batch: Vec<_> = (1..=5).map(|uid| message(uid, true)).collect();
    store.upsert_batch(account_id, folder_id, &batch).await.unwrap();

    // Server kept 2 and 4 only.
    let local = store.local_uid_set(folder_id).await.unwrap();
    let server: std::collections::HashSet<u32> = [2, 4].into_iter().collect();
    let ghosts: Vec<u32> = local.difference(&server).copied().collect();

    let removed = store.delete_uids(folder_id, &ghosts).await.unwrap();
    assert_eq!(removed, 3);
    assert_eq!(store.local_uid_set(folder_id).await.unwrap(), server);

    // Deleting an already-absent UID is a no-op.
    assert_eq!(store.delete_uids(folder_id, &[99]).await.unwrap(), 0);
}

#[tokio::test]
async fn folder_reset_clears_cache_and_state() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;
    store
        .upsert_batch(account_id, folder_id, &[message(1, false)])
        .await
        .unwrap();
    store.advance_watermark(folder_id, 1).await.unwrap();
    store
        .update_folder_counters(folder_id, 2, 111, 1, 1)
        .await
        .unwrap();

    store.reset_folder(folder_id, 222).await.unwrap();

    let folder = &store.folders_for_account(account_id).await.unwrap()[0];
    assert_eq!(folder.watermark(), 0);
    assert_eq!(folder.uid_next, 0);
    assert_eq!(folder.uid_validity, 222);
    assert!(store.local_uid_set(folder_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn message_key_is_positional() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;
    store
        .upsert_batch(account_id, folder_id, &[message(7, false)])
        .await
        .unwrap();

    let key: String =
        sqlx::query_scalar("SELECT message_key FROM messages WHERE folder_id = ? AND uid = 7")
            .bind(folder_id)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(key, format!("{}:{}:7", account_id, folder_id));
}

#[tokio::test]
async fn dirty_rows_surface_for_flush_and_clear_in_bulk() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;
    let batch: Vec<_> = (1..=3).map(|uid| message(uid, false)).collect();
    store.upsert_batch(account_id, folder_id, &batch).await.unwrap();

    let rows = store.flag_rows(folder_id).await.unwrap();
    store.set_seen_local(rows[0].id, true).await.unwrap();
    store.set_seen_local(rows[2].id, true).await.unwrap();

    let dirty = store.dirty_rows(account_id).await.unwrap();
    assert_eq!(dirty.len(), 2);
    assert!(dirty.iter().all(|r| r.server_path == "INBOX"));
    // Ordered by folder then UID so a flush opens each mailbox once.
    assert!(dirty[0].uid < dirty[1].uid);

    let ids: Vec<i64> = dirty.iter().map(|r| r.id).collect();
    store.clear_dirty_bulk(&ids).await.unwrap();
    assert!(store.dirty_rows(account_id).await.unwrap().is_empty());

    // Seen values survived the clear.
    let rows = store.flag_rows(folder_id).await.unwrap();
    assert!(rows[0].seen && !rows[1].seen && rows[2].seen);
}

#[tokio::test]
async fn local_counts_update_leaves_protocol_state_alone() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;
    store
        .update_folder_counters(folder_id, 10, 111, 9, 4)
        .await
        .unwrap();
    store.advance_watermark(folder_id, 9).await.unwrap();

    store.update_local_counts(folder_id, 7, 2).await.unwrap();

    let folder = &store.folders_for_account(account_id).await.unwrap()[0];
    assert_eq!(folder.message_count, 7);
    assert_eq!(folder.unseen_count, 2);
    assert_eq!(folder.uid_next, 10);
    assert_eq!(folder.uid_validity, 111);
    assert_eq!(folder.watermark(), 9);
}

#[tokio::test]
async fn reconciliation_timestamps_are_independent() {
    let store = test_store().await;
    let (account_id, folder_id) = seed(&store).await;

    store.touch_flag_synced(folder_id).await.unwrap();
    let folder = &store.folders_for_account(account_id).await.unwrap()[0];
    assert!(folder.last_flag_synced_at.is_some());
    assert!(folder.last_reconciled_at.is_none());

    store.touch_reconciled(folder_id).await.unwrap();
    let folder = &store.folders_for_account(account_id).await.unwrap()[0];
    assert!(folder.last_reconciled_at.is_some());
}

#[tokio::test]
async fn run_lifecycle_records_progress_and_outcome() {
    let store = test_store().await;
    let (account_id, _) = seed(&store).await;

    let run_id = store.start_run(account_id, "initial").await.unwrap();
    store
        .update_run_progress(run_id, 40, 40, 120, Some("INBOX"))
        .await
        .unwrap();

    let run = store.latest_run(account_id).await.unwrap().unwrap();
    assert_eq!(run.status, "running");
    assert_eq!(run.processed, 40);
    assert_eq!(run.current_folder.as_deref(), Some("INBOX"));

    store
        .finish_run(run_id, RunStatus::Partial, None)
        .await
        .unwrap();
    let run = store.latest_run(account_id).await.unwrap().unwrap();
    assert_eq!(run.status, "partial");
    assert!(run.finished_at.is_some());
    assert!(run.current_folder.is_none());

    // A failed run keeps its category-tagged error text.
    let run_id = store.start_run(account_id, "incremental").await.unwrap();
    store
        .finish_run(run_id, RunStatus::Failed, Some("network: reset by peer"))
        .await
        .unwrap();
    let run = store.latest_run(account_id).await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error.as_deref(), Some("network: reset by peer"));
}

#[tokio::test]
async fn account_upsert_refreshes_parameters() {
    let store = test_store().await;
    let id = store
        .upsert_account("b@example.com", "old.example.com", 993, "b", "pw1")
        .await
        .unwrap();
    let id2 = store
        .upsert_account("b@example.com", "new.example.com", 1993, "b", "pw2")
        .await
        .unwrap();
    assert_eq!(id, id2);

    let account = store.account_by_email("b@example.com").await.unwrap().unwrap();
    assert_eq!(account.imap_host, "new.example.com");
    assert_eq!(account.imap_port, 1993);
    assert_eq!(account.imap_secret, "pw2");
}
