//! IMAP connection and session plumbing.
//!
//! One `MailSession` wraps one logged-in TLS session behind a tokio mutex.
//! All mailbox-cursor operations (fetch, search, store) are only reachable
//! through a [`FolderLock`], an owned guard that selects the folder on
//! acquisition and serializes every command against it until dropped. That
//! keeps interleaved cursor state impossible even if a caller holds the
//! session from multiple tasks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag, NameAttribute};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, TryStreamExt};
use log::warn;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tokio_native_tls::{native_tls, TlsConnector};
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::error::ImapError;
use super::types::{
    convert_body_structure, convert_envelope, FolderStatus, RawMessage,
};

pub type TlsCompatStream =
    tokio_util::compat::Compat<tokio_native_tls::TlsStream<TcpStream>>;
pub type TlsImapSession = async_imap::Session<TlsCompatStream>;

/// Metadata fetched for every new message; bodies are downloaded separately
/// per located MIME part.
const META_FETCH_QUERY: &str = "(UID FLAGS ENVELOPE INTERNALDATE RFC822.SIZE BODYSTRUCTURE)";

#[derive(Clone)]
pub struct MailSession {
    inner: Arc<TokioMutex<TlsImapSession>>,
}

impl MailSession {
    /// Open a TCP connection, perform the TLS handshake and log in.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        secret: &str,
    ) -> Result<Self, ImapError> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| ImapError::Tls(e.to_string()))?;
        let tls = TlsConnector::from(tls);

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| ImapError::Connection(e.to_string()))?;
        let tls_stream = tls
            .connect(host, tcp)
            .await
            .map_err(|e| ImapError::Tls(e.to_string()))?;

        let client = async_imap::Client::new(tls_stream.compat());
        let session = client
            .login(user, secret)
            .await
            .map_err(|(e, _)| ImapError::Auth(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(TokioMutex::new(session)),
        })
    }

    /// List every selectable folder on the server.
    pub async fn list_folders(&self) -> Result<Vec<String>, ImapError> {
        let mut session = self.inner.lock().await;
        let stream = session.list(None, Some("*")).await?;
        let names: Vec<_> = stream.try_collect().await?;
        Ok(names
            .iter()
            .filter(|n| {
                !n.attributes()
                    .iter()
                    .any(|a| matches!(a, NameAttribute::NoSelect))
            })
            .map(|n| n.name().to_string())
            .collect())
    }

    /// STATUS round trip for one folder: message count, unseen count,
    /// uidNext and uidValidity, without selecting it.
    pub async fn folder_status(&self, folder: &str) -> Result<FolderStatus, ImapError> {
        let mut session = self.inner.lock().await;
        let mailbox = session
            .status(folder, "(MESSAGES UNSEEN UIDNEXT UIDVALIDITY)")
            .await?;
        Ok(FolderStatus {
            path: folder.to_string(),
            messages: mailbox.exists,
            unseen: mailbox.unseen.unwrap_or(0),
            uid_next: mailbox.uid_next.unwrap_or(0),
            uid_validity: mailbox.uid_validity.unwrap_or(0),
        })
    }

    /// Acquire the exclusive per-folder lock: selects the folder and returns
    /// a guard owning the session until dropped.
    pub async fn lock_folder(&self, folder: &str) -> Result<FolderLock, ImapError> {
        let mut guard = self.inner.clone().lock_owned().await;
        let mailbox = guard
            .select(folder)
            .await
            .map_err(|e| match e {
                async_imap::error::Error::No(msg) => ImapError::FolderNotFound(msg),
                other => ImapError::from(other),
            })?;
        Ok(FolderLock {
            path: folder.to_string(),
            exists: mailbox.exists,
            uid_next: mailbox.uid_next.unwrap_or(0),
            uid_validity: mailbox.uid_validity.unwrap_or(0),
            guard,
        })
    }

    pub async fn logout(&self) -> Result<(), ImapError> {
        let mut session = self.inner.lock().await;
        session.logout().await.map_err(ImapError::from)
    }
}

impl std::fmt::Debug for MailSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailSession").finish_non_exhaustive()
    }
}

/// One message's system flags as observed in a sweep.
#[derive(Debug, Clone, Copy)]
pub struct ServerFlags {
    pub uid: u32,
    pub seen: bool,
    pub flagged: bool,
}

/// Exclusive handle on one selected folder, scoped to the live session.
/// Dropping it (on any path, including panics) releases the lock.
pub struct FolderLock {
    pub path: String,
    pub exists: u32,
    pub uid_next: u32,
    pub uid_validity: u32,
    guard: OwnedMutexGuard<TlsImapSession>,
}

impl FolderLock {
    /// Fetch metadata for every message with UID >= `start_uid`.
    ///
    /// Note the `start:*` range always matches at least the last message in
    /// the mailbox even when its UID is below `start`; callers filter
    /// against their watermark.
    pub async fn fetch_meta_from(&mut self, start_uid: u32) -> Result<Vec<RawMessage>, ImapError> {
        let range = format!("{}:*", start_uid.max(1));
        let stream = self.guard.uid_fetch(&range, META_FETCH_QUERY).await?;
        let fetches = collect_tolerant(stream, &self.path).await;
        Ok(fetches.iter().filter_map(raw_from_fetch).collect())
    }

    /// Fetch metadata for an explicit UID set (comma-joined).
    pub async fn fetch_meta_uids(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, ImapError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let uid_set = join_uids(uids);
        let stream = self.guard.uid_fetch(&uid_set, META_FETCH_QUERY).await?;
        let fetches = collect_tolerant(stream, &self.path).await;
        Ok(fetches.iter().filter_map(raw_from_fetch).collect())
    }

    /// Download one MIME part's raw bytes with a hard read timeout, so a
    /// stalled server cannot hang the whole batch.
    pub async fn fetch_part(
        &mut self,
        uid: u32,
        section: &[u32],
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ImapError> {
        let section_str = section
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(".");
        let query = format!("(UID BODY.PEEK[{}])", section_str);

        let fetch_fut = async {
            let stream = self.guard.uid_fetch(uid.to_string(), &query).await?;
            let fetches: Vec<Fetch> = stream.try_collect().await?;
            let path = imap_proto::types::SectionPath::Part(section.to_vec(), None);
            Ok::<_, ImapError>(
                fetches
                    .iter()
                    .find(|f| f.uid == Some(uid))
                    .and_then(|f| f.section(&path))
                    .map(|bytes| bytes.to_vec()),
            )
        };

        let outcome = tokio::time::timeout(timeout, fetch_fut).await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(ImapError::Timeout(format!(
                "body download for uid {} in {} exceeded {:?}",
                uid, self.path, timeout
            ))),
        }
    }

    /// Lightweight flag sweep over the whole folder. No envelope, no body.
    pub async fn fetch_flag_sweep(&mut self) -> Result<Vec<ServerFlags>, ImapError> {
        let stream = self.guard.uid_fetch("1:*", "(UID FLAGS)").await?;
        let fetches = collect_tolerant(stream, &self.path).await;
        Ok(fetches
            .iter()
            .filter_map(|f| {
                let uid = f.uid?;
                let mut seen = false;
                let mut flagged = false;
                for flag in f.flags() {
                    match flag {
                        Flag::Seen => seen = true,
                        Flag::Flagged => flagged = true,
                        _ => {}
                    }
                }
                Some(ServerFlags { uid, seen, flagged })
            })
            .collect())
    }

    /// The folder's full current UID set.
    pub async fn fetch_all_uids(&mut self) -> Result<HashSet<u32>, ImapError> {
        let uids = self.guard.uid_search("ALL").await?;
        Ok(uids.into_iter().collect())
    }

    /// Add or remove one system flag on one message.
    pub async fn store_flag(&mut self, uid: u32, flag: &str, on: bool) -> Result<(), ImapError> {
        let op = if on { "+FLAGS" } else { "-FLAGS" };
        let query = format!("{} ({})", op, flag);
        let stream = self.guard.uid_store(uid.to_string(), &query).await?;
        let _: Vec<Fetch> = stream.try_collect().await?;
        Ok(())
    }
}

fn join_uids(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Collect a FETCH stream tolerantly: individual responses that fail to
/// parse (e.g. literal strings inside BODYSTRUCTURE) are logged and skipped
/// instead of aborting the batch.
async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl Stream<Item = Result<Fetch, E>>,
    folder: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => warn!("Skipping unparseable fetch response in {}: {}", folder, e),
        }
    }
    items
}

fn flag_to_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::Custom(c) => c.to_string(),
        other => format!("{:?}", other),
    }
}

fn raw_from_fetch(fetch: &Fetch) -> Option<RawMessage> {
    let uid = fetch.uid?;
    Some(RawMessage {
        uid,
        flags: fetch.flags().map(|f| flag_to_string(&f)).collect(),
        envelope: fetch.envelope().map(convert_envelope),
        structure: fetch
            .bodystructure()
            .map(|bs| convert_body_structure(bs, &[])),
        internal_date: fetch
            .internal_date()
            .map(|d: DateTime<chrono::FixedOffset>| d.with_timezone(&Utc)),
        size: fetch.size,
    })
}
