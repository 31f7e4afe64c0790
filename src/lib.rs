//! Mailbox synchronization engine.
//!
//! Keeps a local SQLite mirror of remote IMAP accounts: a first full pass
//! per folder, incremental catch-up from per-folder UID watermarks, and
//! periodic flag and ghost reconciliation, all bounded by a wall-clock
//! budget per run.

pub mod codec;
pub mod config;
pub mod error;
pub mod imap;
pub mod mime;
pub mod secret;
pub mod store;
pub mod sync;

pub mod prelude {
    pub use crate::codec::{MessageCodec, NormalizedMessage};
    pub use crate::config::{Settings, SyncSettings};
    pub use crate::error::SyncError;
    pub use crate::imap::error::ImapError;
    pub use crate::imap::session::MailSession;
    pub use crate::secret::SecretBox;
    pub use crate::store::Store;
    pub use crate::sync::{SyncEngine, SyncMode};
}
