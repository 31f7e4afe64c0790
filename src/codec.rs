//! Normalization of fetched messages into storable rows.
//!
//! The codec walks the typed MIME tree to pick the text and HTML bodies and
//! the attachment set, downloads only the parts it needs, decodes transfer
//! encodings, embeds inline `cid:` images as data URIs, and derives the
//! preview. Tree selection is done by pure visitors over [`MimePart`] so the
//! rules are testable without a server.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::imap::error::ImapError;
use crate::imap::session::FolderLock;
use crate::imap::types::{LeafPart, MailAddress, MimePart, RawMessage};
use crate::mime::{decode_transfer_encoding, html_to_text};

/// Stored plain-text body cap, characters.
const BODY_TEXT_CAP: usize = 50_000;
/// Stored HTML body cap, characters.
const BODY_HTML_CAP: usize = 500_000;
/// Preview length, characters.
const PREVIEW_CAP: usize = 200;
/// Inline images above this size are left as `cid:` references.
const INLINE_IMAGE_CAP: u32 = 1_048_576;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentMeta {
    pub file_name: String,
    pub mime_type: String,
    pub size: u32,
    pub section: String,
}

/// The codec's output: everything the store writes for one message.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub preview: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub seen: bool,
    pub flagged: bool,
    pub has_attachments: bool,
    pub attachments: Vec<AttachmentMeta>,
    pub in_reply_to: Option<String>,
    pub size: i64,
}

pub struct MessageCodec {
    body_timeout: Duration,
}

impl MessageCodec {
    pub fn new(body_timeout: Duration) -> Self {
        Self { body_timeout }
    }

    /// Turn one fetched message into a storable row.
    ///
    /// Body downloads degrade: a timed-out or missing part yields a
    /// metadata-only row rather than failing the batch. Only a dead
    /// connection propagates, since nothing later in the batch can succeed.
    pub async fn normalize(
        &self,
        lock: &mut FolderLock,
        raw: &RawMessage,
    ) -> Result<NormalizedMessage, ImapError> {
        let env = raw.envelope.clone().unwrap_or_default();

        let mut body_text = None;
        let mut body_html = None;
        let mut attachments = Vec::new();

        if let Some(tree) = &raw.structure {
            if let Some(leaf) = find_text_part(tree, "plain") {
                body_text = self
                    .download_text(lock, raw.uid, leaf)
                    .await?
                    .map(|s| truncate_chars(&s, BODY_TEXT_CAP));
            }
            if let Some(leaf) = find_text_part(tree, "html") {
                if let Some(html) = self.download_text(lock, raw.uid, leaf).await? {
                    let embedded = self.embed_inline_images(lock, raw.uid, html, tree).await?;
                    body_html = Some(truncate_chars(&embedded, BODY_HTML_CAP));
                }
            }

            attachments = collect_attachments(tree)
                .into_iter()
                .map(|leaf| AttachmentMeta {
                    file_name: leaf
                        .file_name
                        .clone()
                        .unwrap_or_else(|| format!("part-{}", leaf.section_string())),
                    mime_type: format!("{}/{}", leaf.mime_type, leaf.mime_subtype),
                    size: leaf.octets,
                    section: leaf.section_string(),
                })
                .collect();
        } else {
            debug!("uid {} has no body structure, storing metadata only", raw.uid);
        }

        let preview = derive_preview(body_text.as_deref(), body_html.as_deref());

        Ok(NormalizedMessage {
            uid: raw.uid,
            message_id: env.message_id,
            subject: env.subject,
            from: env.from,
            to: env.to,
            cc: env.cc,
            date: env.date.or(raw.internal_date),
            preview,
            body_text,
            body_html,
            seen: raw.seen(),
            flagged: raw.flagged(),
            has_attachments: !attachments.is_empty(),
            attachments,
            in_reply_to: env.in_reply_to,
            size: raw.size.unwrap_or(0) as i64,
        })
    }

    async fn download_text(
        &self,
        lock: &mut FolderLock,
        uid: u32,
        leaf: &LeafPart,
    ) -> Result<Option<String>, ImapError> {
        match self.download_part(lock, uid, leaf).await? {
            Some(raw) => Ok(Some(decode_transfer_encoding(&raw, &leaf.transfer_encoding))),
            None => Ok(None),
        }
    }

    async fn download_part(
        &self,
        lock: &mut FolderLock,
        uid: u32,
        leaf: &LeafPart,
    ) -> Result<Option<Vec<u8>>, ImapError> {
        match lock.fetch_part(uid, &leaf.section, self.body_timeout).await {
            Ok(bytes) => Ok(bytes),
            Err(e @ ImapError::Connection(_)) => Err(e),
            Err(e) => {
                warn!(
                    "Body part {} of uid {} in {} not downloaded: {}",
                    leaf.section_string(),
                    uid,
                    lock.path,
                    e
                );
                Ok(None)
            }
        }
    }

    /// Replace `cid:` references in the HTML with base64 data URIs for small
    /// inline images. Unresolvable references stay as-is.
    async fn embed_inline_images(
        &self,
        lock: &mut FolderLock,
        uid: u32,
        html: String,
        tree: &MimePart,
    ) -> Result<String, ImapError> {
        let mut html = html;
        for leaf in collect_inline_images(tree) {
            let Some(cid) = &leaf.content_id else { continue };
            let needle = format!("cid:{}", cid);
            if !html.contains(&needle) {
                continue;
            }
            if leaf.octets > INLINE_IMAGE_CAP {
                debug!("Inline image {} too large to embed ({} bytes)", cid, leaf.octets);
                continue;
            }
            if let Some(raw) = self.download_part(lock, uid, leaf).await? {
                let bytes = match leaf.transfer_encoding.as_str() {
                    "base64" => {
                        let cleaned: Vec<u8> = raw
                            .iter()
                            .filter(|b| !b.is_ascii_whitespace())
                            .copied()
                            .collect();
                        BASE64.decode(&cleaned).unwrap_or(raw)
                    }
                    _ => raw,
                };
                let data_uri = format!(
                    "data:{}/{};base64,{}",
                    leaf.mime_type,
                    leaf.mime_subtype,
                    BASE64.encode(bytes)
                );
                html = html.replace(&needle, &data_uri);
            }
        }
        Ok(html)
    }
}

/// Depth-first search for the first non-attachment `text/<subtype>` leaf.
pub fn find_text_part<'a>(part: &'a MimePart, subtype: &str) -> Option<&'a LeafPart> {
    match part {
        MimePart::Leaf(leaf) => {
            (leaf.is_text(subtype) && !leaf.is_attachment_disposition()).then_some(leaf)
        }
        MimePart::Multipart { parts, .. } => {
            parts.iter().find_map(|p| find_text_part(p, subtype))
        }
    }
}

/// Collect every leaf that should surface as an attachment.
pub fn collect_attachments(part: &MimePart) -> Vec<&LeafPart> {
    let mut out = Vec::new();
    walk_attachments(part, &mut out);
    out
}

fn walk_attachments<'a>(part: &'a MimePart, out: &mut Vec<&'a LeafPart>) {
    match part {
        MimePart::Leaf(leaf) => {
            if leaf_is_attachment(leaf) {
                out.push(leaf);
            }
        }
        MimePart::Multipart { parts, .. } => {
            for p in parts {
                walk_attachments(p, out);
            }
        }
    }
}

fn leaf_is_attachment(leaf: &LeafPart) -> bool {
    if leaf.is_attachment_disposition() {
        return true;
    }
    // Inline parts with a content id are body imagery, not attachments.
    if leaf.disposition.as_deref() == Some("inline") && leaf.content_id.is_some() {
        return false;
    }
    if leaf.file_name.is_some() {
        return true;
    }
    // Unnamed, undisposed non-text leaves (a bare application/pdf, say)
    // still surface as attachments.
    leaf.disposition.is_none() && leaf.mime_type != "text"
}

fn collect_inline_images(part: &MimePart) -> Vec<&LeafPart> {
    let mut out = Vec::new();
    walk_inline_images(part, &mut out);
    out
}

fn walk_inline_images<'a>(part: &'a MimePart, out: &mut Vec<&'a LeafPart>) {
    match part {
        MimePart::Leaf(leaf) => {
            if leaf.mime_type == "image" && leaf.content_id.is_some() {
                out.push(leaf);
            }
        }
        MimePart::Multipart { parts, .. } => {
            for p in parts {
                walk_inline_images(p, out);
            }
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn derive_preview(body_text: Option<&str>, body_html: Option<&str>) -> Option<String> {
    let source = match (body_text, body_html) {
        (Some(text), _) if !text.trim().is_empty() => text.to_string(),
        (_, Some(html)) => html_to_text(html),
        _ => return None,
    };
    let collapsed = source.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(truncate_chars(&collapsed, PREVIEW_CAP))
}
