//! Typed records for server protocol responses.
//!
//! The wire library hands back loosely shaped, byte-oriented structures
//! (`imap_proto` envelopes and BODYSTRUCTURE nodes). Everything past the
//! session boundary works on the owned types below so the MIME walk and the
//! codec stay exhaustive and type-checked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mime::decode_encoded_words;

/// One folder's counters as reported by a STATUS or SELECT round trip.
#[derive(Debug, Clone)]
pub struct FolderStatus {
    pub path: String,
    pub messages: u32,
    pub unseen: u32,
    pub uid_next: u32,
    pub uid_validity: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

/// Envelope fields decoded to owned strings (RFC 2047 applied to subject and
/// display names).
#[derive(Debug, Clone, Default)]
pub struct ParsedEnvelope {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub date: Option<DateTime<Utc>>,
    pub in_reply_to: Option<String>,
}

/// A tagged MIME tree: either a fetchable leaf part or a multipart container.
/// `section` on a leaf is the BODY[section] path used to download it.
#[derive(Debug, Clone, PartialEq)]
pub enum MimePart {
    Leaf(LeafPart),
    Multipart {
        subtype: String,
        parts: Vec<MimePart>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeafPart {
    pub section: Vec<u32>,
    pub mime_type: String,
    pub mime_subtype: String,
    pub content_id: Option<String>,
    pub disposition: Option<String>,
    pub file_name: Option<String>,
    pub transfer_encoding: String,
    pub octets: u32,
}

impl LeafPart {
    pub fn is_text(&self, subtype: &str) -> bool {
        self.mime_type == "text" && self.mime_subtype == subtype
    }

    pub fn is_attachment_disposition(&self) -> bool {
        self.disposition.as_deref() == Some("attachment")
    }

    pub fn section_string(&self) -> String {
        self.section
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Everything the metadata fetch yields for one message: envelope, flags,
/// body structure, size. Body content is downloaded separately, per part.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub flags: Vec<String>,
    pub envelope: Option<ParsedEnvelope>,
    pub structure: Option<MimePart>,
    pub internal_date: Option<DateTime<Utc>>,
    pub size: Option<u32>,
}

impl RawMessage {
    pub fn seen(&self) -> bool {
        self.flags.iter().any(|f| f == "\\Seen")
    }

    pub fn flagged(&self) -> bool {
        self.flags.iter().any(|f| f == "\\Flagged")
    }
}

// ---------------------------------------------------------------------------
// Conversions from imap_proto wire types
// ---------------------------------------------------------------------------

fn bytes_to_string(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).to_string()
}

fn convert_address(addr: &imap_proto::types::Address<'_>) -> MailAddress {
    let name = addr
        .name
        .as_ref()
        .map(|n| decode_encoded_words(&bytes_to_string(n)));
    let mailbox = addr.mailbox.as_ref().map(|m| bytes_to_string(m));
    let host = addr.host.as_ref().map(|h| bytes_to_string(h));

    // Synthesize mailbox@host when the structured pair is present; fall back
    // to a sentinel so a degenerate address never aborts normalization.
    let address = match (mailbox, host) {
        (Some(m), Some(h)) if !m.is_empty() && !h.is_empty() => format!("{}@{}", m, h),
        (Some(m), _) if !m.is_empty() => m,
        _ => "unknown".to_string(),
    };

    MailAddress { name, address }
}

fn convert_address_list(addrs: Option<&Vec<imap_proto::types::Address<'_>>>) -> Vec<MailAddress> {
    addrs
        .map(|list| list.iter().map(convert_address).collect())
        .unwrap_or_default()
}

fn parse_envelope_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
}

pub fn convert_envelope(env: &imap_proto::types::Envelope<'_>) -> ParsedEnvelope {
    ParsedEnvelope {
        message_id: env.message_id.as_ref().map(|m| bytes_to_string(m)),
        subject: env
            .subject
            .as_ref()
            .map(|s| decode_encoded_words(&bytes_to_string(s))),
        from: convert_address_list(env.from.as_ref()),
        to: convert_address_list(env.to.as_ref()),
        cc: convert_address_list(env.cc.as_ref()),
        date: env
            .date
            .as_ref()
            .and_then(|d| parse_envelope_date(&bytes_to_string(d))),
        in_reply_to: env.in_reply_to.as_ref().map(|m| bytes_to_string(m)),
    }
}

fn encoding_to_string(enc: &imap_proto::types::ContentEncoding<'_>) -> String {
    use imap_proto::types::ContentEncoding;
    match enc {
        ContentEncoding::SevenBit => "7bit".to_string(),
        ContentEncoding::EightBit => "8bit".to_string(),
        ContentEncoding::Binary => "binary".to_string(),
        ContentEncoding::Base64 => "base64".to_string(),
        ContentEncoding::QuotedPrintable => "quoted-printable".to_string(),
        ContentEncoding::Other(s) => s.to_lowercase(),
    }
}

fn param_lookup(
    params: &Option<Vec<(std::borrow::Cow<'_, str>, std::borrow::Cow<'_, str>)>>,
    key: &str,
) -> Option<String> {
    params.as_ref().and_then(|list| {
        list.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.to_string())
    })
}

fn convert_leaf(
    common: &imap_proto::types::BodyContentCommon<'_>,
    other: &imap_proto::types::BodyContentSinglePart<'_>,
    section: Vec<u32>,
) -> LeafPart {
    let disposition = common.disposition.as_ref().map(|d| d.ty.to_lowercase());
    // Prefer the disposition filename, fall back to the Content-Type name.
    let file_name = common
        .disposition
        .as_ref()
        .and_then(|d| param_lookup(&d.params, "filename"))
        .or_else(|| param_lookup(&common.ty.params, "name"))
        .map(|n| decode_encoded_words(&n));

    LeafPart {
        section,
        mime_type: common.ty.ty.to_lowercase(),
        mime_subtype: common.ty.subtype.to_lowercase(),
        content_id: other
            .id
            .as_ref()
            .map(|id| id.trim_matches(['<', '>']).to_string()),
        disposition,
        file_name,
        transfer_encoding: encoding_to_string(&other.transfer_encoding),
        octets: other.octets,
    }
}

/// Convert a parsed BODYSTRUCTURE into the owned tagged tree, assigning
/// BODY[section] paths along the way. A lone non-multipart body is section 1.
pub fn convert_body_structure(
    bs: &imap_proto::types::BodyStructure<'_>,
    section: &[u32],
) -> MimePart {
    use imap_proto::types::BodyStructure;
    match bs {
        BodyStructure::Basic { common, other, .. } | BodyStructure::Text { common, other, .. } => {
            let path = if section.is_empty() {
                vec![1]
            } else {
                section.to_vec()
            };
            MimePart::Leaf(convert_leaf(common, other, path))
        }
        BodyStructure::Message { body, .. } => {
            // Treat the embedded message's content as living at the same
            // section, matching how servers number message/rfc822 parts.
            convert_body_structure(body, section)
        }
        BodyStructure::Multipart { common, bodies, .. } => {
            let parts = bodies
                .iter()
                .enumerate()
                .map(|(i, part)| {
                    let mut child = section.to_vec();
                    child.push((i + 1) as u32);
                    convert_body_structure(part, &child)
                })
                .collect();
            MimePart::Multipart {
                subtype: common.ty.subtype.to_lowercase(),
                parts,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_and_flagged_from_flags() {
        let msg = RawMessage {
            uid: 7,
            flags: vec!["\\Seen".into(), "\\Flagged".into()],
            envelope: None,
            structure: None,
            internal_date: None,
            size: None,
        };
        assert!(msg.seen());
        assert!(msg.flagged());

        let unread = RawMessage { flags: vec![], ..msg };
        assert!(!unread.seen());
        assert!(!unread.flagged());
    }

    #[test]
    fn test_section_string() {
        let leaf = LeafPart {
            section: vec![2, 1],
            ..Default::default()
        };
        assert_eq!(leaf.section_string(), "2.1");
    }

    #[test]
    fn test_parse_envelope_date_rfc2822() {
        let parsed = parse_envelope_date("Tue, 1 Jul 2025 10:52:37 +0200").unwrap();
        assert_eq!(parsed.timezone(), Utc);
    }
}
