//! Header and body text decoding helpers.
//!
//! Covers the three decoding layers the sync engine meets on the wire:
//! RFC 2047 encoded-words in envelope fields, content-transfer encodings on
//! fetched body parts, and HTML-to-text stripping for preview derivation.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use regex::Regex;

/// Decode MIME encoded-word headers (RFC 2047).
/// Supports both Q-encoding and B-encoding.
/// Format: =?charset?encoding?encoded-text?=
pub fn decode_encoded_words(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENCODED_WORD_RE: Regex = Regex::new(
            r"=\?([^?]+)\?([BbQq])\?([^?]+)\?="
        ).unwrap();
    }

    let mut result = String::new();
    let mut last_end = 0;

    for cap in ENCODED_WORD_RE.captures_iter(input) {
        let (full_match, [_charset, encoding, encoded_text]) = cap.extract();
        let start = cap.get(0).unwrap().start();
        let end = cap.get(0).unwrap().end();

        if start > last_end {
            result.push_str(&input[last_end..start]);
        }

        let decoded = match encoding.to_uppercase().as_str() {
            "B" => decode_base64_text(encoded_text),
            "Q" => decode_q_encoding(encoded_text),
            _ => full_match.to_string(),
        };

        result.push_str(&decoded);
        last_end = end;
    }

    if last_end == 0 {
        return input.to_string();
    }
    if last_end < input.len() {
        result.push_str(&input[last_end..]);
    }
    result
}

fn decode_base64_text(encoded: &str) -> String {
    BASE64
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| encoded.to_string())
}

/// Q-encoding is quoted-printable with `_` standing for space.
fn decode_q_encoding(encoded: &str) -> String {
    let bytes = decode_quoted_printable_bytes(
        encoded.replace('_', " ").as_bytes(),
    );
    String::from_utf8(bytes).unwrap_or_else(|_| encoded.to_string())
}

fn decode_quoted_printable_bytes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;

    while i < input.len() {
        match input[i] {
            b'=' if i + 2 < input.len() && input[i + 1] == b'\r' && input[i + 2] == b'\n' => {
                // Soft line break
                i += 3;
            }
            b'=' if i + 1 < input.len() && input[i + 1] == b'\n' => {
                i += 2;
            }
            b'=' if i + 2 < input.len() => {
                let hex = std::str::from_utf8(&input[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(input[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Decode a fetched body part according to its BODYSTRUCTURE transfer
/// encoding. Unknown encodings pass through unchanged; decode failures fall
/// back to the raw bytes rather than dropping the part.
pub fn decode_transfer_encoding(raw: &[u8], encoding: &str) -> String {
    let bytes = match encoding.to_ascii_lowercase().as_str() {
        "base64" => {
            let cleaned: Vec<u8> = raw
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            BASE64.decode(&cleaned).unwrap_or_else(|_| raw.to_vec())
        }
        "quoted-printable" => decode_quoted_printable_bytes(raw),
        _ => raw.to_vec(),
    };
    String::from_utf8_lossy(&bytes).to_string()
}

/// Strip an HTML document down to readable text: drop style/script blocks,
/// remove tags, unescape the five common entities, collapse whitespace.
pub fn html_to_text(html: &str) -> String {
    lazy_static::lazy_static! {
        static ref BLOCK_RE: Regex =
            Regex::new(r"(?is)<(style|script)[^>]*>.*?</(style|script)>").unwrap();
        static ref TAG_RE: Regex = Regex::new(r"<[^>]+>").unwrap();
        static ref WS_RE: Regex = Regex::new(r"\s+").unwrap();
    }

    let no_blocks = BLOCK_RE.replace_all(html, " ");
    let no_tags = TAG_RE.replace_all(&no_blocks, " ");
    let unescaped = no_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");
    WS_RE.replace_all(&unescaped, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_q_encoded_subject() {
        let input = "=?UTF-8?Q?We=E2=80=99re_Updating_our_Consumer_Terms?=";
        assert_eq!(decode_encoded_words(input), "We\u{2019}re Updating our Consumer Terms");
    }

    #[test]
    fn test_decode_b_encoded_subject() {
        let input = "=?UTF-8?B?SGVsbG8gd29ybGQ=?=";
        assert_eq!(decode_encoded_words(input), "Hello world");
    }

    #[test]
    fn test_plain_header_passthrough() {
        let input = "Re: quarterly numbers";
        assert_eq!(decode_encoded_words(input), input);
    }

    #[test]
    fn test_mixed_encoded_and_plain() {
        let input = "Re: =?UTF-8?Q?Test=20Message?= from sender";
        assert_eq!(decode_encoded_words(input), "Re: Test Message from sender");
    }

    #[test]
    fn test_transfer_decode_base64() {
        assert_eq!(decode_transfer_encoding(b"aGVsbG8=", "base64"), "hello");
    }

    #[test]
    fn test_transfer_decode_base64_with_line_breaks() {
        assert_eq!(decode_transfer_encoding(b"aGVs\r\nbG8=", "BASE64"), "hello");
    }

    #[test]
    fn test_transfer_decode_quoted_printable_soft_break() {
        assert_eq!(
            decode_transfer_encoding(b"foo=\r\nbar =E2=82=AC", "quoted-printable"),
            "foobar \u{20ac}"
        );
    }

    #[test]
    fn test_transfer_decode_identity() {
        assert_eq!(decode_transfer_encoding(b"as-is", "7bit"), "as-is");
    }

    #[test]
    fn test_html_to_text_strips_style_and_tags() {
        let html = "<html><style>p{color:red}</style><body><p>Hi &amp; bye</p>\n<script>x()</script></body></html>";
        assert_eq!(html_to_text(html), "Hi & bye");
    }

    #[test]
    fn test_html_to_text_collapses_whitespace() {
        assert_eq!(html_to_text("<div>a</div>   <div>b\n\nc</div>"), "a b c");
    }
}
