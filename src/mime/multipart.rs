//! multipart/related body splitting (RFC 2046 framing).
//!
//! The splitter works on raw bytes: insurer gateways are not uniformly
//! well-behaved, so framing is validated byte by byte rather than trusting
//! a lenient decoder. Known quirks handled here:
//! - quoted and bare `boundary` parameters;
//! - a spurious trailing CRLF some gateways insert into binary parts right
//!   before the boundary marker;
//! - base64 Content-Transfer-Encoding on attachment parts.
//!
//! A missing closing delimiter is treated as truncation and rejected; a
//! partially transmitted PDF must never reach the archive.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;

/// Structural decode failures. The connector wraps these into
/// [`crate::error::FetchError::MalformedResponse`] with insurer and
/// shipment context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MimeError {
    #[error("response is not a multipart body (content-type: {0})")]
    NotMultipart(String),
    #[error("multipart content-type carries no boundary parameter")]
    MissingBoundary,
    #[error("body ends before the closing boundary delimiter (truncated)")]
    Truncated,
    #[error("multipart body contains no parts")]
    Empty,
    #[error("part headers are malformed: {0}")]
    BadPartHeaders(String),
    #[error("unsupported content-transfer-encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("invalid base64 in part body: {0}")]
    BadBase64(String),
    #[error("root part {0} declared by the start parameter is missing")]
    MissingRoot(String),
    #[error("root part is not valid UTF-8 XML")]
    RootNotXml,
    #[error("xop:Include references unknown content-id {0}")]
    UnresolvedContentId(String),
    #[error("invalid envelope XML: {0}")]
    BadEnvelope(String),
}

/// One decoded MIME part.
#[derive(Debug, Clone)]
pub struct MimePart {
    /// Content-ID with angle brackets stripped, if present.
    pub content_id: Option<String>,
    /// Lowercased media type without parameters.
    pub content_type: String,
    /// Part body after transfer-decoding and CRLF normalisation.
    pub data: Bytes,
}

impl MimePart {
    /// XML parts keep their trailing whitespace; everything else is
    /// treated as binary for the spurious-CRLF strip.
    pub fn is_xml(&self) -> bool {
        self.content_type.contains("xml")
    }
}

/// A split multipart/related body: the SOAP root part plus attachments.
#[derive(Debug)]
pub struct MultipartBody {
    pub root: MimePart,
    pub attachments: Vec<MimePart>,
}

impl MultipartBody {
    /// Find an attachment by normalised content-id.
    pub fn attachment(&self, content_id: &str) -> Option<&MimePart> {
        let wanted = normalize_content_id(content_id);
        self.attachments
            .iter()
            .find(|p| p.content_id.as_deref() == Some(wanted.as_str()))
    }
}

/// Split a raw HTTP body into its MIME parts.
///
/// `content_type` is the full header value including parameters, e.g.
/// `multipart/related; type="application/xop+xml"; boundary="MIME_x"`.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Result<MultipartBody, MimeError> {
    let (media_type, params) = split_content_type(content_type);
    if !media_type.starts_with("multipart/") {
        return Err(MimeError::NotMultipart(media_type));
    }
    let boundary = params
        .iter()
        .find(|(k, _)| k == "boundary")
        .map(|(_, v)| v.clone())
        .filter(|b| !b.is_empty())
        .ok_or(MimeError::MissingBoundary)?;
    let start_cid = params
        .iter()
        .find(|(k, _)| k == "start")
        .map(|(_, v)| normalize_content_id(v));

    let raw_parts = split_on_boundary(body, boundary.as_bytes())?;
    if raw_parts.is_empty() {
        return Err(MimeError::Empty);
    }

    let mut parts = Vec::with_capacity(raw_parts.len());
    for raw in raw_parts {
        parts.push(decode_part(raw)?);
    }

    // The root part is named by the start parameter, otherwise positional.
    let root_index = match &start_cid {
        Some(cid) => parts
            .iter()
            .position(|p| p.content_id.as_deref() == Some(cid.as_str()))
            .ok_or_else(|| MimeError::MissingRoot(cid.clone()))?,
        None => 0,
    };
    let root = parts.remove(root_index);

    Ok(MultipartBody {
        root,
        attachments: parts,
    })
}

/// Strip `<...>` and a `cid:` prefix so header and href forms compare equal.
pub fn normalize_content_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed);
    trimmed.strip_prefix("cid:").unwrap_or(trimmed).to_string()
}

// ── Framing ──────────────────────────────────────────────────────────────────

/// Slice the body into raw part regions between boundary delimiters.
///
/// A delimiter is `--boundary` at the start of a line; the closing
/// delimiter is `--boundary--`. The CRLF preceding a delimiter belongs to
/// the delimiter, not to the part body.
fn split_on_boundary<'a>(body: &'a [u8], boundary: &[u8]) -> Result<Vec<&'a [u8]>, MimeError> {
    let mut delim = Vec::with_capacity(boundary.len() + 2);
    delim.extend_from_slice(b"--");
    delim.extend_from_slice(boundary);

    let mut parts = Vec::new();
    let mut cursor = 0usize;
    let mut part_start: Option<usize> = None;
    let mut closed = false;

    while let Some(found) = find_subsequence(&body[cursor..], &delim) {
        let at = cursor + found;
        // Only honour delimiters at the start of a line.
        if !at_line_start(body, at) {
            cursor = at + delim.len();
            continue;
        }

        if let Some(start) = part_start {
            let mut end = at;
            // The CRLF (or bare LF) before the delimiter is framing.
            if end >= 2 && &body[end - 2..end] == b"\r\n" {
                end -= 2;
            } else if end >= 1 && body[end - 1] == b'\n' {
                end -= 1;
            }
            parts.push(&body[start..end]);
        }

        let after = at + delim.len();
        if body[after..].starts_with(b"--") {
            closed = true;
            break;
        }

        // Skip transport padding up to the end of the delimiter line.
        let content = skip_line_end(body, after).ok_or(MimeError::Truncated)?;
        part_start = Some(content);
        cursor = content;
    }

    if !closed {
        return Err(MimeError::Truncated);
    }
    Ok(parts)
}

fn at_line_start(body: &[u8], pos: usize) -> bool {
    pos == 0 || body[pos - 1] == b'\n'
}

/// Advance past optional linear whitespace and the line terminator.
fn skip_line_end(body: &[u8], mut pos: usize) -> Option<usize> {
    while pos < body.len() && (body[pos] == b' ' || body[pos] == b'\t') {
        pos += 1;
    }
    if body[pos..].starts_with(b"\r\n") {
        Some(pos + 2)
    } else if body[pos..].starts_with(b"\n") {
        Some(pos + 1)
    } else {
        None
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── Part decoding ────────────────────────────────────────────────────────────

fn decode_part(raw: &[u8]) -> Result<MimePart, MimeError> {
    let (headers, body) = split_headers(raw)?;

    let mut content_id = None;
    let mut content_type = String::from("application/octet-stream");
    let mut encoding = String::from("binary");

    for line in headers.split(|&b| b == b'\n') {
        let line = trim_ascii(line);
        if line.is_empty() {
            continue;
        }
        let text = std::str::from_utf8(line)
            .map_err(|_| MimeError::BadPartHeaders("non-UTF-8 header line".into()))?;
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| MimeError::BadPartHeaders(format!("no colon in {text:?}")))?;
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "content-id" => content_id = Some(normalize_content_id(value)),
            "content-type" => {
                content_type = split_content_type(value).0;
            }
            "content-transfer-encoding" => encoding = value.to_ascii_lowercase(),
            _ => {}
        }
    }

    let mut data = match encoding.as_str() {
        "binary" | "8bit" | "7bit" => body.to_vec(),
        "base64" => {
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            BASE64
                .decode(&compact)
                .map_err(|e| MimeError::BadBase64(e.to_string()))?
        }
        other => return Err(MimeError::UnsupportedEncoding(other.to_string())),
    };

    let part_is_xml = content_type.contains("xml");
    if !part_is_xml && data.ends_with(b"\r\n") {
        // Some gateways insert an extra CRLF into binary parts right
        // before the boundary. The framing CRLF is already consumed by
        // the splitter, so a remaining one is spurious.
        data.truncate(data.len() - 2);
    }

    Ok(MimePart {
        content_id,
        content_type,
        data: Bytes::from(data),
    })
}

/// Split a raw part into its header block and body.
fn split_headers(raw: &[u8]) -> Result<(&[u8], &[u8]), MimeError> {
    if let Some(pos) = find_subsequence(raw, b"\r\n\r\n") {
        Ok((&raw[..pos], &raw[pos + 4..]))
    } else if let Some(pos) = find_subsequence(raw, b"\n\n") {
        Ok((&raw[..pos], &raw[pos + 2..]))
    } else {
        Err(MimeError::BadPartHeaders(
            "no blank line between headers and body".into(),
        ))
    }
}

fn trim_ascii(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &line[s..=e],
        _ => &[],
    }
}

/// Split a Content-Type value into (lowercased media type, parameters).
fn split_content_type(value: &str) -> (String, Vec<(String, String)>) {
    let mut pieces = value.split(';');
    let media_type = pieces.next().unwrap_or("").trim().to_ascii_lowercase();
    let params = pieces
        .filter_map(|p| {
            let (k, v) = p.split_once('=')?;
            let v = v.trim().trim_matches('"');
            Some((k.trim().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    (media_type, params)
}
