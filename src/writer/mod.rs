//! Message writer: envelope and MIME tree back to RFC822 wire bytes.
//!
//! The writer takes an owned [`Draft`] tree. Leaf content is held the way
//! it travels: already encoded for 7bit, base64 and quoted-printable, and
//! raw for 8bit and binary, which the writer turns into quoted-printable
//! and base64 respectively. Output always uses CRLF.

use memchr::memmem;
use rand::Rng;

use crate::codec;
use crate::model::body::find_param;
use crate::model::{Address, Body, Disposition, Encoding, Envelope, MediaType, Param, Structure};
use crate::parser::address::write_address;
use crate::parser::lexer::TSPECIALS;

/// Settings for rendering headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOptions {
    /// Column at which address lists are folded.
    pub line_width: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self { line_width: 78 }
    }
}

/// What a [`Draft`] node carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftContent {
    /// Leaf bytes.
    Data(Vec<u8>),
    /// Children of a multipart.
    Parts(Vec<Draft>),
    /// A complete RFC822 message, written verbatim.
    Message(Vec<u8>),
}

/// An owned MIME tree ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub media_type: MediaType,
    pub subtype: Option<String>,
    pub params: Vec<Param>,
    pub encoding: Encoding,
    pub id: Option<String>,
    pub description: Option<String>,
    pub disposition: Option<Disposition>,
    pub content: DraftContent,
}

impl Draft {
    fn bare(media_type: MediaType, content: DraftContent) -> Self {
        let subtype = media_type.default_subtype().map(String::from);
        Self {
            media_type,
            subtype,
            params: Vec::new(),
            encoding: Encoding::SevenBit,
            id: None,
            description: None,
            disposition: None,
            content,
        }
    }

    /// A text/plain body. Non-ASCII text is marked UTF-8 and 8bit.
    pub fn text(text: &str) -> Self {
        let mut draft = Self::bare(MediaType::Text, DraftContent::Data(text.as_bytes().to_vec()));
        if text.is_ascii() {
            draft.params.push(Param::new("charset", "US-ASCII"));
        } else {
            draft.params.push(Param::new("charset", "UTF-8"));
            draft.encoding = Encoding::EightBit;
        }
        draft
    }

    /// A multipart body of the given subtype. A boundary is generated when rendered.
    pub fn multipart(subtype: &str, parts: Vec<Draft>) -> Self {
        let mut draft = Self::bare(MediaType::Multipart, DraftContent::Parts(parts));
        draft.subtype = Some(subtype.to_ascii_lowercase());
        draft
    }

    /// A binary attachment; written as base64.
    pub fn attachment(media_type: MediaType, subtype: &str, filename: &str, data: Vec<u8>) -> Self {
        let mut draft = Self::bare(media_type, DraftContent::Data(data));
        draft.subtype = Some(subtype.to_ascii_lowercase());
        draft.encoding = Encoding::Binary;
        draft.disposition = Some(Disposition {
            kind: "attachment".to_string(),
            params: vec![Param::new("filename", filename)],
        });
        draft
    }

    /// A message/rfc822 body wrapping a complete message.
    pub fn message(raw: Vec<u8>) -> Self {
        Self::bare(MediaType::Message, DraftContent::Message(raw))
    }

    /// Rebuild a draft from a parsed body and the bytes of its content.
    pub fn from_parsed(body: &Body, bytes: &[u8]) -> Self {
        let own = clamp(bytes, 0, body.size.bytes);
        let content = match &body.structure {
            Structure::Single => DraftContent::Data(own.to_vec()),
            Structure::Message(_) => DraftContent::Message(own.to_vec()),
            Structure::Multipart(parts) => DraftContent::Parts(
                parts
                    .iter()
                    .map(|p| {
                        Draft::from_parsed(&p.body, clamp(own, p.content_offset(), p.body.size.bytes))
                    })
                    .collect(),
            ),
        };
        Self {
            media_type: body.media_type.clone(),
            subtype: body.subtype.clone(),
            params: body.params.clone(),
            encoding: body.encoding.clone(),
            id: body.id.clone(),
            description: body.description.clone(),
            disposition: body.disposition.clone(),
            content,
        }
    }

    fn mime_type(&self) -> String {
        match &self.subtype {
            Some(sub) => format!("{}/{}", self.media_type, sub),
            None => self.media_type.to_string(),
        }
    }
}

fn clamp(bytes: &[u8], start: usize, len: usize) -> &[u8] {
    let start = start.min(bytes.len());
    let end = start.saturating_add(len).min(bytes.len());
    &bytes[start..end]
}

/// Render the envelope headers, then MIME headers and content for `body`.
pub fn render_message(envelope: &Envelope, body: &Draft, opts: &WriterOptions) -> Vec<u8> {
    let (headers, content) = render_part(body);
    let mut out = render_envelope(envelope, opts).into_bytes();
    out.extend_from_slice(b"MIME-Version: 1.0\r\n");
    out.extend_from_slice(headers.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&content);
    out
}

/// Render only the envelope headers, without the terminating blank line.
///
/// Order is fixed: Newsgroups, Date, From, Sender, Reply-To, Subject, To,
/// Cc, In-Reply-To, Message-ID. Bcc is never written, and Sender and
/// Reply-To are left out when they repeat From.
pub fn render_envelope(env: &Envelope, opts: &WriterOptions) -> String {
    let mut out = String::new();
    let text = |out: &mut String, name: &str, value: &Option<String>| {
        if let Some(value) = value {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&single_line(value));
            out.push_str("\r\n");
        }
    };

    text(&mut out, "Newsgroups", &env.newsgroups);
    text(&mut out, "Followup-To", &env.followup_to);
    text(&mut out, "Date", &env.date);
    write_address_header(&mut out, "From", &env.from, opts.line_width);
    if env.sender != env.from {
        write_address_header(&mut out, "Sender", &env.sender, opts.line_width);
    }
    if env.reply_to != env.from {
        write_address_header(&mut out, "Reply-To", &env.reply_to, opts.line_width);
    }
    if let Some(subject) = &env.subject {
        out.push_str("Subject: ");
        out.push_str(&encode_unstructured(subject));
        out.push_str("\r\n");
    }
    write_address_header(&mut out, "To", &env.to, opts.line_width);
    write_address_header(&mut out, "Cc", &env.cc, opts.line_width);
    text(&mut out, "In-Reply-To", &env.in_reply_to);
    text(&mut out, "Message-ID", &env.message_id);
    text(&mut out, "References", &env.references);
    out
}

/// Input bytes per encoded-word; 52 base64 characters plus the wrapper
/// keeps a folded Subject line under 78 columns.
const ENCODED_WORD_BYTES: usize = 39;

/// Header text on one line: line breaks and the whitespace around them
/// become a single space.
fn single_line(value: &str) -> String {
    if !value.contains(['\r', '\n']) {
        return value.to_string();
    }
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Non-ASCII unstructured text as folded RFC 2047 encoded-words.
fn encode_unstructured(value: &str) -> String {
    let value = single_line(value);
    if value.is_ascii() {
        return value;
    }
    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in value.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(encoded_word(&chunk));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(encoded_word(&chunk));
    }
    words.join("\r\n ")
}

fn encoded_word(text: &str) -> String {
    use ::base64::Engine as _;
    format!(
        "=?UTF-8?B?{}?=",
        ::base64::engine::general_purpose::STANDARD.encode(text)
    )
}

/// Write `Name: a, b, c` folded so no line passes `width` unless a single
/// address is longer than that. Addresses are never split.
fn write_address_header(out: &mut String, name: &str, list: &[Address], width: usize) {
    if list.is_empty() {
        return;
    }
    out.push_str(name);
    out.push_str(": ");
    let mut column = name.len() + 2;
    for (i, addr) in list.iter().enumerate() {
        let mut text = String::new();
        write_address(&mut text, addr);
        let len = text.chars().count();
        if i > 0 {
            // Room for ", ", the address, and the comma that may follow it.
            let trailing = usize::from(i + 1 < list.len());
            out.push(',');
            if column + 2 + len + trailing > width {
                out.push_str("\r\n ");
                column = 1;
            } else {
                out.push(' ');
                column += 2;
            }
        }
        out.push_str(&text);
        column += len;
    }
    out.push_str("\r\n");
}

/// Render a node's Content-* header lines and its encoded content.
fn render_part(draft: &Draft) -> (String, Vec<u8>) {
    let mut params = draft.params.clone();
    let (encoding, content) = match &draft.content {
        DraftContent::Data(data) => encode_leaf(draft, data),
        DraftContent::Message(raw) => (identity(&draft.encoding), raw.clone()),
        DraftContent::Parts(parts) => {
            let rendered: Vec<Vec<u8>> = parts
                .iter()
                .map(|part| {
                    let (headers, content) = render_part(part);
                    let mut bytes = headers.into_bytes();
                    bytes.extend_from_slice(b"\r\n");
                    bytes.extend_from_slice(&content);
                    bytes
                })
                .collect();
            let boundary = choose_boundary(find_param(&params, "boundary"), &rendered);
            params.retain(|p| p.attribute != "boundary");
            params.push(Param::new("boundary", boundary.clone()));

            let mut out = Vec::new();
            for part in &rendered {
                out.extend_from_slice(b"--");
                out.extend_from_slice(boundary.as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(part);
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"--");
            out.extend_from_slice(boundary.as_bytes());
            out.extend_from_slice(b"--\r\n");
            (identity(&draft.encoding), out)
        }
    };

    let mut headers = String::new();
    headers.push_str("Content-Type: ");
    headers.push_str(&draft.mime_type());
    write_params(&mut headers, &params);
    headers.push_str("\r\n");
    if encoding != Encoding::SevenBit {
        headers.push_str("Content-Transfer-Encoding: ");
        headers.push_str(encoding.name());
        headers.push_str("\r\n");
    }
    if let Some(id) = &draft.id {
        headers.push_str("Content-ID: ");
        headers.push_str(id);
        headers.push_str("\r\n");
    }
    if let Some(description) = &draft.description {
        headers.push_str("Content-Description: ");
        headers.push_str(description);
        headers.push_str("\r\n");
    }
    if let Some(disposition) = &draft.disposition {
        headers.push_str("Content-Disposition: ");
        headers.push_str(&disposition.kind);
        write_params(&mut headers, &disposition.params);
        headers.push_str("\r\n");
    }
    (headers, content)
}

/// 8bit becomes quoted-printable over CRLF text; binary becomes base64.
fn encode_leaf(draft: &Draft, data: &[u8]) -> (Encoding, Vec<u8>) {
    match draft.encoding {
        Encoding::EightBit => {
            let canonical = if draft.media_type == MediaType::Text {
                codec::to_crlf(data)
            } else {
                data.to_vec()
            };
            (Encoding::QuotedPrintable, codec::qp::encode(&canonical))
        }
        Encoding::Binary => (Encoding::Base64, codec::base64::encode(data)),
        ref other => (other.clone(), data.to_vec()),
    }
}

/// Containers can only carry identity encodings.
fn identity(encoding: &Encoding) -> Encoding {
    match encoding {
        Encoding::EightBit => Encoding::EightBit,
        _ => Encoding::SevenBit,
    }
}

/// Keep the requested boundary unless a part contains it; otherwise make
/// up fresh ones until none collides.
fn choose_boundary(requested: Option<&str>, parts: &[Vec<u8>]) -> String {
    let collides = |boundary: &str| {
        let delimiter = format!("--{boundary}");
        let finder = memmem::Finder::new(delimiter.as_bytes());
        parts.iter().any(|p| finder.find(p).is_some())
    };
    if let Some(boundary) = requested.filter(|b| !b.is_empty()) {
        if !collides(boundary) {
            return boundary.to_string();
        }
        tracing::debug!(boundary, "Boundary occurs in a part, generating a new one");
    }
    let mut rng = rand::thread_rng();
    loop {
        let candidate = format!("=_mtxbox_{:016x}{:08x}", rng.gen::<u64>(), rng.gen::<u32>());
        if !collides(&candidate) {
            return candidate;
        }
    }
}

fn write_params(out: &mut String, params: &[Param]) {
    for param in params {
        out.push_str("; ");
        out.push_str(&param.attribute);
        out.push('=');
        let plain = !param.value.is_empty()
            && param
                .value
                .bytes()
                .all(|b| b > b' ' && b < 0x7f && !TSPECIALS.contains(&b));
        if plain {
            out.push_str(&param.value);
        } else {
            out.push('"');
            for ch in param.value.chars() {
                if ch == '"' || ch == '\\' {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('"');
        }
    }
}
