//! RFC822 messages: envelope extraction and the recursive MIME body scan.

use memchr::memmem;
use tracing::{debug, warn};

use super::address::parse_address_list_lenient;
use super::content::{
    parse_content_disposition, parse_content_type, parse_transfer_encoding, ContentType,
};
use super::header::{decode_header_bytes, get_header, parse_date, unfold_headers};
use super::ParseContext;
use crate::error::ParseError;
use crate::model::{
    Address, Body, BodySize, Envelope, MediaType, NestedMessage, Param, Part, Structure,
};

/// Boundary assumed when a multipart declares none.
const DEFAULT_BOUNDARY: &str = "-";

/// Length of the header block at the start of `bytes`, blank line included.
///
/// The block ends at the first CRLFCRLF or LFLF, whichever comes first. A
/// leading blank line means an empty header. With no blank line at all
/// the whole input is header.
pub fn header_length(bytes: &[u8]) -> usize {
    if bytes.starts_with(b"\r\n") {
        return 2;
    }
    if bytes.starts_with(b"\n") {
        return 1;
    }
    let crlf = memmem::find(bytes, b"\r\n\r\n");
    let lf = memmem::find(bytes, b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if c < l => c + 4,
        (_, Some(l)) => l + 2,
        (Some(c), None) => c + 4,
        (None, None) => bytes.len(),
    }
}

/// Split a message into its header block and its body.
pub fn split_message(bytes: &[u8]) -> (&[u8], &[u8]) {
    bytes.split_at(header_length(bytes))
}

/// Parse a message header and, when given, its body.
///
/// The header is scanned once; the first occurrence of each recognised
/// header wins. Soft problems are logged; only unparseable structure
/// (nesting beyond `ctx.max_depth`) is an error.
pub fn parse_message(
    header: &[u8],
    body: Option<&[u8]>,
    ctx: &ParseContext,
) -> Result<(Envelope, Option<Body>), ParseError> {
    let text = decode_header_bytes(header);
    let headers = unfold_headers(&text);
    let envelope = build_envelope(&headers, ctx);
    let body = match body {
        Some(content) => Some(parse_body(&headers, content, &ContentType::default(), ctx, 0)?),
        None => None,
    };
    Ok((envelope, body))
}

/// Build an envelope from unfolded headers.
pub fn build_envelope(headers: &[(String, String)], ctx: &ParseContext) -> Envelope {
    let text = |name: &str| get_header(headers, name).map(str::to_string);
    let addresses = |name: &str| -> Vec<Address> {
        let Some(value) = get_header(headers, name) else {
            return Vec::new();
        };
        let (list, err) = parse_address_list_lenient(value, &ctx.default_host);
        if let Some(err) = err {
            warn!(header = name, error = %err, "Malformed address header");
        }
        list
    };

    let from = addresses("from");
    let or_from = |list: Vec<Address>| if list.is_empty() { from.clone() } else { list };
    let date = text("date");
    let parsed_date = date.as_deref().and_then(parse_date);

    Envelope {
        parsed_date,
        date,
        subject: text("subject"),
        sender: or_from(addresses("sender")),
        reply_to: or_from(addresses("reply-to")),
        to: addresses("to"),
        cc: addresses("cc"),
        bcc: addresses("bcc"),
        in_reply_to: text("in-reply-to"),
        message_id: text("message-id"),
        newsgroups: text("newsgroups"),
        followup_to: text("followup-to"),
        references: text("references"),
        from,
    }
}

/// Build the body tree of `content`, described by `headers`.
fn parse_body(
    headers: &[(String, String)],
    content: &[u8],
    default: &ContentType,
    ctx: &ParseContext,
    depth: usize,
) -> Result<Body, ParseError> {
    if depth > ctx.max_depth {
        return Err(ParseError::TooDeep(ctx.max_depth));
    }

    let ct = get_header(headers, "content-type")
        .map(parse_content_type)
        .unwrap_or_else(|| default.clone());
    let mut body = Body {
        media_type: ct.media_type,
        subtype: ct.subtype,
        params: ct.params,
        encoding: get_header(headers, "content-transfer-encoding")
            .map(parse_transfer_encoding)
            .unwrap_or_default(),
        id: get_header(headers, "content-id").map(str::to_string),
        description: get_header(headers, "content-description").map(str::to_string),
        disposition: get_header(headers, "content-disposition")
            .and_then(parse_content_disposition),
        size: BodySize {
            bytes: content.len(),
            lines: None,
        },
        structure: Structure::Single,
    };

    match body.media_type {
        MediaType::Text => {
            body.size.lines = Some(count_lines(content));
            if body.param("charset").is_none() {
                body.params.push(Param::new("charset", "US-ASCII"));
            }
        }
        MediaType::Message if body.is_subtype("rfc822") => {
            body.size.lines = Some(count_lines(content));
            body.structure = if body.encoding.is_identity() {
                let text_offset = header_length(content);
                let (nested_header, nested_content) = content.split_at(text_offset);
                let text = decode_header_bytes(nested_header);
                let nested_headers = unfold_headers(&text);
                let envelope = build_envelope(&nested_headers, ctx);
                let nested_body = parse_body(
                    &nested_headers,
                    nested_content,
                    &ContentType::default(),
                    ctx,
                    depth + 1,
                )?;
                Structure::Message(Some(Box::new(NestedMessage {
                    envelope,
                    body: nested_body,
                    text_offset,
                })))
            } else {
                warn_encoded_container(&body);
                Structure::Message(None)
            };
        }
        MediaType::Multipart => {
            body.structure = if body.encoding.is_identity() {
                let boundary = body.param("boundary").unwrap_or(DEFAULT_BOUNDARY).to_string();
                let part_default = if body.is_subtype("digest") {
                    ContentType::of(MediaType::Message)
                } else {
                    ContentType::default()
                };
                Structure::Multipart(parse_parts(content, &boundary, &part_default, ctx, depth)?)
            } else {
                warn_encoded_container(&body);
                Structure::Multipart(Vec::new())
            };
        }
        _ => {}
    }
    Ok(body)
}

fn warn_encoded_container(body: &Body) {
    let err = ParseError::EncodedContainer {
        container: body.mime_type(),
        encoding: body.encoding.to_string(),
    };
    warn!(error = %err, "Ignoring contents of encoded container");
}

/// Split multipart content at its delimiter lines.
///
/// The line break before a delimiter belongs to the delimiter. Text before
/// the first delimiter and after the close delimiter is ignored; without a
/// close delimiter the last part runs to end of content.
fn parse_parts(
    content: &[u8],
    boundary: &str,
    part_default: &ContentType,
    ctx: &ParseContext,
    depth: usize,
) -> Result<Vec<Part>, ParseError> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut closed = false;
    let mut line_start = 0;

    loop {
        let line_end = memchr::memchr(b'\n', &content[line_start..])
            .map_or(content.len(), |i| line_start + i + 1);
        if let Some(closing) = match_delimiter(&content[line_start..line_end], delimiter.as_bytes())
        {
            if let Some(start) = part_start {
                let end = strip_line_break(content, line_start).max(start);
                parts.push(build_part(&content[start..end], start, part_default, ctx, depth)?);
            }
            if closing {
                closed = true;
                break;
            }
            part_start = Some(line_end);
        }
        if line_end >= content.len() {
            break;
        }
        line_start = line_end;
    }

    match part_start {
        Some(start) if !closed => {
            debug!(boundary, "Multipart has no close delimiter");
            parts.push(build_part(&content[start..], start, part_default, ctx, depth)?);
        }
        None => warn!(boundary, "Multipart body has no delimiter lines"),
        _ => {}
    }
    Ok(parts)
}

/// `Some(is_close)` if `line` is `--boundary` or `--boundary--`, optionally
/// followed by transport whitespace.
fn match_delimiter(line: &[u8], delimiter: &[u8]) -> Option<bool> {
    let rest = line.strip_prefix(delimiter)?;
    let (closing, rest) = match rest.strip_prefix(b"--") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    rest.iter()
        .all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
        .then_some(closing)
}

fn strip_line_break(content: &[u8], pos: usize) -> usize {
    let mut end = pos;
    if end > 0 && content[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && content[end - 1] == b'\r' {
            end -= 1;
        }
    }
    end
}

fn build_part(
    bytes: &[u8],
    offset: usize,
    default: &ContentType,
    ctx: &ParseContext,
    depth: usize,
) -> Result<Part, ParseError> {
    let header_size = header_length(bytes);
    let text = decode_header_bytes(&bytes[..header_size]);
    let headers = unfold_headers(&text);
    let body = parse_body(&headers, &bytes[header_size..], default, ctx, depth + 1)?;
    Ok(Part {
        offset,
        header_size,
        body,
    })
}

fn count_lines(content: &[u8]) -> usize {
    memchr::memchr_iter(b'\n', content).count()
}
