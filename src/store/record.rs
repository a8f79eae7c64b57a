//! The internal header line that precedes every message record:
//!
//! ```text
//!  4-Jan-2024 10:00:00 +0100,1234;000000000003\r\n
//! ```
//!
//! internal date, byte count of the message text that follows, and the
//! 12-digit octal flag field. The line ending picks the variant: CRLF for
//! MTX, bare LF for Tenex.

use chrono::{DateTime, FixedOffset};
use memchr::{memchr, memrchr};

use crate::model::SystemFlags;

/// Width of the octal flag field. Rewritten in place, so it never changes.
pub const FLAG_FIELD_WIDTH: usize = 12;

/// Octal digits given to the user keyword mask.
const USER_DIGITS: usize = 10;

/// Octal digits given to the system flags.
const SYSTEM_DIGITS: usize = 2;

const _: () = assert!(USER_DIGITS + SYSTEM_DIGITS == FLAG_FIELD_WIDTH);

/// Keyword slots available in the user mask.
pub const MAX_KEYWORDS: usize = 30;

const _: () = assert!(MAX_KEYWORDS <= USER_DIGITS * 3);

/// Longest header line accepted before a record is considered corrupt.
pub const MAX_HEADER_LINE: usize = 128;

/// strftime pattern of the internal date.
pub const INTERNAL_DATE_FORMAT: &str = "%e-%b-%Y %H:%M:%S %z";

/// The two on-disk variants, which differ only in line ending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    /// CRLF-terminated header lines.
    Mtx,
    /// LF-terminated header lines.
    Tenex,
}

impl RecordFormat {
    pub fn line_ending(self) -> &'static [u8] {
        match self {
            RecordFormat::Mtx => b"\r\n",
            RecordFormat::Tenex => b"\n",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RecordFormat::Mtx => "mtx",
            RecordFormat::Tenex => "tenex",
        }
    }
}

/// A parsed internal header line.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderLine {
    pub internal_date: DateTime<FixedOffset>,
    /// Byte count of the message text.
    pub size: u64,
    pub system: SystemFlags,
    pub user: u32,
    pub format: RecordFormat,
    /// Length of the line including its terminator.
    pub len: usize,
    /// Offset of the flag field from the start of the line.
    pub flags_offset: usize,
}

/// Parse the header line at the start of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the line terminator, which
/// may just mean the record is still being written.
pub fn parse_header_line(buf: &[u8]) -> Result<Option<HeaderLine>, String> {
    let window = &buf[..buf.len().min(MAX_HEADER_LINE)];
    let Some(nl) = memchr(b'\n', window) else {
        if buf.len() >= MAX_HEADER_LINE {
            return Err("internal header line too long".to_string());
        }
        return Ok(None);
    };

    let (line, format) = match window[..nl].strip_suffix(b"\r") {
        Some(line) => (line, RecordFormat::Mtx),
        None => (&window[..nl], RecordFormat::Tenex),
    };
    let line = std::str::from_utf8(line)
        .map_err(|_| "internal header line is not ASCII".to_string())?;

    let semi = memrchr(b';', line.as_bytes())
        .ok_or_else(|| format!("no flag field in {line:?}"))?;
    let comma = memrchr(b',', &line.as_bytes()[..semi])
        .ok_or_else(|| format!("no size field in {line:?}"))?;

    let internal_date = parse_internal_date(&line[..comma])
        .ok_or_else(|| format!("bad internal date in {line:?}"))?;
    let size_field = &line[comma + 1..semi];
    if size_field.is_empty() || !size_field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("bad size in {line:?}"));
    }
    let size = size_field
        .parse::<u64>()
        .map_err(|_| format!("bad size in {line:?}"))?;
    let (system, user) =
        parse_flags(&line[semi + 1..]).ok_or_else(|| format!("bad flag field in {line:?}"))?;

    Ok(Some(HeaderLine {
        internal_date,
        size,
        system,
        user,
        format,
        len: nl + 1,
        flags_offset: semi + 1,
    }))
}

/// Render a complete header line, terminator included.
pub fn format_header_line(
    internal_date: &DateTime<FixedOffset>,
    size: u64,
    system: SystemFlags,
    user: u32,
    format: RecordFormat,
) -> Vec<u8> {
    let mut line = format!(
        "{},{};{}",
        format_internal_date(internal_date),
        size,
        format_flags(system, user)
    )
    .into_bytes();
    line.extend_from_slice(format.line_ending());
    line
}

/// The fixed-width flag field.
pub fn format_flags(system: SystemFlags, user: u32) -> String {
    let field = format!("{:010o}{:02o}", user & user_mask_limit(), system.bits());
    debug_assert_eq!(field.len(), FLAG_FIELD_WIDTH);
    field
}

/// Parse a flag field. Unknown system bits are dropped.
pub fn parse_flags(field: &str) -> Option<(SystemFlags, u32)> {
    if field.len() != FLAG_FIELD_WIDTH || !field.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return None;
    }
    let user = u32::from_str_radix(&field[..USER_DIGITS], 8).ok()?;
    let system = u8::from_str_radix(&field[USER_DIGITS..], 8).ok()?;
    Some((SystemFlags::from_bits_truncate(system), user & user_mask_limit()))
}

fn user_mask_limit() -> u32 {
    (1u32 << MAX_KEYWORDS) - 1
}

/// Bit of the user mask that holds keyword `slot`.
pub fn keyword_bit(slot: usize) -> u32 {
    1 << (MAX_KEYWORDS - 1 - slot)
}

pub fn format_internal_date(date: &DateTime<FixedOffset>) -> String {
    date.format(INTERNAL_DATE_FORMAT).to_string()
}

/// Parse `dd-Mon-yyyy hh:mm:ss +zzzz`; the day may be space padded.
pub fn parse_internal_date(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(text.trim(), "%d-%b-%Y %H:%M:%S %z").ok()
}
