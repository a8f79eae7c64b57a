//! Streaming Unix mbox reader, used to import messages into a mailbox.
//!
//! Reads the file line by line through a large buffer and never holds more
//! than one message in memory. Tolerant of mixed line endings, `From `
//! lines without a preceding blank line, and a UTF-8 BOM.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use tracing::warn;

use super::header::{decode_header_bytes, get_header, unfold_headers};
use super::message::split_message;
use crate::error::{Result, StoreError};
use crate::model::{FlagSet, SystemFlags};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Progress is reported every this many bytes.
const PROGRESS_INTERVAL: u64 = 4 * 1024 * 1024;

/// One message read from an mbox file.
#[derive(Debug, Clone)]
pub struct MboxMessage {
    /// Offset of the `From ` separator line.
    pub offset: u64,
    /// Delivery time from the separator line.
    pub delivered: Option<DateTime<FixedOffset>>,
    /// Flags recovered from `Status:` and `X-Status:` headers.
    pub flags: FlagSet,
    /// The RFC822 text, separator line removed and `>From ` unescaped.
    pub raw: Vec<u8>,
}

pub struct MboxReader {
    path: PathBuf,
    file_size: u64,
}

impl MboxReader {
    /// Open an mbox file. Does not check that it actually is one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::FileNotFound(path.clone())
            } else {
                StoreError::io(&path, e)
            }
        })?;
        Ok(Self {
            path,
            file_size: metadata.len(),
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Read every message, in file order.
    ///
    /// `on_message` returns `Ok(false)` to stop early; its errors abort the
    /// read. Returns the number of messages delivered.
    pub fn read_all(
        &self,
        on_message: &mut dyn FnMut(MboxMessage) -> Result<bool>,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<u64> {
        let file = File::open(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);

        let mut count = 0u64;
        let mut offset = 0u64;
        let mut last_progress = 0u64;
        let mut current: Option<(u64, Option<DateTime<FixedOffset>>)> = None;
        let mut message_buf: Vec<u8> = Vec::with_capacity(64 * 1024);
        let mut line: Vec<u8> = Vec::with_capacity(4096);
        let mut prev_blank = true;

        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| StoreError::io(&self.path, e))?;
            if n == 0 {
                break;
            }

            let content = if offset == 0 {
                line.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(&line)
            } else {
                &line[..]
            };

            if let Some(rest) = content.strip_prefix(b"From ") {
                if !prev_blank && current.is_some() {
                    warn!(offset, "Found 'From ' separator without preceding blank line");
                }
                if let Some((start, delivered)) = current.take() {
                    if !on_message(finish(start, delivered, &mut message_buf))? {
                        return Ok(count + 1);
                    }
                    count += 1;
                }
                current = Some((offset, parse_separator_date(rest)));
            } else if current.is_some() {
                message_buf.extend_from_slice(unescape_from(content));
            } else if !is_blank_line(content) {
                warn!(offset, "Data before the first 'From ' line, skipping");
            }

            prev_blank = is_blank_line(content);
            offset += n as u64;

            if let Some(cb) = progress {
                if offset - last_progress >= PROGRESS_INTERVAL {
                    cb(offset, self.file_size);
                    last_progress = offset;
                }
            }
        }

        if let Some((start, delivered)) = current.take() {
            on_message(finish(start, delivered, &mut message_buf))?;
            count += 1;
        }
        if let Some(cb) = progress {
            cb(self.file_size, self.file_size);
        }
        Ok(count)
    }
}

/// Turn the accumulated lines into a message, dropping the blank line that
/// separates it from the next one.
fn finish(offset: u64, delivered: Option<DateTime<FixedOffset>>, buf: &mut Vec<u8>) -> MboxMessage {
    let mut raw = std::mem::take(buf);
    if raw.ends_with(b"\r\n\r\n") {
        raw.truncate(raw.len() - 2);
    } else if raw.ends_with(b"\n\n") {
        raw.truncate(raw.len() - 1);
    }
    let flags = status_flags(&raw);
    MboxMessage {
        offset,
        delivered,
        flags,
        raw,
    }
}

/// `>From ` → `From `, one level only.
fn unescape_from(line: &[u8]) -> &[u8] {
    let quoted = line.iter().take_while(|&&b| b == b'>').count();
    if quoted > 0 && line[quoted..].starts_with(b"From ") {
        &line[1..]
    } else {
        line
    }
}

/// Parse the ctime-style date of a `From sender Thu Jan  1 00:00:00 2024` line.
fn parse_separator_date(rest: &[u8]) -> Option<DateTime<FixedOffset>> {
    let text = String::from_utf8_lossy(rest);
    let mut words = text.split_ascii_whitespace();
    words.next()?; // envelope sender
    let date: Vec<&str> = words.collect();
    let utc = FixedOffset::east_opt(0)?;
    for take in [6, 5] {
        let Some(candidate) = date.get(..take).map(|w| w.join(" ")) else {
            continue;
        };
        if let Ok(dt) = DateTime::parse_from_str(&candidate, "%a %b %d %H:%M:%S %Y %z") {
            return Some(dt);
        }
        if let Ok(ndt) = NaiveDateTime::parse_from_str(&candidate, "%a %b %d %H:%M:%S %Y") {
            return ndt.and_local_timezone(utc).single();
        }
    }
    None
}

/// Recover flags from the `Status:` / `X-Status:` headers mail spools keep.
fn status_flags(raw: &[u8]) -> FlagSet {
    let (header, _) = split_message(raw);
    let headers = unfold_headers(&decode_header_bytes(header));
    let mut system = SystemFlags::empty();
    for c in get_header(&headers, "status").unwrap_or("").chars() {
        match c {
            'R' => system |= SystemFlags::SEEN,
            'O' => system |= SystemFlags::OLD,
            _ => {}
        }
    }
    for c in get_header(&headers, "x-status").unwrap_or("").chars() {
        match c {
            'D' => system |= SystemFlags::DELETED,
            'F' => system |= SystemFlags::FLAGGED,
            'A' => system |= SystemFlags::ANSWERED,
            'T' => system |= SystemFlags::DRAFT,
            _ => {}
        }
    }
    FlagSet::new(system)
}

/// Check whether a line is blank (empty or only whitespace / CR / LF).
fn is_blank_line(line: &[u8]) -> bool {
    line.iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}
