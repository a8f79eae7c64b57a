//! [`MailboxStore`]: one open stream on a mailbox file.

use std::fs::File;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Local};
use tracing::{debug, info, warn};

use super::cache::{KeywordTable, MessageCache, MessageEntry, ParsedMessage};
use super::lock::{self, WriterLock};
use super::record::{self, HeaderLine, RecordFormat, FLAG_FIELD_WIDTH, MAX_HEADER_LINE};
use super::{OpenOptions, StreamState};
use crate::codec;
use crate::error::{LockError, Result, StoreError};
use crate::model::{Body, Encoding, Envelope, FlagSet, SequenceSet, Structure, SystemFlags};
use crate::parser::{self, header_length, RawMessage};

struct Handle {
    file: File,
    writable: bool,
}

/// An open mailbox.
///
/// Holds a shared lock on the file while open. Messages become visible
/// through [`ping`](Self::ping), which parses whatever was appended since
/// the previous call.
pub struct MailboxStore {
    path: PathBuf,
    handle: Option<Handle>,
    options: OpenOptions,
    /// `None` until the file has a first record.
    format: Option<RecordFormat>,
    lock_path: PathBuf,
    entries: Vec<MessageEntry>,
    /// End of the last record parsed.
    watermark: u64,
    next_id: u64,
    keywords: KeywordTable,
    cache: MessageCache,
}

impl MailboxStore {
    /// Open a mailbox. No messages are visible until the first `ping`.
    ///
    /// A read-write open of a file we may not write falls back to
    /// read-only.
    pub fn open(path: impl AsRef<Path>, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, writable) = if options.readonly {
            (open_file(&path, false)?, false)
        } else {
            match open_file(&path, true) {
                Ok(file) => (file, true),
                Err(StoreError::Io { ref source, .. })
                    if source.kind() == std::io::ErrorKind::PermissionDenied =>
                {
                    warn!(path = %path.display(), "No write access, opening read-only");
                    (open_file(&path, false)?, false)
                }
                Err(e) => return Err(e),
            }
        };

        let meta = file.metadata().map_err(|e| StoreError::io(&path, e))?;
        if !meta.is_file() {
            return Err(StoreError::NotMailbox(path));
        }
        let lock_path = lock::lock_file_path(&options.resolved_lock_dir(), &meta);
        let sniffed = sniff(&file, &path)?;
        let pending = matches!(sniffed, Sniffed::Partial) && WriterLock::is_held(&lock_path)?;
        let format = match sniffed {
            Sniffed::Format(format) => Some(format),
            Sniffed::Empty if options.allow_empty => None,
            Sniffed::Partial if pending => {
                debug!(path = %path.display(), "First record still being written");
                None
            }
            Sniffed::Empty | Sniffed::Partial => return Err(StoreError::NotMailbox(path)),
        };
        lock::lock_shared(&file, &path)?;

        info!(
            path = %path.display(),
            format = format.map_or("empty", RecordFormat::name),
            readonly = !writable,
            "Opened mailbox"
        );
        Ok(Self {
            keywords: KeywordTable::new(&options.keywords),
            cache: MessageCache::new(options.cache_size),
            path,
            handle: Some(Handle { file, writable }),
            options,
            format,
            lock_path,
            entries: Vec::new(),
            watermark: 0,
            next_id: 1,
        })
    }

    /// Create a new, empty mailbox. Fails if the file exists.
    pub fn create(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
        {
            Ok(_) => {
                info!(path = %path.display(), "Created mailbox");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(path.to_path_buf()))
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Release the file and its lock. Idempotent.
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            info!(path = %self.path.display(), "Closed mailbox");
        }
        self.entries.clear();
        self.cache.clear();
        self.watermark = 0;
    }

    pub fn state(&self) -> StreamState {
        match &self.handle {
            None => StreamState::Closed,
            Some(h) if h.writable => StreamState::ReadWrite,
            Some(_) => StreamState::ReadOnly,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> Option<RecordFormat> {
        self.format
    }

    /// The writer lock file serialising appends and expunges.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn exists_count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn recent_count(&self) -> u32 {
        self.entries.iter().filter(|e| e.recent).count() as u32
    }

    /// Keywords known to this stream, by slot.
    pub fn keywords(&self) -> &[String] {
        self.keywords.names()
    }

    /// User-mask bit of a keyword, if it has a slot.
    pub fn keyword_bit(&self, name: &str) -> Option<u32> {
        self.keywords.slot(name).map(record::keyword_bit)
    }

    pub fn entry(&self, msgno: u32) -> Result<&MessageEntry> {
        let index = self.index(msgno)?;
        Ok(&self.entries[index])
    }

    /// User-visible flags of a message.
    pub fn flags(&self, msgno: u32) -> Result<FlagSet> {
        Ok(self.keywords.flag_set(self.entry(msgno)?))
    }

    // ── Parsing ─────────────────────────────────────────────────

    /// Reload the flags of known messages and parse records appended since
    /// the last call. Returns the number of new messages.
    ///
    /// A file that shrank or a malformed record closes the stream and
    /// returns [`StoreError::Corrupt`]. A record cut short while another
    /// writer holds the writer lock is left for the next call.
    pub fn ping(&mut self) -> Result<u32> {
        self.update(false)
    }

    /// `holds_writer_lock` means no append can be in progress, so any short
    /// record is corrupt.
    fn update(&mut self, holds_writer_lock: bool) -> Result<u32> {
        let handle = self.handle()?;
        let size = handle
            .file
            .metadata()
            .map_err(|e| StoreError::io(&self.path, e))?
            .len();

        if size < self.watermark {
            let err = StoreError::corrupt(
                &self.path,
                format!("file shrank from {} to {} bytes", self.watermark, size),
            );
            warn!(error = %err, "Closing mailbox");
            self.close();
            return Err(err);
        }
        let result = self.reload_all_flags().and_then(|()| {
            if size == self.watermark {
                return Ok(0);
            }
            let (found, end) = self.scan(size, holds_writer_lock)?;
            self.commit(found, end)
        });
        match result {
            Ok(count) => Ok(count),
            Err(err) => {
                if err.is_fatal() {
                    warn!(error = %err, "Closing mailbox");
                    self.close();
                }
                Err(err)
            }
        }
    }

    /// Read header lines from the watermark up to `size`.
    fn scan(&self, size: u64, holds_writer_lock: bool) -> Result<(Vec<(u64, HeaderLine)>, u64)> {
        let file = &self.handle()?.file;
        let mut buf = [0u8; MAX_HEADER_LINE];
        let mut format = self.format;
        let mut found = Vec::new();
        let mut pos = self.watermark;

        while pos < size {
            let want = (size - pos).min(MAX_HEADER_LINE as u64) as usize;
            let n = read_at_most(file, &self.path, pos, &mut buf[..want])?;
            let line = match record::parse_header_line(&buf[..n]) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    if !holds_writer_lock && self.append_in_progress()? {
                        break;
                    }
                    return Err(self.corrupt(format!("truncated internal header at offset {pos}")));
                }
                Err(reason) => return Err(self.corrupt(format!("{reason} at offset {pos}"))),
            };

            match format {
                Some(expected) if expected != line.format => {
                    return Err(self.corrupt(format!(
                        "{} record at offset {pos} in a {} mailbox",
                        line.format.name(),
                        expected.name()
                    )));
                }
                Some(_) => {}
                None => format = Some(line.format),
            }

            let end = pos + line.len as u64 + line.size;
            if end > size {
                if !holds_writer_lock && self.append_in_progress()? {
                    break;
                }
                return Err(self.corrupt(format!("record at offset {pos} runs past end of file")));
            }
            found.push((pos, line));
            pos = end;
        }
        Ok((found, pos))
    }

    /// Turn scanned header lines into entries. Messages without `OLD` are
    /// recent; a writable stream marks them `OLD` on disk.
    fn commit(&mut self, found: Vec<(u64, HeaderLine)>, end: u64) -> Result<u32> {
        let count = found.len() as u32;
        let writable = self.is_writable();
        let mut mark_old = Vec::new();

        for (offset, line) in found {
            if self.format.is_none() {
                self.format = Some(line.format);
            }
            let mut entry = MessageEntry {
                id: self.next_id,
                record_offset: offset,
                text_offset: line.len as u64,
                flags_offset: line.flags_offset as u64,
                size: line.size,
                internal_date: line.internal_date,
                system: line.system,
                user: line.user,
                recent: false,
                header_size: None,
                local_flags: false,
            };
            self.next_id += 1;
            if !entry.has(SystemFlags::OLD) {
                entry.recent = true;
                if writable {
                    entry.system |= SystemFlags::OLD;
                    mark_old.push(self.entries.len());
                }
            }
            self.entries.push(entry);
        }
        self.watermark = end;
        debug!(
            new = count,
            exists = self.entries.len(),
            watermark = end,
            "Parsed new records"
        );

        for &index in &mark_old {
            self.write_flags(index)?;
        }
        if !mark_old.is_empty() {
            self.sync()?;
        }
        Ok(count)
    }

    fn append_in_progress(&self) -> Result<bool> {
        Ok(WriterLock::is_held(&self.lock_path)?)
    }

    /// Pick up flag changes other streams made to known messages.
    fn reload_all_flags(&mut self) -> Result<()> {
        let mut changed = 0;
        for index in 0..self.entries.len() {
            if self.entries[index].local_flags {
                continue;
            }
            if self.reload_flags(index)? {
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(changed, "Reloaded flags changed by another stream");
        }
        Ok(())
    }

    /// Re-read one message's flag field from disk. Returns whether it
    /// differed from memory.
    fn reload_flags(&mut self, index: usize) -> Result<bool> {
        let position = self.entries[index].flags_position();
        let field = self.read_bytes(position, FLAG_FIELD_WIDTH as u64)?;
        let (system, user) = std::str::from_utf8(&field)
            .ok()
            .and_then(record::parse_flags)
            .ok_or_else(|| self.corrupt(format!("bad flag field at offset {position}")))?;
        let entry = &mut self.entries[index];
        let changed = (entry.system, entry.user) != (system, user);
        entry.system = system;
        entry.user = user;
        Ok(changed)
    }

    // ── Fetching ────────────────────────────────────────────────

    /// The message split into header and body. Does not touch flags.
    pub fn raw_message(&mut self, msgno: u32) -> Result<RawMessage> {
        let index = self.index(msgno)?;
        let (start, size, known) = {
            let entry = &self.entries[index];
            (entry.text_start(), entry.size, entry.header_size)
        };
        let mut header = self.read_bytes(start, size)?;
        let header_size = known.map_or_else(|| header_length(&header), |n| n as usize);
        self.entries[index].header_size = Some(header_size as u64);
        let body = header.split_off(header_size.min(header.len()));
        Ok(RawMessage { header, body })
    }

    /// The parsed envelope and body, from cache when possible. Does not
    /// touch flags.
    pub fn parsed(&mut self, msgno: u32) -> Result<Arc<ParsedMessage>> {
        let index = self.index(msgno)?;
        let id = self.entries[index].id;
        if let Some(parsed) = self.cache.get(id) {
            return Ok(parsed);
        }
        let raw = self.raw_message(msgno)?;
        let (envelope, body) = parser::parse_source(&raw, &self.options.context)?;
        debug!(msgno, "Parsed message");
        Ok(self.cache.put(id, ParsedMessage { envelope, body }))
    }

    pub fn fetch_envelope(&mut self, msgno: u32) -> Result<Envelope> {
        Ok(self.parsed(msgno)?.envelope.clone())
    }

    pub fn fetch_body(&mut self, msgno: u32) -> Result<Body> {
        Ok(self.parsed(msgno)?.body.clone())
    }

    /// The RFC822 header block, blank line included.
    pub fn fetch_header(&mut self, msgno: u32) -> Result<Vec<u8>> {
        let entry = self.entry(msgno)?;
        if let Some(size) = entry.header_size {
            return self.read_bytes(entry.text_start(), size);
        }
        Ok(self.raw_message(msgno)?.header)
    }

    /// The text after the header. Sets `\Seen`.
    pub fn fetch_text(&mut self, msgno: u32) -> Result<Vec<u8>> {
        let raw = self.raw_message(msgno)?;
        self.mark_seen(msgno)?;
        Ok(raw.body)
    }

    /// Header and text together. Sets `\Seen`.
    pub fn fetch_message(&mut self, msgno: u32) -> Result<Vec<u8>> {
        let raw = self.raw_message(msgno)?;
        self.mark_seen(msgno)?;
        Ok(raw.to_bytes())
    }

    /// Content of the body part named by `section`, still transfer
    /// encoded. Sets `\Seen` unless the part is a multipart.
    pub fn fetch_body_part(&mut self, msgno: u32, section: &str) -> Result<Vec<u8>> {
        Ok(self.body_part(msgno, section)?.1)
    }

    /// Like [`fetch_body_part`](Self::fetch_body_part), with the transfer
    /// encoding removed.
    pub fn fetch_body_part_decoded(&mut self, msgno: u32, section: &str) -> Result<Vec<u8>> {
        let (encoding, bytes) = self.body_part(msgno, section)?;
        Ok(codec::decode_body(&encoding, &bytes)?)
    }

    fn body_part(&mut self, msgno: u32, section: &str) -> Result<(Encoding, Vec<u8>)> {
        let parsed = self.parsed(msgno)?;
        let located = parsed
            .body
            .find_section(section)
            .ok_or_else(|| StoreError::BadSection(section.to_string()))?;
        let leaf = !matches!(located.body.structure, Structure::Multipart(_));
        let encoding = located.body.encoding.clone();

        let raw = self.raw_message(msgno)?;
        let start = located.start.min(raw.body.len());
        let end = (located.start + located.body.size.bytes).min(raw.body.len());
        let bytes = raw.body[start..end].to_vec();

        if leaf {
            self.mark_seen(msgno)?;
        }
        Ok((encoding, bytes))
    }

    // ── Flags ───────────────────────────────────────────────────

    pub fn set_flags(&mut self, sequence: &SequenceSet, flags: &FlagSet) -> Result<()> {
        self.store_flags(sequence, flags, true)
    }

    pub fn clear_flags(&mut self, sequence: &SequenceSet, flags: &FlagSet) -> Result<()> {
        self.store_flags(sequence, flags, false)
    }

    /// Update flags in memory, then rewrite each changed flag field in
    /// place. A read-only stream keeps the change in memory only.
    fn store_flags(&mut self, sequence: &SequenceSet, flags: &FlagSet, add: bool) -> Result<()> {
        self.handle()?;
        let msgnos = sequence.resolve(self.exists_count())?;
        let system = flags.system - SystemFlags::OLD;
        let user = if add {
            self.keywords.mask_for(&flags.keywords)?
        } else {
            self.keywords.known_mask(&flags.keywords)
        };

        let writable = self.is_writable();
        let mut changed = 0;
        for msgno in msgnos {
            let index = msgno as usize - 1;
            if writable {
                self.reload_flags(index)?;
            }
            let entry = &mut self.entries[index];
            let before = (entry.system, entry.user);
            if add {
                entry.system |= system;
                entry.user |= user;
            } else {
                entry.system -= system;
                entry.user &= !user;
            }
            if (entry.system, entry.user) != before {
                entry.local_flags = !writable;
                let id = entry.id;
                self.cache.invalidate(id);
                self.write_flags(index)?;
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(changed, add, flags = %flags, "Updated flags");
            self.sync()?;
        }
        Ok(())
    }

    fn mark_seen(&mut self, msgno: u32) -> Result<()> {
        let index = self.index(msgno)?;
        let writable = self.is_writable();
        if writable {
            self.reload_flags(index)?;
        }
        let entry = &mut self.entries[index];
        if entry.has(SystemFlags::SEEN) {
            return Ok(());
        }
        entry.system |= SystemFlags::SEEN;
        entry.local_flags = !writable;
        let id = entry.id;
        self.cache.invalidate(id);
        self.write_flags(index)?;
        self.sync()
    }

    fn write_flags(&self, index: usize) -> Result<()> {
        let handle = self.handle()?;
        if !handle.writable {
            return Ok(());
        }
        let entry = &self.entries[index];
        let field = record::format_flags(entry.system, entry.user);
        handle
            .file
            .write_all_at(field.as_bytes(), entry.flags_position())
            .map_err(|e| StoreError::io(&self.path, e))
    }

    // ── Search ──────────────────────────────────────────────────

    /// Message numbers matching `criteria`. Never sets `\Seen`.
    pub fn search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        crate::search::search(self, criteria)
    }

    // ── Structural changes ──────────────────────────────────────

    /// Remove every message marked `\Deleted` and compact the file.
    /// Returns the numbers the removed messages had before the call.
    ///
    /// Needs the writer lock and sole access to the mailbox. A failure
    /// while moving records closes the stream.
    pub fn expunge(&mut self) -> Result<Vec<u32>> {
        if !self.handle()?.writable {
            return Err(StoreError::ReadOnly);
        }
        if !self.entries.iter().any(|e| e.has(SystemFlags::DELETED)) {
            debug!(path = %self.path.display(), "Nothing to expunge");
            return Ok(Vec::new());
        }

        let _writer = WriterLock::try_acquire(&self.lock_path)?
            .ok_or_else(|| LockError::Busy(self.path.clone()))?;
        lock::upgrade_exclusive(&self.handle()?.file, &self.path)?;

        let result = self.compact();
        let restored = match &self.handle {
            Some(h) => lock::downgrade_shared(&h.file, &self.path),
            None => Ok(()),
        };
        match result {
            Ok(expunged) => {
                restored?;
                info!(
                    path = %self.path.display(),
                    expunged = expunged.len(),
                    exists = self.entries.len(),
                    "Expunged mailbox"
                );
                Ok(expunged)
            }
            Err(err) => {
                warn!(error = %err, "Expunge failed, closing mailbox");
                self.close();
                Err(err)
            }
        }
    }

    fn compact(&mut self) -> Result<Vec<u32>> {
        self.update(true)?;

        let file = &self.handle()?.file;
        let mut buf = vec![0u8; self.options.copy_chunk_size.max(1)];
        let mut survivors = Vec::with_capacity(self.entries.len());
        let mut expunged = Vec::new();
        let mut dropped = Vec::new();
        let mut delta = 0u64;

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.has(SystemFlags::DELETED) {
                delta += entry.record_len();
                expunged.push(i as u32 + 1);
                dropped.push(entry.id);
                continue;
            }
            let mut entry = entry.clone();
            if delta > 0 {
                shift_left(file, &self.path, entry.record_offset, delta, entry.record_len(), &mut buf)?;
                entry.record_offset -= delta;
            }
            survivors.push(entry);
        }

        let new_len = self.watermark - delta;
        file.set_len(new_len)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&self.path, e))?;

        self.entries = survivors;
        self.watermark = new_len;
        for id in dropped {
            self.cache.invalidate(id);
        }
        Ok(expunged)
    }

    /// Append a message to this mailbox and pick it up.
    pub fn append(
        &mut self,
        message: &[u8],
        flags: &FlagSet,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<()> {
        if !self.handle()?.writable {
            return Err(StoreError::ReadOnly);
        }
        let mut appender = Appender::open(&self.path, &self.options)?;
        if let Err(e) = appender.write(message, flags, date, &mut self.keywords) {
            appender.rollback();
            return Err(e);
        }
        appender.finish()?;
        self.ping()?;
        Ok(())
    }

    /// Append a message to the mailbox at `path` without opening a stream.
    /// Open streams see it on their next `ping`.
    pub fn append_to(
        path: impl AsRef<Path>,
        message: &[u8],
        flags: &FlagSet,
        date: Option<DateTime<FixedOffset>>,
        options: &OpenOptions,
    ) -> Result<()> {
        let mut keywords = KeywordTable::new(&options.keywords);
        let mut appender = Appender::open(path.as_ref(), options)?;
        if let Err(e) = appender.write(message, flags, date, &mut keywords) {
            appender.rollback();
            return Err(e);
        }
        appender.finish()
    }

    /// Append the selected messages, with flags and internal dates, to
    /// another mailbox. All or nothing. Returns the number copied.
    pub fn copy(&mut self, sequence: &SequenceSet, dest: impl AsRef<Path>) -> Result<u32> {
        self.handle()?;
        let msgnos = sequence.resolve(self.exists_count())?;
        let mut keywords = KeywordTable::new(&self.options.keywords);
        let mut appender = Appender::open(dest.as_ref(), &self.options)?;
        for &msgno in &msgnos {
            if let Err(e) = self.copy_one(msgno, &mut appender, &mut keywords) {
                appender.rollback();
                return Err(e);
            }
        }
        appender.finish()?;
        info!(
            count = msgnos.len(),
            dest = %dest.as_ref().display(),
            "Copied messages"
        );
        Ok(msgnos.len() as u32)
    }

    fn copy_one(
        &self,
        msgno: u32,
        appender: &mut Appender,
        keywords: &mut KeywordTable,
    ) -> Result<()> {
        let entry = self.entry(msgno)?;
        let flags = self.keywords.flag_set(entry);
        let date = entry.internal_date;
        let text = self.read_bytes(entry.text_start(), entry.size)?;
        appender.write(&text, &flags, Some(date), keywords)
    }

    /// Copy, then mark the originals `\Deleted`.
    pub fn move_to(&mut self, sequence: &SequenceSet, dest: impl AsRef<Path>) -> Result<u32> {
        let count = self.copy(sequence, dest)?;
        self.set_flags(sequence, &FlagSet::new(SystemFlags::DELETED))?;
        Ok(count)
    }

    /// Flush to disk and pick up new messages.
    pub fn check(&mut self) -> Result<()> {
        let handle = self.handle()?;
        if handle.writable {
            handle
                .file
                .sync_all()
                .map_err(|e| StoreError::io(&self.path, e))?;
        }
        self.ping()?;
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn handle(&self) -> Result<&Handle> {
        self.handle.as_ref().ok_or(StoreError::Closed)
    }

    fn is_writable(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.writable)
    }

    fn index(&self, msgno: u32) -> Result<usize> {
        self.handle()?;
        msgno
            .checked_sub(1)
            .map(|i| i as usize)
            .filter(|&i| i < self.entries.len())
            .ok_or(StoreError::NoSuchMessage(msgno))
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::corrupt(&self.path, reason)
    }

    fn sync(&self) -> Result<()> {
        let handle = self.handle()?;
        if handle.writable {
            handle
                .file
                .sync_data()
                .map_err(|e| StoreError::io(&self.path, e))?;
        }
        Ok(())
    }

    fn read_bytes(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let file = &self.handle()?.file;
        let mut buf = vec![0u8; len as usize];
        file.read_exact_at(&mut buf, offset)
            .map_err(|e| StoreError::io(&self.path, e))?;
        Ok(buf)
    }
}

/// Writes whole records at the end of a mailbox under its writer lock.
struct Appender {
    path: PathBuf,
    file: File,
    format: RecordFormat,
    /// Length before the first write; failures truncate back to it.
    start: u64,
    end: u64,
    written: usize,
    _lock: WriterLock,
}

impl Appender {
    fn open(path: &Path, options: &OpenOptions) -> Result<Self> {
        let file = open_file(path, true)?;
        let meta = file.metadata().map_err(|e| StoreError::io(path, e))?;
        if !meta.is_file() {
            return Err(StoreError::NotMailbox(path.to_path_buf()));
        }
        let lock = WriterLock::acquire(lock::lock_file_path(&options.resolved_lock_dir(), &meta))?;

        let format = match sniff(&file, path)? {
            Sniffed::Format(format) => format,
            Sniffed::Empty => options.create_format,
            Sniffed::Partial => return Err(StoreError::NotMailbox(path.to_path_buf())),
        };
        let start = file
            .metadata()
            .map_err(|e| StoreError::io(path, e))?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            format,
            start,
            end: start,
            written: 0,
            _lock: lock,
        })
    }

    /// Write one record with a single write at the end of the file.
    fn write(
        &mut self,
        message: &[u8],
        flags: &FlagSet,
        date: Option<DateTime<FixedOffset>>,
        keywords: &mut KeywordTable,
    ) -> Result<()> {
        let user = keywords.mask_for(&flags.keywords)?;
        let date = date.unwrap_or_else(|| Local::now().into());
        let mut bytes = record::format_header_line(
            &date,
            message.len() as u64,
            flags.system - SystemFlags::OLD,
            user,
            self.format,
        );
        bytes.extend_from_slice(message);
        self.file
            .write_all_at(&bytes, self.end)
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.end += bytes.len() as u64;
        self.written += 1;
        Ok(())
    }

    fn finish(self) -> Result<()> {
        if let Err(e) = self.file.sync_data() {
            self.rollback();
            return Err(StoreError::io(&self.path, e));
        }
        info!(
            path = %self.path.display(),
            messages = self.written,
            bytes = self.end - self.start,
            "Appended to mailbox"
        );
        Ok(())
    }

    fn rollback(&self) {
        if let Err(e) = self.file.set_len(self.start) {
            warn!(path = %self.path.display(), error = %e, "Failed to truncate after failed append");
        }
    }
}

fn open_file(path: &Path, writable: bool) -> Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(writable)
        .open(path)
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::FileNotFound(path.to_path_buf())
            } else {
                StoreError::io(path, e)
            }
        })
}

/// What the start of a mailbox file looks like.
enum Sniffed {
    Empty,
    Format(RecordFormat),
    /// The first header line is not complete yet.
    Partial,
}

fn sniff(file: &File, path: &Path) -> Result<Sniffed> {
    let mut buf = [0u8; MAX_HEADER_LINE];
    let n = read_at_most(file, path, 0, &mut buf)?;
    if n == 0 {
        return Ok(Sniffed::Empty);
    }
    match record::parse_header_line(&buf[..n]) {
        Ok(Some(line)) => Ok(Sniffed::Format(line.format)),
        Ok(None) => Ok(Sniffed::Partial),
        Err(_) => Err(StoreError::NotMailbox(path.to_path_buf())),
    }
}

/// Fill as much of `buf` as the file has from `offset` on.
fn read_at_most(file: &File, path: &Path, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(StoreError::io(path, e)),
        }
    }
    Ok(filled)
}

/// Move `len` bytes at `from` to `from - delta`, front to back.
fn shift_left(
    file: &File,
    path: &Path,
    from: u64,
    delta: u64,
    len: u64,
    buf: &mut [u8],
) -> Result<()> {
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(buf.len() as u64) as usize;
        file.read_exact_at(&mut buf[..n], from + done)
            .map_err(|e| StoreError::io(path, e))?;
        file.write_all_at(&buf[..n], from + done - delta)
            .map_err(|e| StoreError::io(path, e))?;
        done += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MediaType;
    use tempfile::TempDir;

    const DATE: &str = " 4-Jan-2024 10:00:00 +0100";

    fn message(subject: &str, body: &str) -> Vec<u8> {
        format!("From: Alice <alice@example.com>\r\nTo: bob@example.com\r\nSubject: {subject}\r\n\r\n{body}")
            .into_bytes()
    }

    fn record(flags: &str, text: &[u8]) -> Vec<u8> {
        let mut out = format!("{DATE},{};{flags}\r\n", text.len()).into_bytes();
        out.extend_from_slice(text);
        out
    }

    fn setup(records: &[Vec<u8>]) -> (TempDir, PathBuf, OpenOptions) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("INBOX");
        std::fs::write(&path, records.concat()).unwrap();
        let opts = OpenOptions::default().with_lock_dir(dir.path());
        (dir, path, opts)
    }

    fn open(path: &Path, opts: &OpenOptions) -> MailboxStore {
        let mut store = MailboxStore::open(path, opts.clone()).unwrap();
        store.ping().unwrap();
        store
    }

    fn flag_field(path: &Path, store: &MailboxStore, msgno: u32) -> String {
        let data = std::fs::read(path).unwrap();
        let pos = store.entry(msgno).unwrap().flags_position() as usize;
        String::from_utf8(data[pos..pos + record::FLAG_FIELD_WIDTH].to_vec()).unwrap()
    }

    #[test]
    fn test_open_does_not_parse() {
        let (_dir, path, opts) = setup(&[record("000000000000", &message("a", "x\r\n"))]);
        let mut store = MailboxStore::open(&path, opts).unwrap();
        assert_eq!(store.exists_count(), 0);
        assert_eq!(store.watermark(), 0);
        assert_eq!(store.format(), Some(RecordFormat::Mtx));
        assert_eq!(store.ping().unwrap(), 1);
        assert_eq!(store.exists_count(), 1);
    }

    #[test]
    fn test_open_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        assert!(matches!(
            MailboxStore::open(&missing, OpenOptions::default()),
            Err(StoreError::FileNotFound(_))
        ));

        let junk = dir.path().join("junk");
        std::fs::write(&junk, b"From someone Thu Jan  4 10:00:00 2024\n").unwrap();
        assert!(matches!(
            MailboxStore::open(&junk, OpenOptions::default().with_lock_dir(dir.path())),
            Err(StoreError::NotMailbox(_))
        ));

        let empty = dir.path().join("empty");
        std::fs::write(&empty, b"").unwrap();
        let strict = OpenOptions {
            allow_empty: false,
            ..OpenOptions::default().with_lock_dir(dir.path())
        };
        assert!(matches!(
            MailboxStore::open(&empty, strict),
            Err(StoreError::NotMailbox(_))
        ));
        let store = MailboxStore::open(&empty, OpenOptions::default()).unwrap();
        assert_eq!(store.format(), None);
    }

    #[test]
    fn test_recent_marks_old_on_disk() {
        let (_dir, path, opts) = setup(&[
            record("000000000000", &message("new", "x\r\n")),
            record("000000000021", &message("old", "y\r\n")),
        ]);
        let store = open(&path, &opts);
        assert_eq!(store.recent_count(), 1);
        assert!(store.entry(1).unwrap().recent);
        assert_eq!(flag_field(&path, &store, 1), "000000000020");
        drop(store);

        let store = open(&path, &opts);
        assert_eq!(store.recent_count(), 0);
    }

    #[test]
    fn test_readonly_does_not_write() {
        let (_dir, path, opts) = setup(&[record("000000000000", &message("a", "x\r\n"))]);
        let before = std::fs::read(&path).unwrap();
        let ro = OpenOptions {
            readonly: true,
            ..opts
        };
        let mut store = open(&path, &ro);
        assert_eq!(store.state(), StreamState::ReadOnly);
        assert_eq!(store.recent_count(), 1);
        store.fetch_text(1).unwrap();
        store
            .set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::FLAGGED))
            .unwrap();
        assert!(store.entry(1).unwrap().has(SystemFlags::SEEN | SystemFlags::FLAGGED));
        store.ping().unwrap();
        assert!(store.entry(1).unwrap().has(SystemFlags::SEEN | SystemFlags::FLAGGED));
        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(matches!(store.expunge(), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn test_shrunk_file_is_fatal() {
        let (_dir, path, opts) = setup(&[
            record("000000000020", &message("a", "x\r\n")),
            record("000000000020", &message("b", "y\r\n")),
        ]);
        let mut store = open(&path, &opts);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(10).unwrap();
        assert!(matches!(store.ping(), Err(StoreError::Corrupt { .. })));
        assert_eq!(store.state(), StreamState::Closed);
        assert!(matches!(store.fetch_text(1), Err(StoreError::Closed)));
    }

    #[test]
    fn test_bad_record_discards_partial_parse() {
        let mut data = record("000000000020", &message("a", "x\r\n"));
        data.extend_from_slice(b"not a header line\r\n");
        let (_dir, path, opts) = setup(&[data]);
        let mut store = MailboxStore::open(&path, opts).unwrap();
        assert!(matches!(store.ping(), Err(StoreError::Corrupt { .. })));
        assert_eq!(store.exists_count(), 0);
        assert_eq!(store.state(), StreamState::Closed);
    }

    #[test]
    fn test_record_in_progress_waits_for_writer() {
        let complete = record("000000000020", &message("a", "x\r\n"));
        let next = record("000000000020", &message("b", "y\r\n"));
        let (dir, path, opts) = setup(&[complete.clone(), next[..20].to_vec()]);
        let mut store = MailboxStore::open(&path, opts.clone()).unwrap();

        let writer = WriterLock::acquire(store.lock_path().to_path_buf()).unwrap();
        assert_eq!(store.ping().unwrap(), 1);
        assert_eq!(store.watermark(), complete.len() as u64);

        std::fs::write(&path, [complete, next].concat()).unwrap();
        drop(writer);
        assert_eq!(store.ping().unwrap(), 1);
        assert_eq!(store.exists_count(), 2);
        drop(dir);
    }

    #[test]
    fn test_truncated_record_without_writer_is_corrupt() {
        let next = record("000000000020", &message("b", "y\r\n"));
        let (_dir, path, opts) = setup(&[next[..next.len() - 2].to_vec()]);
        let mut store = MailboxStore::open(&path, opts).unwrap();
        assert!(matches!(store.ping(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_fetch_parts_and_seen() {
        let text = b"From: a@example.com\r\nSubject: parts\r\nMIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=xx\r\n\r\n--xx\r\nContent-Type: text/plain\r\n\r\nfirst\r\n--xx\r\nContent-Type: text/plain\r\nContent-Transfer-Encoding: base64\r\n\r\nc2Vjb25k\r\n--xx--\r\n";
        let (_dir, path, opts) = setup(&[record("000000000020", text)]);
        let mut store = open(&path, &opts);

        let body = store.fetch_body(1).unwrap();
        assert_eq!(body.media_type, MediaType::Multipart);
        assert_eq!(body.parts().len(), 2);
        assert!(!store.entry(1).unwrap().has(SystemFlags::SEEN));

        assert_eq!(store.fetch_body_part(1, "1").unwrap(), b"first");
        assert!(store.entry(1).unwrap().has(SystemFlags::SEEN));
        assert_eq!(flag_field(&path, &store, 1), "000000000021");

        assert_eq!(store.fetch_body_part(1, "2").unwrap(), b"c2Vjb25k");
        assert_eq!(store.fetch_body_part_decoded(1, "2").unwrap(), b"second");
        assert!(matches!(
            store.fetch_body_part(1, "3"),
            Err(StoreError::BadSection(_))
        ));

        let header = store.fetch_header(1).unwrap();
        assert!(header.ends_with(b"boundary=xx\r\n\r\n"));
        assert_eq!(store.fetch_envelope(1).unwrap().subject.as_deref(), Some("parts"));
    }

    #[test]
    fn test_multipart_section_does_not_set_seen() {
        let text = b"Content-Type: multipart/mixed; boundary=o\r\n\r\n--o\r\nContent-Type: multipart/alternative; boundary=i\r\n\r\n--i\r\n\r\ninner\r\n--i--\r\n--o--\r\n";
        let (_dir, path, opts) = setup(&[record("000000000020", text)]);
        let mut store = open(&path, &opts);
        store.fetch_body_part(1, "1").unwrap();
        assert!(!store.entry(1).unwrap().has(SystemFlags::SEEN));
        assert_eq!(store.fetch_body_part(1, "1.1").unwrap(), b"inner");
        assert!(store.entry(1).unwrap().has(SystemFlags::SEEN));
    }

    #[test]
    fn test_keywords_written_to_flag_field() {
        let (_dir, path, mut opts) = setup(&[record("000000000020", &message("a", "x\r\n"))]);
        opts.keywords = vec!["Work".to_string()];
        let mut store = open(&path, &opts);

        let flags = FlagSet::parse("(\\Flagged Home)").unwrap();
        store.set_flags(&SequenceSet::single(1), &flags).unwrap();
        assert_eq!(store.keywords(), ["Work", "Home"]);
        assert_eq!(flag_field(&path, &store, 1), "200000000024");
        assert_eq!(store.flags(1).unwrap().keywords, vec!["Home"]);

        store.clear_flags(&SequenceSet::single(1), &flags).unwrap();
        assert_eq!(flag_field(&path, &store, 1), "000000000020");
    }

    #[test]
    fn test_expunge_compacts_in_chunks() {
        let msgs: Vec<Vec<u8>> = (0..5)
            .map(|i| message(&format!("m{i}"), &"body line\r\n".repeat(i + 1)))
            .collect();
        let records: Vec<Vec<u8>> = msgs.iter().map(|m| record("000000000020", m)).collect();
        let (_dir, path, mut opts) = setup(&records);
        opts.copy_chunk_size = 7;
        let mut store = open(&path, &opts);

        let deleted = FlagSet::new(SystemFlags::DELETED);
        store.set_flags(&"2,4".parse().unwrap(), &deleted).unwrap();
        assert_eq!(store.expunge().unwrap(), vec![2, 4]);

        assert_eq!(store.exists_count(), 3);
        for (msgno, original) in [(1, 0), (2, 2), (3, 4)] {
            assert_eq!(store.fetch_message(msgno).unwrap(), msgs[original]);
        }
        let expected_len = records[0].len() + records[2].len() + records[4].len();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected_len as u64);
        assert_eq!(store.watermark(), expected_len as u64);

        drop(store);
        let reopened = open(&path, &opts);
        assert_eq!(reopened.exists_count(), 3);
    }

    #[test]
    fn test_expunge_needs_sole_access() {
        let (_dir, path, opts) = setup(&[record("000000000020", &message("a", "x\r\n"))]);
        let mut store = open(&path, &opts);
        store
            .set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::DELETED))
            .unwrap();

        let other = open(&path, &OpenOptions { readonly: true, ..opts.clone() });
        assert!(matches!(
            store.expunge(),
            Err(StoreError::Lock(LockError::InUse(_)))
        ));
        drop(other);

        let writer = WriterLock::acquire(store.lock_path().to_path_buf()).unwrap();
        assert!(matches!(
            store.expunge(),
            Err(StoreError::Lock(LockError::Busy(_)))
        ));
        drop(writer);

        assert_eq!(store.expunge().unwrap(), vec![1]);
        assert_eq!(store.exists_count(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_expunge_reports_torn_record() {
        use std::io::Write;

        let (_dir, path, opts) = setup(&[
            record("000000000020", &message("a", "x\r\n")),
            record("000000000020", &message("b", "y\r\n")),
        ]);
        let mut store = open(&path, &opts);
        store
            .set_flags(&SequenceSet::single(1), &FlagSet::new(SystemFlags::DELETED))
            .unwrap();

        let torn = record("000000000000", &message("c", "z\r\n"));
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&torn[..torn.len() - 5])
            .unwrap();
        let before = std::fs::read(&path).unwrap();

        assert!(matches!(store.expunge(), Err(StoreError::Corrupt { .. })));
        assert_eq!(store.state(), StreamState::Closed);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_append_and_append_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("box");
        MailboxStore::create(&path).unwrap();
        assert!(matches!(
            MailboxStore::create(&path),
            Err(StoreError::AlreadyExists(_))
        ));
        let opts = OpenOptions {
            create_format: RecordFormat::Tenex,
            ..OpenOptions::default().with_lock_dir(dir.path())
        };

        let mut store = open(&path, &opts);
        MailboxStore::append_to(&path, &message("one", "1\n"), &FlagSet::default(), None, &opts)
            .unwrap();
        assert_eq!(store.exists_count(), 0);
        assert_eq!(store.ping().unwrap(), 1);
        assert_eq!(store.format(), Some(RecordFormat::Tenex));

        let flags = FlagSet::new(SystemFlags::SEEN).with_keyword("Later");
        store.append(&message("two", "2\n"), &flags, None).unwrap();
        assert_eq!(store.exists_count(), 2);
        assert_eq!(store.flags(2).unwrap(), flags);
        assert!(store.entry(2).unwrap().recent);
        assert_eq!(store.fetch_message(2).unwrap(), message("two", "2\n"));
    }

    #[test]
    fn test_copy_and_move() {
        let (dir, path, opts) = setup(&[
            record("000000000021", &message("a", "x\r\n")),
            record("000000000024", &message("b", "y\r\n")),
        ]);
        let dest = dir.path().join("Archive");
        MailboxStore::create(&dest).unwrap();

        let mut store = open(&path, &opts);
        assert_eq!(store.move_to(&SequenceSet::all(), &dest).unwrap(), 2);
        assert!(store.entry(1).unwrap().has(SystemFlags::DELETED));

        let mut archive = open(&dest, &opts);
        assert_eq!(archive.exists_count(), 2);
        assert_eq!(archive.recent_count(), 2);
        assert_eq!(archive.flags(1).unwrap().system, SystemFlags::SEEN);
        assert_eq!(archive.flags(2).unwrap().system, SystemFlags::FLAGGED);
        assert_eq!(
            archive.entry(1).unwrap().internal_date,
            store.entry(1).unwrap().internal_date
        );
        assert_eq!(archive.fetch_message(2).unwrap(), message("b", "y\r\n"));
        assert_eq!(archive.format(), Some(RecordFormat::Mtx));
    }

    #[test]
    fn test_no_such_message() {
        let (_dir, path, opts) = setup(&[record("000000000020", &message("a", "x\r\n"))]);
        let mut store = open(&path, &opts);
        assert!(matches!(store.fetch_text(0), Err(StoreError::NoSuchMessage(0))));
        assert!(matches!(store.fetch_text(2), Err(StoreError::NoSuchMessage(2))));
        assert!(matches!(
            store.set_flags(&"1:3".parse().unwrap(), &FlagSet::new(SystemFlags::SEEN)),
            Err(StoreError::NoSuchMessage(3))
        ));
        store.close();
        store.close();
        assert_eq!(store.state(), StreamState::Closed);
    }
}
