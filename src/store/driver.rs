use std::path::Path;

use chrono::{DateTime, FixedOffset};

use super::{MailboxStore, OpenOptions};
use crate::error::Result;
use crate::model::{Body, Envelope, FlagSet, SequenceSet};

/// The operations a mailbox format offers to the layers above it.
///
/// Message numbers are 1-based and contiguous. A new driver sees no
/// messages until its first [`ping`](MailboxDriver::ping).
pub trait MailboxDriver {
    fn open(path: &Path, options: OpenOptions) -> Result<Self>
    where
        Self: Sized;

    /// Release the file and every lock. Idempotent.
    fn close(&mut self);

    /// Pick up messages appended since the last call; returns how many.
    fn ping(&mut self) -> Result<u32>;

    fn exists_count(&self) -> u32;

    fn recent_count(&self) -> u32;

    fn fetch_envelope(&mut self, msgno: u32) -> Result<Envelope>;

    fn fetch_body(&mut self, msgno: u32) -> Result<Body>;

    /// The RFC822 header block, blank line included.
    fn fetch_header(&mut self, msgno: u32) -> Result<Vec<u8>>;

    /// The text after the header. Sets `\Seen`.
    fn fetch_text(&mut self, msgno: u32) -> Result<Vec<u8>>;

    /// Content of a body part named by a section such as `"2.1"`. Sets
    /// `\Seen` unless the part is a multipart.
    fn fetch_body_part(&mut self, msgno: u32, section: &str) -> Result<Vec<u8>>;

    fn set_flags(&mut self, sequence: &SequenceSet, flags: &FlagSet) -> Result<()>;

    fn clear_flags(&mut self, sequence: &SequenceSet, flags: &FlagSet) -> Result<()>;

    /// Message numbers matching every criterion, ascending.
    fn search(&mut self, criteria: &str) -> Result<Vec<u32>>;

    /// Remove messages marked `\Deleted`; returns their former numbers.
    fn expunge(&mut self) -> Result<Vec<u32>>;

    fn append(
        &mut self,
        message: &[u8],
        flags: &FlagSet,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<()>;
}

impl MailboxDriver for MailboxStore {
    fn open(path: &Path, options: OpenOptions) -> Result<Self> {
        MailboxStore::open(path, options)
    }

    fn close(&mut self) {
        MailboxStore::close(self)
    }

    fn ping(&mut self) -> Result<u32> {
        MailboxStore::ping(self)
    }

    fn exists_count(&self) -> u32 {
        MailboxStore::exists_count(self)
    }

    fn recent_count(&self) -> u32 {
        MailboxStore::recent_count(self)
    }

    fn fetch_envelope(&mut self, msgno: u32) -> Result<Envelope> {
        MailboxStore::fetch_envelope(self, msgno)
    }

    fn fetch_body(&mut self, msgno: u32) -> Result<Body> {
        MailboxStore::fetch_body(self, msgno)
    }

    fn fetch_header(&mut self, msgno: u32) -> Result<Vec<u8>> {
        MailboxStore::fetch_header(self, msgno)
    }

    fn fetch_text(&mut self, msgno: u32) -> Result<Vec<u8>> {
        MailboxStore::fetch_text(self, msgno)
    }

    fn fetch_body_part(&mut self, msgno: u32, section: &str) -> Result<Vec<u8>> {
        MailboxStore::fetch_body_part(self, msgno, section)
    }

    fn set_flags(&mut self, sequence: &SequenceSet, flags: &FlagSet) -> Result<()> {
        MailboxStore::set_flags(self, sequence, flags)
    }

    fn clear_flags(&mut self, sequence: &SequenceSet, flags: &FlagSet) -> Result<()> {
        MailboxStore::clear_flags(self, sequence, flags)
    }

    fn search(&mut self, criteria: &str) -> Result<Vec<u32>> {
        MailboxStore::search(self, criteria)
    }

    fn expunge(&mut self) -> Result<Vec<u32>> {
        MailboxStore::expunge(self)
    }

    fn append(
        &mut self,
        message: &[u8],
        flags: &FlagSet,
        date: Option<DateTime<FixedOffset>>,
    ) -> Result<()> {
        MailboxStore::append(self, message, flags, date)
    }
}
