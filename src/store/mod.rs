//! The single-file, append-only mailbox store.
//!
//! A mailbox is a sequence of records, each an internal header line
//! ([`record`]) followed by the RFC822 text. [`MailboxStore`] parses the
//! file incrementally, caches what it learns per message ([`cache`]), and
//! mutates the file under the locking discipline in [`lock`].

pub mod cache;
pub mod driver;
pub mod lock;
pub mod mailbox;
pub mod record;

use std::path::PathBuf;

use crate::parser::ParseContext;

pub use cache::{KeywordTable, MessageEntry, ParsedMessage};
pub use driver::MailboxDriver;
pub use mailbox::MailboxStore;
pub use record::{RecordFormat, FLAG_FIELD_WIDTH, MAX_KEYWORDS};

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    ReadOnly,
    ReadWrite,
}

/// How a mailbox is opened. Built from [`crate::config::Config::open_options`]
/// or by hand.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Never write to the file; flag changes stay in memory.
    pub readonly: bool,
    /// Treat an empty file as a valid, empty mailbox.
    pub allow_empty: bool,
    /// Variant used for the first record written into an empty mailbox.
    pub create_format: RecordFormat,
    /// Where writer lock files live; the system temp dir when `None`.
    pub lock_dir: Option<PathBuf>,
    /// Keywords given the first user flag slots.
    pub keywords: Vec<String>,
    /// Parser settings for fetched messages.
    pub context: ParseContext,
    /// Parsed messages kept in memory.
    pub cache_size: usize,
    /// Buffer size used to move records during expunge.
    pub copy_chunk_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            readonly: false,
            allow_empty: true,
            create_format: RecordFormat::Mtx,
            lock_dir: None,
            keywords: Vec::new(),
            context: ParseContext::default(),
            cache_size: 50,
            copy_chunk_size: 64 * 1024,
        }
    }
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            readonly: true,
            ..Self::default()
        }
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub(crate) fn resolved_lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
