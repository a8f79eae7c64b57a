//! Per-stream message state: one [`MessageEntry`] per record, the keyword
//! table, and an LRU cache of parsed messages.

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use lru::LruCache;
use serde::Serialize;
use tracing::warn;

use super::record::{keyword_bit, MAX_KEYWORDS};
use crate::error::{Result, StoreError};
use crate::model::{is_keyword_atom, Body, Envelope, FlagSet, SystemFlags};

/// What the store knows about one record without parsing its text.
#[derive(Debug, Clone, Serialize)]
pub struct MessageEntry {
    /// Unique for the lifetime of the stream; survives renumbering.
    pub id: u64,
    /// Start of the record (its internal header line) in the file.
    pub record_offset: u64,
    /// Length of the internal header line, i.e. where the text starts in the record.
    pub text_offset: u64,
    /// Where the flag field starts in the record.
    pub flags_offset: u64,
    /// Byte count of the message text.
    pub size: u64,
    pub internal_date: DateTime<FixedOffset>,
    pub system: SystemFlags,
    pub user: u32,
    /// New to this session.
    pub recent: bool,
    /// Length of the RFC822 header, once something has looked at it.
    pub header_size: Option<u64>,
    /// Flags changed in memory on a read-only stream; never reloaded from disk.
    #[serde(skip)]
    pub local_flags: bool,
}

impl MessageEntry {
    /// File position of the message text.
    pub fn text_start(&self) -> u64 {
        self.record_offset + self.text_offset
    }

    /// File position of the flag field.
    pub fn flags_position(&self) -> u64 {
        self.record_offset + self.flags_offset
    }

    /// Header line plus text.
    pub fn record_len(&self) -> u64 {
        self.text_offset + self.size
    }

    pub fn has(&self, flag: SystemFlags) -> bool {
        self.system.contains(flag)
    }
}

/// Names of the user keywords, by slot.
///
/// Slots are handed out first come first served and never reused while
/// the stream is open.
#[derive(Debug, Clone, Default)]
pub struct KeywordTable {
    names: Vec<String>,
}

impl KeywordTable {
    /// A table whose first slots are the configured keywords.
    pub fn new(seed: &[String]) -> Self {
        let mut table = Self::default();
        for name in seed {
            if let Err(e) = table.assign(name) {
                warn!(keyword = %name, error = %e, "Ignoring configured keyword");
            }
        }
        table
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Slot of an existing keyword, case-insensitively.
    pub fn slot(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n.eq_ignore_ascii_case(name))
    }

    /// Slot of `name`, assigning a new one if needed.
    pub fn assign(&mut self, name: &str) -> Result<usize> {
        if let Some(slot) = self.slot(name) {
            return Ok(slot);
        }
        if !is_keyword_atom(name) {
            return Err(StoreError::BadFlag(name.to_string()));
        }
        if self.names.len() >= MAX_KEYWORDS {
            return Err(StoreError::TooManyKeywords(MAX_KEYWORDS));
        }
        self.names.push(name.to_string());
        Ok(self.names.len() - 1)
    }

    /// User mask for `names`, assigning slots to new keywords.
    pub fn mask_for(&mut self, names: &[String]) -> Result<u32> {
        names
            .iter()
            .try_fold(0, |mask, name| Ok(mask | keyword_bit(self.assign(name)?)))
    }

    /// User mask of the keywords that already have slots; others are ignored.
    pub fn known_mask(&self, names: &[String]) -> u32 {
        names
            .iter()
            .filter_map(|name| self.slot(name))
            .fold(0, |mask, slot| mask | keyword_bit(slot))
    }

    /// Keyword names set in `mask`, in slot order.
    pub fn decode(&self, mask: u32) -> Vec<String> {
        self.names
            .iter()
            .enumerate()
            .filter(|(slot, _)| mask & keyword_bit(*slot) != 0)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// The flags of an entry as a user-visible flag list.
    pub fn flag_set(&self, entry: &MessageEntry) -> FlagSet {
        FlagSet {
            system: entry.system - SystemFlags::OLD,
            keywords: self.decode(entry.user),
        }
    }
}

/// A parsed message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub envelope: Envelope,
    pub body: Body,
}

/// Parsed messages keyed by [`MessageEntry::id`].
pub struct MessageCache {
    inner: LruCache<u64, Arc<ParsedMessage>>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    pub fn get(&mut self, id: u64) -> Option<Arc<ParsedMessage>> {
        self.inner.get(&id).cloned()
    }

    pub fn put(&mut self, id: u64, parsed: ParsedMessage) -> Arc<ParsedMessage> {
        let parsed = Arc::new(parsed);
        self.inner.put(id, Arc::clone(&parsed));
        parsed
    }

    pub fn invalidate(&mut self, id: u64) {
        self.inner.pop(&id);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
