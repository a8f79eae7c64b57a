//! Centralized error types for mtxbox.
//!
//! Parser and codec errors are plain values so they can be logged and
//! recovered from locally; [`StoreError`] is what crosses the public API.

use std::path::PathBuf;
use thiserror::Error;

/// Malformed header, address or MIME syntax.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A quoted string ran to the end of input.
    #[error("unterminated quoted string at offset {offset}")]
    UnterminatedQuote { offset: usize },

    /// A comment ran to the end of input.
    #[error("unterminated comment at offset {offset}")]
    UnterminatedComment { offset: usize },

    /// A domain literal (`[...]`) ran to the end of input.
    #[error("unterminated domain literal at offset {offset}")]
    UnterminatedLiteral { offset: usize },

    /// A route-addr was opened with `<` but never closed.
    #[error("unterminated route address at offset {offset}")]
    UnterminatedRoute { offset: usize },

    /// Something other than `,`, `;` or end of input followed an address.
    #[error("junk after address: {0:?}")]
    TrailingJunk(String),

    /// A MIME parameter had a name but no `=value`.
    #[error("missing value for parameter '{0}'")]
    MissingParameterValue(String),

    /// A syntactic element was expected but not found.
    #[error("expected {expected} at offset {offset}")]
    Expected {
        expected: &'static str,
        offset: usize,
    },

    /// A multipart or message body declared an encoding containers may not use.
    #[error("{container} body may not use {encoding} transfer encoding")]
    EncodedContainer {
        container: String,
        encoding: String,
    },

    /// MIME nesting exceeded the configured depth.
    #[error("MIME structure nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Malformed transfer-encoded content.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Base64 input did not divide into complete quanta.
    #[error("base64 input is not a whole number of quanta ({0} significant characters)")]
    InvalidLength(usize),

    /// A byte outside the base64 alphabet.
    #[error("invalid base64 byte 0x{byte:02x} at offset {offset}")]
    InvalidByte { byte: u8, offset: usize },

    /// `=` found somewhere other than the tail of the final quantum.
    #[error("misplaced base64 padding at offset {offset}")]
    MisplacedPadding { offset: usize },
}

/// Failure to take or release one of the mailbox locks.
#[derive(Error, Debug)]
pub enum LockError {
    /// The lock syscall itself failed.
    #[error("lock error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Another stream holds the mailbox open, so exclusive access is impossible.
    #[error("mailbox '{0}' is in use by another process")]
    InUse(PathBuf),

    /// Another writer currently holds the append/expunge lock.
    #[error("mailbox '{0}' is being written by another process")]
    Busy(PathBuf),
}

/// Malformed search criteria.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// A token that is not a known criterion.
    #[error("unknown search criterion: {0}")]
    UnknownCriterion(String),

    /// A criterion that needs an argument was last in the list.
    #[error("missing argument to {0}")]
    MissingArgument(String),

    /// A date argument not in `d-Mon-yyyy` form.
    #[error("invalid search date: {0}")]
    BadDate(String),

    /// A size argument that is not a number.
    #[error("invalid number: {0}")]
    BadNumber(String),

    /// A quoted string ran to the end of the criteria.
    #[error("unterminated quoted string in search criteria")]
    UnterminatedQuote,
}

/// All errors produced by the mailbox store and surfaced to callers.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The specified mailbox does not exist.
    #[error("mailbox not found: {0}")]
    FileNotFound(PathBuf),

    /// `create` was asked to make a mailbox that already exists.
    #[error("mailbox already exists: {0}")]
    AlreadyExists(PathBuf),

    /// The file does not start with a valid internal header line.
    #[error("not a valid mailbox: {0}")]
    NotMailbox(PathBuf),

    /// The mailbox changed underneath us or has a malformed record.
    /// The stream is closed and must be reopened.
    #[error("mailbox '{path}' is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// One of the mailbox locks could not be obtained.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A mutation was attempted on a read-only stream.
    #[error("mailbox is open read-only")]
    ReadOnly,

    /// The stream has been closed.
    #[error("mailbox stream is closed")]
    Closed,

    /// A message number outside `1..=exists`.
    #[error("no such message: {0}")]
    NoSuchMessage(u32),

    /// A body section that does not name a part of the message.
    #[error("invalid body section: {0}")]
    BadSection(String),

    /// A sequence set that could not be parsed.
    #[error("invalid sequence set: {0}")]
    BadSequence(String),

    /// A flag list that could not be parsed.
    #[error("invalid flag: {0}")]
    BadFlag(String),

    /// The keyword table has no free slot.
    #[error("too many keywords (at most {0})")]
    TooManyKeywords(usize),

    /// A hard message parse failure.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A hard content decoding failure.
    #[error("decode error: {0}")]
    Codec(#[from] CodecError),

    /// Invalid search criteria.
    #[error(transparent)]
    Search(#[from] SearchError),
}

/// Convenience alias for `Result<T, StoreError>`.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `Corrupt` variant.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error invalidated the stream that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Closed)
    }
}

impl LockError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
