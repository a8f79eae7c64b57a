//! RFC822/MIME parsing: addresses, Content-* headers, envelopes and body trees.
//!
//! Everything here is pure: functions take byte slices and a [`ParseContext`]
//! and never touch the filesystem. The one exception is [`mbox`], a streaming
//! reader over Unix mbox files used by the import command.

pub mod address;
pub mod content;
pub mod header;
pub mod lexer;
pub mod mbox;
pub mod message;

use std::borrow::Cow;

use crate::error::ParseError;
use crate::model::{Body, Envelope};

pub use message::{header_length, parse_message, split_message};

/// Default limit on MIME nesting.
pub const MAX_DEPTH: usize = 20;

/// Settings shared by every parse call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseContext {
    /// Host given to addresses that have none.
    pub default_host: String,
    /// Deepest multipart/message nesting accepted.
    pub max_depth: usize,
}

impl Default for ParseContext {
    fn default() -> Self {
        Self {
            default_host: "localhost".to_string(),
            max_depth: MAX_DEPTH,
        }
    }
}

/// Anything that can hand over a message as raw header and body bytes.
pub trait RawMessageSource {
    /// The header block, including the terminating blank line.
    fn raw_header(&self) -> Cow<'_, [u8]>;
    /// Everything after the header block.
    fn raw_body(&self) -> Cow<'_, [u8]>;
}

/// An owned message split into header and body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl RawMessage {
    /// Split a complete RFC822 message at its first blank line.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let (header, body) = split_message(bytes);
        Self {
            header: header.to_vec(),
            body: body.to_vec(),
        }
    }

    /// Header and body joined back together.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.body.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.body);
        out
    }
}

impl RawMessageSource for RawMessage {
    fn raw_header(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.header)
    }

    fn raw_body(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.body)
    }
}

/// Parse the envelope and body of any message source.
pub fn parse_source<S: RawMessageSource + ?Sized>(
    source: &S,
    ctx: &ParseContext,
) -> Result<(Envelope, Body), ParseError> {
    let header = source.raw_header();
    let body = source.raw_body();
    let (envelope, parsed) = parse_message(&header, Some(&body), ctx)?;
    let body = parsed.unwrap_or_else(|| Body::new(crate::model::MediaType::Text));
    Ok((envelope, body))
}
