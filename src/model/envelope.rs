//! Message envelope: the structured standard header fields.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use super::address::Address;

/// Structured view of a message's standard headers.
///
/// Built once by the message parser and never mutated afterwards.
/// String fields hold the header text as it appeared (whitespace runs
/// collapsed); RFC 2047 encoded-words are left encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Raw `Date:` value.
    pub date: Option<String>,
    /// `Date:` parsed into its components, if it could be.
    pub parsed_date: Option<DateTime<FixedOffset>>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    /// Defaults to a copy of `from` when absent.
    pub sender: Vec<Address>,
    /// Defaults to a copy of `from` when absent.
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    /// Parsed but never written back out.
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
    pub newsgroups: Option<String>,
    pub followup_to: Option<String>,
    pub references: Option<String>,
}

impl Envelope {
    /// Subject with RFC 2047 encoded-words decoded, for display.
    pub fn decoded_subject(&self) -> Option<String> {
        self.subject
            .as_deref()
            .map(crate::parser::header::decode_encoded_words)
    }

    /// First `From` address, if any.
    pub fn first_from(&self) -> Option<&Address> {
        self.from.first()
    }
}
