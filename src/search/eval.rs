//! Criteria compiled to predicates over one message at a time.

use std::sync::Arc;

use chrono::Datelike;
use memchr::memmem;

use super::query::{date_ordinal, Criterion};
use crate::codec;
use crate::error::Result;
use crate::model::{Address, MediaType, SystemFlags};
use crate::parser::address::address_list_to_string;
use crate::parser::header::{decode_charset, decode_encoded_words, decode_header_bytes, unfold_headers};
use crate::parser::RawMessage;
use crate::store::{MailboxStore, MessageEntry, ParsedMessage};

/// A compiled criterion.
pub type Predicate = Box<dyn Fn(&mut MessageView<'_>) -> Result<bool>>;

/// One message under evaluation. Text and structure are loaded on first
/// use and shared by every predicate; nothing here changes flags.
pub struct MessageView<'a> {
    store: &'a mut MailboxStore,
    msgno: u32,
    raw: Option<RawMessage>,
    parsed: Option<Arc<ParsedMessage>>,
    headers: Option<Vec<(String, String)>>,
}

impl<'a> MessageView<'a> {
    pub fn new(store: &'a mut MailboxStore, msgno: u32) -> Self {
        Self {
            store,
            msgno,
            raw: None,
            parsed: None,
            headers: None,
        }
    }

    pub fn msgno(&self) -> u32 {
        self.msgno
    }

    fn entry(&self) -> Result<&MessageEntry> {
        self.store.entry(self.msgno)
    }

    fn has(&self, flag: SystemFlags) -> Result<bool> {
        Ok(self.entry()?.has(flag))
    }

    fn has_keyword(&self, name: &str) -> Result<bool> {
        let user = self.entry()?.user;
        Ok(self.store.keyword_bit(name).is_some_and(|bit| user & bit != 0))
    }

    fn raw(&mut self) -> Result<&RawMessage> {
        let raw = match self.raw.take() {
            Some(raw) => raw,
            None => self.store.raw_message(self.msgno)?,
        };
        Ok(&*self.raw.insert(raw))
    }

    fn parsed(&mut self) -> Result<Arc<ParsedMessage>> {
        if let Some(parsed) = &self.parsed {
            return Ok(Arc::clone(parsed));
        }
        let parsed = self.store.parsed(self.msgno)?;
        self.parsed = Some(Arc::clone(&parsed));
        Ok(parsed)
    }

    fn headers(&mut self) -> Result<&[(String, String)]> {
        let headers = match self.headers.take() {
            Some(headers) => headers,
            None => unfold_headers(&decode_header_bytes(&self.raw()?.header)),
        };
        Ok(self.headers.insert(headers).as_slice())
    }
}

fn predicate<F>(f: F) -> Predicate
where
    F: Fn(&mut MessageView<'_>) -> Result<bool> + 'static,
{
    Box::new(f)
}

fn flag(bit: SystemFlags, set: bool) -> Predicate {
    predicate(move |view: &mut MessageView<'_>| Ok(view.has(bit)? == set))
}

/// Compile one criterion.
pub fn compile(criterion: Criterion) -> Predicate {
    match criterion {
        Criterion::All => predicate(|_: &mut MessageView<'_>| Ok(true)),
        Criterion::Answered => flag(SystemFlags::ANSWERED, true),
        Criterion::Unanswered => flag(SystemFlags::ANSWERED, false),
        Criterion::Deleted => flag(SystemFlags::DELETED, true),
        Criterion::Undeleted => flag(SystemFlags::DELETED, false),
        Criterion::Draft => flag(SystemFlags::DRAFT, true),
        Criterion::Undraft => flag(SystemFlags::DRAFT, false),
        Criterion::Flagged => flag(SystemFlags::FLAGGED, true),
        Criterion::Unflagged => flag(SystemFlags::FLAGGED, false),
        Criterion::Seen => flag(SystemFlags::SEEN, true),
        Criterion::Unseen => flag(SystemFlags::SEEN, false),
        Criterion::New => predicate(|view: &mut MessageView<'_>| {
            Ok(view.entry()?.recent && !view.has(SystemFlags::SEEN)?)
        }),
        Criterion::Old => predicate(|view: &mut MessageView<'_>| Ok(!view.entry()?.recent)),
        Criterion::Recent => predicate(|view: &mut MessageView<'_>| Ok(view.entry()?.recent)),
        Criterion::Keyword(name) => {
            predicate(move |view: &mut MessageView<'_>| view.has_keyword(&name))
        }
        Criterion::Unkeyword(name) => {
            predicate(move |view: &mut MessageView<'_>| Ok(!view.has_keyword(&name)?))
        }
        Criterion::Before(day) => internal_date(move |d| d < day),
        Criterion::On(day) => internal_date(move |d| d == day),
        Criterion::Since(day) => internal_date(move |d| d >= day),
        Criterion::SentBefore(day) => sent_date(move |d| d < day),
        Criterion::SentOn(day) => sent_date(move |d| d == day),
        Criterion::SentSince(day) => sent_date(move |d| d >= day),
        Criterion::Larger(n) => predicate(move |view: &mut MessageView<'_>| Ok(view.entry()?.size > n)),
        Criterion::Smaller(n) => predicate(move |view: &mut MessageView<'_>| Ok(view.entry()?.size < n)),
        Criterion::From(s) => address(s, |p| &p.envelope.from),
        Criterion::To(s) => address(s, |p| &p.envelope.to),
        Criterion::Cc(s) => address(s, |p| &p.envelope.cc),
        Criterion::Bcc(s) => address(s, |p| &p.envelope.bcc),
        Criterion::Subject(s) => {
            let needle = s.to_lowercase();
            predicate(move |view: &mut MessageView<'_>| {
                let parsed = view.parsed()?;
                let envelope = &parsed.envelope;
                Ok(envelope
                    .subject
                    .as_deref()
                    .is_some_and(|raw| contains(raw, &needle))
                    || envelope
                        .decoded_subject()
                        .is_some_and(|decoded| contains(&decoded, &needle)))
            })
        }
        Criterion::Body(s) => {
            let needle = s.to_lowercase();
            predicate(move |view: &mut MessageView<'_>| body_matches(view, &needle))
        }
        Criterion::Text(s) => {
            let needle = s.to_lowercase();
            predicate(move |view: &mut MessageView<'_>| {
                if bytes_contain(&view.raw()?.header, needle.as_bytes()) {
                    return Ok(true);
                }
                body_matches(view, &needle)
            })
        }
        Criterion::Header(name, s) => {
            let needle = s.to_lowercase();
            predicate(move |view: &mut MessageView<'_>| {
                Ok(view
                    .headers()?
                    .iter()
                    .filter(|(field, _)| field.eq_ignore_ascii_case(&name))
                    .any(|(_, value)| {
                        contains(value, &needle) || contains(&decode_encoded_words(value), &needle)
                    }))
            })
        }
    }
}

/// Whether every predicate holds, stopping at the first that does not.
pub fn matches_all(predicates: &[Predicate], view: &mut MessageView<'_>) -> Result<bool> {
    for p in predicates {
        if !p(view)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn internal_date(test: impl Fn(u32) -> bool + 'static) -> Predicate {
    predicate(move |view: &mut MessageView<'_>| {
        let date = view.entry()?.internal_date;
        Ok(test(date_ordinal(date.year() as u32, date.month(), date.day())))
    })
}

fn sent_date(test: impl Fn(u32) -> bool + 'static) -> Predicate {
    predicate(move |view: &mut MessageView<'_>| {
        let parsed = view.parsed()?;
        Ok(parsed
            .envelope
            .parsed_date
            .is_some_and(|d| test(date_ordinal(d.year() as u32, d.month(), d.day()))))
    })
}

fn address(
    needle: String,
    field: impl Fn(&ParsedMessage) -> &Vec<Address> + 'static,
) -> Predicate {
    let needle = needle.to_lowercase();
    predicate(move |view: &mut MessageView<'_>| {
        let parsed = view.parsed()?;
        let rendered = address_list_to_string(field(&parsed));
        Ok(contains(&rendered, &needle) || contains(&decode_encoded_words(&rendered), &needle))
    })
}

/// Search the raw body, then the text leaves with transfer encoding and
/// charset removed.
fn body_matches(view: &mut MessageView<'_>, needle: &str) -> Result<bool> {
    if bytes_contain(&view.raw()?.body, needle.as_bytes()) {
        return Ok(true);
    }
    let parsed = view.parsed()?;
    let body = &view.raw()?.body;

    let mut found = false;
    parsed.body.for_each_leaf(&mut |leaf| {
        if found || leaf.body.media_type != MediaType::Text {
            return;
        }
        let start = leaf.start.min(body.len());
        let end = (leaf.start + leaf.body.size.bytes).min(body.len());
        if let Ok(decoded) = codec::decode_body(&leaf.body.encoding, &body[start..end]) {
            let charset = leaf.body.param("charset").unwrap_or("us-ascii");
            found = contains(&decode_charset(charset, &decoded), needle);
        }
    });
    Ok(found)
}

/// Case-insensitive substring test; `needle` is already lowercase.
fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

/// ASCII case-insensitive byte substring test; `needle` is already lowercase.
fn bytes_contain(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    memmem::find(&haystack.to_ascii_lowercase(), needle).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_helpers() {
        assert!(contains("Hello World", "world"));
        assert!(contains("ÉCOLE", "école"));
        assert!(!contains("abc", "abd"));
        assert!(bytes_contain(b"Some BODY text\r\n", b"body"));
        assert!(bytes_contain(b"", b""));
        assert!(!bytes_contain(b"short", b"longer"));
    }
}
