//! Search criteria parser.
//!
//! Parses a criteria string such as `UNSEEN FROM "alice" SINCE 1-Jan-2024`
//! into a list of [`Criterion`] values, all of which must hold.
//!
//! # Supported criteria
//!
//! - Flags: `ALL`, `ANSWERED`, `DELETED`, `DRAFT`, `FLAGGED`, `NEW`, `OLD`,
//!   `RECENT`, `SEEN`, and the `UN`- forms `UNANSWERED`, `UNDELETED`,
//!   `UNDRAFT`, `UNFLAGGED`, `UNSEEN`
//! - Keywords: `KEYWORD name`, `UNKEYWORD name`
//! - Internal date: `BEFORE d`, `ON d`, `SINCE d`
//! - Date header: `SENTBEFORE d`, `SENTON d`, `SENTSINCE d`
//! - Size: `LARGER n`, `SMALLER n`
//! - Text: `FROM s`, `TO s`, `CC s`, `BCC s`, `SUBJECT s`, `BODY s`,
//!   `TEXT s`, `HEADER name s`
//!
//! Dates are `d-Mon-yyyy`. Strings are atoms or double-quoted with
//! backslash escapes. Keywords are case-insensitive.

use crate::error::SearchError;

/// One search criterion. Dates are day ordinals, see [`date_ordinal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    All,
    Answered,
    Unanswered,
    Deleted,
    Undeleted,
    Draft,
    Undraft,
    Flagged,
    Unflagged,
    Seen,
    Unseen,
    /// Recent and not seen.
    New,
    /// Not recent.
    Old,
    Recent,
    Keyword(String),
    Unkeyword(String),
    Before(u32),
    On(u32),
    Since(u32),
    SentBefore(u32),
    SentOn(u32),
    SentSince(u32),
    Larger(u64),
    Smaller(u64),
    From(String),
    To(String),
    Cc(String),
    Bcc(String),
    Subject(String),
    Body(String),
    Text(String),
    Header(String, String),
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Parse a criteria string. The first unknown token fails the whole parse.
pub fn parse_criteria(input: &str) -> Result<Vec<Criterion>, SearchError> {
    let tokens = tokenize(input)?;
    let mut tokens = tokens.into_iter();
    let mut criteria = Vec::new();

    while let Some(token) = tokens.next() {
        let name = token.to_ascii_uppercase();
        let mut arg = || {
            tokens
                .next()
                .ok_or_else(|| SearchError::MissingArgument(name.clone()))
        };
        let criterion = match name.as_str() {
            "ALL" => Criterion::All,
            "ANSWERED" => Criterion::Answered,
            "UNANSWERED" => Criterion::Unanswered,
            "DELETED" => Criterion::Deleted,
            "UNDELETED" => Criterion::Undeleted,
            "DRAFT" => Criterion::Draft,
            "UNDRAFT" => Criterion::Undraft,
            "FLAGGED" => Criterion::Flagged,
            "UNFLAGGED" => Criterion::Unflagged,
            "SEEN" => Criterion::Seen,
            "UNSEEN" => Criterion::Unseen,
            "NEW" => Criterion::New,
            "OLD" => Criterion::Old,
            "RECENT" => Criterion::Recent,
            "KEYWORD" => Criterion::Keyword(arg()?),
            "UNKEYWORD" => Criterion::Unkeyword(arg()?),
            "BEFORE" => Criterion::Before(parse_date(&arg()?)?),
            "ON" => Criterion::On(parse_date(&arg()?)?),
            "SINCE" => Criterion::Since(parse_date(&arg()?)?),
            "SENTBEFORE" => Criterion::SentBefore(parse_date(&arg()?)?),
            "SENTON" => Criterion::SentOn(parse_date(&arg()?)?),
            "SENTSINCE" => Criterion::SentSince(parse_date(&arg()?)?),
            "LARGER" => Criterion::Larger(parse_number(&arg()?)?),
            "SMALLER" => Criterion::Smaller(parse_number(&arg()?)?),
            "FROM" => Criterion::From(arg()?),
            "TO" => Criterion::To(arg()?),
            "CC" => Criterion::Cc(arg()?),
            "BCC" => Criterion::Bcc(arg()?),
            "SUBJECT" => Criterion::Subject(arg()?),
            "BODY" => Criterion::Body(arg()?),
            "TEXT" => Criterion::Text(arg()?),
            "HEADER" => {
                let field = arg()?;
                Criterion::Header(field, arg()?)
            }
            _ => return Err(SearchError::UnknownCriterion(token)),
        };
        criteria.push(criterion);
    }
    Ok(criteria)
}

/// Split on whitespace, honouring double-quoted strings with `\` escapes.
pub fn tokenize(input: &str) -> Result<Vec<String>, SearchError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '"' {
            chars.next();
            let mut quoted = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => quoted.push(escaped),
                        None => return Err(SearchError::UnterminatedQuote),
                    },
                    Some(c) => quoted.push(c),
                    None => return Err(SearchError::UnterminatedQuote),
                }
            }
            tokens.push(quoted);
        } else {
            let mut atom = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                atom.push(c);
                chars.next();
            }
            tokens.push(atom);
        }
    }
    Ok(tokens)
}

/// Parse `d-Mon-yyyy` into its day ordinal.
pub fn parse_date(text: &str) -> Result<u32, SearchError> {
    let bad = || SearchError::BadDate(text.to_string());
    let mut fields = text.trim().splitn(3, '-');
    let (day, month, year) = match (fields.next(), fields.next(), fields.next()) {
        (Some(d), Some(m), Some(y)) => (d, m, y),
        _ => return Err(bad()),
    };
    let day: u32 = day.parse().map_err(|_| bad())?;
    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(month))
        .ok_or_else(bad)? as u32
        + 1;
    let year: u32 = match year.parse() {
        Ok(y) if year.len() == 4 => y,
        _ => return Err(bad()),
    };
    if !(1..=31).contains(&day) {
        return Err(bad());
    }
    Ok(date_ordinal(year, month, day))
}

/// Collapse a date to one comparable number.
pub fn date_ordinal(year: u32, month: u32, day: u32) -> u32 {
    year * 512 + month * 32 + day
}

fn parse_number(text: &str) -> Result<u64, SearchError> {
    text.parse()
        .map_err(|_| SearchError::BadNumber(text.to_string()))
}
