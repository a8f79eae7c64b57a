//! RFC822 address lists: parsing and quoting.
//!
//! ```text
//! address-list = [address] *("," [address])
//! address      = mailbox / group
//! group        = phrase ":" [mailbox *("," mailbox)] ";"
//! mailbox      = addr-spec / phrase route-addr
//! route-addr   = "<" [route ":"] addr-spec ">"
//! ```
//!
//! Group members are flattened into the surrounding list.

use tracing::warn;

use super::lexer::{Lexer, SPECIALS, WORD_SPECIALS};
use crate::error::ParseError;
use crate::model::Address;

/// Parse a header value into addresses.
///
/// Junk after an address is logged and skipped; only unterminated quoted
/// strings, comments, literals and route addresses are errors.
pub fn parse_address_list(input: &str, default_host: &str) -> Result<Vec<Address>, ParseError> {
    match parse_address_list_lenient(input, default_host) {
        (list, None) => Ok(list),
        (_, Some(err)) => Err(err),
    }
}

/// Like [`parse_address_list`], but keeps the addresses parsed before a
/// hard error alongside the error itself.
pub fn parse_address_list_lenient(
    input: &str,
    default_host: &str,
) -> (Vec<Address>, Option<ParseError>) {
    let mut lx = Lexer::new(input);
    let mut out = Vec::new();
    let result = parse_list_into(&mut lx, default_host, &mut out);
    (out, result.err())
}

fn parse_list_into(
    lx: &mut Lexer<'_>,
    default_host: &str,
    out: &mut Vec<Address>,
) -> Result<(), ParseError> {
    loop {
        lx.skip_cfws()?;
        match lx.peek() {
            None => return Ok(()),
            Some(b',') => {
                lx.bump();
                continue;
            }
            _ => {}
        }
        if !parse_entry(lx, default_host, out)? {
            finish_entry(lx)?;
        }
    }
}

/// After an address only `,`, `;` or end of input may follow.
fn finish_entry(lx: &mut Lexer<'_>) -> Result<(), ParseError> {
    lx.skip_cfws()?;
    match entry_end(lx) {
        Ok(()) if lx.is_eof() => {}
        Ok(()) => lx.bump(),
        Err(junk) => {
            warn!(error = %junk, "Skipping to next address");
            lx.skip_to_comma();
        }
    }
    Ok(())
}

/// Whether the lexer sits where an address may end, without consuming.
fn entry_end(lx: &Lexer<'_>) -> Result<(), ParseError> {
    match lx.peek() {
        None | Some(b',' | b';') => Ok(()),
        Some(_) => Err(ParseError::TrailingJunk(lx.rest().to_string())),
    }
}

/// Parse one mailbox or group into `out`. Returns true for a group, whose
/// closing `;` has already been consumed.
fn parse_entry(
    lx: &mut Lexer<'_>,
    default_host: &str,
    out: &mut Vec<Address>,
) -> Result<bool, ParseError> {
    let start = lx.pos();
    let phrase = parse_phrase(lx)?;
    lx.skip_cfws()?;

    match lx.peek() {
        Some(b':') if !phrase.is_empty() => {
            lx.bump();
            parse_group_members(lx, default_host, out)?;
            Ok(true)
        }
        Some(b'<') => {
            if let Some(mut addr) = parse_route_addr(lx, default_host)? {
                if !phrase.is_empty() {
                    addr.personal = Some(phrase.join(" "));
                }
                out.push(addr);
            }
            Ok(false)
        }
        _ => {
            lx.reset(start);
            match parse_addr_spec(lx, default_host)? {
                Some(mut addr) => {
                    let checkpoint = lx.pos();
                    if let Some(comment) = lx.skip_cfws()?.filter(|c| !c.is_empty()) {
                        addr.personal = Some(comment);
                    } else {
                        lx.reset(checkpoint);
                    }
                    out.push(addr);
                }
                None => {
                    warn!(input = lx.rest(), "Expected an address, skipping");
                    lx.skip_to_comma();
                }
            }
            Ok(false)
        }
    }
}

fn parse_phrase(lx: &mut Lexer<'_>) -> Result<Vec<String>, ParseError> {
    let mut words = Vec::new();
    loop {
        lx.skip_cfws()?;
        match lx.word(WORD_SPECIALS)? {
            Some(word) => words.push(word),
            None => return Ok(words),
        }
    }
}

fn parse_group_members(
    lx: &mut Lexer<'_>,
    default_host: &str,
    out: &mut Vec<Address>,
) -> Result<(), ParseError> {
    loop {
        lx.skip_cfws()?;
        match lx.peek() {
            None => return Ok(()),
            Some(b';') => {
                lx.bump();
                return Ok(());
            }
            Some(b',') => {
                lx.bump();
                continue;
            }
            _ => {}
        }
        parse_entry(lx, default_host, out)?;
        lx.skip_cfws()?;
        if let Err(junk) = entry_end(lx) {
            warn!(error = %junk, "Skipping to next group member");
            lx.skip_to_comma();
            continue;
        }
        match lx.peek() {
            Some(b',') => lx.bump(),
            Some(b';') => {
                lx.bump();
                return Ok(());
            }
            _ => return Ok(()),
        }
    }
}

/// Parse `<[route:]addr-spec>` with the lexer on the `<`. An empty `<>`
/// yields nothing.
fn parse_route_addr(lx: &mut Lexer<'_>, default_host: &str) -> Result<Option<Address>, ParseError> {
    let start = lx.pos();
    lx.bump();
    lx.skip_cfws()?;
    if lx.eat(b'>') {
        return Ok(None);
    }

    let mut adl = None;
    if lx.peek() == Some(b'@') {
        let mut route = Vec::new();
        while lx.eat(b'@') {
            route.push(format!("@{}", parse_domain(lx)?));
            lx.skip_cfws()?;
            if !lx.eat(b',') {
                break;
            }
            lx.skip_cfws()?;
        }
        lx.skip_cfws()?;
        if !lx.eat(b':') {
            let offset = lx.pos();
            lx.truncate();
            return Err(ParseError::Expected {
                expected: "':' after source route",
                offset,
            });
        }
        adl = Some(route.join(","));
    }

    let addr = parse_addr_spec(lx, default_host)?;
    lx.skip_cfws()?;
    if !lx.eat(b'>') {
        lx.truncate();
        return Err(ParseError::UnterminatedRoute { offset: start });
    }
    Ok(addr.map(|a| Address { adl, ..a }))
}

/// Parse `local-part ["@" domain]`. Returns `None` without consuming
/// anything useful when there is no local part.
fn parse_addr_spec(lx: &mut Lexer<'_>, default_host: &str) -> Result<Option<Address>, ParseError> {
    let mut local = String::new();
    loop {
        lx.skip_cfws()?;
        match lx.word(SPECIALS)? {
            Some(word) => local.push_str(&word),
            None if local.is_empty() => return Ok(None),
            None => break,
        }
        let checkpoint = lx.pos();
        lx.skip_cfws()?;
        if lx.eat(b'.') {
            local.push('.');
        } else {
            lx.reset(checkpoint);
            break;
        }
    }

    let checkpoint = lx.pos();
    lx.skip_cfws()?;
    let host = if lx.eat(b'@') {
        parse_domain(lx)?
    } else {
        lx.reset(checkpoint);
        default_host.to_string()
    };

    Ok(Some(Address::new(local, host)))
}

fn parse_domain(lx: &mut Lexer<'_>) -> Result<String, ParseError> {
    let mut domain = String::new();
    loop {
        lx.skip_cfws()?;
        if lx.peek() == Some(b'[') {
            domain.push_str(&lx.domain_literal()?);
        } else if let Some(atom) = lx.atom(SPECIALS) {
            domain.push_str(atom);
        } else {
            let offset = lx.pos();
            lx.truncate();
            return Err(ParseError::Expected {
                expected: "domain",
                offset,
            });
        }
        let checkpoint = lx.pos();
        lx.skip_cfws()?;
        if lx.eat(b'.') {
            domain.push('.');
        } else {
            lx.reset(checkpoint);
            return Ok(domain);
        }
    }
}

// ── Writing ─────────────────────────────────────────────────────

/// Append one address in header form.
pub fn write_address(out: &mut String, addr: &Address) {
    let personal = addr.personal.as_deref().filter(|p| !p.is_empty());
    if personal.is_none() && addr.adl.is_none() {
        write_addr_spec(out, addr);
        return;
    }
    if let Some(personal) = personal {
        write_personal(out, personal);
        out.push(' ');
    }
    out.push('<');
    if let Some(adl) = &addr.adl {
        out.push_str(adl);
        out.push(':');
    }
    write_addr_spec(out, addr);
    out.push('>');
}

/// Append `mailbox@host`, quoting the mailbox when needed.
pub fn write_addr_spec(out: &mut String, addr: &Address) {
    let mailbox = &addr.mailbox;
    let needs_quotes = mailbox.is_empty()
        || mailbox.starts_with('.')
        || mailbox.ends_with('.')
        || mailbox.contains("..")
        || mailbox
            .bytes()
            .any(|b| (b != b'.' && SPECIALS.contains(&b)) || b <= b' ' || b == 0x7f);
    if needs_quotes {
        write_quoted(out, mailbox);
    } else {
        out.push_str(mailbox);
    }
    if !addr.host.is_empty() {
        out.push('@');
        out.push_str(&addr.host);
    }
}

/// Append a comma-separated address list.
pub fn write_address_list(out: &mut String, list: &[Address]) {
    for (i, addr) in list.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_address(out, addr);
    }
}

/// Render an address list to a new string.
pub fn address_list_to_string(list: &[Address]) -> String {
    let mut out = String::new();
    write_address_list(&mut out, list);
    out
}

fn write_personal(out: &mut String, personal: &str) {
    let collapsed = personal.split_ascii_whitespace().collect::<Vec<_>>().join(" ");
    let needs_quotes = collapsed != personal
        || personal
            .bytes()
            .any(|b| SPECIALS.contains(&b) || b < b' ' || b == 0x7f);
    if needs_quotes {
        write_quoted(out, personal);
    } else {
        out.push_str(personal);
    }
}

fn write_quoted(out: &mut String, s: &str) {
    out.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
}
