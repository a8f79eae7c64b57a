//! RFC822 lexical primitives: CFWS, atoms, quoted strings, comments and
//! domain literals.
//!
//! The lexer works on an already unfolded header value. Every delimiter it
//! looks for is ASCII, so byte positions it stops at are always valid
//! `str` boundaries. On an unterminated construct it reports the error and
//! jumps to end of input, so callers can never read past it.

use crate::error::ParseError;

/// RFC822 specials.
pub const SPECIALS: &[u8] = b"()<>@,;:\\\".[]";

/// Delimiters of a phrase word: the specials less `.`.
pub const WORD_SPECIALS: &[u8] = b"()<>@,;:\\\"[]";

/// MIME tspecials (RFC 2045).
pub const TSPECIALS: &[u8] = b"()<>@,;:\\\"/[]?=";

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    pub fn bump(&mut self) {
        if !self.is_eof() {
            self.pos += 1;
        }
    }

    /// Consume `c` if it is next.
    pub fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Remaining, unconsumed input.
    pub fn rest(&self) -> &'a str {
        &self.input[self.pos.min(self.input.len())..]
    }

    /// Back up to a position returned earlier by [`Lexer::pos`].
    pub fn reset(&mut self, pos: usize) {
        self.pos = pos.min(self.input.len());
    }

    /// Abandon the rest of the input.
    pub fn truncate(&mut self) {
        self.pos = self.input.len();
    }

    /// Skip whitespace and comments. Returns the text of the last comment seen.
    pub fn skip_cfws(&mut self) -> Result<Option<String>, ParseError> {
        let mut last_comment = None;
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => self.pos += 1,
                Some(b'(') => last_comment = Some(self.comment()?),
                _ => return Ok(last_comment),
            }
        }
    }

    /// Read a comment starting at `(`. Nested comments are kept verbatim
    /// inside the returned text; quoted pairs are unescaped.
    pub fn comment(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let bytes = self.input.as_bytes();
        let mut depth = 0usize;
        let mut out = Vec::new();
        while let Some(&b) = bytes.get(self.pos) {
            self.pos += 1;
            match b {
                b'(' => {
                    if depth > 0 {
                        out.push(b);
                    }
                    depth += 1;
                }
                b')' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Ok(String::from_utf8_lossy(&out).trim().to_string());
                    }
                    out.push(b);
                }
                b'\\' => {
                    if let Some(&next) = bytes.get(self.pos) {
                        out.push(next);
                        self.pos += 1;
                    }
                }
                _ => out.push(b),
            }
        }
        self.truncate();
        Err(ParseError::UnterminatedComment { offset: start })
    }

    /// Read a quoted string starting at `"`, returning its unescaped content.
    pub fn quoted_string(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let bytes = self.input.as_bytes();
        self.pos += 1;
        let mut out = Vec::new();
        while let Some(&b) = bytes.get(self.pos) {
            self.pos += 1;
            match b {
                b'"' => return Ok(String::from_utf8_lossy(&out).into_owned()),
                b'\\' => {
                    if let Some(&next) = bytes.get(self.pos) {
                        out.push(next);
                        self.pos += 1;
                    }
                }
                _ => out.push(b),
            }
        }
        self.truncate();
        Err(ParseError::UnterminatedQuote { offset: start })
    }

    /// Read a domain literal starting at `[`, brackets included.
    pub fn domain_literal(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        let bytes = self.input.as_bytes();
        self.pos += 1;
        while let Some(&b) = bytes.get(self.pos) {
            self.pos += 1;
            match b {
                b']' => return Ok(self.input[start..self.pos].to_string()),
                b'\\' => self.bump(),
                _ => {}
            }
        }
        self.truncate();
        Err(ParseError::UnterminatedLiteral { offset: start })
    }

    /// Read a run of atom characters: anything printable that is not
    /// whitespace, a control character or one of `specials`.
    pub fn atom(&mut self, specials: &[u8]) -> Option<&'a str> {
        let start = self.pos;
        let bytes = self.input.as_bytes();
        while let Some(&b) = bytes.get(self.pos) {
            if b <= b' ' || b == 0x7f || specials.contains(&b) {
                break;
            }
            self.pos += 1;
        }
        (self.pos > start).then(|| &self.input[start..self.pos])
    }

    /// Read a word: an atom or a quoted string.
    pub fn word(&mut self, specials: &[u8]) -> Result<Option<String>, ParseError> {
        if self.peek() == Some(b'"') {
            return self.quoted_string().map(Some);
        }
        Ok(self.atom(specials).map(str::to_string))
    }

    /// Skip up to, but not past, the next top-level `,`. Quoted strings,
    /// comments and literals are stepped over whole.
    pub fn skip_to_comma(&mut self) {
        while let Some(b) = self.peek() {
            let stepped = match b {
                b',' => return,
                b'"' => self.quoted_string().map(drop),
                b'(' => self.comment().map(drop),
                b'[' => self.domain_literal().map(drop),
                _ => {
                    self.pos += 1;
                    Ok(())
                }
            };
            if stepped.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_comment() {
        let mut lx = Lexer::new("(outer (inner \\) x) end) rest");
        assert_eq!(lx.comment().unwrap(), "outer (inner ) x) end");
        assert_eq!(lx.rest(), " rest");
    }

    #[test]
    fn test_unterminated_comment_truncates() {
        let mut lx = Lexer::new("(never closed");
        assert_eq!(
            lx.comment(),
            Err(ParseError::UnterminatedComment { offset: 0 })
        );
        assert!(lx.is_eof());
    }

    #[test]
    fn test_quoted_string_escapes() {
        let mut lx = Lexer::new(r#""a \"b\" c"x"#);
        assert_eq!(lx.quoted_string().unwrap(), "a \"b\" c");
        assert_eq!(lx.rest(), "x");
    }

    #[test]
    fn test_unterminated_quote() {
        let mut lx = Lexer::new("  \"abc");
        lx.skip_cfws().unwrap();
        assert_eq!(
            lx.quoted_string(),
            Err(ParseError::UnterminatedQuote { offset: 2 })
        );
        assert!(lx.is_eof());
    }

    #[test]
    fn test_atom_stops_at_specials() {
        let mut lx = Lexer::new("john.doe@example");
        assert_eq!(lx.atom(SPECIALS), Some("john"));
        assert!(lx.eat(b'.'));
        assert_eq!(lx.atom(WORD_SPECIALS), Some("doe"));
        assert_eq!(lx.peek(), Some(b'@'));
    }

    #[test]
    fn test_atom_accepts_eight_bit() {
        let mut lx = Lexer::new("García <x>");
        assert_eq!(lx.atom(WORD_SPECIALS), Some("García"));
    }

    #[test]
    fn test_skip_cfws_returns_comment() {
        let mut lx = Lexer::new("  (Real Name)  x");
        assert_eq!(lx.skip_cfws().unwrap().as_deref(), Some("Real Name"));
        assert_eq!(lx.peek(), Some(b'x'));
    }

    #[test]
    fn test_skip_to_comma_ignores_quoted() {
        let mut lx = Lexer::new("junk \"a,b\" (c,d) more, next");
        lx.skip_to_comma();
        assert_eq!(lx.rest(), ", next");
    }
}
