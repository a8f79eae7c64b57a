//! Content-Type, Content-Transfer-Encoding and Content-Disposition values.

use tracing::warn;

use super::lexer::{Lexer, TSPECIALS};
use crate::error::ParseError;
use crate::model::{Disposition, Encoding, MediaType, Param};

/// A parsed Content-Type value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub media_type: MediaType,
    pub subtype: Option<String>,
    pub params: Vec<Param>,
}

impl Default for ContentType {
    fn default() -> Self {
        Self::of(MediaType::Text)
    }
}

impl ContentType {
    /// The given type with its default subtype and no parameters.
    pub fn of(media_type: MediaType) -> Self {
        let subtype = media_type.default_subtype().map(String::from);
        Self {
            media_type,
            subtype,
            params: Vec::new(),
        }
    }
}

/// Parse `type/subtype; attr=value; ...`.
///
/// Never fails: an unknown type becomes [`MediaType::Other`], a missing
/// subtype takes the per-type default, and malformed parameters are
/// logged and dropped.
pub fn parse_content_type(value: &str) -> ContentType {
    let mut lx = Lexer::new(value);
    let Some(name) = token(&mut lx) else {
        warn!(value, "Content-Type without a type, assuming text/plain");
        return ContentType::default();
    };
    let media_type = MediaType::from_name(&name);

    let _ = lx.skip_cfws();
    let subtype = if lx.eat(b'/') {
        token(&mut lx).map(|s| s.to_ascii_lowercase())
    } else {
        None
    }
    .or_else(|| media_type.default_subtype().map(String::from));

    let params = parse_params(&mut lx);
    ContentType {
        media_type,
        subtype,
        params,
    }
}

/// Parse a Content-Transfer-Encoding token. Empty means 7bit.
pub fn parse_transfer_encoding(value: &str) -> Encoding {
    let token = value
        .split(|c: char| c == ';' || c == '(')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match token.as_str() {
        "" | "7bit" => Encoding::SevenBit,
        "8bit" => Encoding::EightBit,
        "binary" => Encoding::Binary,
        "base64" => Encoding::Base64,
        "quoted-printable" => Encoding::QuotedPrintable,
        _ => {
            warn!(encoding = %token, "Unknown transfer encoding");
            Encoding::Other(token)
        }
    }
}

/// Parse `inline; filename=x` and friends.
pub fn parse_content_disposition(value: &str) -> Option<Disposition> {
    let mut lx = Lexer::new(value);
    let kind = token(&mut lx)?.to_ascii_lowercase();
    let params = parse_params(&mut lx);
    Some(Disposition { kind, params })
}

fn token(lx: &mut Lexer<'_>) -> Option<String> {
    lx.skip_cfws().ok()?;
    lx.atom(TSPECIALS).map(str::to_string)
}

/// `*(";" attribute "=" value)`. Parsing stops at the first hard syntax
/// error, keeping what came before it.
fn parse_params(lx: &mut Lexer<'_>) -> Vec<Param> {
    let mut params: Vec<Param> = Vec::new();
    loop {
        if lx.skip_cfws().is_err() {
            break;
        }
        if lx.is_eof() {
            break;
        }
        if !lx.eat(b';') {
            warn!(junk = lx.rest(), "Junk in MIME parameters, skipping to next ';'");
            skip_past_semicolon(lx);
            continue;
        }
        let Some(attribute) = token(lx) else {
            // Trailing or doubled ';'.
            continue;
        };
        let value = match param_value(lx, &attribute) {
            Ok(v) => v,
            Err(e @ ParseError::MissingParameterValue(_)) => {
                warn!(error = %e, "Dropping MIME parameter");
                continue;
            }
            Err(e) => {
                warn!(parameter = %attribute, error = %e, "Bad MIME parameter value");
                break;
            }
        };
        if params
            .iter()
            .any(|p| p.attribute.eq_ignore_ascii_case(&attribute))
        {
            warn!(parameter = %attribute, "Duplicate MIME parameter, keeping the first");
            continue;
        }
        params.push(Param::new(attribute, value));
    }
    params
}

/// `"=" value` after an attribute. A missing value is a soft error the
/// caller skips; anything else ends the parameter list.
fn param_value(lx: &mut Lexer<'_>, attribute: &str) -> Result<String, ParseError> {
    let missing = || ParseError::MissingParameterValue(attribute.to_string());
    lx.skip_cfws()?;
    if !lx.eat(b'=') {
        return Err(missing());
    }
    lx.skip_cfws()?;
    if lx.peek() == Some(b'"') {
        return lx.quoted_string();
    }
    lx.atom(TSPECIALS).map(str::to_string).ok_or_else(missing)
}

fn skip_past_semicolon(lx: &mut Lexer<'_>) {
    while let Some(b) = lx.peek() {
        if b == b';' {
            return;
        }
        if b == b'"' {
            if lx.quoted_string().is_err() {
                return;
            }
        } else {
            lx.bump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value() {
        assert_eq!(param_value(&mut Lexer::new(" = \"a b\""), "name").unwrap(), "a b");
        assert_eq!(param_value(&mut Lexer::new("=utf-8;"), "charset").unwrap(), "utf-8");
        assert_eq!(
            param_value(&mut Lexer::new("; name=x"), "charset"),
            Err(ParseError::MissingParameterValue("charset".to_string()))
        );
        assert_eq!(
            param_value(&mut Lexer::new("=;"), "charset"),
            Err(ParseError::MissingParameterValue("charset".to_string()))
        );
        assert!(matches!(
            param_value(&mut Lexer::new("=\"open"), "name"),
            Err(ParseError::UnterminatedQuote { .. })
        ));
    }

    #[test]
    fn test_basic_content_type() {
        let ct = parse_content_type("Text/HTML; Charset=\"UTF-8\"");
        assert_eq!(ct.media_type, MediaType::Text);
        assert_eq!(ct.subtype.as_deref(), Some("html"));
        assert_eq!(ct.params, vec![Param::new("charset", "UTF-8")]);
    }

    #[test]
    fn test_default_subtypes() {
        assert_eq!(parse_content_type("text").subtype.as_deref(), Some("plain"));
        assert_eq!(
            parse_content_type("multipart; boundary=x").subtype.as_deref(),
            Some("mixed")
        );
        assert_eq!(parse_content_type("message").subtype.as_deref(), Some("rfc822"));
        assert_eq!(
            parse_content_type("application").subtype.as_deref(),
            Some("octet-stream")
        );
        assert_eq!(parse_content_type("image").subtype, None);
    }

    #[test]
    fn test_unknown_type() {
        let ct = parse_content_type("x-weird/thing");
        assert_eq!(ct.media_type, MediaType::Other("x-weird".to_string()));
        assert_eq!(ct.subtype.as_deref(), Some("thing"));
    }

    #[test]
    fn test_boundary_with_specials_and_comments() {
        let ct = parse_content_type(
            "multipart/mixed (a comment); boundary=\"=_part;1\" ; charset=us-ascii",
        );
        assert_eq!(ct.params.len(), 2);
        assert_eq!(ct.params[0].value, "=_part;1");
        assert_eq!(ct.params[1].attribute, "charset");
    }

    #[test]
    fn test_parameter_without_value_is_dropped() {
        let ct = parse_content_type("text/plain; format; charset=utf-8");
        assert_eq!(ct.params, vec![Param::new("charset", "utf-8")]);
    }

    #[test]
    fn test_empty_value_defaults_to_text_plain() {
        assert_eq!(parse_content_type(""), ContentType::default());
    }

    #[test]
    fn test_transfer_encoding() {
        assert_eq!(parse_transfer_encoding(" BASE64 "), Encoding::Base64);
        assert_eq!(
            parse_transfer_encoding("Quoted-Printable"),
            Encoding::QuotedPrintable
        );
        assert_eq!(parse_transfer_encoding(""), Encoding::SevenBit);
        assert_eq!(
            parse_transfer_encoding("x-uuencode"),
            Encoding::Other("x-uuencode".to_string())
        );
    }

    #[test]
    fn test_disposition() {
        let d = parse_content_disposition("Attachment; filename=\"report.pdf\"").unwrap();
        assert_eq!(d.kind, "attachment");
        assert_eq!(d.params, vec![Param::new("filename", "report.pdf")]);
        assert!(parse_content_disposition("  ").is_none());
    }
}
