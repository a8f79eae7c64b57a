//! Content-transfer-encodings and line-ending canonicalisation.

pub mod base64;
pub mod qp;

use crate::error::CodecError;
use crate::model::Encoding;

/// Remove a body's transfer encoding. Identity encodings are copied.
pub fn decode_body(encoding: &Encoding, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    match encoding {
        Encoding::Base64 => base64::decode(bytes),
        Encoding::QuotedPrintable => Ok(qp::decode(bytes)),
        _ => Ok(bytes.to_vec()),
    }
}

/// Apply a transfer encoding. Identity encodings are copied.
pub fn encode_body(encoding: &Encoding, bytes: &[u8]) -> Vec<u8> {
    match encoding {
        Encoding::Base64 => base64::encode(bytes),
        Encoding::QuotedPrintable => qp::encode(bytes),
        _ => bytes.to_vec(),
    }
}

/// Convert every bare LF and bare CR to CRLF.
pub fn to_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + bytes.len() / 32);
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            b => out.push(b),
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_crlf() {
        assert_eq!(to_crlf(b"a\nb\r\nc\rd"), b"a\r\nb\r\nc\r\nd");
        assert_eq!(to_crlf(b""), b"");
    }

    #[test]
    fn test_decode_body_dispatch() {
        assert_eq!(
            decode_body(&Encoding::Base64, b"aGk=\r\n").unwrap(),
            b"hi"
        );
        assert_eq!(
            decode_body(&Encoding::QuotedPrintable, b"h=69").unwrap(),
            b"hi"
        );
        assert_eq!(decode_body(&Encoding::EightBit, b"h\xe9").unwrap(), b"h\xe9");
        assert!(decode_body(&Encoding::Base64, b"a").is_err());
    }
}
