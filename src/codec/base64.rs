//! Base64 content-transfer-encoding (RFC 2045 §6.8).

use ::base64::alphabet;
use ::base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use ::base64::Engine as _;

use crate::error::CodecError;

/// Output characters per encoded line.
pub const LINE_LENGTH: usize = 60;

const MIME: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireCanonical),
);

/// Decode base64 text. Whitespace is ignored; anything else outside the
/// alphabet, padding anywhere but the end of the last quantum, or a
/// partial quantum is an error.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut significant = Vec::with_capacity(input.len());
    let mut pad_offsets = Vec::new();
    for (offset, &byte) in input.iter().enumerate() {
        match byte {
            b' ' | b'\t' | b'\r' | b'\n' => {}
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/' => {
                if !pad_offsets.is_empty() {
                    return Err(CodecError::MisplacedPadding {
                        offset: pad_offsets[0],
                    });
                }
                significant.push(byte);
            }
            b'=' => {
                pad_offsets.push(offset);
                significant.push(byte);
            }
            _ => return Err(CodecError::InvalidByte { byte, offset }),
        }
    }

    let len = significant.len();
    if len % 4 != 0 {
        return Err(CodecError::InvalidLength(len));
    }
    if pad_offsets.len() > 2 {
        return Err(CodecError::MisplacedPadding {
            offset: pad_offsets[0],
        });
    }

    MIME.decode(&significant)
        .map_err(|_| CodecError::InvalidLength(len))
}

/// Encode bytes as base64 lines of [`LINE_LENGTH`] characters, each ended
/// by CRLF.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let encoded = MIME.encode(input);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / LINE_LENGTH * 2 + 2);
    for line in encoded.as_bytes().chunks(LINE_LENGTH) {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out
}
