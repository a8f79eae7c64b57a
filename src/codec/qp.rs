//! Quoted-printable content-transfer-encoding (RFC 2045 §6.7).

/// Payload characters allowed on one encoded line, before the soft-break `=`.
pub const MAX_LINE: usize = 75;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// Value of two hex digits, either case.
pub fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let digit = |b: u8| (b as char).to_digit(16).map(|d| d as u8);
    Some(digit(hi)? << 4 | digit(lo)?)
}

/// Decode quoted-printable text.
///
/// Never fails: an `=` that starts neither a hex escape nor a soft line
/// break is kept literally. Whitespace at the end of a line is dropped.
pub fn decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'=' => {
                if let Some(byte) = input
                    .get(i + 1..i + 3)
                    .and_then(|pair| hex_pair(pair[0], pair[1]))
                {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                // Soft break, possibly with transport padding after the `=`.
                let ws_end = skip_blanks(input, i + 1);
                match line_break_len(input, ws_end) {
                    Some(len) => i = ws_end + len,
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b' ' | b'\t' => {
                let ws_end = skip_blanks(input, i);
                if ws_end == input.len() || line_break_len(input, ws_end).is_some() {
                    i = ws_end;
                } else {
                    out.extend_from_slice(&input[i..ws_end]);
                    i = ws_end;
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    out
}

fn skip_blanks(input: &[u8], mut i: usize) -> usize {
    while matches!(input.get(i), Some(b' ' | b'\t')) {
        i += 1;
    }
    i
}

fn line_break_len(input: &[u8], i: usize) -> Option<usize> {
    match input.get(i..) {
        Some([b'\r', b'\n', ..]) => Some(2),
        Some([b'\n', ..]) => Some(1),
        _ => None,
    }
}

/// Encode bytes as quoted-printable.
///
/// CRLF is the only hard line break; lone CR and LF are escaped like any
/// other control character. Lines are wrapped with `=CRLF` so no line has
/// more than [`MAX_LINE`] payload characters.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 8);
    let mut line_len = 0;
    let mut i = 0;
    while i < input.len() {
        let byte = input[i];
        if input[i..].starts_with(b"\r\n") {
            out.extend_from_slice(b"\r\n");
            line_len = 0;
            i += 2;
            continue;
        }

        let at_line_end = i + 1 == input.len() || input[i + 1..].starts_with(b"\r\n");
        let escape = byte == b'='
            || byte < b' '
            || byte >= 0x7f
            || (byte == b' ' && at_line_end);
        let width = if escape { 3 } else { 1 };

        if line_len + width > MAX_LINE {
            out.extend_from_slice(b"=\r\n");
            line_len = 0;
        }
        if escape {
            out.extend_from_slice(&[b'=', HEX[(byte >> 4) as usize], HEX[(byte & 0x0f) as usize]]);
        } else {
            out.push(byte);
        }
        line_len += width;
        i += 1;
    }
    out
}
