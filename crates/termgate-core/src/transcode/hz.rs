//! HZ-GB-2312 (RFC 1843).
//!
//! Seven-bit wrapper around GB2312: `~{` switches to GB mode, `~}` back to
//! ASCII, `~~` is a literal tilde and `~` + newline is a soft line break.
//! In GB mode each pair of bytes in 0x21..=0x7E is a GB2312 code with the
//! high bits stripped.

use encoding_rs::GBK;

use crate::constants::MAX_ENCODING_UNIT;
use crate::{Error, Result};

const REPLACEMENT: char = '\u{FFFD}';

fn is_gb_byte(b: u8) -> bool {
    (0x21..=0x7E).contains(&b)
}

/// Streaming HZ decoder with an explicit carry buffer.
pub(super) struct HzDecoder {
    gb_mode: bool,
    carry: [u8; MAX_ENCODING_UNIT],
    carry_len: usize,
}

impl HzDecoder {
    pub(super) fn new() -> Self {
        Self {
            gb_mode: false,
            carry: [0; MAX_ENCODING_UNIT],
            carry_len: 0,
        }
    }

    pub(super) fn decode(&mut self, src: &[u8], out: &mut String) -> Result<()> {
        let mut buf = Vec::with_capacity(self.carry_len + src.len());
        buf.extend_from_slice(&self.carry[..self.carry_len]);
        buf.extend_from_slice(src);
        self.carry_len = 0;

        let mut i = 0;
        while i < buf.len() {
            let b = buf[i];
            if b == b'~' {
                let Some(&next) = buf.get(i + 1) else {
                    break;
                };
                match next {
                    b'~' => out.push('~'),
                    b'{' => self.gb_mode = true,
                    b'}' => self.gb_mode = false,
                    b'\n' => {}
                    _ => {
                        out.push(REPLACEMENT);
                        i += 1;
                        continue;
                    }
                }
                i += 2;
                continue;
            }

            if self.gb_mode && is_gb_byte(b) {
                let Some(&trail) = buf.get(i + 1) else {
                    break;
                };
                if is_gb_byte(trail) {
                    let pair = [b | 0x80, trail | 0x80];
                    let (text, _) = GBK.decode_without_bom_handling(&pair);
                    out.push_str(&text);
                    i += 2;
                } else {
                    out.push(REPLACEMENT);
                    i += 1;
                }
                continue;
            }

            out.push(if b.is_ascii() { b as char } else { REPLACEMENT });
            i += 1;
        }

        let rest = &buf[i..];
        if rest.len() > MAX_ENCODING_UNIT {
            return Err(Error::Transcode {
                message: format!("HZ carry overflow ({} bytes)", rest.len()),
            });
        }
        self.carry[..rest.len()].copy_from_slice(rest);
        self.carry_len = rest.len();
        Ok(())
    }

    pub(super) fn finish(self) -> Result<()> {
        if self.carry_len > 0 {
            return Err(Error::Transcode {
                message: format!(
                    "HZ-GB2312 stream ended inside a character ({} pending bytes)",
                    self.carry_len
                ),
            });
        }
        Ok(())
    }
}

/// Encode UTF-8 text as HZ.
///
/// Each call is self-contained: GB mode is closed again before returning.
/// Characters outside GB2312 become `?`.
pub(super) fn encode(text: &str, out: &mut Vec<u8>) {
    let mut gb_mode = false;
    let mut scratch = [0u8; 4];

    for c in text.chars() {
        if c.is_ascii() {
            if gb_mode {
                out.extend_from_slice(b"~}");
                gb_mode = false;
            }
            if c == '~' {
                out.extend_from_slice(b"~~");
            } else {
                out.push(c as u8);
            }
            continue;
        }

        let (bytes, _, unmappable) = GBK.encode(c.encode_utf8(&mut scratch));
        match bytes.as_ref() {
            [lead, trail] if !unmappable && *lead >= 0xA1 && *trail >= 0xA1 => {
                if !gb_mode {
                    out.extend_from_slice(b"~{");
                    gb_mode = true;
                }
                out.push(lead & 0x7F);
                out.push(trail & 0x7F);
            }
            _ => {
                if gb_mode {
                    out.extend_from_slice(b"~}");
                    gb_mode = false;
                }
                out.push(b'?');
            }
        }
    }

    if gb_mode {
        out.extend_from_slice(b"~}");
    }
}
