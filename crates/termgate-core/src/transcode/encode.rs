//! Client-to-backend direction: UTF-8 keystrokes into the session charset.

use std::borrow::Cow;

use encoding_rs::{CoderResult, Decoder, Encoder, UTF_8};

use super::{Charset, hz};

enum Target {
    Identity,
    Table(Encoder),
    Utf16 { big_endian: bool },
    Hz,
}

/// Streaming encoder for `stdin` payloads.
///
/// Input is UTF-8 that may be split anywhere; a partial sequence at the end
/// of one payload is completed by the next. Characters the target charset
/// cannot represent are replaced the way `encoding_rs` does for the web
/// (numeric character references), or `?` for HZ.
pub struct InputEncoder {
    utf8: Decoder,
    target: Target,
}

impl InputEncoder {
    pub fn new(charset: Charset) -> Self {
        let target = match charset {
            Charset::Utf8 => Target::Identity,
            Charset::Hz => Target::Hz,
            Charset::Utf16 { big_endian, .. } => Target::Utf16 { big_endian },
            other => match other.legacy_encoding() {
                Some(encoding) => Target::Table(encoding.new_encoder()),
                None => Target::Identity,
            },
        };
        Self {
            utf8: UTF_8.new_decoder_without_bom_handling(),
            target,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.target, Target::Identity)
    }

    pub fn encode<'a>(&mut self, input: &'a [u8]) -> Cow<'a, [u8]> {
        if self.is_identity() {
            return Cow::Borrowed(input);
        }

        let mut text = String::new();
        let mut src = input;
        loop {
            text.reserve(
                self.utf8
                    .max_utf8_buffer_length(src.len())
                    .unwrap_or(src.len() + 16),
            );
            let (result, read, _) = self.utf8.decode_to_string(src, &mut text, false);
            src = &src[read..];
            if let CoderResult::InputEmpty = result {
                break;
            }
        }

        let mut out = Vec::with_capacity(text.len());
        match &mut self.target {
            Target::Identity => out.extend_from_slice(text.as_bytes()),
            Target::Table(encoder) => encode_table(encoder, &text, &mut out),
            Target::Utf16 { big_endian } => {
                for unit in text.encode_utf16() {
                    if *big_endian {
                        out.extend_from_slice(&unit.to_be_bytes());
                    } else {
                        out.extend_from_slice(&unit.to_le_bytes());
                    }
                }
            }
            Target::Hz => hz::encode(&text, &mut out),
        }
        Cow::Owned(out)
    }
}

fn encode_table(encoder: &mut Encoder, mut src: &str, out: &mut Vec<u8>) {
    loop {
        let needed = encoder
            .max_buffer_length_from_utf8_if_no_unmappables(src.len())
            .unwrap_or(src.len().saturating_mul(4) + 16);
        out.reserve(needed);
        let (result, read, _) = encoder.encode_from_utf8_to_vec(src, out, false);
        src = &src[read..];
        match result {
            CoderResult::InputEmpty => return,
            CoderResult::OutputFull => continue,
        }
    }
}
