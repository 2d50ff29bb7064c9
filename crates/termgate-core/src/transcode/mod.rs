//! Charset transcoding for terminal streams.
//!
//! Backend output arrives in whatever legacy charset the remote side speaks
//! and is chopped at arbitrary byte offsets by the transport. A
//! [`Transcoder`] turns those chunks into UTF-8 text, holding back any
//! trailing incomplete sequence until the next chunk completes it. Nothing
//! half-decoded is ever emitted, and a stream that ends mid-sequence is
//! reported by [`Transcoder::finish`].
//!
//! The reverse direction (client keystrokes into the backend charset) lives
//! in [`encode`].
//!
//! Decoders come from `encoding_rs`, which carries the undecodable tail in
//! its own state (never more than one character's worth of bytes). HZ is
//! not an `encoding_rs` encoding and is handled in [`hz`] with an explicit
//! fixed-size carry buffer.

mod encode;
mod hz;
mod proptest;

use std::borrow::Cow;
use std::io::{self, Write};

use encoding_rs::{
    BIG5, CoderResult, Decoder, DecoderResult, EUC_JP, EUC_KR, Encoding, GB18030, GBK,
    ISO_2022_JP, SHIFT_JIS, UTF_8, UTF_16BE, UTF_16LE,
};

use crate::{Error, Result};

pub use encode::InputEncoder;

// =============================================================================
// Charset
// =============================================================================

/// A supported session charset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    /// Canonical encoding; streams pass through untouched.
    Utf8,
    /// UTF-16. With `use_bom` a leading byte-order mark selects the
    /// endianness; otherwise `big_endian` is fixed and a BOM is just a
    /// character.
    Utf16 { big_endian: bool, use_bom: bool },
    Gb18030,
    Gbk,
    /// HZ-GB-2312 (RFC 1843), also requested as plain `GB2312`.
    Hz,
    Big5,
    EucJp,
    Iso2022Jp,
    ShiftJis,
    EucKr,
}

impl Charset {
    /// Resolve a charset name, ignoring case.
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let charset = match upper.as_str() {
            "UTF8" | "UTF-8" => Charset::Utf8,
            "GB18030" => Charset::Gb18030,
            "GB2312" | "HZ-GB2312" | "HZ-GB-2312" | "HZ" => Charset::Hz,
            "GBK" => Charset::Gbk,
            "BIG5" => Charset::Big5,
            "EUC-JP" | "EUCJP" => Charset::EucJp,
            "ISO2022JP" | "ISO-2022-JP" => Charset::Iso2022Jp,
            "SHIFTJIS" | "SHIFT_JIS" | "SHIFT-JIS" | "SJIS" => Charset::ShiftJis,
            "EUC-KR" | "EUCKR" => Charset::EucKr,
            "UTF16-BOM" | "UTF-16-BOM" | "UTF16-BE-BOM" | "UTF-16-BE-BOM" => Charset::Utf16 {
                big_endian: true,
                use_bom: true,
            },
            "UTF16-LE-BOM" | "UTF-16-LE-BOM" => Charset::Utf16 {
                big_endian: false,
                use_bom: true,
            },
            "UTF16" | "UTF-16" | "UTF16-BE" | "UTF-16-BE" => Charset::Utf16 {
                big_endian: true,
                use_bom: false,
            },
            "UTF16-LE" | "UTF-16-LE" => Charset::Utf16 {
                big_endian: false,
                use_bom: false,
            },
            _ => return Err(Error::UnsupportedCharset(name.to_string())),
        };
        Ok(charset)
    }

    /// Canonical display name.
    pub fn name(&self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::Utf16 {
                big_endian: true,
                use_bom: true,
            } => "UTF-16-BOM",
            Charset::Utf16 {
                big_endian: false,
                use_bom: true,
            } => "UTF-16-LE-BOM",
            Charset::Utf16 {
                big_endian: true,
                use_bom: false,
            } => "UTF-16-BE",
            Charset::Utf16 {
                big_endian: false,
                use_bom: false,
            } => "UTF-16-LE",
            Charset::Gb18030 => "GB18030",
            Charset::Gbk => "GBK",
            Charset::Hz => "HZ-GB2312",
            Charset::Big5 => "BIG5",
            Charset::EucJp => "EUC-JP",
            Charset::Iso2022Jp => "ISO-2022-JP",
            Charset::ShiftJis => "SHIFT_JIS",
            Charset::EucKr => "EUC-KR",
        }
    }

    /// True for the canonical charset, where no conversion is needed.
    pub fn is_identity(&self) -> bool {
        matches!(self, Charset::Utf8)
    }

    /// The `encoding_rs` table for legacy multi-byte charsets.
    fn legacy_encoding(&self) -> Option<&'static Encoding> {
        match self {
            Charset::Gb18030 => Some(GB18030),
            Charset::Gbk => Some(GBK),
            Charset::Big5 => Some(BIG5),
            Charset::EucJp => Some(EUC_JP),
            Charset::Iso2022Jp => Some(ISO_2022_JP),
            Charset::ShiftJis => Some(SHIFT_JIS),
            Charset::EucKr => Some(EUC_KR),
            Charset::Utf8 | Charset::Utf16 { .. } | Charset::Hz => None,
        }
    }
}

// =============================================================================
// Transcoder
// =============================================================================

enum StreamDecoder {
    Table(Decoder),
    Hz(hz::HzDecoder),
}

/// Chunk-by-chunk decoder from one charset into UTF-8.
pub struct Transcoder {
    charset: Charset,
    decoder: StreamDecoder,
}

impl Transcoder {
    pub fn new(charset: Charset) -> Self {
        let decoder = match charset {
            Charset::Utf8 => StreamDecoder::Table(UTF_8.new_decoder_without_bom_handling()),
            Charset::Hz => StreamDecoder::Hz(hz::HzDecoder::new()),
            Charset::Utf16 {
                big_endian,
                use_bom,
            } => {
                let encoding = if big_endian { UTF_16BE } else { UTF_16LE };
                StreamDecoder::Table(if use_bom {
                    encoding.new_decoder()
                } else {
                    encoding.new_decoder_without_bom_handling()
                })
            }
            other => StreamDecoder::Table(
                other
                    .legacy_encoding()
                    .unwrap_or(UTF_8)
                    .new_decoder_without_bom_handling(),
            ),
        };
        Self { charset, decoder }
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    /// Decode one chunk, returning every character it completes.
    ///
    /// Invalid sequences become U+FFFD. A trailing partial sequence is held
    /// back and contributes to the next call.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String> {
        let mut out = String::new();
        match &mut self.decoder {
            StreamDecoder::Table(decoder) => decode_table(decoder, chunk, &mut out),
            StreamDecoder::Hz(decoder) => decoder.decode(chunk, &mut out)?,
        }
        Ok(out)
    }

    /// End the stream. Fails if it stopped in the middle of a character.
    pub fn finish(self) -> Result<String> {
        let mut out = String::new();
        match self.decoder {
            StreamDecoder::Table(mut decoder) => {
                out.reserve(decoder.max_utf8_buffer_length(0).unwrap_or(16));
                let (result, _) = decoder.decode_to_string_without_replacement(b"", &mut out, true);
                if let DecoderResult::Malformed(len, _) = result {
                    return Err(Error::Transcode {
                        message: format!(
                            "{} stream ended inside a character ({} pending bytes)",
                            self.charset.name(),
                            len
                        ),
                    });
                }
            }
            StreamDecoder::Hz(decoder) => decoder.finish()?,
        }
        Ok(out)
    }
}

fn decode_table(decoder: &mut Decoder, mut src: &[u8], out: &mut String) {
    loop {
        let needed = decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or(src.len().saturating_mul(3) + 16);
        out.reserve(needed);
        let (result, read, _) = decoder.decode_to_string(src, out, false);
        src = &src[read..];
        match result {
            CoderResult::InputEmpty => return,
            CoderResult::OutputFull => continue,
        }
    }
}

// =============================================================================
// Output filter
// =============================================================================

/// Backend-to-client byte filter for async pipelines.
///
/// UTF-8 sessions take the [`OutputFilter::Passthrough`] arm and never copy.
pub enum OutputFilter {
    Passthrough,
    Decode(Transcoder),
}

impl OutputFilter {
    /// Build the filter for a charset name. Unknown names are rejected here,
    /// before any backend is contacted.
    pub fn for_charset(name: &str) -> Result<Self> {
        let charset = Charset::from_name(name)?;
        Ok(if charset.is_identity() {
            OutputFilter::Passthrough
        } else {
            OutputFilter::Decode(Transcoder::new(charset))
        })
    }

    pub fn filter<'a>(&mut self, chunk: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        match self {
            OutputFilter::Passthrough => Ok(Cow::Borrowed(chunk)),
            OutputFilter::Decode(t) => Ok(Cow::Owned(t.decode(chunk)?.into_bytes())),
        }
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        match self {
            OutputFilter::Passthrough => Ok(Vec::new()),
            OutputFilter::Decode(t) => Ok(t.finish()?.into_bytes()),
        }
    }
}

// =============================================================================
// Writer adapter
// =============================================================================

/// [`Write`] adapter that decodes everything written into UTF-8 on `inner`.
///
/// `write` always reports the whole input as consumed: bytes held back for
/// an incomplete character are owned by the decoder, not the caller.
pub struct DecodeWriter<W: Write> {
    inner: W,
    transcoder: Transcoder,
}

impl<W: Write> DecodeWriter<W> {
    pub fn new(charset: Charset, inner: W) -> Self {
        Self {
            inner,
            transcoder: Transcoder::new(charset),
        }
    }

    /// Flush and hand back the inner writer; errors on a dangling sequence.
    pub fn finish(mut self) -> io::Result<W> {
        let tail = self.transcoder.finish().map_err(io::Error::other)?;
        self.inner.write_all(tail.as_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for DecodeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = self.transcoder.decode(buf).map_err(io::Error::other)?;
        self.inner.write_all(text.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Result of [`decode_by`]: the destination itself for UTF-8, or a decoding
/// wrapper around it.
pub enum Decoded<W: Write> {
    Passthrough(W),
    Decoding(DecodeWriter<W>),
}

impl<W: Write> Decoded<W> {
    pub fn finish(self) -> io::Result<W> {
        match self {
            Decoded::Passthrough(w) => Ok(w),
            Decoded::Decoding(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for Decoded<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Decoded::Passthrough(w) => w.write(buf),
            Decoded::Decoding(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Decoded::Passthrough(w) => w.flush(),
            Decoded::Decoding(w) => w.flush(),
        }
    }
}

/// Wrap `dst` so that bytes in `charset` come out as UTF-8.
pub fn decode_by<W: Write>(charset: &str, dst: W) -> Result<Decoded<W>> {
    let charset = Charset::from_name(charset)?;
    Ok(if charset.is_identity() {
        Decoded::Passthrough(dst)
    } else {
        Decoded::Decoding(DecodeWriter::new(charset, dst))
    })
}
