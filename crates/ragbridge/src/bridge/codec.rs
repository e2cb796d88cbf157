//! Line-framed JSON codec for worker communication.
//!
//! One JSON document per `\n`-terminated line. Works over any
//! AsyncRead/AsyncWrite (child pipes, in-memory duplex streams).
//!
//! Decoding never fails on bad input: a line that is not valid UTF-8, not
//! JSON, or not the expected shape is surfaced as [`Frame::Malformed`] so the
//! reader can log it and keep going. A `FramedRead` stops for good after the
//! first decoder error, which would take every later response with it.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single line. Replies with many source snippets can be
/// large, but nothing legitimate comes close to this.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const PREVIEW_CHARS: usize = 200;

/// One decoded line.
#[derive(Debug, PartialEq)]
pub enum Frame<T> {
    Message(T),
    Malformed { line: String, error: String },
    /// Line exceeded the length cap and was discarded.
    Oversized { len: usize },
}

/// Codec that frames messages by newline and serializes with JSON.
pub struct JsonLinesCodec<T> {
    max_line_bytes: usize,
    /// Bytes already scanned for a newline in the current partial line.
    next_index: usize,
    /// Inside an oversized line, dropping bytes until the next newline.
    discarding: bool,
    discarded: usize,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            next_index: 0,
            discarding: false,
            discarded: 0,
            _phantom: PhantomData,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    fn parse(line: &[u8]) -> Frame<T> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text,
            Err(e) => {
                return Frame::Malformed {
                    line: String::from_utf8_lossy(line).into_owned(),
                    error: e.to_string(),
                };
            }
        };
        match serde_json::from_str(text) {
            Ok(item) => Frame::Message(item),
            Err(e) => Frame::Malformed {
                line: text.to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// Shortened form of a line for log output.
pub fn preview(line: &str) -> &str {
    match line.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

fn without_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Frame<T>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                if self.discarding {
                    self.discarded += src.len();
                    src.clear();
                    self.next_index = 0;
                } else if src.len() > self.max_line_bytes {
                    self.discarding = true;
                    self.discarded = src.len();
                    src.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            let raw = src.split_to(end + 1);
            self.next_index = 0;

            if self.discarding {
                let len = self.discarded + end;
                self.discarding = false;
                self.discarded = 0;
                return Ok(Some(Frame::Oversized { len }));
            }
            if end > self.max_line_bytes {
                return Ok(Some(Frame::Oversized { len: end }));
            }

            let line = without_cr(&raw[..end]);
            if is_blank(line) {
                continue;
            }
            return Ok(Some(Self::parse(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if self.discarding {
            let len = self.discarded + src.len();
            self.discarding = false;
            self.discarded = 0;
            src.clear();
            return Ok(Some(Frame::Oversized { len }));
        }
        // Final line without a trailing newline (worker exited mid-write).
        let rest = src.split();
        self.next_index = 0;
        let line = without_cr(&rest);
        if is_blank(line) {
            return Ok(None);
        }
        Ok(Some(Self::parse(line)))
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
