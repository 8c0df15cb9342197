//! Stream framing for peer and scanner byte streams
//!
//! `JsonFrameCodec` cuts one complete top-level JSON object per frame by
//! brace matching, so peers may send objects back to back, with or without
//! newlines, and split across reads. An object that grows past the length
//! limit is discarded and framing resumes at the next `{`. `ScanLineCodec` yields trimmed,
//! non-empty lines terminated by CR or LF.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::LineSrvError;

/// Default upper bound for a single JSON frame
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Default upper bound for a single scanner line
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Brace-matching decoder for concatenated JSON objects
#[derive(Debug, Clone)]
pub struct JsonFrameCodec {
    max_length: usize,
    // Bytes of the current candidate frame already examined
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonFrameCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            scanned: 0,
            depth: 0,
            in_string: false,
            escaped: false,
        }
    }

    fn reset(&mut self) {
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonFrameCodec {
    type Item = Bytes;
    type Error = LineSrvError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, LineSrvError> {
        'frame: loop {
            if self.scanned == 0 {
                // Drop inter-frame noise (whitespace, newlines, stray bytes)
                match buf.iter().position(|b| *b == b'{') {
                    Some(start) => buf.advance(start),
                    None => {
                        buf.clear();
                        return Ok(None);
                    },
                }
            }

            while self.scanned < buf.len() {
                if self.scanned >= self.max_length {
                    warn!(
                        "Discarding JSON frame longer than {} bytes",
                        self.max_length
                    );
                    buf.advance(self.scanned);
                    self.reset();
                    continue 'frame;
                }

                let byte = buf[self.scanned];
                self.scanned += 1;

                if self.in_string {
                    if self.escaped {
                        self.escaped = false;
                    } else if byte == b'\\' {
                        self.escaped = true;
                    } else if byte == b'"' {
                        self.in_string = false;
                    }
                    continue;
                }

                match byte {
                    b'"' => self.in_string = true,
                    b'{' => self.depth += 1,
                    b'}' => {
                        self.depth = self.depth.saturating_sub(1);
                        if self.depth == 0 {
                            let frame = buf.split_to(self.scanned).freeze();
                            self.reset();
                            return Ok(Some(frame));
                        }
                    },
                    _ => {},
                }
            }

            return Ok(None);
        }
    }
}

/// Outbound frames are written as-is followed by a newline
impl Encoder<Bytes> for JsonFrameCodec {
    type Error = LineSrvError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), LineSrvError> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(&item);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

/// CR/LF line splitter for barcode scanners
#[derive(Debug, Clone)]
pub struct ScanLineCodec {
    max_length: usize,
    discarding: bool,
}

impl ScanLineCodec {
    pub fn new() -> Self {
        Self {
            max_length: DEFAULT_MAX_LINE_LENGTH,
            discarding: false,
        }
    }

    fn take_line(bytes: &[u8]) -> Option<String> {
        let line = String::from_utf8_lossy(bytes);
        let line = line.trim();
        (!line.is_empty()).then(|| line.to_string())
    }
}

impl Default for ScanLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ScanLineCodec {
    type Item = String;
    type Error = LineSrvError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LineSrvError> {
        loop {
            let Some(end) = buf.iter().position(|b| *b == b'\r' || *b == b'\n') else {
                if buf.len() > self.max_length {
                    // Oversized garbage, skip it up to the next terminator
                    buf.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let raw = buf.split_to(end + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if let Some(line) = Self::take_line(&raw[..end]) {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LineSrvError> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        let rest = buf.split();
        if self.discarding {
            self.discarding = false;
            return Ok(None);
        }
        Ok(Self::take_line(&rest))
    }
}
