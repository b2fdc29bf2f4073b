use crate::record::FormatError;
use bytes::{Buf, BytesMut};
use memchr::memchr;
use std::io;
use tokio_util::codec::Decoder;

/// Longest line accepted; longer ones are skipped and reported.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1 << 20;

/// One framed line, or the reason it was dropped.
pub type Line = Result<String, FormatError>;

/// Newline framer that yields each line as an owned `String`.
///
/// A line that is longer than `max_length`, or that is not valid in `charset`,
/// comes out as an `Err` item and framing resumes after its newline. Only
/// `max_length` bytes of an over-long line are ever buffered. The charset must
/// be ASCII-compatible (`\n` is searched for as a raw byte).
pub struct LineDecoder {
    charset: &'static encoding_rs::Encoding,
    max_length: usize,
    // bytes of `src` already known to contain no newline
    next_index: usize,
    // inside an over-long line, dropping bytes until its newline
    discarding: bool,
}

impl LineDecoder {
    pub fn new(charset: &'static encoding_rs::Encoding, max_length: usize) -> Self {
        Self {
            charset,
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn transcode(&self, raw: &[u8]) -> Line {
        let invalid = || FormatError::InvalidEncoding(self.charset.name());
        if self.charset == encoding_rs::UTF_8 {
            std::str::from_utf8(raw).map(str::to_owned).map_err(|_| invalid())
        } else {
            let (text, had_errors) = self.charset.decode_without_bom_handling(raw);
            if had_errors {
                return Err(invalid());
            }
            Ok(text.into_owned())
        }
    }

    fn too_long(&self) -> Line {
        Err(FormatError::LineTooLong(self.max_length))
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(encoding_rs::UTF_8, DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for LineDecoder {
    type Item = Line;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.discarding {
            return match memchr(b'\n', &src[..]) {
                Some(offset) => {
                    src.advance(offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    Ok(Some(self.too_long()))
                }
                None => {
                    src.clear();
                    Ok(None)
                }
            };
        }

        let scan_from = self.next_index.min(src.len());
        match memchr(b'\n', &src[scan_from..]) {
            Some(offset) => {
                let end = scan_from + offset;
                self.next_index = 0;
                let line = src.split_to(end + 1);
                if end > self.max_length {
                    return Ok(Some(self.too_long()));
                }
                Ok(Some(self.transcode(&line[..end])))
            }
            None if src.len() > self.max_length => {
                src.clear();
                self.next_index = 0;
                self.discarding = true;
                Ok(None)
            }
            None => {
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if self.discarding {
            // over-long last line with no newline
            buf.clear();
            self.discarding = false;
            return Ok(Some(self.too_long()));
        }
        if buf.is_empty() {
            return Ok(None);
        }

        // trailing line without a newline
        let rest = buf.split();
        self.next_index = 0;
        Ok(Some(self.transcode(&rest)))
    }
}
