#[cfg(test)]
mod framing_test;

use bytes::BytesMut;

use crate::cookie::{self, CookieKind};
use crate::error::{Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::message::Message;

/// Result of a single decode step against the front of a TCP receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A complete message occupies `consumed` bytes at the front.
    Frame { message: Message, consumed: usize },
    /// A Magic Cookie frame occupies the front; skip it silently.
    Cookie { kind: CookieKind },
    /// The header parsed but `needed` more bytes are required.
    Partial { needed: usize },
    /// The front of the buffer does not hold a valid frame.
    Corrupt,
}

/// Decodes the frame at the front of `b` without consuming anything.
pub fn decode(b: &[u8], max_message_size: usize) -> DecodeOutcome {
    if b.len() < HEADER_SIZE {
        return DecodeOutcome::Partial {
            needed: HEADER_SIZE - b.len(),
        };
    }

    if let Some(kind) = cookie::cookie_at_start(b) {
        return DecodeOutcome::Cookie { kind };
    }

    let header = match Header::unmarshal(&mut &b[..]) {
        Ok(h) => h,
        Err(_) => return DecodeOutcome::Corrupt,
    };

    if header.protocol_version != crate::PROTOCOL_VERSION
        || header.frame_len() > max_message_size
    {
        return DecodeOutcome::Corrupt;
    }

    if b.len() < header.frame_len() {
        return DecodeOutcome::Partial {
            needed: header.frame_len() - b.len(),
        };
    }

    let consumed = header.frame_len();
    let payload = bytes::Bytes::copy_from_slice(&b[HEADER_SIZE..consumed]);
    DecodeOutcome::Frame {
        message: Message { header, payload },
        consumed,
    }
}

/// Incremental decoder for a length-prefixed SOME/IP TCP stream.
///
/// The owner appends received bytes to its accumulator and calls
/// [`StreamDecoder::next_frame`] until it returns `Ok(None)`. With Magic
/// Cookies enabled a malformed frame causes a scan to the next cookie and
/// parsing resumes behind it; without cookies the error is surfaced and the
/// endpoint is expected to reset the connection.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    cookies_enabled: bool,
    max_message_size: usize,
    resyncs: u64,
}

impl StreamDecoder {
    pub fn new(cookies_enabled: bool, max_message_size: usize) -> Self {
        StreamDecoder {
            cookies_enabled,
            max_message_size,
            resyncs: 0,
        }
    }

    /// Number of times the decoder had to resynchronize on a cookie.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn next_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match decode(buf, self.max_message_size) {
                DecodeOutcome::Frame { message, consumed } => {
                    let _ = buf.split_to(consumed);
                    return Ok(Some(message));
                }
                DecodeOutcome::Cookie { .. } => {
                    let _ = buf.split_to(HEADER_SIZE);
                }
                DecodeOutcome::Partial { .. } => return Ok(None),
                DecodeOutcome::Corrupt => {
                    if !self.cookies_enabled {
                        return Err(Error::ErrCorruptFrame);
                    }
                    match cookie::find_cookie(buf, 1) {
                        Some(at) => {
                            self.resyncs += 1;
                            log::debug!("resynchronized on magic cookie after {at} bytes");
                            let _ = buf.split_to(at);
                        }
                        None => {
                            // No cookie yet. Drop everything except a tail
                            // that may still be a cookie prefix.
                            let keep = HEADER_SIZE - 1;
                            if buf.len() > keep {
                                let _ = buf.split_to(buf.len() - keep);
                            }
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }
}
