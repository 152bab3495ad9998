#[cfg(test)]
mod tp_test;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::header::{Header, HEADER_SIZE};
use crate::message::Message;

/// Message type bit marking a TP segment.
pub const TP_FLAG: u8 = 0x20;

/// Size of the TP header that precedes each segment payload.
pub const TP_HEADER_SIZE: usize = 4;

/// Segment payloads are cut at multiples of this, except for the final one.
pub const TP_ALIGNMENT: usize = 16;

/// The 4 byte SOME/IP-TP header.
///
/// The wire value carries the byte offset of the segment in its upper 28
/// bits (offsets are always multiples of 16, so the low nibble is zero) and
/// the more-segments flag in bit 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpHeader {
    pub offset: u32,
    pub more: bool,
}

impl TpHeader {
    pub fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < TP_HEADER_SIZE {
            return Err(Error::ErrTpHeaderTooShort);
        }
        let raw = buf.get_u32();
        Ok(TpHeader {
            offset: raw & 0xFFFF_FFF0,
            more: raw & 0x01 != 0,
        })
    }

    pub fn marshal_to(&self, out: &mut BytesMut) {
        out.put_u32((self.offset & 0xFFFF_FFF0) | u32::from(self.more));
    }
}

/// Splits `message` into TP segments that each fit `max_segment_size` bytes
/// on the wire (SOME/IP header + TP header + chunk).
///
/// Chunks are multiples of 16 bytes except the last. The caller is expected
/// to invoke this only when the message actually exceeds its transport
/// budget; a message that already fits comes back as a single final segment.
pub fn segment(message: &Message, max_segment_size: usize) -> Result<Vec<Message>> {
    let budget = max_segment_size.saturating_sub(HEADER_SIZE + TP_HEADER_SIZE);
    let chunk_size = budget - budget % TP_ALIGNMENT;
    if chunk_size == 0 {
        return Err(Error::ErrTpBudgetTooSmall);
    }

    let payload = &message.payload;
    let mut segments = Vec::with_capacity(payload.len() / chunk_size + 1);
    let mut offset = 0usize;

    loop {
        let end = usize::min(offset + chunk_size, payload.len());
        let more = end < payload.len();

        let mut seg_payload = BytesMut::with_capacity(TP_HEADER_SIZE + (end - offset));
        TpHeader {
            offset: offset as u32,
            more,
        }
        .marshal_to(&mut seg_payload);
        seg_payload.extend_from_slice(&payload[offset..end]);

        let mut header = message.header.clone();
        header.message_type = message.header.message_type.with_tp();
        segments.push(Message {
            header,
            payload: seg_payload.freeze(),
        });

        if !more {
            return Ok(segments);
        }
        offset = end;
    }
}

/// Reassembles one segmented message.
///
/// One reassembler exists per (sender, message id, request id) key; the
/// keying is the owner's business. Segments must arrive with strictly
/// contiguous offsets; a gap or a replay surfaces an error and the owner
/// drops the reassembler.
#[derive(Debug)]
pub struct Reassembler {
    max_size: usize,
    header: Option<Header>,
    data: BytesMut,
    next_offset: u32,
}

impl Reassembler {
    pub fn new(max_size: usize) -> Self {
        Reassembler {
            max_size,
            header: None,
            data: BytesMut::new(),
            next_offset: 0,
        }
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Feeds one segment. Returns the reassembled message once the final
    /// segment has been consumed.
    pub fn push(&mut self, segment: &Message) -> Result<Option<Message>> {
        if !segment.header.message_type.is_tp() {
            return Err(Error::ErrNotTp);
        }

        let mut payload = segment.payload.clone();
        let tp = TpHeader::unmarshal(&mut payload)?;

        if tp.offset != self.next_offset {
            return Err(Error::ErrTpSegmentGap);
        }
        if tp.more && payload.len() % TP_ALIGNMENT != 0 {
            return Err(Error::ErrTpAlignment);
        }
        if self.data.len() + payload.len() > self.max_size {
            return Err(Error::ErrTpTooLarge);
        }

        if self.header.is_none() {
            self.header = Some(segment.header.clone());
        }
        self.data.extend_from_slice(&payload);
        self.next_offset += payload.len() as u32;

        if tp.more {
            return Ok(None);
        }

        let mut header = self.header.take().unwrap_or_else(|| segment.header.clone());
        header.message_type = header.message_type.without_tp();
        let payload: Bytes = std::mem::take(&mut self.data).freeze();
        self.next_offset = 0;

        Ok(Some(Message { header, payload }))
    }
}
