#[cfg(test)]
mod message_test;

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::header::{Header, MessageType, ReturnCode, HEADER_SIZE, LENGTH_FIELD_TAIL};
use crate::types::*;

/// A complete SOME/IP message: header plus payload.
///
/// The header's `length` field is recomputed on [`Message::marshal`]; the
/// stored value is only meaningful on messages produced by `unmarshal`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Bytes,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} payload={}B", self.header, self.payload.len())
    }
}

impl Message {
    pub fn request(
        service: ServiceId,
        method: MethodId,
        client: ClientId,
        session: SessionId,
        interface_version: MajorVersion,
        payload: Bytes,
    ) -> Self {
        Message {
            header: Header {
                service,
                method,
                client,
                session,
                protocol_version: crate::PROTOCOL_VERSION,
                interface_version,
                message_type: MessageType::Request,
                return_code: ReturnCode::Ok,
                ..Default::default()
            },
            payload,
        }
    }

    pub fn notification(
        service: ServiceId,
        event: EventId,
        interface_version: MajorVersion,
        payload: Bytes,
    ) -> Self {
        Message {
            header: Header {
                service,
                method: event,
                client: ILLEGAL_CLIENT,
                session: 0x0001,
                protocol_version: crate::PROTOCOL_VERSION,
                interface_version,
                message_type: MessageType::Notification,
                return_code: ReturnCode::Ok,
                ..Default::default()
            },
            payload,
        }
    }

    /// Builds a RESPONSE mirroring the request id of `request`.
    pub fn response_to(request: &Message, payload: Bytes) -> Self {
        Message {
            header: Header {
                service: request.header.service,
                method: request.header.method,
                client: request.header.client,
                session: request.header.session,
                protocol_version: crate::PROTOCOL_VERSION,
                interface_version: request.header.interface_version,
                message_type: MessageType::Response,
                return_code: ReturnCode::Ok,
                ..Default::default()
            },
            payload,
        }
    }

    /// Builds an ERROR response for `request` carrying `return_code`.
    pub fn error_to(request: &Message, return_code: ReturnCode) -> Self {
        Message {
            header: Header {
                message_type: MessageType::Error,
                return_code,
                ..Message::response_to(request, Bytes::new()).header
            },
            payload: Bytes::new(),
        }
    }

    /// Size of the marshaled frame.
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serializes the message, enforcing `max_message_size` on the frame.
    pub fn marshal(&self, max_message_size: usize) -> Result<Bytes> {
        if self.wire_size() > max_message_size {
            return Err(Error::ErrMessageTooLarge);
        }

        let mut out = BytesMut::with_capacity(self.wire_size());
        let mut header = self.header.clone();
        header.length = LENGTH_FIELD_TAIL + self.payload.len() as u32;
        header.marshal_to(&mut out);
        out.extend_from_slice(&self.payload);
        Ok(out.freeze())
    }

    /// Parses a single message occupying the whole of `raw`.
    ///
    /// This is the UDP entry point: a datagram must contain exactly one
    /// SOME/IP message, so trailing bytes or a short payload are rejected.
    /// TCP streams go through [`crate::framing`] instead.
    pub fn unmarshal(raw: &Bytes) -> Result<Self> {
        let mut buf = raw.clone();
        let header = Header::unmarshal(&mut buf)?;

        if header.protocol_version != crate::PROTOCOL_VERSION {
            return Err(Error::ErrUnsupportedProtocolVersion(
                header.protocol_version,
            ));
        }
        if header.frame_len() != raw.len() {
            return Err(Error::ErrLengthMismatch);
        }

        Ok(Message {
            header,
            payload: raw.slice(HEADER_SIZE..),
        })
    }
}
