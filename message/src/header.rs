
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::types::*;

/// Size of the fixed SOME/IP header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Number of header bytes covered by the length field (everything after the
/// length word up to the payload: request id, versions, type, return code).
pub const LENGTH_FIELD_TAIL: u32 = 8;

pub const PROTOCOL_VERSION: u8 = 0x01;

/// SOME/IP message types (SIP_RPC_684). The 0x20 bit marks a TP segment.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    #[default]
    Request,
    RequestNoReturn,
    Notification,
    RequestAck,
    RequestNoReturnAck,
    NotificationAck,
    Response,
    Error,
    ResponseAck,
    ErrorAck,
    TpRequest,
    TpRequestNoReturn,
    TpNotification,
    TpResponse,
    TpError,
    Unknown,
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v {
            0x00 => MessageType::Request,
            0x01 => MessageType::RequestNoReturn,
            0x02 => MessageType::Notification,
            0x40 => MessageType::RequestAck,
            0x41 => MessageType::RequestNoReturnAck,
            0x42 => MessageType::NotificationAck,
            0x80 => MessageType::Response,
            0x81 => MessageType::Error,
            0xC0 => MessageType::ResponseAck,
            0xC1 => MessageType::ErrorAck,
            0x20 => MessageType::TpRequest,
            0x21 => MessageType::TpRequestNoReturn,
            0x22 => MessageType::TpNotification,
            0xA0 => MessageType::TpResponse,
            0xA1 => MessageType::TpError,
            _ => MessageType::Unknown,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Request => 0x00,
            MessageType::RequestNoReturn => 0x01,
            MessageType::Notification => 0x02,
            MessageType::RequestAck => 0x40,
            MessageType::RequestNoReturnAck => 0x41,
            MessageType::NotificationAck => 0x42,
            MessageType::Response => 0x80,
            MessageType::Error => 0x81,
            MessageType::ResponseAck => 0xC0,
            MessageType::ErrorAck => 0xC1,
            MessageType::TpRequest => 0x20,
            MessageType::TpRequestNoReturn => 0x21,
            MessageType::TpNotification => 0x22,
            MessageType::TpResponse => 0xA0,
            MessageType::TpError => 0xA1,
            MessageType::Unknown => 0xFF,
        }
    }
}

impl MessageType {
    /// Returns true for the segmented (TP) variants.
    pub fn is_tp(&self) -> bool {
        u8::from(*self) & crate::tp::TP_FLAG != 0 && *self != MessageType::Unknown
    }

    /// Maps a TP variant back to its plain counterpart.
    pub fn without_tp(&self) -> MessageType {
        MessageType::from(u8::from(*self) & !crate::tp::TP_FLAG)
    }

    /// Maps a plain type to its TP variant where one exists.
    pub fn with_tp(&self) -> MessageType {
        MessageType::from(u8::from(*self) | crate::tp::TP_FLAG)
    }

    /// Requests expect a response or error from the provider.
    pub fn expects_response(&self) -> bool {
        matches!(self, MessageType::Request | MessageType::TpRequest)
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self.without_tp(),
            MessageType::Request | MessageType::RequestNoReturn
        )
    }

    pub fn is_response(&self) -> bool {
        matches!(self.without_tp(), MessageType::Response | MessageType::Error)
    }

    pub fn is_notification(&self) -> bool {
        self.without_tp() == MessageType::Notification
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// SOME/IP return codes (SIP_RPC_371).
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    #[default]
    Ok,
    NotOk,
    UnknownService,
    UnknownMethod,
    NotReady,
    NotReachable,
    Timeout,
    WrongProtocolVersion,
    WrongInterfaceVersion,
    MalformedMessage,
    WrongMessageType,
    Unknown,
}

impl From<u8> for ReturnCode {
    fn from(v: u8) -> Self {
        match v {
            0x00 => ReturnCode::Ok,
            0x01 => ReturnCode::NotOk,
            0x02 => ReturnCode::UnknownService,
            0x03 => ReturnCode::UnknownMethod,
            0x04 => ReturnCode::NotReady,
            0x05 => ReturnCode::NotReachable,
            0x06 => ReturnCode::Timeout,
            0x07 => ReturnCode::WrongProtocolVersion,
            0x08 => ReturnCode::WrongInterfaceVersion,
            0x09 => ReturnCode::MalformedMessage,
            0x0A => ReturnCode::WrongMessageType,
            _ => ReturnCode::Unknown,
        }
    }
}

impl From<ReturnCode> for u8 {
    fn from(c: ReturnCode) -> Self {
        match c {
            ReturnCode::Ok => 0x00,
            ReturnCode::NotOk => 0x01,
            ReturnCode::UnknownService => 0x02,
            ReturnCode::UnknownMethod => 0x03,
            ReturnCode::NotReady => 0x04,
            ReturnCode::NotReachable => 0x05,
            ReturnCode::Timeout => 0x06,
            ReturnCode::WrongProtocolVersion => 0x07,
            ReturnCode::WrongInterfaceVersion => 0x08,
            ReturnCode::MalformedMessage => 0x09,
            ReturnCode::WrongMessageType => 0x0A,
            ReturnCode::Unknown => 0xFF,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The fixed 16 byte SOME/IP header.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            Service ID         |            Method ID          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |            Client ID          |           Session ID          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Protocol Ver. | Interface Ver.| Message Type  |  Return Code  |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// All fields are big endian. `length` counts every byte after the length
/// word, i.e. the 8 byte header tail plus the payload.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub service: ServiceId,
    pub method: MethodId,
    pub length: u32,
    pub client: ClientId,
    pub session: SessionId,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:04x}.{:04x}.{:04x}.{:04x}] {} {} len={}",
            self.service,
            self.method,
            self.client,
            self.session,
            self.message_type,
            self.return_code,
            self.length
        )
    }
}

impl Header {
    /// Reads a header from `buf`, advancing it by [`HEADER_SIZE`].
    ///
    /// Only structural validation happens here; length consistency against
    /// the surrounding frame is the caller's business.
    pub fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < HEADER_SIZE {
            return Err(Error::ErrHeaderTooShort);
        }

        let service = buf.get_u16();
        let method = buf.get_u16();
        let length = buf.get_u32();
        let client = buf.get_u16();
        let session = buf.get_u16();
        let protocol_version = buf.get_u8();
        let interface_version = buf.get_u8();
        let message_type = MessageType::from(buf.get_u8());
        let return_code = ReturnCode::from(buf.get_u8());

        if length < LENGTH_FIELD_TAIL {
            return Err(Error::ErrLengthTooSmall);
        }

        Ok(Header {
            service,
            method,
            length,
            client,
            session,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        })
    }

    pub fn marshal_to(&self, out: &mut BytesMut) {
        out.put_u16(self.service);
        out.put_u16(self.method);
        out.put_u32(self.length);
        out.put_u16(self.client);
        out.put_u16(self.session);
        out.put_u8(self.protocol_version);
        out.put_u8(self.interface_version);
        out.put_u8(self.message_type.into());
        out.put_u8(self.return_code.into());
    }

    /// Combined 32 bit message id (service in the high half).
    pub fn message_id(&self) -> u32 {
        (u32::from(self.service) << 16) | u32::from(self.method)
    }

    /// Combined 32 bit request id (client in the high half).
    pub fn request_id(&self) -> u32 {
        (u32::from(self.client) << 16) | u32::from(self.session)
    }

    /// Number of payload bytes announced by the length field.
    pub fn payload_len(&self) -> usize {
        (self.length - LENGTH_FIELD_TAIL) as usize
    }

    /// Total frame size announced by the length field.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len()
    }
}
