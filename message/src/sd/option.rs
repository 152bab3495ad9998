use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const OPTION_TYPE_CONFIGURATION: u8 = 0x01;
pub const OPTION_TYPE_LOAD_BALANCING: u8 = 0x02;
pub const OPTION_TYPE_IPV4_ENDPOINT: u8 = 0x04;
pub const OPTION_TYPE_IPV6_ENDPOINT: u8 = 0x06;
pub const OPTION_TYPE_IPV4_MULTICAST: u8 = 0x14;
pub const OPTION_TYPE_IPV6_MULTICAST: u8 = 0x16;

/// Transport protocol carried in endpoint options (IANA numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl L4Proto {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x06 => Ok(L4Proto::Tcp),
            0x11 => Ok(L4Proto::Udp),
            _ => Err(Error::ErrSdMalformed),
        }
    }
}

impl From<L4Proto> for u8 {
    fn from(p: L4Proto) -> Self {
        match p {
            L4Proto::Tcp => 0x06,
            L4Proto::Udp => 0x11,
        }
    }
}

/// A Service Discovery option.
///
/// Every option starts with `length (16) | type (8) | reserved (8)`; the
/// length counts everything after the type byte. Unknown option types are
/// preserved raw so that a message containing them still round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    Ipv4Endpoint {
        addr: Ipv4Addr,
        proto: L4Proto,
        port: u16,
    },
    Ipv6Endpoint {
        addr: Ipv6Addr,
        proto: L4Proto,
        port: u16,
    },
    Ipv4Multicast {
        addr: Ipv4Addr,
        port: u16,
    },
    Ipv6Multicast {
        addr: Ipv6Addr,
        port: u16,
    },
    /// DNS-TXT style `key=value` items.
    Configuration(Vec<(String, String)>),
    LoadBalancing {
        priority: u16,
        weight: u16,
    },
    Unknown {
        option_type: u8,
        body: Bytes,
    },
}

impl SdOption {
    pub fn option_type(&self) -> u8 {
        match self {
            SdOption::Ipv4Endpoint { .. } => OPTION_TYPE_IPV4_ENDPOINT,
            SdOption::Ipv6Endpoint { .. } => OPTION_TYPE_IPV6_ENDPOINT,
            SdOption::Ipv4Multicast { .. } => OPTION_TYPE_IPV4_MULTICAST,
            SdOption::Ipv6Multicast { .. } => OPTION_TYPE_IPV6_MULTICAST,
            SdOption::Configuration(_) => OPTION_TYPE_CONFIGURATION,
            SdOption::LoadBalancing { .. } => OPTION_TYPE_LOAD_BALANCING,
            SdOption::Unknown { option_type, .. } => *option_type,
        }
    }

    pub fn marshal_to(&self, out: &mut BytesMut) -> Result<()> {
        match self {
            SdOption::Ipv4Endpoint { addr, proto, port } => {
                out.put_u16(0x0009);
                out.put_u8(OPTION_TYPE_IPV4_ENDPOINT);
                out.put_u8(0x00);
                out.put_slice(&addr.octets());
                out.put_u8(0x00);
                out.put_u8((*proto).into());
                out.put_u16(*port);
            }
            SdOption::Ipv6Endpoint { addr, proto, port } => {
                out.put_u16(0x0015);
                out.put_u8(OPTION_TYPE_IPV6_ENDPOINT);
                out.put_u8(0x00);
                out.put_slice(&addr.octets());
                out.put_u8(0x00);
                out.put_u8((*proto).into());
                out.put_u16(*port);
            }
            SdOption::Ipv4Multicast { addr, port } => {
                out.put_u16(0x0009);
                out.put_u8(OPTION_TYPE_IPV4_MULTICAST);
                out.put_u8(0x00);
                out.put_slice(&addr.octets());
                out.put_u8(0x00);
                out.put_u8(L4Proto::Udp.into());
                out.put_u16(*port);
            }
            SdOption::Ipv6Multicast { addr, port } => {
                out.put_u16(0x0015);
                out.put_u8(OPTION_TYPE_IPV6_MULTICAST);
                out.put_u8(0x00);
                out.put_slice(&addr.octets());
                out.put_u8(0x00);
                out.put_u8(L4Proto::Udp.into());
                out.put_u16(*port);
            }
            SdOption::Configuration(items) => {
                let mut body = BytesMut::new();
                for (key, value) in items {
                    let item = format!("{key}={value}");
                    if item.len() > 255 {
                        return Err(Error::ErrSdMalformed);
                    }
                    body.put_u8(item.len() as u8);
                    body.put_slice(item.as_bytes());
                }
                body.put_u8(0x00);

                out.put_u16(1 + body.len() as u16);
                out.put_u8(OPTION_TYPE_CONFIGURATION);
                out.put_u8(0x00);
                out.put_slice(&body);
            }
            SdOption::LoadBalancing { priority, weight } => {
                out.put_u16(0x0005);
                out.put_u8(OPTION_TYPE_LOAD_BALANCING);
                out.put_u8(0x00);
                out.put_u16(*priority);
                out.put_u16(*weight);
            }
            SdOption::Unknown { option_type, body } => {
                out.put_u16(1 + body.len() as u16);
                out.put_u8(*option_type);
                out.put_u8(0x00);
                out.put_slice(body);
            }
        }
        Ok(())
    }

    /// Reads one option from `buf`, advancing past it.
    pub fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::ErrSdMalformed);
        }
        let length = buf.get_u16() as usize;
        let option_type = buf.get_u8();
        // the reserved byte is part of the announced length
        if length < 1 || buf.remaining() < length {
            return Err(Error::ErrSdMalformed);
        }
        let _reserved = buf.get_u8();
        let body_len = length - 1;

        let mut body = BytesMut::with_capacity(body_len);
        body.resize(body_len, 0);
        buf.copy_to_slice(&mut body);
        let mut body = body.freeze();

        match option_type {
            OPTION_TYPE_IPV4_ENDPOINT => {
                if body.len() != 8 {
                    return Err(Error::ErrSdMalformed);
                }
                let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let proto = L4Proto::from_u8(body[5])?;
                let port = u16::from_be_bytes([body[6], body[7]]);
                Ok(SdOption::Ipv4Endpoint { addr, proto, port })
            }
            OPTION_TYPE_IPV6_ENDPOINT => {
                if body.len() != 20 {
                    return Err(Error::ErrSdMalformed);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let proto = L4Proto::from_u8(body[17])?;
                let port = u16::from_be_bytes([body[18], body[19]]);
                Ok(SdOption::Ipv6Endpoint {
                    addr: Ipv6Addr::from(octets),
                    proto,
                    port,
                })
            }
            OPTION_TYPE_IPV4_MULTICAST => {
                if body.len() != 8 || L4Proto::from_u8(body[5])? != L4Proto::Udp {
                    return Err(Error::ErrSdMalformed);
                }
                let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[6], body[7]]);
                Ok(SdOption::Ipv4Multicast { addr, port })
            }
            OPTION_TYPE_IPV6_MULTICAST => {
                if body.len() != 20 || L4Proto::from_u8(body[17])? != L4Proto::Udp {
                    return Err(Error::ErrSdMalformed);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[18], body[19]]);
                Ok(SdOption::Ipv6Multicast {
                    addr: Ipv6Addr::from(octets),
                    port,
                })
            }
            OPTION_TYPE_CONFIGURATION => {
                let mut items = vec![];
                while body.has_remaining() {
                    let item_len = body.get_u8() as usize;
                    if item_len == 0 {
                        break;
                    }
                    if body.remaining() < item_len {
                        return Err(Error::ErrSdMalformed);
                    }
                    let item = body.split_to(item_len);
                    let text =
                        std::str::from_utf8(&item).map_err(|_| Error::ErrSdMalformed)?;
                    match text.split_once('=') {
                        Some((k, v)) => items.push((k.to_owned(), v.to_owned())),
                        None => items.push((text.to_owned(), String::new())),
                    }
                }
                Ok(SdOption::Configuration(items))
            }
            OPTION_TYPE_LOAD_BALANCING => {
                if body.len() != 4 {
                    return Err(Error::ErrSdMalformed);
                }
                Ok(SdOption::LoadBalancing {
                    priority: u16::from_be_bytes([body[0], body[1]]),
                    weight: u16::from_be_bytes([body[2], body[3]]),
                })
            }
            other => Ok(SdOption::Unknown {
                option_type: other,
                body,
            }),
        }
    }
}
