use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::types::*;

use super::option::SdOption;

/// Size of one entry on the wire.
pub const ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    FindService,
    OfferService,
    SubscribeEventgroup,
    SubscribeEventgroupAck,
}

impl EntryType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x00 => Ok(EntryType::FindService),
            0x01 => Ok(EntryType::OfferService),
            0x06 => Ok(EntryType::SubscribeEventgroup),
            0x07 => Ok(EntryType::SubscribeEventgroupAck),
            other => Err(Error::ErrSdUnknownEntryType(other)),
        }
    }

    pub fn is_service_entry(&self) -> bool {
        matches!(self, EntryType::FindService | EntryType::OfferService)
    }
}

impl From<EntryType> for u8 {
    fn from(t: EntryType) -> Self {
        match t {
            EntryType::FindService => 0x00,
            EntryType::OfferService => 0x01,
            EntryType::SubscribeEventgroup => 0x06,
            EntryType::SubscribeEventgroupAck => 0x07,
        }
    }
}

/// The entry-kind specific second word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDetail {
    /// Find/Offer entries carry the minor version.
    Service { minor: MinorVersion },
    /// Subscribe/Ack entries carry a 4 bit counter and the eventgroup id.
    Eventgroup {
        counter: u8,
        eventgroup: EventgroupId,
    },
}

/// One Service Discovery entry with its referenced options resolved.
///
/// On the wire an entry references runs inside the shared options array by
/// (index, count) pairs; [`super::SdMessage`] resolves the references during
/// unmarshal and rebuilds the shared array during marshal, so users only
/// ever see the flat `options` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub entry_type: EntryType,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub ttl: Ttl,
    pub detail: EntryDetail,
    pub options: Vec<SdOption>,
}

impl Entry {
    pub fn find_service(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
    ) -> Self {
        Entry {
            entry_type: EntryType::FindService,
            service,
            instance,
            major,
            ttl,
            detail: EntryDetail::Service { minor },
            options: vec![],
        }
    }

    pub fn offer_service(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        options: Vec<SdOption>,
    ) -> Self {
        Entry {
            entry_type: EntryType::OfferService,
            service,
            instance,
            major,
            ttl,
            detail: EntryDetail::Service { minor },
            options,
        }
    }

    /// An Offer with ttl 0 is a StopOffer.
    pub fn stop_offer_service(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Self {
        Entry::offer_service(service, instance, major, minor, 0, vec![])
    }

    pub fn subscribe(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: Ttl,
        options: Vec<SdOption>,
    ) -> Self {
        Entry {
            entry_type: EntryType::SubscribeEventgroup,
            service,
            instance,
            major,
            ttl,
            detail: EntryDetail::Eventgroup {
                counter,
                eventgroup,
            },
            options,
        }
    }

    pub fn subscribe_ack(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: Ttl,
        options: Vec<SdOption>,
    ) -> Self {
        Entry {
            entry_type: EntryType::SubscribeEventgroupAck,
            service,
            instance,
            major,
            ttl,
            detail: EntryDetail::Eventgroup {
                counter,
                eventgroup,
            },
            options,
        }
    }

    /// The eventgroup for eventgroup entries, `None` for service entries.
    pub fn eventgroup(&self) -> Option<EventgroupId> {
        match self.detail {
            EntryDetail::Eventgroup { eventgroup, .. } => Some(eventgroup),
            EntryDetail::Service { .. } => None,
        }
    }

    /// A ttl of zero withdraws: StopOffer / StopSubscribe / Nack.
    pub fn is_stop(&self) -> bool {
        self.ttl == 0
    }

    pub(super) fn marshal_to(
        &self,
        out: &mut BytesMut,
        options_index: u8,
        options_count: u8,
    ) -> Result<()> {
        if self.ttl > 0xFF_FFFF {
            return Err(Error::ErrSdMalformed);
        }

        out.put_u8(self.entry_type.into());
        out.put_u8(options_index);
        out.put_u8(0x00); // second run unused
        out.put_u8(options_count << 4);
        out.put_u16(self.service);
        out.put_u16(self.instance);
        out.put_u8(self.major);
        out.put_uint(u64::from(self.ttl), 3);

        match self.detail {
            EntryDetail::Service { minor } => {
                if !self.entry_type.is_service_entry() {
                    return Err(Error::ErrSdMalformed);
                }
                out.put_u32(minor);
            }
            EntryDetail::Eventgroup {
                counter,
                eventgroup,
            } => {
                if self.entry_type.is_service_entry() {
                    return Err(Error::ErrSdMalformed);
                }
                out.put_u8(0x00);
                out.put_u8(counter & 0x0F);
                out.put_u16(eventgroup);
            }
        }
        Ok(())
    }

    /// Reads one entry, returning it together with its raw option runs
    /// `(index1, count1, index2, count2)` for the caller to resolve.
    pub(super) fn unmarshal<B: Buf>(buf: &mut B) -> Result<(Self, (u8, u8, u8, u8))> {
        if buf.remaining() < ENTRY_SIZE {
            return Err(Error::ErrSdMalformed);
        }

        let entry_type = EntryType::from_u8(buf.get_u8())?;
        let index1 = buf.get_u8();
        let index2 = buf.get_u8();
        let counts = buf.get_u8();
        let service = buf.get_u16();
        let instance = buf.get_u16();
        let major = buf.get_u8();
        let ttl = buf.get_uint(3) as u32;

        let detail = if entry_type.is_service_entry() {
            EntryDetail::Service {
                minor: buf.get_u32(),
            }
        } else {
            let _reserved = buf.get_u8();
            let counter = buf.get_u8() & 0x0F;
            EntryDetail::Eventgroup {
                counter,
                eventgroup: buf.get_u16(),
            }
        };

        Ok((
            Entry {
                entry_type,
                service,
                instance,
                major,
                ttl,
                detail,
                options: vec![],
            },
            (index1, counts >> 4, index2, counts & 0x0F),
        ))
    }
}
