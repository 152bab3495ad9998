//! Service Discovery payload format.
//!
//! SD messages travel as SOME/IP notifications on the reserved message id
//! 0xFFFF/0x8100. The payload is a flags word, an entries array and an
//! options array; entries reference option runs by (index, count).

#[cfg(test)]
mod sd_test;

pub mod entry;
pub mod option;

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub use entry::{Entry, EntryDetail, EntryType, ENTRY_SIZE};
pub use option::{L4Proto, SdOption};

use crate::error::{Error, Result};
use crate::header::{Header, MessageType, ReturnCode};
use crate::message::Message;
use crate::types::*;

pub const SD_SERVICE: ServiceId = 0xFFFF;
pub const SD_METHOD: MethodId = 0x8100;
pub const SD_INSTANCE: InstanceId = 0x0000;
pub const SD_INTERFACE_VERSION: u8 = 0x01;

pub const FLAG_REBOOT: u8 = 0x80;
pub const FLAG_UNICAST: u8 = 0x40;

/// Everything after the SOME/IP header, before the entries array.
const SD_PREFIX_SIZE: usize = 8; // flags + reserved + length of entries

/// A parsed Service Discovery message.
///
/// `rejected_entries` counts entries that were dropped during unmarshal
/// because their type was unknown or their option references did not
/// resolve; the rest of the message is still usable, processing keeps
/// going past a bad entry.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct SdMessage {
    pub reboot: bool,
    pub unicast: bool,
    pub entries: Vec<Entry>,
    pub rejected_entries: usize,
}

impl SdMessage {
    pub fn new(reboot: bool) -> Self {
        SdMessage {
            reboot,
            unicast: true,
            entries: vec![],
            rejected_entries: 0,
        }
    }

    /// Serializes the SD payload (flags, entries, options).
    pub fn marshal(&self) -> Result<Bytes> {
        let mut options: Vec<SdOption> = vec![];
        let mut runs: Vec<(u8, u8)> = Vec::with_capacity(self.entries.len());

        for e in &self.entries {
            if e.options.is_empty() {
                runs.push((0, 0));
                continue;
            }
            if e.options.len() > 0x0F {
                return Err(Error::ErrSdMalformed);
            }
            let index = match find_run(&options, &e.options) {
                Some(i) => i,
                None => {
                    let i = options.len();
                    options.extend(e.options.iter().cloned());
                    i
                }
            };
            if index > u8::MAX as usize {
                return Err(Error::ErrSdMalformed);
            }
            runs.push((index as u8, e.options.len() as u8));
        }

        let mut out = BytesMut::new();
        let mut flags = 0u8;
        if self.reboot {
            flags |= FLAG_REBOOT;
        }
        if self.unicast {
            flags |= FLAG_UNICAST;
        }
        out.put_u8(flags);
        out.put_uint(0, 3); // reserved

        out.put_u32((self.entries.len() * ENTRY_SIZE) as u32);
        for (e, (index, count)) in self.entries.iter().zip(&runs) {
            e.marshal_to(&mut out, *index, *count)?;
        }

        let mut options_buf = BytesMut::new();
        for o in &options {
            o.marshal_to(&mut options_buf)?;
        }
        out.put_u32(options_buf.len() as u32);
        out.put_slice(&options_buf);

        Ok(out.freeze())
    }

    /// Parses an SD payload.
    pub fn unmarshal(payload: &Bytes) -> Result<Self> {
        let mut buf = payload.clone();
        if buf.remaining() < SD_PREFIX_SIZE {
            return Err(Error::ErrSdMalformed);
        }

        let flags = buf.get_u8();
        let _reserved = buf.get_uint(3);

        let entries_len = buf.get_u32() as usize;
        if entries_len % ENTRY_SIZE != 0 || buf.remaining() < entries_len {
            return Err(Error::ErrSdMalformed);
        }

        let mut raw_entries = Vec::with_capacity(entries_len / ENTRY_SIZE);
        let mut rejected = 0usize;
        let mut entries_buf = buf.split_to(entries_len);
        while entries_buf.has_remaining() {
            // fixed width, so a bad entry never desynchronizes its successors
            let mut one = entries_buf.split_to(ENTRY_SIZE);
            match Entry::unmarshal(&mut one) {
                Ok(parsed) => raw_entries.push(parsed),
                Err(Error::ErrSdUnknownEntryType(t)) => {
                    log::debug!("dropping sd entry with unknown type {t:#04x}");
                    rejected += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if buf.remaining() < 4 {
            return Err(Error::ErrSdMalformed);
        }
        let options_len = buf.get_u32() as usize;
        if buf.remaining() < options_len {
            return Err(Error::ErrSdMalformed);
        }
        let mut options_buf = buf.split_to(options_len);
        let mut options = vec![];
        while options_buf.has_remaining() {
            options.push(SdOption::unmarshal(&mut options_buf)?);
        }

        let mut entries = Vec::with_capacity(raw_entries.len());
        for (mut entry, (i1, n1, i2, n2)) in raw_entries {
            match resolve_runs(&options, i1, n1, i2, n2) {
                Some(resolved) => {
                    entry.options = resolved;
                    entries.push(entry);
                }
                None => {
                    log::debug!("dropping sd entry with out of range option reference");
                    rejected += 1;
                }
            }
        }

        Ok(SdMessage {
            reboot: flags & FLAG_REBOOT != 0,
            unicast: flags & FLAG_UNICAST != 0,
            entries,
            rejected_entries: rejected,
        })
    }

    /// Wraps the SD payload into its carrier SOME/IP message.
    pub fn to_message(&self, session: SessionId) -> Result<Message> {
        Ok(Message {
            header: Header {
                service: SD_SERVICE,
                method: SD_METHOD,
                client: ILLEGAL_CLIENT,
                session,
                protocol_version: crate::PROTOCOL_VERSION,
                interface_version: SD_INTERFACE_VERSION,
                message_type: MessageType::Notification,
                return_code: ReturnCode::Ok,
                ..Default::default()
            },
            payload: self.marshal()?,
        })
    }

    /// Extracts the SD payload from a carrier message.
    pub fn from_message(message: &Message) -> Result<Self> {
        if message.header.service != SD_SERVICE || message.header.method != SD_METHOD {
            return Err(Error::ErrNotSd);
        }
        if message.header.message_type != MessageType::Notification {
            return Err(Error::ErrNotSd);
        }
        SdMessage::unmarshal(&message.payload)
    }
}

/// Returns true when `message` is an SD carrier.
pub fn is_sd_message(message: &Message) -> bool {
    message.header.service == SD_SERVICE && message.header.method == SD_METHOD
}

fn find_run(options: &[SdOption], run: &[SdOption]) -> Option<usize> {
    if options.len() < run.len() {
        return None;
    }
    (0..=options.len() - run.len()).find(|&i| &options[i..i + run.len()] == run)
}

fn resolve_runs(
    options: &[SdOption],
    i1: u8,
    n1: u8,
    i2: u8,
    n2: u8,
) -> Option<Vec<SdOption>> {
    let mut resolved = Vec::with_capacity((n1 + n2) as usize);
    for (index, count) in [(i1 as usize, n1 as usize), (i2 as usize, n2 as usize)] {
        if count == 0 {
            continue;
        }
        if index + count > options.len() {
            return None;
        }
        resolved.extend(options[index..index + count].iter().cloned());
    }
    Some(resolved)
}
