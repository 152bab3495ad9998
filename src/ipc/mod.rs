//! Local IPC between applications and the routing manager.
//!
//! Transport is a Unix domain stream socket. Frames are tagged on both
//! sides so a desynchronized peer is detected immediately:
//!
//! ```text
//! START_TAG (4) | client id (2, LE) | command (1) | payload size (4, LE)
//!     | payload | END_TAG (4)
//! ```
//!
//! Multi-byte fields on the local wire are little endian throughout (the
//! network wire format in `someip-message` stays big endian). A framing
//! violation closes the application's channel; there is no resync on the
//! local transport.

#[cfg(test)]
mod ipc_test;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use message::types::*;

use crate::error::{Error, Result};
use crate::policy::{IdRange, PolicyRights, ServiceRight};
use crate::routing::RoutingState;

pub const START_TAG: [u8; 4] = [0x67, 0x37, 0x6D, 0x07];
pub const END_TAG: [u8; 4] = [0x07, 0x6D, 0x37, 0x67];

/// start tag + client + command + payload size
const HEADER_SIZE: usize = 4 + 2 + 1 + 4;

/// Upper bound for a single IPC payload; anything above is a framing error.
const MAX_PAYLOAD_SIZE: usize = 16 << 20;

/// One framed command on the local wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcFrame {
    /// Sender for app→manager frames, addressee for manager→app frames.
    pub client: ClientId,
    pub command: Command,
}

/// The closed command set of the local protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    RegisterApplication {
        name: String,
        requested_client: ClientId,
    },
    DeregisterApplication,
    ApplicationInfo {
        assigned_client: ClientId,
        peers: Vec<(ClientId, String)>,
    },
    ApplicationLost {
        client: ClientId,
    },
    RequestService {
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    ReleaseService {
        service: ServiceId,
        instance: InstanceId,
    },
    RequestServiceAck {
        service: ServiceId,
        instance: InstanceId,
    },
    ProvideService {
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        /// 0 means "no reliable leg"; same for the unreliable port.
        reliable_port: u16,
        unreliable_port: u16,
    },
    WithdrawService {
        service: ServiceId,
        instance: InstanceId,
    },
    /// Availability up-edge, manager → requesting application.
    StartService {
        service: ServiceId,
        instance: InstanceId,
    },
    /// Availability down-edge.
    StopService {
        service: ServiceId,
        instance: InstanceId,
    },
    ProvideEventgroup {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        reliability: u8,
        /// 0 when the eventgroup has no multicast address.
        multicast_addr: u32,
        multicast_port: u16,
    },
    WithdrawEventgroup {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
    RequestEventgroup {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    },
    ReleaseEventgroup {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    },
    RegisterMethod {
        service: ServiceId,
        method: MethodId,
    },
    DeregisterMethod {
        service: ServiceId,
        method: MethodId,
    },
    AddField {
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroups: Vec<EventgroupId>,
        /// 0 disables the cyclic notifier.
        cycle_ms: u32,
        change_resets_cycle: bool,
        /// Initial (cached) field value; empty for plain events.
        payload: Bytes,
    },
    RemoveField {
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    },
    /// A full marshaled SOME/IP frame plus the instance it addresses.
    Send {
        instance: InstanceId,
        data: Bytes,
    },
    Notify {
        instance: InstanceId,
        force: bool,
        data: Bytes,
    },
    NotifyOne {
        instance: InstanceId,
        target: ClientId,
        force: bool,
        data: Bytes,
    },
    /// App → manager: subscribe intent. Manager → provider app: an inbound
    /// subscription awaiting the provider's verdict (`pending_id`).
    Subscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
        subscriber: ClientId,
        pending_id: u32,
    },
    Unsubscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: ClientId,
    },
    SubscribeAck {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: ClientId,
        pending_id: u32,
    },
    SubscribeNack {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: ClientId,
        pending_id: u32,
    },
    OfferedServicesRequest {
        offer_type: u8,
    },
    OfferedServicesResponse {
        services: Vec<(ServiceId, InstanceId)>,
    },
    Ping,
    Pong,
    UpdateSecurityPolicy {
        uid: u32,
        gid: u32,
        rights: PolicyRights,
    },
    RemoveSecurityPolicy {
        uid: u32,
        gid: u32,
    },
    RoutingState {
        state: RoutingState,
    },
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::RegisterApplication { .. } => 0x00,
            Command::DeregisterApplication => 0x01,
            Command::ApplicationInfo { .. } => 0x02,
            Command::ApplicationLost { .. } => 0x03,
            Command::RequestService { .. } => 0x04,
            Command::ReleaseService { .. } => 0x05,
            Command::RequestServiceAck { .. } => 0x06,
            Command::ProvideService { .. } => 0x07,
            Command::WithdrawService { .. } => 0x08,
            Command::StartService { .. } => 0x09,
            Command::StopService { .. } => 0x0A,
            Command::ProvideEventgroup { .. } => 0x0B,
            Command::WithdrawEventgroup { .. } => 0x0C,
            Command::RequestEventgroup { .. } => 0x0D,
            Command::ReleaseEventgroup { .. } => 0x0E,
            Command::RegisterMethod { .. } => 0x0F,
            Command::DeregisterMethod { .. } => 0x10,
            Command::AddField { .. } => 0x11,
            Command::RemoveField { .. } => 0x12,
            Command::Send { .. } => 0x13,
            Command::Notify { .. } => 0x14,
            Command::NotifyOne { .. } => 0x15,
            Command::Subscribe { .. } => 0x16,
            Command::Unsubscribe { .. } => 0x17,
            Command::SubscribeAck { .. } => 0x18,
            Command::SubscribeNack { .. } => 0x19,
            Command::OfferedServicesRequest { .. } => 0x1A,
            Command::OfferedServicesResponse { .. } => 0x1B,
            Command::Ping => 0x1C,
            Command::Pong => 0x1D,
            Command::UpdateSecurityPolicy { .. } => 0x1E,
            Command::RemoveSecurityPolicy { .. } => 0x1F,
            Command::RoutingState { .. } => 0x20,
        }
    }

    fn marshal_payload(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            Command::RegisterApplication {
                name,
                requested_client,
            } => {
                out.put_u16_le(*requested_client);
                put_string(&mut out, name);
            }
            Command::DeregisterApplication | Command::Ping | Command::Pong => {}
            Command::ApplicationInfo {
                assigned_client,
                peers,
            } => {
                out.put_u16_le(*assigned_client);
                out.put_u32_le(peers.len() as u32);
                for (client, name) in peers {
                    out.put_u16_le(*client);
                    put_string(&mut out, name);
                }
            }
            Command::ApplicationLost { client } => out.put_u16_le(*client),
            Command::RequestService {
                service,
                instance,
                major,
                minor,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u8(*major);
                out.put_u32_le(*minor);
            }
            Command::ReleaseService { service, instance }
            | Command::RequestServiceAck { service, instance }
            | Command::WithdrawService { service, instance }
            | Command::StartService { service, instance }
            | Command::StopService { service, instance } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
            }
            Command::ProvideService {
                service,
                instance,
                major,
                minor,
                reliable_port,
                unreliable_port,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u8(*major);
                out.put_u32_le(*minor);
                out.put_u16_le(*reliable_port);
                out.put_u16_le(*unreliable_port);
            }
            Command::ProvideEventgroup {
                service,
                instance,
                eventgroup,
                reliability,
                multicast_addr,
                multicast_port,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*eventgroup);
                out.put_u8(*reliability);
                out.put_u32_le(*multicast_addr);
                out.put_u16_le(*multicast_port);
            }
            Command::WithdrawEventgroup {
                service,
                instance,
                eventgroup,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*eventgroup);
            }
            Command::RequestEventgroup {
                service,
                instance,
                eventgroup,
                event,
            }
            | Command::ReleaseEventgroup {
                service,
                instance,
                eventgroup,
                event,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*eventgroup);
                out.put_u16_le(*event);
            }
            Command::RegisterMethod { service, method }
            | Command::DeregisterMethod { service, method } => {
                out.put_u16_le(*service);
                out.put_u16_le(*method);
            }
            Command::AddField {
                service,
                instance,
                event,
                eventgroups,
                cycle_ms,
                change_resets_cycle,
                payload,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*event);
                out.put_u32_le(*cycle_ms);
                out.put_u8(u8::from(*change_resets_cycle));
                out.put_u32_le(eventgroups.len() as u32);
                for eg in eventgroups {
                    out.put_u16_le(*eg);
                }
                put_bytes(&mut out, payload);
            }
            Command::RemoveField {
                service,
                instance,
                event,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*event);
            }
            Command::Send { instance, data } => {
                out.put_u16_le(*instance);
                put_bytes(&mut out, data);
            }
            Command::Notify {
                instance,
                force,
                data,
            } => {
                out.put_u16_le(*instance);
                out.put_u8(u8::from(*force));
                put_bytes(&mut out, data);
            }
            Command::NotifyOne {
                instance,
                target,
                force,
                data,
            } => {
                out.put_u16_le(*instance);
                out.put_u16_le(*target);
                out.put_u8(u8::from(*force));
                put_bytes(&mut out, data);
            }
            Command::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                ttl,
                subscriber,
                pending_id,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*eventgroup);
                out.put_u8(*major);
                out.put_u32_le(*ttl);
                out.put_u16_le(*subscriber);
                out.put_u32_le(*pending_id);
            }
            Command::Unsubscribe {
                service,
                instance,
                eventgroup,
                subscriber,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*eventgroup);
                out.put_u16_le(*subscriber);
            }
            Command::SubscribeAck {
                service,
                instance,
                eventgroup,
                subscriber,
                pending_id,
            }
            | Command::SubscribeNack {
                service,
                instance,
                eventgroup,
                subscriber,
                pending_id,
            } => {
                out.put_u16_le(*service);
                out.put_u16_le(*instance);
                out.put_u16_le(*eventgroup);
                out.put_u16_le(*subscriber);
                out.put_u32_le(*pending_id);
            }
            Command::OfferedServicesRequest { offer_type } => out.put_u8(*offer_type),
            Command::OfferedServicesResponse { services } => {
                out.put_u32_le(services.len() as u32);
                for (service, instance) in services {
                    out.put_u16_le(*service);
                    out.put_u16_le(*instance);
                }
            }
            Command::UpdateSecurityPolicy { uid, gid, rights } => {
                out.put_u32_le(*uid);
                out.put_u32_le(*gid);
                put_rights(&mut out, rights);
            }
            Command::RemoveSecurityPolicy { uid, gid } => {
                out.put_u32_le(*uid);
                out.put_u32_le(*gid);
            }
            Command::RoutingState { state } => out.put_u8((*state).into()),
        }
        out.freeze()
    }

    fn unmarshal(code: u8, mut p: Bytes) -> Result<Command> {
        let command = match code {
            0x00 => {
                let requested_client = get_u16(&mut p)?;
                Command::RegisterApplication {
                    requested_client,
                    name: get_string(&mut p)?,
                }
            }
            0x01 => Command::DeregisterApplication,
            0x02 => {
                let assigned_client = get_u16(&mut p)?;
                let count = get_u32(&mut p)? as usize;
                let mut peers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let client = get_u16(&mut p)?;
                    peers.push((client, get_string(&mut p)?));
                }
                Command::ApplicationInfo {
                    assigned_client,
                    peers,
                }
            }
            0x03 => Command::ApplicationLost {
                client: get_u16(&mut p)?,
            },
            0x04 => Command::RequestService {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                major: get_u8(&mut p)?,
                minor: get_u32(&mut p)?,
            },
            0x05 => Command::ReleaseService {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
            },
            0x06 => Command::RequestServiceAck {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
            },
            0x07 => Command::ProvideService {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                major: get_u8(&mut p)?,
                minor: get_u32(&mut p)?,
                reliable_port: get_u16(&mut p)?,
                unreliable_port: get_u16(&mut p)?,
            },
            0x08 => Command::WithdrawService {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
            },
            0x09 => Command::StartService {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
            },
            0x0A => Command::StopService {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
            },
            0x0B => Command::ProvideEventgroup {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                eventgroup: get_u16(&mut p)?,
                reliability: get_u8(&mut p)?,
                multicast_addr: get_u32(&mut p)?,
                multicast_port: get_u16(&mut p)?,
            },
            0x0C => Command::WithdrawEventgroup {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                eventgroup: get_u16(&mut p)?,
            },
            0x0D => Command::RequestEventgroup {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                eventgroup: get_u16(&mut p)?,
                event: get_u16(&mut p)?,
            },
            0x0E => Command::ReleaseEventgroup {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                eventgroup: get_u16(&mut p)?,
                event: get_u16(&mut p)?,
            },
            0x0F => Command::RegisterMethod {
                service: get_u16(&mut p)?,
                method: get_u16(&mut p)?,
            },
            0x10 => Command::DeregisterMethod {
                service: get_u16(&mut p)?,
                method: get_u16(&mut p)?,
            },
            0x11 => {
                let service = get_u16(&mut p)?;
                let instance = get_u16(&mut p)?;
                let event = get_u16(&mut p)?;
                let cycle_ms = get_u32(&mut p)?;
                let change_resets_cycle = get_u8(&mut p)? != 0;
                let count = get_u32(&mut p)? as usize;
                let mut eventgroups = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    eventgroups.push(get_u16(&mut p)?);
                }
                Command::AddField {
                    service,
                    instance,
                    event,
                    eventgroups,
                    cycle_ms,
                    change_resets_cycle,
                    payload: get_bytes(&mut p)?,
                }
            }
            0x12 => Command::RemoveField {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                event: get_u16(&mut p)?,
            },
            0x13 => Command::Send {
                instance: get_u16(&mut p)?,
                data: get_bytes(&mut p)?,
            },
            0x14 => Command::Notify {
                instance: get_u16(&mut p)?,
                force: get_u8(&mut p)? != 0,
                data: get_bytes(&mut p)?,
            },
            0x15 => Command::NotifyOne {
                instance: get_u16(&mut p)?,
                target: get_u16(&mut p)?,
                force: get_u8(&mut p)? != 0,
                data: get_bytes(&mut p)?,
            },
            0x16 => Command::Subscribe {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                eventgroup: get_u16(&mut p)?,
                major: get_u8(&mut p)?,
                ttl: get_u32(&mut p)?,
                subscriber: get_u16(&mut p)?,
                pending_id: get_u32(&mut p)?,
            },
            0x17 => Command::Unsubscribe {
                service: get_u16(&mut p)?,
                instance: get_u16(&mut p)?,
                eventgroup: get_u16(&mut p)?,
                subscriber: get_u16(&mut p)?,
            },
            0x18 | 0x19 => {
                let service = get_u16(&mut p)?;
                let instance = get_u16(&mut p)?;
                let eventgroup = get_u16(&mut p)?;
                let subscriber = get_u16(&mut p)?;
                let pending_id = get_u32(&mut p)?;
                if code == 0x18 {
                    Command::SubscribeAck {
                        service,
                        instance,
                        eventgroup,
                        subscriber,
                        pending_id,
                    }
                } else {
                    Command::SubscribeNack {
                        service,
                        instance,
                        eventgroup,
                        subscriber,
                        pending_id,
                    }
                }
            }
            0x1A => Command::OfferedServicesRequest {
                offer_type: get_u8(&mut p)?,
            },
            0x1B => {
                let count = get_u32(&mut p)? as usize;
                let mut services = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let service = get_u16(&mut p)?;
                    services.push((service, get_u16(&mut p)?));
                }
                Command::OfferedServicesResponse { services }
            }
            0x1C => Command::Ping,
            0x1D => Command::Pong,
            0x1E => Command::UpdateSecurityPolicy {
                uid: get_u32(&mut p)?,
                gid: get_u32(&mut p)?,
                rights: get_rights(&mut p)?,
            },
            0x1F => Command::RemoveSecurityPolicy {
                uid: get_u32(&mut p)?,
                gid: get_u32(&mut p)?,
            },
            0x20 => Command::RoutingState {
                state: RoutingState::from(get_u8(&mut p)?),
            },
            other => return Err(Error::ErrUnknownCommand(other)),
        };
        Ok(command)
    }
}

/// Serializes one frame.
pub fn encode_frame(client: ClientId, command: &Command) -> Bytes {
    let payload = command.marshal_payload();
    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len() + END_TAG.len());
    out.put_slice(&START_TAG);
    out.put_u16_le(client);
    out.put_u8(command.code());
    out.put_u32_le(payload.len() as u32);
    out.put_slice(&payload);
    out.put_slice(&END_TAG);
    out.freeze()
}

/// Incremental frame decoder for one IPC connection.
///
/// Unlike the TCP decoder there is no resynchronization: any framing
/// violation is fatal for the connection and the application is treated as
/// lost.
#[derive(Debug, Default)]
pub struct FrameDecoder {}

impl FrameDecoder {
    pub fn next_frame(&mut self, buf: &mut BytesMut) -> Result<Option<IpcFrame>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        if buf[..4] != START_TAG {
            return Err(Error::ErrIpcFraming);
        }

        let client = u16::from_le_bytes([buf[4], buf[5]]);
        let code = buf[6];
        let payload_size =
            u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]) as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(Error::ErrIpcFraming);
        }

        let total = HEADER_SIZE + payload_size + END_TAG.len();
        if buf.len() < total {
            return Ok(None);
        }
        if buf[total - 4..total] != END_TAG {
            return Err(Error::ErrIpcFraming);
        }

        let frame = buf.split_to(total).freeze();
        let payload = frame.slice(HEADER_SIZE..HEADER_SIZE + payload_size);
        let command = Command::unmarshal(code, payload)?;

        Ok(Some(IpcFrame { client, command }))
    }
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u32_le(s.len() as u32);
    out.put_slice(s.as_bytes());
}

fn put_bytes(out: &mut BytesMut, b: &Bytes) {
    out.put_u32_le(b.len() as u32);
    out.put_slice(b);
}

fn put_rights(out: &mut BytesMut, rights: &PolicyRights) {
    for set in [&rights.requests, &rights.offers] {
        out.put_u32_le(set.len() as u32);
        for right in set.iter() {
            out.put_u16_le(right.service);
            out.put_u32_le(right.instances.len() as u32);
            for r in &right.instances {
                out.put_u16_le(r.first);
                out.put_u16_le(r.last);
            }
            out.put_u32_le(right.methods.len() as u32);
            for r in &right.methods {
                out.put_u16_le(r.first);
                out.put_u16_le(r.last);
            }
        }
    }
}

fn get_rights(p: &mut Bytes) -> Result<PolicyRights> {
    let mut sets: [Vec<ServiceRight>; 2] = [vec![], vec![]];
    for set in &mut sets {
        let count = get_u32(p)? as usize;
        for _ in 0..count {
            let service = get_u16(p)?;
            let mut instances = vec![];
            for _ in 0..get_u32(p)? as usize {
                instances.push(IdRange {
                    first: get_u16(p)?,
                    last: get_u16(p)?,
                });
            }
            let mut methods = vec![];
            for _ in 0..get_u32(p)? as usize {
                methods.push(IdRange {
                    first: get_u16(p)?,
                    last: get_u16(p)?,
                });
            }
            set.push(ServiceRight {
                service,
                instances,
                methods,
            });
        }
    }
    let [requests, offers] = sets;
    Ok(PolicyRights { requests, offers })
}

fn get_u8(p: &mut Bytes) -> Result<u8> {
    if p.remaining() < 1 {
        return Err(Error::ErrIpcPayload);
    }
    Ok(p.get_u8())
}

fn get_u16(p: &mut Bytes) -> Result<u16> {
    if p.remaining() < 2 {
        return Err(Error::ErrIpcPayload);
    }
    Ok(p.get_u16_le())
}

fn get_u32(p: &mut Bytes) -> Result<u32> {
    if p.remaining() < 4 {
        return Err(Error::ErrIpcPayload);
    }
    Ok(p.get_u32_le())
}

fn get_bytes(p: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(p)? as usize;
    if p.remaining() < len {
        return Err(Error::ErrIpcPayload);
    }
    Ok(p.split_to(len))
}

fn get_string(p: &mut Bytes) -> Result<String> {
    let raw = get_bytes(p)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::ErrIpcPayload)
}
