//! Per-datagram subscribe processing helpers.
//!
//! Subscribe entries are committed per datagram: several entries for the
//! same (service, instance, eventgroup) collapse to their net effect, and a
//! StopSubscribe directly followed by a Subscribe is a refresh that must not
//! tear the underlying subscription down. Replies wait for asynchronous
//! acceptance verdicts while preserving per-sender ordering.

use std::collections::VecDeque;
use std::net::SocketAddr;

use message::sd::{Entry, EntryType};
use message::types::*;

/// Net effect of all subscribe entries for one eventgroup in one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetSubscribe {
    Subscribe {
        entry: Entry,
        /// A StopSubscribe preceded the final Subscribe: keep the existing
        /// subscription alive and only refresh its TTL.
        refresh: bool,
    },
    Stop {
        entry: Entry,
    },
}

impl NetSubscribe {
    pub fn entry(&self) -> &Entry {
        match self {
            NetSubscribe::Subscribe { entry, .. } | NetSubscribe::Stop { entry } => entry,
        }
    }
}

/// Collapses the SubscribeEventgroup entries of one datagram, preserving
/// the order in which eventgroups first appear.
pub fn collapse_subscribes(entries: &[Entry]) -> Vec<NetSubscribe> {
    let mut order: Vec<(ServiceId, InstanceId, EventgroupId)> = vec![];
    let mut net: Vec<NetSubscribe> = vec![];

    for entry in entries {
        if entry.entry_type != EntryType::SubscribeEventgroup {
            continue;
        }
        let Some(eventgroup) = entry.eventgroup() else {
            continue;
        };
        let key = (entry.service, entry.instance, eventgroup);

        let state = if entry.ttl > 0 {
            let prior_stop = match order.iter().position(|k| *k == key) {
                Some(i) => matches!(net[i], NetSubscribe::Stop { .. }),
                None => false,
            };
            NetSubscribe::Subscribe {
                entry: entry.clone(),
                refresh: prior_stop,
            }
        } else {
            NetSubscribe::Stop {
                entry: entry.clone(),
            }
        };

        match order.iter().position(|k| *k == key) {
            Some(i) => net[i] = state,
            None => {
                order.push(key);
                net.push(state);
            }
        }
    }

    net
}

#[derive(Debug)]
enum Slot {
    Ready(Entry),
    Waiting {
        token: u64,
        ack: Entry,
        nack: Entry,
    },
}

#[derive(Debug)]
struct PendingReply {
    to: SocketAddr,
    slots: Vec<Slot>,
}

impl PendingReply {
    fn is_complete(&self) -> bool {
        self.slots.iter().all(|s| matches!(s, Slot::Ready(_)))
    }
}

/// Assembles SubscribeAck/Nack reply datagrams.
///
/// A datagram's acks go out as one reply; entries whose acceptance verdict
/// is asynchronous keep the whole reply (and every later reply to the same
/// sender) queued until the verdict lands, so a sender always observes its
/// acks in request order.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    next_token: u64,
    pending: VecDeque<PendingReply>,
}

/// Builder handle for the reply to one inbound datagram.
pub struct ReplyBuilder {
    to: SocketAddr,
    slots: Vec<Slot>,
}

impl ReplyAssembler {
    pub fn begin(&mut self, to: SocketAddr) -> ReplyBuilder {
        ReplyBuilder { to, slots: vec![] }
    }

    /// Commits a built reply. Returns every reply datagram that became
    /// flushable, oldest first.
    pub fn commit(&mut self, builder: ReplyBuilder) -> Vec<(SocketAddr, Vec<Entry>)> {
        if builder.slots.is_empty() {
            return self.flushable();
        }
        self.pending.push_back(PendingReply {
            to: builder.to,
            slots: builder.slots,
        });
        self.flushable()
    }

    /// Resolves an asynchronous acceptance verdict.
    pub fn resolve(&mut self, token: u64, accept: bool) -> Vec<(SocketAddr, Vec<Entry>)> {
        for reply in &mut self.pending {
            for slot in &mut reply.slots {
                if let Slot::Waiting {
                    token: t,
                    ack,
                    nack,
                } = slot
                {
                    if *t == token {
                        let chosen = if accept { ack.clone() } else { nack.clone() };
                        *slot = Slot::Ready(chosen);
                        return self.flushable();
                    }
                }
            }
        }
        vec![]
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pops complete replies, per sender strictly in arrival order.
    fn flushable(&mut self) -> Vec<(SocketAddr, Vec<Entry>)> {
        let mut out = vec![];
        let mut blocked: Vec<SocketAddr> = vec![];
        let mut index = 0;
        while index < self.pending.len() {
            let reply = &self.pending[index];
            if blocked.contains(&reply.to) {
                index += 1;
                continue;
            }
            if reply.is_complete() {
                let reply = self.pending.remove(index).unwrap();
                let entries = reply
                    .slots
                    .into_iter()
                    .map(|s| match s {
                        Slot::Ready(e) => e,
                        Slot::Waiting { .. } => unreachable!("complete reply"),
                    })
                    .collect();
                out.push((reply.to, entries));
            } else {
                blocked.push(reply.to);
                index += 1;
            }
        }
        out
    }
}

impl ReplyBuilder {
    /// Adds an already decided entry (ack or nack).
    pub fn push_ready(&mut self, entry: Entry) {
        self.slots.push(Slot::Ready(entry));
    }
}

impl ReplyAssembler {
    /// Adds an entry whose verdict is still outstanding; returns the token
    /// the owner passes back into [`ReplyAssembler::resolve`].
    pub fn push_waiting(&mut self, builder: &mut ReplyBuilder, ack: Entry, nack: Entry) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        builder.slots.push(Slot::Waiting { token, ack, nack });
        token
    }
}
