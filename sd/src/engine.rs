#[cfg(test)]
mod engine_test;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use message::sd::{Entry, EntryType, L4Proto, SdMessage, SdOption};
use message::types::*;
use message::Message;
use rand::Rng;

use crate::config::{Reliability, SdConfig};
use crate::error::{Error, Result};
use crate::phase::PhaseMachine;
use crate::subscriptions::{collapse_subscribes, NetSubscribe, ReplyAssembler, ReplyBuilder};

/// Where an outgoing SD datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdDestination {
    Multicast,
    Unicast(SocketAddr),
}

/// A remote service instance learned from an Offer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
    pub ttl: Ttl,
    pub reliable: Option<SocketAddr>,
    pub unreliable: Option<SocketAddr>,
}

/// A provider-side subscription awaiting the local acceptance verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDecision {
    pub token: u64,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: EventgroupId,
    pub subscriber: SocketAddr,
    pub ttl: Ttl,
    pub reliable: Option<SocketAddr>,
    pub unreliable: Option<SocketAddr>,
}

/// Work orders returned by the engine to its driver.
#[derive(Debug)]
pub enum SdAction {
    /// Transmit a ready-made SD carrier message.
    Send {
        message: Message,
        to: SdDestination,
    },
    /// Ask the local provider whether to accept a subscription, then call
    /// [`SdEngine::resolve_subscription`].
    Decide(SubscriptionDecision),
    RemoteOffered(RemoteService),
    /// StopOffer, TTL expiry or reboot removed a remote instance.
    RemoteExpired {
        service: ServiceId,
        instance: InstanceId,
    },
    /// Our own subscription got acknowledged.
    SubscriptionAcked {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        multicast: Option<SocketAddr>,
    },
    SubscriptionNacked {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
    /// A remote subscriber was committed on the provider side.
    RemoteSubscribed {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: SocketAddr,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
        ttl: Ttl,
    },
    RemoteUnsubscribed {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: SocketAddr,
    },
    PeerRebooted {
        peer: SocketAddr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineMode {
    Running,
    /// No offers are emitted and inbound SD is dropped.
    Suspended,
    /// Multicast offers are stopped; unicast find responses keep working.
    Diagnosis,
}

#[derive(Debug)]
struct LocalOffer {
    major: MajorVersion,
    minor: MinorVersion,
    reliable_port: Option<u16>,
    unreliable_port: Option<u16>,
    machine: PhaseMachine,
}

#[derive(Debug)]
struct LocalEventgroup {
    reliability: Reliability,
    multicast: Option<SocketAddr>,
}

#[derive(Debug)]
struct FindCampaign {
    major: MajorVersion,
    minor: MinorVersion,
    machine: PhaseMachine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalSubState {
    Pending,
    Acked,
    Nacked,
}

#[derive(Debug)]
struct LocalSubscription {
    major: MajorVersion,
    ttl: Ttl,
    reliable_local: Option<SocketAddr>,
    unreliable_local: Option<SocketAddr>,
    state: LocalSubState,
}

#[derive(Debug)]
struct RemoteOfferState {
    from: SocketAddr,
    major: MajorVersion,
    minor: MinorVersion,
    reliable: Option<SocketAddr>,
    unreliable: Option<SocketAddr>,
    expires: Option<Instant>,
}

#[derive(Debug)]
struct RemoteSubscription {
    reliable: Option<SocketAddr>,
    unreliable: Option<SocketAddr>,
    expires: Option<Instant>,
}

#[derive(Debug)]
struct PendingSubscription {
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    subscriber: SocketAddr,
    ttl: Ttl,
    reliable: Option<SocketAddr>,
    unreliable: Option<SocketAddr>,
}

#[derive(Debug, Default)]
struct PeerState {
    seen: bool,
    reboot: bool,
    session: SessionId,
}

/// Outgoing SD session counter. The reboot flag stays set until the counter
/// wraps for the first time; receivers combine flag and counter to detect a
/// restart on our side.
#[derive(Debug)]
struct SessionCounter {
    next: SessionId,
    wrapped: bool,
}

impl Default for SessionCounter {
    fn default() -> Self {
        SessionCounter {
            next: 1,
            wrapped: false,
        }
    }
}

impl SessionCounter {
    fn take(&mut self) -> (SessionId, bool) {
        let session = self.next;
        if self.next == 0xFFFF {
            self.next = 1;
            self.wrapped = true;
        } else {
            self.next += 1;
        }
        (session, !self.wrapped)
    }
}

/// The Service Discovery state machine.
pub struct SdEngine {
    config: SdConfig,
    mode: EngineMode,

    offers: HashMap<(ServiceId, InstanceId), LocalOffer>,
    eventgroups: HashMap<(ServiceId, InstanceId, EventgroupId), LocalEventgroup>,
    finds: HashMap<(ServiceId, InstanceId), FindCampaign>,
    local_subs: HashMap<(ServiceId, InstanceId, EventgroupId), LocalSubscription>,

    remote_offers: HashMap<(ServiceId, InstanceId), RemoteOfferState>,
    remote_subs: HashMap<(ServiceId, InstanceId, EventgroupId, SocketAddr), RemoteSubscription>,

    peers: HashMap<SocketAddr, PeerState>,
    replies: ReplyAssembler,
    pending_decisions: HashMap<u64, PendingSubscription>,
    /// Delayed unicast find responses: (due, target, service, instance).
    pending_unicast_offers: Vec<(Instant, SocketAddr, ServiceId, InstanceId)>,

    multicast_session: SessionCounter,
    unicast_sessions: HashMap<SocketAddr, SessionCounter>,
}

impl SdEngine {
    pub fn new(config: SdConfig) -> Self {
        SdEngine {
            config,
            mode: EngineMode::Running,
            offers: HashMap::new(),
            eventgroups: HashMap::new(),
            finds: HashMap::new(),
            local_subs: HashMap::new(),
            remote_offers: HashMap::new(),
            remote_subs: HashMap::new(),
            peers: HashMap::new(),
            replies: ReplyAssembler::default(),
            pending_decisions: HashMap::new(),
            pending_unicast_offers: vec![],
            multicast_session: SessionCounter::default(),
            unicast_sessions: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SdConfig {
        &self.config
    }

    pub fn is_suspended(&self) -> bool {
        self.mode == EngineMode::Suspended
    }

    // === local provider surface ===========================================

    /// Registers a local offer and starts its announcement phases.
    pub fn offer_service(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        reliable_port: Option<u16>,
        unreliable_port: Option<u16>,
        now: Instant,
    ) {
        let initial_delay = self.random_initial_delay();
        self.offers
            .entry((service, instance))
            .or_insert_with(|| LocalOffer {
                major,
                minor,
                reliable_port,
                unreliable_port,
                machine: PhaseMachine::start(now, initial_delay, true),
            });
    }

    /// Withdraws a local offer; a StopOffer goes out immediately.
    pub fn stop_offer_service(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Vec<SdAction> {
        let Some(offer) = self.offers.remove(&(service, instance)) else {
            return vec![];
        };
        self.remote_subs
            .retain(|(s, i, _, _), _| !(*s == service && *i == instance));

        if self.mode == EngineMode::Suspended {
            return vec![];
        }
        let entry =
            Entry::stop_offer_service(service, instance, offer.major, offer.minor);
        self.make_send(vec![entry], SdDestination::Multicast)
            .into_iter()
            .collect()
    }

    pub fn offer_eventgroup(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        reliability: Reliability,
        multicast: Option<SocketAddr>,
    ) {
        self.eventgroups.insert(
            (service, instance, eventgroup),
            LocalEventgroup {
                reliability,
                multicast,
            },
        );
    }

    pub fn stop_offer_eventgroup(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        self.eventgroups.remove(&(service, instance, eventgroup));
        self.remote_subs
            .retain(|(s, i, e, _), _| !(*s == service && *i == instance && *e == eventgroup));
    }

    // === local consumer surface ===========================================

    /// Starts a find campaign unless the instance is already known.
    pub fn request_service(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        now: Instant,
    ) {
        if self.lookup_remote(service, instance).is_some() {
            return;
        }
        let initial_delay = self.random_initial_delay();
        self.finds
            .entry((service, instance))
            .or_insert_with(|| FindCampaign {
                major,
                minor,
                machine: PhaseMachine::start(now, initial_delay, false),
            });
    }

    pub fn release_service(&mut self, service: ServiceId, instance: InstanceId) {
        self.finds.remove(&(service, instance));
    }

    /// Registers a subscription intent. The Subscribe entry goes out right
    /// away when the provider is already known, otherwise upon its Offer.
    pub fn subscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
        reliable_local: Option<SocketAddr>,
        unreliable_local: Option<SocketAddr>,
    ) -> Vec<SdAction> {
        self.local_subs.insert(
            (service, instance, eventgroup),
            LocalSubscription {
                major,
                ttl,
                reliable_local,
                unreliable_local,
                state: LocalSubState::Pending,
            },
        );

        match self.remote_offers.get(&(service, instance)) {
            Some(offer) if self.mode == EngineMode::Running => {
                let to = offer.from;
                let entry = self.subscribe_entry(service, instance, eventgroup);
                self.make_send(vec![entry], SdDestination::Unicast(to))
                    .into_iter()
                    .collect()
            }
            _ => vec![],
        }
    }

    /// Withdraws a subscription intent with an immediate StopSubscribe.
    pub fn unsubscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Vec<SdAction> {
        let Some(sub) = self.local_subs.remove(&(service, instance, eventgroup)) else {
            return vec![];
        };
        match self.remote_offers.get(&(service, instance)) {
            Some(offer) if self.mode == EngineMode::Running => {
                let to = offer.from;
                let entry = Entry::subscribe(
                    service, instance, eventgroup, sub.major, 0, 0, vec![],
                );
                self.make_send(vec![entry], SdDestination::Unicast(to))
                    .into_iter()
                    .collect()
            }
            _ => vec![],
        }
    }

    // === verdicts =========================================================

    /// Commits an asynchronous acceptance verdict for an inbound
    /// subscription and flushes every reply datagram that became ready.
    pub fn resolve_subscription(
        &mut self,
        token: u64,
        accept: bool,
        now: Instant,
    ) -> Result<Vec<SdAction>> {
        let pending = self
            .pending_decisions
            .remove(&token)
            .ok_or(Error::ErrUnknownDecision)?;

        let mut actions = vec![];
        if accept {
            self.remote_subs.insert(
                (
                    pending.service,
                    pending.instance,
                    pending.eventgroup,
                    pending.subscriber,
                ),
                RemoteSubscription {
                    reliable: pending.reliable,
                    unreliable: pending.unreliable,
                    expires: expiry(now, pending.ttl),
                },
            );
            actions.push(SdAction::RemoteSubscribed {
                service: pending.service,
                instance: pending.instance,
                eventgroup: pending.eventgroup,
                subscriber: pending.subscriber,
                reliable: pending.reliable,
                unreliable: pending.unreliable,
                ttl: pending.ttl,
            });
        }

        for (to, entries) in self.replies.resolve(token, accept) {
            actions.extend(self.make_send(entries, SdDestination::Unicast(to)));
        }
        Ok(actions)
    }

    // === routing states ===================================================

    /// SUSPENDED: offers stop, inbound SD is dropped.
    pub fn suspend(&mut self) -> Vec<SdAction> {
        if self.mode == EngineMode::Suspended {
            return vec![];
        }
        self.mode = EngineMode::Suspended;
        self.emit_stop_all()
    }

    /// RESUMED: every local offer re-enters its repetition phase.
    pub fn resume(&mut self, now: Instant) {
        if self.mode == EngineMode::Running {
            return;
        }
        self.mode = EngineMode::Running;
        for offer in self.offers.values_mut() {
            offer.machine.restart(now);
        }
    }

    /// DIAGNOSIS: multicast offers are withdrawn but finds keep being
    /// answered unicast.
    pub fn diagnosis(&mut self) -> Vec<SdAction> {
        if self.mode == EngineMode::Diagnosis {
            return vec![];
        }
        self.mode = EngineMode::Diagnosis;
        self.emit_stop_all()
    }

    /// SHUTDOWN: final StopOffer for everything we announced.
    pub fn shutdown(&mut self) -> Vec<SdAction> {
        let actions = self.emit_stop_all();
        self.offers.clear();
        self.finds.clear();
        self.mode = EngineMode::Suspended;
        actions
    }

    fn emit_stop_all(&mut self) -> Vec<SdAction> {
        let entries: Vec<Entry> = self
            .offers
            .iter()
            .map(|((s, i), o)| Entry::stop_offer_service(*s, *i, o.major, o.minor))
            .collect();
        if entries.is_empty() {
            return vec![];
        }
        self.make_send(entries, SdDestination::Multicast)
            .into_iter()
            .collect()
    }

    // === timers ===========================================================

    /// Earliest instant at which [`SdEngine::handle_timeout`] has work.
    pub fn next_timeout(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                next = Some(match next {
                    Some(n) => n.min(t),
                    None => t,
                });
            }
        };

        if self.mode == EngineMode::Running {
            for offer in self.offers.values() {
                consider(offer.machine.deadline());
            }
            for find in self.finds.values() {
                consider(find.machine.deadline());
            }
        }
        if self.mode != EngineMode::Suspended {
            for (due, _, _, _) in &self.pending_unicast_offers {
                consider(Some(*due));
            }
        }
        for offer in self.remote_offers.values() {
            consider(offer.expires);
        }
        for sub in self.remote_subs.values() {
            consider(sub.expires);
        }
        next
    }

    /// Runs every timer that is due at `now`.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<SdAction> {
        let mut actions = vec![];

        if self.mode == EngineMode::Running {
            // cyclic / repetition offers, batched into one datagram
            let mut offer_entries = vec![];
            for ((service, instance), offer) in &mut self.offers {
                if offer.machine.fire(now, &self.config) {
                    offer_entries.push(offer_entry(
                        *service,
                        *instance,
                        offer,
                        self.config.ttl,
                        self.config.unicast,
                    ));
                }
            }
            if !offer_entries.is_empty() {
                actions.extend(self.make_send(offer_entries, SdDestination::Multicast));
            }

            let mut find_entries = vec![];
            for ((service, instance), find) in &mut self.finds {
                if find.machine.fire(now, &self.config) {
                    find_entries.push(Entry::find_service(
                        *service,
                        *instance,
                        find.major,
                        find.minor,
                        self.config.ttl,
                    ));
                }
            }
            if !find_entries.is_empty() {
                actions.extend(self.make_send(find_entries, SdDestination::Multicast));
            }
        }

        // delayed unicast responses to FindService
        if self.mode != EngineMode::Suspended {
            let due: Vec<_> = {
                let pending = &mut self.pending_unicast_offers;
                let mut due = vec![];
                pending.retain(|(when, to, service, instance)| {
                    if *when <= now {
                        due.push((*to, *service, *instance));
                        false
                    } else {
                        true
                    }
                });
                due
            };
            for (to, service, instance) in due {
                if let Some(offer) = self.offers.get(&(service, instance)) {
                    let entry = offer_entry(
                        service,
                        instance,
                        offer,
                        self.config.ttl,
                        self.config.unicast,
                    );
                    actions.extend(self.make_send(vec![entry], SdDestination::Unicast(to)));
                }
            }
        }

        // remote offer expiry
        let expired: Vec<_> = self
            .remote_offers
            .iter()
            .filter(|(_, o)| o.expires.is_some_and(|e| e <= now))
            .map(|(k, _)| *k)
            .collect();
        for (service, instance) in expired {
            self.remote_offers.remove(&(service, instance));
            self.reset_local_subs(service, instance);
            actions.push(SdAction::RemoteExpired { service, instance });
        }

        // provider-side subscription expiry
        let expired: Vec<_> = self
            .remote_subs
            .iter()
            .filter(|(_, s)| s.expires.is_some_and(|e| e <= now))
            .map(|(k, _)| *k)
            .collect();
        for (service, instance, eventgroup, subscriber) in expired {
            self.remote_subs
                .remove(&(service, instance, eventgroup, subscriber));
            actions.push(SdAction::RemoteUnsubscribed {
                service,
                instance,
                eventgroup,
                subscriber,
            });
        }

        actions
    }

    // === inbound ==========================================================

    /// Processes one SD datagram. Entries are handled in datagram order;
    /// subscribe entries are collapsed to their per-eventgroup net effect
    /// and answered in one reply datagram.
    pub fn handle_message(
        &mut self,
        sd: &SdMessage,
        session: SessionId,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<SdAction> {
        if self.mode == EngineMode::Suspended {
            log::debug!("suspended, dropping sd datagram from {from}");
            return vec![];
        }

        let mut actions = vec![];
        if self.detect_reboot(from, sd.reboot, session) {
            log::info!("peer {from} rebooted");
            actions.push(SdAction::PeerRebooted { peer: from });
            actions.extend(self.purge_peer(from, now));
        }

        for entry in &sd.entries {
            match entry.entry_type {
                EntryType::FindService => self.on_find(entry, from, now),
                EntryType::OfferService => {
                    actions.extend(self.on_offer(entry, from, now));
                }
                EntryType::SubscribeEventgroupAck => {
                    actions.extend(self.on_subscribe_ack(entry));
                }
                EntryType::SubscribeEventgroup => {} // handled collapsed below
            }
        }

        let net = collapse_subscribes(&sd.entries);
        if !net.is_empty() {
            let mut builder = self.replies.begin(from);
            for item in net {
                actions.extend(self.on_net_subscribe(&item, from, now, &mut builder));
            }
            for (to, entries) in self.replies.commit(builder) {
                actions.extend(self.make_send(entries, SdDestination::Unicast(to)));
            }
        }

        actions
    }

    fn on_find(&mut self, entry: &Entry, from: SocketAddr, now: Instant) {
        let matches: Vec<_> = self
            .offers
            .iter()
            .filter(|((s, i), o)| {
                *s == entry.service
                    && (entry.instance == ANY_INSTANCE || *i == entry.instance)
                    && (entry.major == ANY_MAJOR || o.major == entry.major)
            })
            .map(|((s, i), _)| (*s, *i))
            .collect();

        for (service, instance) in matches {
            let due = now + self.config.request_response_delay;
            self.pending_unicast_offers.push((due, from, service, instance));
        }
    }

    fn on_offer(&mut self, entry: &Entry, from: SocketAddr, now: Instant) -> Vec<SdAction> {
        let key = (entry.service, entry.instance);
        let minor = match entry.detail {
            message::sd::EntryDetail::Service { minor } => minor,
            _ => return vec![],
        };

        if entry.is_stop() {
            if self.remote_offers.remove(&key).is_none() {
                return vec![];
            }
            self.reset_local_subs(entry.service, entry.instance);
            return vec![SdAction::RemoteExpired {
                service: entry.service,
                instance: entry.instance,
            }];
        }

        let (reliable, unreliable) = endpoint_options(&entry.options);
        let expires = expiry(now, entry.ttl);

        let changed = match self.remote_offers.get(&key) {
            Some(existing) => existing.reliable != reliable || existing.unreliable != unreliable,
            None => true,
        };
        self.remote_offers.insert(
            key,
            RemoteOfferState {
                from,
                major: entry.major,
                minor,
                reliable,
                unreliable,
                expires,
            },
        );
        self.finds.remove(&key);

        let mut actions = vec![];
        if changed {
            actions.push(SdAction::RemoteOffered(RemoteService {
                service: entry.service,
                instance: entry.instance,
                major: entry.major,
                minor,
                ttl: entry.ttl,
                reliable,
                unreliable,
            }));
        }

        // (re)subscribe everything we want from this instance
        if self.mode == EngineMode::Running {
            let wanted: Vec<EventgroupId> = self
                .local_subs
                .iter()
                .filter(|((s, i, _), _)| *s == entry.service && *i == entry.instance)
                .map(|((_, _, e), _)| *e)
                .collect();
            if !wanted.is_empty() {
                let entries: Vec<Entry> = wanted
                    .into_iter()
                    .map(|eg| self.subscribe_entry(entry.service, entry.instance, eg))
                    .collect();
                actions.extend(self.make_send(entries, SdDestination::Unicast(from)));
            }
        }

        actions
    }

    fn on_subscribe_ack(&mut self, entry: &Entry) -> Vec<SdAction> {
        let Some(eventgroup) = entry.eventgroup() else {
            return vec![];
        };
        let key = (entry.service, entry.instance, eventgroup);
        let Some(sub) = self.local_subs.get_mut(&key) else {
            return vec![];
        };

        if entry.is_stop() {
            sub.state = LocalSubState::Nacked;
            return vec![SdAction::SubscriptionNacked {
                service: entry.service,
                instance: entry.instance,
                eventgroup,
            }];
        }

        let was_acked = sub.state == LocalSubState::Acked;
        sub.state = LocalSubState::Acked;
        if was_acked {
            // ttl refresh only, no new edge
            return vec![];
        }

        let multicast = entry.options.iter().find_map(|o| match o {
            SdOption::Ipv4Multicast { addr, port } => {
                Some(SocketAddr::new(IpAddr::V4(*addr), *port))
            }
            SdOption::Ipv6Multicast { addr, port } => {
                Some(SocketAddr::new(IpAddr::V6(*addr), *port))
            }
            _ => None,
        });

        vec![SdAction::SubscriptionAcked {
            service: entry.service,
            instance: entry.instance,
            eventgroup,
            multicast,
        }]
    }

    fn on_net_subscribe(
        &mut self,
        net: &NetSubscribe,
        from: SocketAddr,
        now: Instant,
        builder: &mut ReplyBuilder,
    ) -> Vec<SdAction> {
        let entry = net.entry().clone();
        let Some(eventgroup) = entry.eventgroup() else {
            return vec![];
        };
        let counter = match entry.detail {
            message::sd::EntryDetail::Eventgroup { counter, .. } => counter,
            _ => 0,
        };
        let (reliable, unreliable) = endpoint_options(&entry.options);
        let sub_key = (entry.service, entry.instance, eventgroup, from);

        if let NetSubscribe::Stop { .. } = net {
            if self.remote_subs.remove(&sub_key).is_some() {
                return vec![SdAction::RemoteUnsubscribed {
                    service: entry.service,
                    instance: entry.instance,
                    eventgroup,
                    subscriber: from,
                }];
            }
            return vec![];
        }

        let refresh = matches!(net, NetSubscribe::Subscribe { refresh: true, .. });

        let nack = Entry::subscribe_ack(
            entry.service,
            entry.instance,
            eventgroup,
            entry.major,
            counter,
            0,
            vec![],
        );

        // unknown service instance or eventgroup
        if !self.offers.contains_key(&(entry.service, entry.instance)) {
            log::debug!(
                "nack: service {:04x}.{:04x} not offered here",
                entry.service,
                entry.instance
            );
            builder.push_ready(nack);
            return vec![];
        }
        let Some(group) = self
            .eventgroups
            .get(&(entry.service, entry.instance, eventgroup))
        else {
            log::debug!("nack: unknown eventgroup {eventgroup:04x}");
            builder.push_ready(nack);
            return vec![];
        };

        // requested endpoints must fit the eventgroup's reliability
        let compatible = (reliable.is_some() && group.reliability.accepts(L4Proto::Tcp))
            || (unreliable.is_some() && group.reliability.accepts(L4Proto::Udp));
        if !compatible {
            log::debug!("nack: endpoint options incompatible with eventgroup reliability");
            builder.push_ready(nack);
            return vec![];
        }

        let mut ack_options = vec![];
        if let Some(SocketAddr::V4(mc)) = group.multicast {
            ack_options.push(SdOption::Ipv4Multicast {
                addr: *mc.ip(),
                port: mc.port(),
            });
        }
        let ack = Entry::subscribe_ack(
            entry.service,
            entry.instance,
            eventgroup,
            entry.major,
            counter,
            entry.ttl,
            ack_options,
        );

        // an existing subscription (or a stop+subscribe collapse) is a pure
        // ttl refresh and is acked without consulting the provider again
        if refresh || self.remote_subs.contains_key(&sub_key) {
            if let Some(existing) = self.remote_subs.get_mut(&sub_key) {
                existing.expires = expiry(now, entry.ttl);
                builder.push_ready(ack);
                return vec![];
            }
        }

        let token = self.replies.push_waiting(builder, ack, nack);
        self.pending_decisions.insert(
            token,
            PendingSubscription {
                service: entry.service,
                instance: entry.instance,
                eventgroup,
                subscriber: from,
                ttl: entry.ttl,
                reliable,
                unreliable,
            },
        );

        vec![SdAction::Decide(SubscriptionDecision {
            token,
            service: entry.service,
            instance: entry.instance,
            eventgroup,
            subscriber: from,
            ttl: entry.ttl,
            reliable,
            unreliable,
        })]
    }

    // === reboot handling ==================================================

    fn detect_reboot(&mut self, from: SocketAddr, reboot: bool, session: SessionId) -> bool {
        let peer = self.peers.entry(from).or_default();
        let rebooted = peer.seen
            && reboot
            && (!peer.reboot || session <= peer.session);
        peer.seen = true;
        peer.reboot = reboot;
        peer.session = session;
        rebooted
    }

    /// Reboot: drop the peer's offers and subscriptions both ways and
    /// restart our find campaigns so requests get re-announced.
    fn purge_peer(&mut self, peer: SocketAddr, now: Instant) -> Vec<SdAction> {
        let mut actions = vec![];

        let offered: Vec<_> = self
            .remote_offers
            .iter()
            .filter(|(_, o)| o.from.ip() == peer.ip())
            .map(|(k, _)| *k)
            .collect();
        for (service, instance) in offered {
            self.remote_offers.remove(&(service, instance));
            self.reset_local_subs(service, instance);
            actions.push(SdAction::RemoteExpired { service, instance });
            // re-announce our interest
            let initial_delay = self.random_initial_delay();
            if let Some(find) = self.finds.get_mut(&(service, instance)) {
                find.machine.restart(now);
            } else {
                self.finds.insert(
                    (service, instance),
                    FindCampaign {
                        major: ANY_MAJOR,
                        minor: ANY_MINOR,
                        machine: PhaseMachine::start(now, initial_delay, false),
                    },
                );
            }
        }

        let subscribed: Vec<_> = self
            .remote_subs
            .keys()
            .filter(|(_, _, _, s)| s.ip() == peer.ip())
            .copied()
            .collect();
        for (service, instance, eventgroup, subscriber) in subscribed {
            self.remote_subs
                .remove(&(service, instance, eventgroup, subscriber));
            actions.push(SdAction::RemoteUnsubscribed {
                service,
                instance,
                eventgroup,
                subscriber,
            });
        }

        actions
    }

    // === helpers ==========================================================

    fn lookup_remote(&self, service: ServiceId, instance: InstanceId) -> Option<&RemoteOfferState> {
        self.remote_offers.get(&(service, instance))
    }

    /// Remote endpoints of a known instance (for the routing manager).
    pub fn remote_endpoints(
        &self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Option<(Option<SocketAddr>, Option<SocketAddr>)> {
        self.lookup_remote(service, instance)
            .map(|o| (o.reliable, o.unreliable))
    }

    pub fn has_remote_subscription(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: SocketAddr,
    ) -> bool {
        self.remote_subs
            .contains_key(&(service, instance, eventgroup, subscriber))
    }

    pub fn is_in_mainphase(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.offers
            .get(&(service, instance))
            .map(|o| o.machine.is_in_mainphase)
            .unwrap_or(false)
    }

    fn reset_local_subs(&mut self, service: ServiceId, instance: InstanceId) {
        for ((s, i, _), sub) in self.local_subs.iter_mut() {
            if *s == service && *i == instance {
                sub.state = LocalSubState::Pending;
            }
        }
    }

    fn subscribe_entry(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Entry {
        let sub = &self.local_subs[&(service, instance, eventgroup)];
        let mut options = vec![];
        if let Some(SocketAddr::V4(addr)) = sub.reliable_local {
            options.push(SdOption::Ipv4Endpoint {
                addr: *addr.ip(),
                proto: L4Proto::Tcp,
                port: addr.port(),
            });
        }
        if let Some(SocketAddr::V4(addr)) = sub.unreliable_local {
            options.push(SdOption::Ipv4Endpoint {
                addr: *addr.ip(),
                proto: L4Proto::Udp,
                port: addr.port(),
            });
        }
        Entry::subscribe(service, instance, eventgroup, sub.major, 0, sub.ttl, options)
    }

    fn random_initial_delay(&self) -> Duration {
        let min = self.config.initial_delay_min.as_millis() as u64;
        let max = self.config.initial_delay_max.as_millis() as u64;
        if max <= min {
            return self.config.initial_delay_min;
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Wraps entries into an SD carrier with the right session counter and
    /// reboot flag for the destination. A datagram whose option array would
    /// overflow the 8 bit entry references is dropped with a log entry; no
    /// realistic entry batch gets there.
    fn make_send(&mut self, entries: Vec<Entry>, to: SdDestination) -> Option<SdAction> {
        let counter = match to {
            SdDestination::Multicast => &mut self.multicast_session,
            SdDestination::Unicast(addr) => {
                self.unicast_sessions.entry(addr).or_default()
            }
        };
        let (session, reboot) = counter.take();

        let mut sd = SdMessage::new(reboot);
        sd.unicast = true;
        sd.entries = entries;

        match sd.to_message(session) {
            Ok(message) => Some(SdAction::Send { message, to }),
            Err(e) => {
                log::error!("failed to assemble sd datagram: {e}");
                None
            }
        }
    }
}

fn expiry(now: Instant, ttl: Ttl) -> Option<Instant> {
    if ttl == DEFAULT_TTL {
        None
    } else {
        Some(now + Duration::from_secs(u64::from(ttl)))
    }
}

fn offer_entry(
    service: ServiceId,
    instance: InstanceId,
    offer: &LocalOffer,
    ttl: Ttl,
    unicast: std::net::Ipv4Addr,
) -> Entry {
    let mut options = vec![];
    if let Some(port) = offer.reliable_port {
        options.push(SdOption::Ipv4Endpoint {
            addr: unicast,
            proto: L4Proto::Tcp,
            port,
        });
    }
    if let Some(port) = offer.unreliable_port {
        options.push(SdOption::Ipv4Endpoint {
            addr: unicast,
            proto: L4Proto::Udp,
            port,
        });
    }
    Entry::offer_service(service, instance, offer.major, offer.minor, ttl, options)
}

/// Splits the endpoint options of an entry into (reliable, unreliable).
fn endpoint_options(options: &[SdOption]) -> (Option<SocketAddr>, Option<SocketAddr>) {
    let mut reliable = None;
    let mut unreliable = None;
    for option in options {
        match option {
            SdOption::Ipv4Endpoint { addr, proto, port } => {
                let sock = SocketAddr::new(IpAddr::V4(*addr), *port);
                match proto {
                    L4Proto::Tcp => reliable = reliable.or(Some(sock)),
                    L4Proto::Udp => unreliable = unreliable.or(Some(sock)),
                }
            }
            SdOption::Ipv6Endpoint { addr, proto, port } => {
                let sock = SocketAddr::new(IpAddr::V6(*addr), *port);
                match proto {
                    L4Proto::Tcp => reliable = reliable.or(Some(sock)),
                    L4Proto::Udp => unreliable = unreliable.or(Some(sock)),
                }
            }
            _ => {}
        }
    }
    (reliable, unreliable)
}
