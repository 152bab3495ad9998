#[cfg(test)]
mod registry_test;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use message::types::*;
use sd::Reliability;

/// Who serves a (service, instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Local {
        client: ClientId,
    },
    Remote {
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
    },
}

impl Provider {
    pub fn is_local(&self) -> bool {
        matches!(self, Provider::Local { .. })
    }
}

/// Who consumes an eventgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    Local(ClientId),
    Remote(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Event,
    Field,
    Selective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Acked,
    Nacked,
    Unsubscribed,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub state: SubscriptionState,
    pub ttl: Ttl,
    /// Remote subscriber delivery endpoints.
    pub reliable: Option<SocketAddr>,
    pub unreliable: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub major: MajorVersion,
    pub minor: MinorVersion,
    pub provider: Provider,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub reliability: Reliability,
    pub eventgroups: HashSet<EventgroupId>,
    /// Last payload, cached for fields.
    pub cached: Option<Bytes>,
    pub cycle: Option<Duration>,
    pub change_resets_cycle: bool,
    /// Local clients that called request_event.
    pub requested_by: HashSet<ClientId>,
}

#[derive(Debug, Clone, Default)]
pub struct Eventgroup {
    pub events: HashSet<EventId>,
    pub multicast: Option<SocketAddr>,
    pub reliability: Reliability,
}

#[derive(Debug, Clone, Copy)]
struct RequestState {
    major: MajorVersion,
    minor: MinorVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Unavailable,
    Available,
    /// One of two expected transport legs has not shown up yet.
    Partial,
}

/// Result of an offer attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    /// New provider; the listed local clients get an availability edge.
    Offered { interested: Vec<ClientId> },
    /// Same provider again (idempotent re-offer).
    Unchanged,
    /// A different provider already holds the instance.
    Conflict,
}

/// The service/event bookkeeping of the routing manager.
///
/// The registry lives on the routing task and is mutated only there;
/// dispatch workers see cloned snapshots. Availability edges are computed
/// here so they stay monotone per (service, instance, observer).
#[derive(Debug, Default)]
pub struct Registry {
    offered: HashMap<(ServiceId, InstanceId), ServiceInstance>,
    requested: HashMap<(ServiceId, InstanceId), HashMap<ClientId, RequestState>>,
    eventgroups: HashMap<(ServiceId, InstanceId), HashMap<EventgroupId, Eventgroup>>,
    events: HashMap<(ServiceId, InstanceId), HashMap<EventId, Event>>,
    subscriptions: HashMap<(ServiceId, InstanceId, EventgroupId), HashMap<Subscriber, Subscription>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    // === offers ===========================================================

    /// At most one provider may hold a (service, instance) at any instant.
    pub fn offer(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        provider: Provider,
    ) -> OfferOutcome {
        match self.offered.get(&(service, instance)) {
            Some(existing) if existing.provider == provider => return OfferOutcome::Unchanged,
            Some(existing) if existing.provider.is_local() && provider.is_local() => {
                return OfferOutcome::Conflict;
            }
            Some(existing) => {
                // remote endpoints may move (new offer with new ports)
                if existing.provider.is_local() != provider.is_local() {
                    return OfferOutcome::Conflict;
                }
            }
            None => {}
        }

        let fresh = !self.offered.contains_key(&(service, instance));
        self.offered.insert(
            (service, instance),
            ServiceInstance {
                major,
                minor,
                provider,
            },
        );

        if fresh {
            OfferOutcome::Offered {
                interested: self.interested_clients(service, instance),
            }
        } else {
            OfferOutcome::Unchanged
        }
    }

    /// Only the original provider may withdraw. Returns the local clients
    /// owed an unavailability edge.
    pub fn stop_offer(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        provider_is_local: bool,
        local_client: Option<ClientId>,
    ) -> Option<Vec<ClientId>> {
        let existing = self.offered.get(&(service, instance))?;
        let matches = match (&existing.provider, provider_is_local) {
            (Provider::Local { client }, true) => {
                local_client.map(|c| c == *client).unwrap_or(false)
            }
            (Provider::Remote { .. }, false) => true,
            _ => false,
        };
        if !matches {
            return None;
        }

        self.offered.remove(&(service, instance));
        self.subscriptions
            .retain(|(s, i, _), _| !(*s == service && *i == instance));
        Some(self.interested_clients(service, instance))
    }

    pub fn provider(&self, service: ServiceId, instance: InstanceId) -> Option<&ServiceInstance> {
        self.offered.get(&(service, instance))
    }

    /// Resolves a concrete instance for a wildcard lookup.
    pub fn any_instance(&self, service: ServiceId) -> Option<InstanceId> {
        self.offered
            .keys()
            .filter(|(s, _)| *s == service)
            .map(|(_, i)| *i)
            .min()
    }

    pub fn offered_services(&self, local_only: Option<bool>) -> Vec<(ServiceId, InstanceId)> {
        let mut out: Vec<_> = self
            .offered
            .iter()
            .filter(|(_, v)| match local_only {
                Some(true) => v.provider.is_local(),
                Some(false) => !v.provider.is_local(),
                None => true,
            })
            .map(|(k, _)| *k)
            .collect();
        out.sort_unstable();
        out
    }

    pub fn availability_of(
        &self,
        service: ServiceId,
        instance: InstanceId,
        expected: Reliability,
    ) -> Availability {
        match self.offered.get(&(service, instance)) {
            None => Availability::Unavailable,
            Some(si) => match si.provider {
                Provider::Local { .. } => Availability::Available,
                Provider::Remote {
                    reliable,
                    unreliable,
                } => {
                    if expected == Reliability::Both
                        && (reliable.is_none() || unreliable.is_none())
                    {
                        Availability::Partial
                    } else if reliable.is_none() && unreliable.is_none() {
                        Availability::Partial
                    } else {
                        Availability::Available
                    }
                }
            },
        }
    }

    // === requests =========================================================

    /// Registers interest. Returns true when the instance is already
    /// available so the caller can deliver the immediate edge.
    pub fn request(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        client: ClientId,
    ) -> bool {
        self.requested
            .entry((service, instance))
            .or_default()
            .insert(client, RequestState { major, minor });

        if instance == ANY_INSTANCE {
            self.offered.keys().any(|(s, _)| *s == service)
        } else {
            self.offered.contains_key(&(service, instance))
        }
    }

    pub fn release(&mut self, service: ServiceId, instance: InstanceId, client: ClientId) {
        if let Some(clients) = self.requested.get_mut(&(service, instance)) {
            clients.remove(&client);
            if clients.is_empty() {
                self.requested.remove(&(service, instance));
            }
        }
    }

    /// Local clients whose requests match the given instance, including
    /// wildcard requests.
    pub fn interested_clients(&self, service: ServiceId, instance: InstanceId) -> Vec<ClientId> {
        let mut out: HashSet<ClientId> = HashSet::new();
        for ((s, i), clients) in &self.requested {
            if *s == service && (*i == instance || *i == ANY_INSTANCE) {
                out.extend(clients.keys().copied());
            }
        }
        let mut out: Vec<_> = out.into_iter().collect();
        out.sort_unstable();
        out
    }

    pub fn is_requested_by(
        &self,
        service: ServiceId,
        instance: InstanceId,
        client: ClientId,
    ) -> bool {
        self.requested
            .iter()
            .any(|((s, i), clients)| {
                *s == service
                    && (*i == instance || *i == ANY_INSTANCE)
                    && clients.contains_key(&client)
            })
    }

    // === events and eventgroups ===========================================

    #[allow(clippy::too_many_arguments)]
    pub fn add_event(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        kind: EventKind,
        reliability: Reliability,
        eventgroups: &[EventgroupId],
        cycle: Option<Duration>,
        change_resets_cycle: bool,
    ) {
        let entry = self
            .events
            .entry((service, instance))
            .or_default()
            .entry(event)
            .or_insert_with(|| Event {
                kind,
                reliability,
                eventgroups: HashSet::new(),
                cached: None,
                cycle,
                change_resets_cycle,
                requested_by: HashSet::new(),
            });
        entry.kind = kind;
        entry.reliability = reliability;
        entry.cycle = cycle;
        entry.change_resets_cycle = change_resets_cycle;
        entry.eventgroups.extend(eventgroups.iter().copied());

        for eg in eventgroups {
            self.eventgroups
                .entry((service, instance))
                .or_default()
                .entry(*eg)
                .or_default()
                .events
                .insert(event);
        }
    }

    pub fn remove_event(&mut self, service: ServiceId, instance: InstanceId, event: EventId) {
        if let Some(events) = self.events.get_mut(&(service, instance)) {
            events.remove(&event);
        }
        if let Some(groups) = self.eventgroups.get_mut(&(service, instance)) {
            for group in groups.values_mut() {
                group.events.remove(&event);
            }
        }
    }

    pub fn add_eventgroup(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        reliability: Reliability,
        multicast: Option<SocketAddr>,
    ) {
        let group = self
            .eventgroups
            .entry((service, instance))
            .or_default()
            .entry(eventgroup)
            .or_default();
        group.reliability = reliability;
        group.multicast = multicast;
    }

    pub fn eventgroup(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Option<&Eventgroup> {
        self.eventgroups.get(&(service, instance))?.get(&eventgroup)
    }

    pub fn event(&self, service: ServiceId, instance: InstanceId, event: EventId) -> Option<&Event> {
        self.events.get(&(service, instance))?.get(&event)
    }

    pub fn request_event(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        client: ClientId,
    ) {
        if let Some(e) = self
            .events
            .entry((service, instance))
            .or_default()
            .get_mut(&event)
        {
            e.requested_by.insert(client);
        } else {
            // interest may precede the provider's event definition
            self.events.entry((service, instance)).or_default().insert(
                event,
                Event {
                    kind: EventKind::Event,
                    reliability: Reliability::Unknown,
                    eventgroups: HashSet::new(),
                    cached: None,
                    cycle: None,
                    change_resets_cycle: false,
                    requested_by: [client].into_iter().collect(),
                },
            );
        }
    }

    pub fn release_event(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        client: ClientId,
    ) {
        if let Some(e) = self
            .events
            .get_mut(&(service, instance))
            .and_then(|m| m.get_mut(&event))
        {
            e.requested_by.remove(&client);
        }
    }

    /// Caches a field payload. Returns false when the payload is unchanged
    /// (caller may suppress the notification unless forced).
    pub fn cache_payload(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: &Bytes,
    ) -> bool {
        if let Some(e) = self
            .events
            .get_mut(&(service, instance))
            .and_then(|m| m.get_mut(&event))
        {
            let changed = e.cached.as_ref() != Some(payload);
            e.cached = Some(payload.clone());
            changed
        } else {
            true
        }
    }

    // === subscriptions ====================================================

    /// A subscription requires the provider to be present (the caller
    /// checks the subscriber side).
    pub fn subscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: Subscriber,
        ttl: Ttl,
        state: SubscriptionState,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
    ) {
        self.subscriptions
            .entry((service, instance, eventgroup))
            .or_default()
            .insert(
                subscriber,
                Subscription {
                    state,
                    ttl,
                    reliable,
                    unreliable,
                },
            );
    }

    pub fn set_subscription_state(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: Subscriber,
        state: SubscriptionState,
    ) {
        if let Some(sub) = self
            .subscriptions
            .get_mut(&(service, instance, eventgroup))
            .and_then(|m| m.get_mut(&subscriber))
        {
            sub.state = state;
        }
    }

    pub fn unsubscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: Subscriber,
    ) {
        if let Some(subs) = self.subscriptions.get_mut(&(service, instance, eventgroup)) {
            subs.remove(&subscriber);
            if subs.is_empty() {
                self.subscriptions.remove(&(service, instance, eventgroup));
            }
        }
    }

    pub fn subscription_state(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        subscriber: Subscriber,
    ) -> Option<SubscriptionState> {
        self.subscriptions
            .get(&(service, instance, eventgroup))?
            .get(&subscriber)
            .map(|s| s.state)
    }

    /// Local clients that must receive `event`: subscribed to a containing
    /// eventgroup with an acked subscription AND having requested the event.
    pub fn local_event_targets(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    ) -> Vec<ClientId> {
        let Some(ev) = self.event(service, instance, event) else {
            return vec![];
        };

        let mut out = HashSet::new();
        for eg in &ev.eventgroups {
            if let Some(subs) = self.subscriptions.get(&(service, instance, *eg)) {
                for (subscriber, sub) in subs {
                    if sub.state != SubscriptionState::Acked {
                        continue;
                    }
                    if let Subscriber::Local(client) = subscriber {
                        if ev.requested_by.contains(client) {
                            out.insert(*client);
                        }
                    }
                }
            }
        }
        let mut out: Vec<_> = out.into_iter().collect();
        out.sort_unstable();
        out
    }

    /// Remote delivery addresses for `event`, one entry per subscriber.
    pub fn remote_event_targets(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    ) -> Vec<(SocketAddr, Reliability, Option<SocketAddr>, Option<SocketAddr>)> {
        let Some(ev) = self.event(service, instance, event) else {
            return vec![];
        };

        let mut out = vec![];
        let mut seen = HashSet::new();
        for eg in &ev.eventgroups {
            let Some(group) = self.eventgroup(service, instance, *eg) else {
                continue;
            };
            if let Some(subs) = self.subscriptions.get(&(service, instance, *eg)) {
                for (subscriber, sub) in subs {
                    if sub.state != SubscriptionState::Acked {
                        continue;
                    }
                    if let Subscriber::Remote(addr) = subscriber {
                        if seen.insert(*addr) {
                            out.push((*addr, group.reliability, sub.reliable, sub.unreliable));
                        }
                    }
                }
            }
        }
        out
    }

    // === client teardown ==================================================

    /// Removes every trace of a lost local client. Returns the withdrawn
    /// offers as (service, instance, clients-to-notify).
    pub fn remove_client(
        &mut self,
        client: ClientId,
    ) -> Vec<(ServiceId, InstanceId, Vec<ClientId>)> {
        let owned: Vec<_> = self
            .offered
            .iter()
            .filter(|(_, si)| matches!(si.provider, Provider::Local { client: c } if c == client))
            .map(|(k, _)| *k)
            .collect();

        let mut withdrawn = vec![];
        for (service, instance) in owned {
            if let Some(clients) =
                self.stop_offer(service, instance, true, Some(client))
            {
                withdrawn.push((service, instance, clients));
            }
        }

        self.requested.retain(|_, clients| {
            clients.remove(&client);
            !clients.is_empty()
        });

        for subs in self.subscriptions.values_mut() {
            subs.remove(&Subscriber::Local(client));
        }
        self.subscriptions.retain(|_, subs| !subs.is_empty());

        for events in self.events.values_mut() {
            for event in events.values_mut() {
                event.requested_by.remove(&client);
            }
        }

        withdrawn
    }
}
