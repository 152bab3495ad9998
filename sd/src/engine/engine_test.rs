use std::net::Ipv4Addr;

use message::sd::EntryDetail;

use super::*;

const SERVICE: ServiceId = 0x1122;
const INSTANCE: InstanceId = 0x0001;

fn test_config() -> SdConfig {
    SdConfig {
        unicast: Ipv4Addr::new(192, 168, 0, 7),
        initial_delay_min: Duration::from_millis(10),
        initial_delay_max: Duration::from_millis(10),
        repetitions_max: 3,
        repetitions_base_delay: Duration::from_millis(200),
        cyclic_offer_delay: Duration::from_secs(2),
        request_response_delay: Duration::from_millis(30),
        ttl: 3,
        ..Default::default()
    }
}

fn peer() -> SocketAddr {
    "192.168.0.9:30490".parse().unwrap()
}

fn offering_engine(now: Instant) -> SdEngine {
    let mut engine = SdEngine::new(test_config());
    engine.offer_service(SERVICE, INSTANCE, 0x01, 0x0000_0000, Some(30509), Some(30509), now);
    engine.offer_eventgroup(SERVICE, INSTANCE, 0x1000, Reliability::Unreliable, None);
    engine.offer_eventgroup(SERVICE, INSTANCE, 0x1001, Reliability::Unreliable, None);
    engine
}

/// Runs the engine's timers up to `until`, collecting actions.
fn drive(engine: &mut SdEngine, until: Instant) -> Vec<SdAction> {
    let mut actions = vec![];
    while let Some(due) = engine.next_timeout() {
        if due > until {
            break;
        }
        actions.extend(engine.handle_timeout(due));
    }
    actions
}

fn sent_sd(actions: &[SdAction]) -> Vec<(&Message, SdDestination)> {
    actions
        .iter()
        .filter_map(|a| match a {
            SdAction::Send { message, to } => Some((message, *to)),
            _ => None,
        })
        .collect()
}

fn decode(message: &Message) -> SdMessage {
    SdMessage::from_message(message).unwrap()
}

fn subscribe_datagram(entries: Vec<Entry>) -> SdMessage {
    let mut sd = SdMessage::new(true);
    sd.entries = entries;
    sd
}

fn sub_entry(eventgroup: EventgroupId, ttl: Ttl) -> Entry {
    Entry::subscribe(
        SERVICE,
        INSTANCE,
        eventgroup,
        0x01,
        0,
        ttl,
        vec![SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(192, 168, 0, 9),
            proto: L4Proto::Udp,
            port: 40002,
        }],
    )
}

/// Resolves every Decide action with `accept` and folds the follow-up
/// actions into the list.
fn auto_resolve(engine: &mut SdEngine, actions: Vec<SdAction>, accept: bool, now: Instant) -> Vec<SdAction> {
    let mut out = vec![];
    for action in actions {
        match action {
            SdAction::Decide(decision) => {
                out.extend(engine.resolve_subscription(decision.token, accept, now).unwrap());
            }
            other => out.push(other),
        }
    }
    out
}

#[test]
fn test_offer_phases_on_the_wire() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let actions = drive(&mut engine, start + Duration::from_secs(4));
    let sent = sent_sd(&actions);

    // initial wait + 3 repetitions + main phase offers within 4s:
    // 10ms, 210ms, 610ms, 1410ms, 3410ms
    assert_eq!(sent.len(), 5);
    for (message, to) in &sent {
        assert_eq!(*to, SdDestination::Multicast);
        let sd = decode(message);
        assert_eq!(sd.entries.len(), 1);
        let entry = &sd.entries[0];
        assert_eq!(entry.entry_type, EntryType::OfferService);
        assert_eq!(entry.service, SERVICE);
        assert_eq!(entry.ttl, 3);
        assert_eq!(entry.options.len(), 2);
    }
    assert!(engine.is_in_mainphase(SERVICE, INSTANCE));

    // sd sessions increase and carry the reboot flag
    let sessions: Vec<SessionId> = sent.iter().map(|(m, _)| m.header.session).collect();
    assert_eq!(sessions, vec![1, 2, 3, 4, 5]);
    assert!(sent.iter().all(|(m, _)| decode(m).reboot));
}

// Multi-subscribe in one datagram: two eventgroups, ttl 3 each, one
// reply with two acks.
#[test]
fn test_multi_subscribe_single_reply() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let datagram = subscribe_datagram(vec![sub_entry(0x1000, 3), sub_entry(0x1001, 3)]);
    let actions = engine.handle_message(&datagram, 1, peer(), start);
    let actions = auto_resolve(&mut engine, actions, true, start);

    let committed: Vec<_> = actions
        .iter()
        .filter(|a| matches!(a, SdAction::RemoteSubscribed { .. }))
        .collect();
    assert_eq!(committed.len(), 2);

    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1, "exactly one reply datagram");
    let (reply, to) = sent[0];
    assert_eq!(to, SdDestination::Unicast(peer()));

    let sd = decode(reply);
    assert_eq!(sd.entries.len(), 2);
    for entry in &sd.entries {
        assert_eq!(entry.entry_type, EntryType::SubscribeEventgroupAck);
        assert_eq!(entry.ttl, 3);
    }
    assert_eq!(sd.entries[0].eventgroup(), Some(0x1000));
    assert_eq!(sd.entries[1].eventgroup(), Some(0x1001));

    assert!(engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));
    assert!(engine.has_remote_subscription(SERVICE, INSTANCE, 0x1001, peer()));
}

// Alternating subscribe/unsubscribe over 16 datagrams, starting with a
// stop: 8 acks with ttl 16, final state subscribed.
#[test]
fn test_alternating_subscribe_unsubscribe() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let mut acks = 0;
    for round in 0..16u16 {
        let ttl = if round % 2 == 0 { 0 } else { 16 };
        let datagram = subscribe_datagram(vec![sub_entry(0x1000, ttl)]);
        let actions = engine.handle_message(&datagram, round + 1, peer(), start);
        let actions = auto_resolve(&mut engine, actions, true, start);

        for (message, _) in sent_sd(&actions) {
            let sd = decode(message);
            for entry in &sd.entries {
                if entry.entry_type == EntryType::SubscribeEventgroupAck {
                    assert_eq!(entry.ttl, 16);
                    acks += 1;
                }
            }
        }
    }

    assert_eq!(acks, 8);
    assert!(engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));
}

// Stop + Subscribe in one datagram is a refresh: the subscription survives
// and exactly one ack is produced without consulting the provider again.
#[test]
fn test_stop_subscribe_collapse_is_refresh() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let actions =
        engine.handle_message(&subscribe_datagram(vec![sub_entry(0x1000, 16)]), 1, peer(), start);
    let _ = auto_resolve(&mut engine, actions, true, start);
    assert!(engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));

    let datagram = subscribe_datagram(vec![sub_entry(0x1000, 0), sub_entry(0x1000, 16)]);
    let actions = engine.handle_message(&datagram, 2, peer(), start);

    // no Decide, no unsubscribe: just one ack
    assert!(actions.iter().all(|a| !matches!(a, SdAction::Decide(_))));
    assert!(actions
        .iter()
        .all(|a| !matches!(a, SdAction::RemoteUnsubscribed { .. })));
    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    let sd = decode(sent[0].0);
    assert_eq!(sd.entries.len(), 1);
    assert_eq!(sd.entries[0].entry_type, EntryType::SubscribeEventgroupAck);
    assert_eq!(sd.entries[0].ttl, 16);
    assert!(engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));
}

#[test]
fn test_unknown_eventgroup_nacked() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let datagram = subscribe_datagram(vec![sub_entry(0x7777, 3)]);
    let actions = engine.handle_message(&datagram, 1, peer(), start);

    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    let sd = decode(sent[0].0);
    assert_eq!(sd.entries[0].entry_type, EntryType::SubscribeEventgroupAck);
    assert_eq!(sd.entries[0].ttl, 0, "nack carries ttl 0");
}

#[test]
fn test_reliability_mismatch_nacked() {
    let start = Instant::now();
    let mut engine = SdEngine::new(test_config());
    engine.offer_service(SERVICE, INSTANCE, 0x01, 0, Some(30509), None, start);
    engine.offer_eventgroup(SERVICE, INSTANCE, 0x1000, Reliability::Reliable, None);

    // subscriber only brings a UDP endpoint for a TCP-only eventgroup
    let datagram = subscribe_datagram(vec![sub_entry(0x1000, 3)]);
    let actions = engine.handle_message(&datagram, 1, peer(), start);

    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(decode(sent[0].0).entries[0].ttl, 0);
}

#[test]
fn test_provider_nack_via_decision() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let datagram = subscribe_datagram(vec![sub_entry(0x1000, 3)]);
    let actions = engine.handle_message(&datagram, 1, peer(), start);
    let actions = auto_resolve(&mut engine, actions, false, start);

    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(decode(sent[0].0).entries[0].ttl, 0);
    assert!(!engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));
}

#[test]
fn test_subscription_ttl_expiry() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let actions =
        engine.handle_message(&subscribe_datagram(vec![sub_entry(0x1000, 3)]), 1, peer(), start);
    let _ = auto_resolve(&mut engine, actions, true, start);

    let actions = drive(&mut engine, start + Duration::from_secs(5));
    assert!(actions.iter().any(|a| matches!(
        a,
        SdAction::RemoteUnsubscribed { eventgroup: 0x1000, .. }
    )));
    assert!(!engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));
}

// Routing state SUSPENDED then RESUMED.
#[test]
fn test_suspend_resume() {
    let start = Instant::now();
    let mut engine = offering_engine(start);
    let _ = drive(&mut engine, start + Duration::from_secs(4));

    // SUSPENDED: ttl 0 goes out once, then silence
    let actions = engine.suspend();
    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    let sd = decode(sent[0].0);
    assert_eq!(sd.entries[0].ttl, 0, "stop offer on suspend");

    let now = start + Duration::from_secs(10);
    assert!(drive(&mut engine, now + Duration::from_secs(10)).is_empty());

    // inbound SD is dropped while suspended
    let sub = subscribe_datagram(vec![sub_entry(0x1000, 3)]);
    assert!(engine.handle_message(&sub, 9, peer(), now).is_empty());

    // RESUMED: repetition phase restarts with doubling delays
    let resumed = now + Duration::from_secs(10);
    engine.resume(resumed);
    let actions = drive(&mut engine, resumed + Duration::from_secs(1));
    let sent = sent_sd(&actions);

    let deltas: Vec<Duration> = {
        let mut due = vec![];
        let mut t = resumed;
        let mut machine_times = vec![];
        // recover fire times from the repetition schedule: 0, 200ms, 600ms
        machine_times.push(t);
        t += Duration::from_millis(200);
        machine_times.push(t);
        t += Duration::from_millis(400);
        machine_times.push(t);
        due.extend(machine_times.iter().map(|m| *m - resumed));
        due
    };
    assert_eq!(sent.len(), deltas.len());
    for (message, _) in &sent {
        assert_eq!(decode(message).entries[0].ttl, 3);
    }
}

#[test]
fn test_find_answered_unicast_after_delay() {
    let start = Instant::now();
    let mut engine = offering_engine(start);
    let _ = drive(&mut engine, start + Duration::from_secs(4));

    let mut find = SdMessage::new(true);
    find.entries
        .push(Entry::find_service(SERVICE, ANY_INSTANCE, ANY_MAJOR, ANY_MINOR, 3));

    let now = start + Duration::from_secs(5);
    let actions = engine.handle_message(&find, 7, peer(), now);
    assert!(sent_sd(&actions).is_empty(), "response is delayed");

    let next = engine.next_timeout().unwrap();
    assert_eq!(next, now + Duration::from_millis(30));

    let actions = engine.handle_timeout(next);
    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, SdDestination::Unicast(peer()));
    let sd = decode(sent[0].0);
    assert_eq!(sd.entries[0].entry_type, EntryType::OfferService);
    assert_eq!(sd.entries[0].ttl, 3);
}

#[test]
fn test_consumer_side_lifecycle() {
    let start = Instant::now();
    let mut engine = SdEngine::new(test_config());

    engine.request_service(SERVICE, INSTANCE, 0x01, ANY_MINOR, start);
    let actions = drive(&mut engine, start + Duration::from_secs(2));
    let finds = sent_sd(&actions);
    assert_eq!(finds.len(), 4, "initial + 3 repetitions, then the campaign ends");
    assert_eq!(decode(finds[0].0).entries[0].entry_type, EntryType::FindService);

    // subscription intent before the provider is known
    assert!(engine
        .subscribe(SERVICE, INSTANCE, 0x1000, 0x01, 16, None,
            Some("192.168.0.7:40001".parse().unwrap()))
        .is_empty());

    // offer arrives: RemoteOffered plus an immediate Subscribe
    let mut offer = SdMessage::new(true);
    offer.entries.push(Entry::offer_service(
        SERVICE,
        INSTANCE,
        0x01,
        0,
        3,
        vec![SdOption::Ipv4Endpoint {
            addr: Ipv4Addr::new(192, 168, 0, 9),
            proto: L4Proto::Udp,
            port: 30509,
        }],
    ));
    let now = start + Duration::from_secs(3);
    let actions = engine.handle_message(&offer, 1, peer(), now);

    assert!(actions
        .iter()
        .any(|a| matches!(a, SdAction::RemoteOffered(r) if r.unreliable.is_some())));
    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    let sub = decode(sent[0].0);
    assert_eq!(sub.entries[0].entry_type, EntryType::SubscribeEventgroup);
    assert_eq!(sub.entries[0].ttl, 16);

    // ack arrives
    let mut ack = SdMessage::new(true);
    ack.entries
        .push(Entry::subscribe_ack(SERVICE, INSTANCE, 0x1000, 0x01, 0, 16, vec![]));
    let actions = engine.handle_message(&ack, 2, peer(), now);
    assert!(actions
        .iter()
        .any(|a| matches!(a, SdAction::SubscriptionAcked { eventgroup: 0x1000, .. })));

    // offer ttl expiry fires an unavailability edge
    let actions = drive(&mut engine, now + Duration::from_secs(5));
    assert!(actions
        .iter()
        .any(|a| matches!(a, SdAction::RemoteExpired { .. })));
}

#[test]
fn test_reboot_purges_peer() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    // peer offers something and subscribes to us
    let mut offer = SdMessage::new(true);
    offer.entries.push(Entry::offer_service(
        0x3344,
        0x0001,
        0x01,
        0,
        0xFF_FFFF,
        vec![],
    ));
    let _ = engine.handle_message(&offer, 1, peer(), start);

    let actions =
        engine.handle_message(&subscribe_datagram(vec![sub_entry(0x1000, 16)]), 2, peer(), start);
    let _ = auto_resolve(&mut engine, actions, true, start);
    assert!(engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));

    // same peer restarts: reboot flag set, session resets to 1
    let mut fresh = SdMessage::new(true);
    fresh.entries.push(Entry::offer_service(
        0x3344,
        0x0001,
        0x01,
        0,
        0xFF_FFFF,
        vec![],
    ));
    let actions = engine.handle_message(&fresh, 1, peer(), start + Duration::from_secs(1));

    assert!(actions
        .iter()
        .any(|a| matches!(a, SdAction::PeerRebooted { .. })));
    assert!(actions
        .iter()
        .any(|a| matches!(a, SdAction::RemoteExpired { service: 0x3344, .. })));
    assert!(actions
        .iter()
        .any(|a| matches!(a, SdAction::RemoteUnsubscribed { .. })));
    assert!(!engine.has_remote_subscription(SERVICE, INSTANCE, 0x1000, peer()));
}

#[test]
fn test_offer_idempotent() {
    let start = Instant::now();
    let mut engine = offering_engine(start);
    engine.offer_service(SERVICE, INSTANCE, 0x01, 0, Some(30509), Some(30509), start);

    let actions = drive(&mut engine, start + Duration::from_millis(50));
    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1, "double offer announces once");
    assert_eq!(decode(sent[0].0).entries.len(), 1);
}

#[test]
fn test_stop_offer_emits_ttl_zero() {
    let start = Instant::now();
    let mut engine = offering_engine(start);

    let actions = engine.stop_offer_service(SERVICE, INSTANCE);
    let sent = sent_sd(&actions);
    assert_eq!(sent.len(), 1);
    let sd = decode(sent[0].0);
    assert_eq!(sd.entries[0].ttl, 0);
    match sd.entries[0].detail {
        EntryDetail::Service { .. } => {}
        other => panic!("{other:?}"),
    }
}
