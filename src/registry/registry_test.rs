use super::*;

const SERVICE: ServiceId = 0x1234;
const INSTANCE: InstanceId = 0x5678;

fn local(client: ClientId) -> Provider {
    Provider::Local { client }
}

fn remote() -> Provider {
    Provider::Remote {
        reliable: Some("192.168.0.9:30509".parse().unwrap()),
        unreliable: Some("192.168.0.9:30509".parse().unwrap()),
    }
}

#[test]
fn test_at_most_one_provider() {
    let mut registry = Registry::new();

    assert_eq!(
        registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1343)),
        OfferOutcome::Offered { interested: vec![] }
    );
    // same provider again is idempotent
    assert_eq!(
        registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1343)),
        OfferOutcome::Unchanged
    );
    // a different local client conflicts
    assert_eq!(
        registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1344)),
        OfferOutcome::Conflict
    );
    // a remote provider for a locally held instance conflicts too
    assert_eq!(
        registry.offer(SERVICE, INSTANCE, 1, 0, remote()),
        OfferOutcome::Conflict
    );
}

#[test]
fn test_stop_offer_only_by_provider() {
    let mut registry = Registry::new();
    registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1343));

    assert!(registry
        .stop_offer(SERVICE, INSTANCE, true, Some(0x1344))
        .is_none());
    assert!(registry.provider(SERVICE, INSTANCE).is_some());

    assert!(registry
        .stop_offer(SERVICE, INSTANCE, true, Some(0x1343))
        .is_some());
    assert!(registry.provider(SERVICE, INSTANCE).is_none());
}

#[test]
fn test_availability_edges_for_interested_clients() {
    let mut registry = Registry::new();

    assert!(!registry.request(SERVICE, INSTANCE, 1, 0, 0x1344));
    assert!(!registry.request(SERVICE, ANY_INSTANCE, 1, 0, 0x1345));

    match registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1343)) {
        OfferOutcome::Offered { interested } => {
            assert_eq!(interested, vec![0x1344, 0x1345]);
        }
        other => panic!("{other:?}"),
    }

    // a late request sees the offer immediately
    assert!(registry.request(SERVICE, INSTANCE, 1, 0, 0x1346));

    let interested = registry
        .stop_offer(SERVICE, INSTANCE, true, Some(0x1343))
        .unwrap();
    assert_eq!(interested, vec![0x1344, 0x1345, 0x1346]);
}

#[test]
fn test_partial_availability() {
    let mut registry = Registry::new();
    registry.offer(
        SERVICE,
        INSTANCE,
        1,
        0,
        Provider::Remote {
            reliable: Some("192.168.0.9:30509".parse().unwrap()),
            unreliable: None,
        },
    );

    assert_eq!(
        registry.availability_of(SERVICE, INSTANCE, Reliability::Both),
        Availability::Partial
    );
    assert_eq!(
        registry.availability_of(SERVICE, INSTANCE, Reliability::Reliable),
        Availability::Available
    );
    assert_eq!(
        registry.availability_of(SERVICE, 0x9999, Reliability::Reliable),
        Availability::Unavailable
    );
}

#[test]
fn test_event_delivery_requires_request_and_subscription() {
    let mut registry = Registry::new();
    registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1343));
    registry.add_eventgroup(SERVICE, INSTANCE, 0x1000, Reliability::Unreliable, None);
    registry.add_event(
        SERVICE,
        INSTANCE,
        0x8001,
        EventKind::Event,
        Reliability::Unreliable,
        &[0x1000],
        None,
        false,
    );

    // subscribed but not requested: no delivery
    registry.subscribe(
        SERVICE,
        INSTANCE,
        0x1000,
        Subscriber::Local(0x1344),
        16,
        SubscriptionState::Acked,
        None,
        None,
    );
    assert!(registry.local_event_targets(SERVICE, INSTANCE, 0x8001).is_empty());

    // requested too: delivered
    registry.request_event(SERVICE, INSTANCE, 0x8001, 0x1344);
    assert_eq!(
        registry.local_event_targets(SERVICE, INSTANCE, 0x8001),
        vec![0x1344]
    );

    // pending subscriptions do not receive
    registry.set_subscription_state(
        SERVICE,
        INSTANCE,
        0x1000,
        Subscriber::Local(0x1344),
        SubscriptionState::Pending,
    );
    assert!(registry.local_event_targets(SERVICE, INSTANCE, 0x8001).is_empty());
}

#[test]
fn test_remote_event_targets_deduplicated() {
    let mut registry = Registry::new();
    registry.add_eventgroup(SERVICE, INSTANCE, 0x1000, Reliability::Unreliable, None);
    registry.add_eventgroup(SERVICE, INSTANCE, 0x1001, Reliability::Unreliable, None);
    registry.add_event(
        SERVICE,
        INSTANCE,
        0x8001,
        EventKind::Event,
        Reliability::Unreliable,
        &[0x1000, 0x1001],
        None,
        false,
    );

    let peer: SocketAddr = "192.168.0.9:30490".parse().unwrap();
    let delivery: SocketAddr = "192.168.0.9:40002".parse().unwrap();
    for eg in [0x1000u16, 0x1001] {
        registry.subscribe(
            SERVICE,
            INSTANCE,
            eg,
            Subscriber::Remote(peer),
            16,
            SubscriptionState::Acked,
            None,
            Some(delivery),
        );
    }

    let targets = registry.remote_event_targets(SERVICE, INSTANCE, 0x8001);
    assert_eq!(targets.len(), 1, "one entry per remote subscriber");
    assert_eq!(targets[0].3, Some(delivery));
}

#[test]
fn test_field_cache_change_detection() {
    let mut registry = Registry::new();
    registry.add_event(
        SERVICE,
        INSTANCE,
        0x8002,
        EventKind::Field,
        Reliability::Unreliable,
        &[0x1000],
        None,
        false,
    );

    let v1 = Bytes::from_static(&[1, 2, 3]);
    assert!(registry.cache_payload(SERVICE, INSTANCE, 0x8002, &v1));
    assert!(!registry.cache_payload(SERVICE, INSTANCE, 0x8002, &v1));
    let v2 = Bytes::from_static(&[1, 2, 4]);
    assert!(registry.cache_payload(SERVICE, INSTANCE, 0x8002, &v2));
    assert_eq!(
        registry.event(SERVICE, INSTANCE, 0x8002).unwrap().cached,
        Some(v2)
    );
}

#[test]
fn test_remove_client_tears_everything_down() {
    let mut registry = Registry::new();
    registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1343));
    registry.request(0x4321, 0x0001, 1, 0, 0x1343);
    registry.subscribe(
        SERVICE,
        INSTANCE,
        0x1000,
        Subscriber::Local(0x1343),
        16,
        SubscriptionState::Acked,
        None,
        None,
    );
    registry.request(SERVICE, INSTANCE, 1, 0, 0x1344);

    let withdrawn = registry.remove_client(0x1343);
    assert_eq!(withdrawn.len(), 1);
    assert_eq!(withdrawn[0].0, SERVICE);
    assert_eq!(withdrawn[0].2, vec![0x1344]);

    assert!(registry.provider(SERVICE, INSTANCE).is_none());
    assert!(!registry.is_requested_by(0x4321, 0x0001, 0x1343));
    assert!(registry
        .subscription_state(SERVICE, INSTANCE, 0x1000, Subscriber::Local(0x1343))
        .is_none());
}

#[test]
fn test_offered_services_filter() {
    let mut registry = Registry::new();
    registry.offer(SERVICE, INSTANCE, 1, 0, local(0x1343));
    registry.offer(0x4321, 0x0001, 1, 0, remote());

    assert_eq!(
        registry.offered_services(Some(true)),
        vec![(SERVICE, INSTANCE)]
    );
    assert_eq!(
        registry.offered_services(Some(false)),
        vec![(0x4321, 0x0001)]
    );
    assert_eq!(registry.offered_services(None).len(), 2);
}
