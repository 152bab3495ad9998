//! End-to-end tests across two routing managers in one process, talking to
//! each other over loopback wire endpoints. Discovery is replaced by static
//! service entries so the tests are deterministic on any machine.

use std::net::Ipv4Addr;
use std::time::Duration;

use bytes::Bytes;
use someip::config::ServiceConfig;
use someip::message::{Message, MessageType};
use someip::{Config, Runtime};
use tokio::sync::mpsc;

fn base_config(tag: &str) -> Config {
    let mut config = Config::default();
    config.routing = format!("routing-{tag}");
    config.service_discovery.enable = false;
    config.unicast = Ipv4Addr::new(127, 0, 0, 1);
    config.ipc_base_path =
        std::env::temp_dir().join(format!("someip-e2e-{tag}-{}", std::process::id()));
    config
}

// Request/response over UDP: 10 byte request, 120 byte response, matching
// session at the client.
#[tokio::test]
async fn test_request_response_over_udp() {
    let port = 41234;

    // provider host binds the service port
    let mut provider_config = base_config("udp-a");
    provider_config.services.push(ServiceConfig {
        service: 0x1234,
        instance: 0x5678,
        unreliable_port: Some(port),
        ..Default::default()
    });
    let provider_rt = Runtime::new(provider_config);
    let provider = provider_rt
        .create_application("routing-udp-a")
        .await
        .unwrap();

    let expected_response: Vec<u8> = (0..120).map(|i| (i % 256) as u8).collect();
    let response_payload = Bytes::from(expected_response.clone());
    let provider_clone = provider.clone();
    provider
        .register_message_handler(0x1234, 0x0421, move |request| {
            assert_eq!(request.payload.len(), 10);
            let response = Message::response_to(request, response_payload.clone());
            provider_clone.blocking_send(0x5678, response).unwrap();
        })
        .await
        .unwrap();
    provider.offer_service(0x1234, 0x5678, 1, 0).await.unwrap();

    // consumer host knows the instance statically
    let mut consumer_config = base_config("udp-b");
    consumer_config.services.push(ServiceConfig {
        service: 0x1234,
        instance: 0x5678,
        unreliable_port: Some(port),
        unicast: Some(Ipv4Addr::new(127, 0, 0, 1)),
        ..Default::default()
    });
    let consumer_rt = Runtime::new(consumer_config);
    let consumer = consumer_rt
        .create_application("routing-udp-b")
        .await
        .unwrap();

    let (response_tx, mut response_rx) = mpsc::channel::<Message>(1);
    consumer
        .register_message_handler(0x1234, 0x0421, move |response| {
            let _ = response_tx.try_send(response.clone());
        })
        .await
        .unwrap();
    consumer
        .request_service(0x1234, 0x5678, 1, 0)
        .await
        .unwrap();

    // give the provider a moment to bind its port
    tokio::time::sleep(Duration::from_millis(200)).await;

    let payload = Bytes::from((0u8..10).collect::<Vec<u8>>());
    let request = Message::request(0x1234, 0x0421, 0x0001, 0x0001, 1, payload);
    consumer.send(0x5678, request).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), response_rx.recv())
        .await
        .expect("response within deadline")
        .unwrap();
    assert_eq!(response.header.message_type, MessageType::Response);
    assert_eq!(response.header.session, 0x0001);
    assert_eq!(response.header.client, 0x0001);
    assert_eq!(&response.payload[..], &expected_response[..]);

    consumer_rt.shutdown().await;
    provider_rt.shutdown().await;
}

// Big payload over TCP: 614400 bytes each way through a 1 MiB frame cap.
#[tokio::test]
async fn test_big_payload_over_tcp() {
    let port = 41235;
    const PAYLOAD_LEN: usize = 614_400;
    const MAX_TCP: usize = 1_048_575;

    let mut provider_config = base_config("tcp-a");
    provider_config.max_message_size_reliable = MAX_TCP;
    provider_config.services.push(ServiceConfig {
        service: 0x1234,
        instance: 0x5678,
        reliable_port: Some(port),
        ..Default::default()
    });
    let provider_rt = Runtime::new(provider_config);
    let provider = provider_rt
        .create_application("routing-tcp-a")
        .await
        .unwrap();

    let provider_clone = provider.clone();
    provider
        .register_message_handler(0x1234, 0x0088, move |request| {
            assert_eq!(request.payload.len(), PAYLOAD_LEN);
            // echo the same amount of data back
            let response = Message::response_to(request, request.payload.clone());
            provider_clone.blocking_send(0x5678, response).unwrap();
        })
        .await
        .unwrap();
    provider.offer_service(0x1234, 0x5678, 1, 0).await.unwrap();

    let mut consumer_config = base_config("tcp-b");
    consumer_config.max_message_size_reliable = MAX_TCP;
    consumer_config.services.push(ServiceConfig {
        service: 0x1234,
        instance: 0x5678,
        reliable_port: Some(port),
        unicast: Some(Ipv4Addr::new(127, 0, 0, 1)),
        ..Default::default()
    });
    let consumer_rt = Runtime::new(consumer_config);
    let consumer = consumer_rt
        .create_application("routing-tcp-b")
        .await
        .unwrap();

    let (response_tx, mut response_rx) = mpsc::channel::<Message>(1);
    consumer
        .register_message_handler(0x1234, 0x0088, move |response| {
            let _ = response_tx.try_send(response.clone());
        })
        .await
        .unwrap();
    consumer
        .request_service(0x1234, 0x5678, 1, 0)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| (i % 256) as u8).collect();
    let request = Message::request(0x1234, 0x0088, 0, 0, 1, Bytes::from(payload.clone()));
    consumer.send(0x5678, request).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(10), response_rx.recv())
        .await
        .expect("big response within deadline")
        .unwrap();
    assert_eq!(response.header.message_type, MessageType::Response);
    assert_eq!(response.payload.len(), PAYLOAD_LEN);
    assert_eq!(&response.payload[..], &payload[..]);

    consumer_rt.shutdown().await;
    provider_rt.shutdown().await;
}
