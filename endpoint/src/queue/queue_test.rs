use super::*;

fn frame(service: u16, method: u16, len: usize, is_response: bool) -> OutboundFrame {
    OutboundFrame {
        data: Bytes::from(vec![0u8; len]),
        service,
        method,
        is_response,
        target: None,
    }
}

#[tokio::test]
async fn test_fifo_order() {
    let q = SendQueue::new(QueueLimits::default());
    for session in 0..4u16 {
        q.enqueue(frame(0x1234, session, 8, false)).unwrap();
    }
    for session in 0..4u16 {
        let f = q.dequeue().await.unwrap();
        assert_eq!(f.method, session);
    }
}

#[test]
fn test_general_limit_rejects_newest() {
    let q = SendQueue::new(QueueLimits::bounded(100));
    q.enqueue(frame(0x1234, 1, 60, false)).unwrap();
    q.enqueue(frame(0x1234, 2, 40, false)).unwrap();
    assert_eq!(
        q.enqueue(frame(0x1234, 3, 1, false)),
        Err(Error::ErrQueueFull)
    );
    assert_eq!(q.len(), 2);
    assert_eq!(q.bytes(), 100);
}

#[test]
fn test_specific_limit_overrides_general() {
    let mut limits = QueueLimits::bounded(64);
    limits.specific.insert((0x1234, 0x0001), 1024);
    let q = SendQueue::new(limits);

    // the specific cap admits more than the general one would
    for _ in 0..8 {
        q.enqueue(frame(0x1234, 0x0001, 100, false)).unwrap();
    }
    assert_eq!(
        q.enqueue(frame(0x1234, 0x0001, 300, false)),
        Err(Error::ErrQueueFull)
    );

    // other keys still fall back to the general cap
    assert_eq!(
        q.enqueue(frame(0x5678, 0x0002, 65, false)),
        Err(Error::ErrQueueFull)
    );
    q.enqueue(frame(0x5678, 0x0002, 64, false)).unwrap();
}

#[tokio::test]
async fn test_dequeue_waits_for_enqueue() {
    let q = std::sync::Arc::new(SendQueue::new(QueueLimits::default()));

    let q2 = q.clone();
    let waiter = tokio::spawn(async move { q2.dequeue().await });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    q.enqueue(frame(0x1234, 7, 4, false)).unwrap();

    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got.method, 7);
}

#[tokio::test]
async fn test_graceful_close_prefers_responses() {
    let q = SendQueue::new(QueueLimits::default());
    q.enqueue(frame(0x1234, 1, 4, false)).unwrap();
    q.enqueue(frame(0x1234, 2, 4, true)).unwrap();
    q.enqueue(frame(0x1234, 3, 4, false)).unwrap();
    q.enqueue(frame(0x1234, 4, 4, true)).unwrap();

    q.close_graceful();

    let a = q.dequeue().await.unwrap();
    let b = q.dequeue().await.unwrap();
    assert!(a.is_response && b.is_response);
    assert_eq!((a.method, b.method), (2, 4));

    // requests are discarded once responses are out
    assert!(q.dequeue().await.is_none());
    assert_eq!(q.len(), 0);

    assert_eq!(
        q.enqueue(frame(0x1234, 5, 4, false)),
        Err(Error::ErrClosed)
    );
}

#[tokio::test]
async fn test_close_drops_everything() {
    let q = SendQueue::new(QueueLimits::default());
    q.enqueue(frame(0x1234, 1, 4, true)).unwrap();
    q.close();
    assert!(q.dequeue().await.is_none());
    assert_eq!(q.bytes(), 0);
}

#[test]
fn test_clear_keeps_queue_usable() {
    let q = SendQueue::new(QueueLimits::bounded(16));
    q.enqueue(frame(0x1234, 1, 16, false)).unwrap();
    assert_eq!(q.enqueue(frame(0x1234, 2, 1, false)), Err(Error::ErrQueueFull));

    q.clear();
    q.enqueue(frame(0x1234, 2, 8, false)).unwrap();
    assert_eq!(q.len(), 1);
}
