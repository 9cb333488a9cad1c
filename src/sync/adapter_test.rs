use super::*;
use crate::state::test_helpers::test_config;
use crate::sync::event::Position;
use crate::sync::transport::LocalHub;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

fn cursor(user_id: Uuid, x: f64) -> SyncEvent {
    SyncEvent::CursorMoved { user_id, display_name: "ada".into(), position: Position { x, y: 0.0 }, timestamp: 0 }
}

fn deleted(id: Uuid) -> SyncEvent {
    SyncEvent::ObjectsDeleted { object_ids: vec![id] }
}

fn collector() -> (impl Fn(SyncEvent) + Send + 'static, mpsc::UnboundedReceiver<SyncEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |event: SyncEvent| drop(tx.send(event)), rx)
}

async fn recv_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("event channel closed unexpectedly")
}

async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) {
    assert!(timeout(Duration::from_millis(80), rx.recv()).await.is_err(), "expected no event");
}

fn envelope(sender_id: Uuid, seq: u64) -> Envelope {
    Envelope { id: Uuid::new_v4(), sender_id, seq, recipient: None, event: deleted(Uuid::nil()) }
}

#[test]
fn sender_order_drops_duplicates_and_stale() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let mut order = SenderOrder::default();

    assert!(order.accept(&envelope(a, 1)));
    assert!(!order.accept(&envelope(a, 1)));
    assert!(order.accept(&envelope(a, 3)));
    assert!(!order.accept(&envelope(a, 2)));
    // Senders are independent.
    assert!(order.accept(&envelope(b, 1)));
}

#[tokio::test]
async fn broadcast_reaches_every_subscriber_in_publish_order() {
    let hub = Arc::new(LocalHub::new());
    let canvas_id = Uuid::new_v4();
    let config = test_config();
    let publisher = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let alice = SyncChannelAdapter::new(hub.clone(), canvas_id, Some(Uuid::new_v4()), &config);
    let bob = SyncChannelAdapter::new(hub.clone(), canvas_id, Some(Uuid::new_v4()), &config);

    let (handler_a, mut rx_a) = collector();
    let (handler_b, mut rx_b) = collector();
    let _sub_a = alice.subscribe(handler_a).unwrap();
    let _sub_b = bob.subscribe(handler_b).unwrap();

    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    publisher.publish(deleted(first)).await.unwrap();
    publisher.publish(deleted(second)).await.unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        assert_eq!(recv_event(rx).await, deleted(first));
        assert_eq!(recv_event(rx).await, deleted(second));
    }
}

#[tokio::test]
async fn unicast_is_delivered_only_to_recipient() {
    let hub = Arc::new(LocalHub::new());
    let canvas_id = Uuid::new_v4();
    let config = test_config();
    let alice_id = Uuid::new_v4();
    let publisher = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let alice = SyncChannelAdapter::new(hub.clone(), canvas_id, Some(alice_id), &config);
    let bob = SyncChannelAdapter::new(hub.clone(), canvas_id, Some(Uuid::new_v4()), &config);

    let (handler_a, mut rx_a) = collector();
    let (handler_b, mut rx_b) = collector();
    let _sub_a = alice.subscribe(handler_a).unwrap();
    let _sub_b = bob.subscribe(handler_b).unwrap();

    let id = Uuid::new_v4();
    publisher.unicast(alice_id, deleted(id)).await.unwrap();

    assert_eq!(recv_event(&mut rx_a).await, deleted(id));
    assert_no_event(&mut rx_b).await;
}

#[tokio::test]
async fn presence_channel_is_separate_from_broadcast() {
    let hub = Arc::new(LocalHub::new());
    let canvas_id = Uuid::new_v4();
    let config = test_config();
    let publisher = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let listener = SyncChannelAdapter::new(hub.clone(), canvas_id, Some(Uuid::new_v4()), &config);

    let (objects_handler, mut objects_rx) = collector();
    let (presence_handler, mut presence_rx) = collector();
    let _objects = listener.subscribe(objects_handler).unwrap();
    let _presence = listener.subscribe_presence(presence_handler).unwrap();

    let user = Uuid::new_v4();
    publisher.publish_presence(cursor(user, 4.0)).await.unwrap();

    assert_eq!(recv_event(&mut presence_rx).await, cursor(user, 4.0));
    assert_no_event(&mut objects_rx).await;
}

#[tokio::test]
async fn other_canvases_are_not_delivered() {
    let hub = Arc::new(LocalHub::new());
    let config = test_config();
    let publisher = SyncChannelAdapter::new(hub.clone(), Uuid::new_v4(), None, &config);
    let listener = SyncChannelAdapter::new(hub.clone(), Uuid::new_v4(), None, &config);

    let (handler, mut rx) = collector();
    let _sub = listener.subscribe(handler).unwrap();
    publisher.publish(deleted(Uuid::new_v4())).await.unwrap();

    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn remote_subscription_skips_own_publishes() {
    let hub = Arc::new(LocalHub::new());
    let canvas_id = Uuid::new_v4();
    let config = test_config();
    let local = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let remote = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);

    let (handler, mut rx) = collector();
    let _sub = local.subscribe_remote(handler).unwrap();

    let own = Uuid::new_v4();
    let theirs = Uuid::new_v4();
    local.publish(deleted(own)).await.unwrap();
    remote.publish(deleted(theirs)).await.unwrap();

    assert_eq!(recv_event(&mut rx).await, deleted(theirs));
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn dropping_handle_stops_delivery() {
    let hub = Arc::new(LocalHub::new());
    let canvas_id = Uuid::new_v4();
    let config = test_config();
    let publisher = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let listener = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);

    let (handler, mut rx) = collector();
    let sub = listener.subscribe(handler).unwrap();
    assert!(sub.is_active());
    drop(sub);
    tokio::task::yield_now().await;

    publisher.publish(deleted(Uuid::new_v4())).await.unwrap();
    assert!(timeout(Duration::from_millis(80), rx.recv()).await.map_or(true, |e| e.is_none()));
}

#[tokio::test]
async fn publish_fails_after_retries_when_unavailable() {
    let hub = Arc::new(LocalHub::new());
    hub.set_state(ConnectionState::Reconnecting);
    let adapter = SyncChannelAdapter::new(hub.clone(), Uuid::new_v4(), None, &test_config());

    assert!(!adapter.is_connected());
    let err = adapter.publish(deleted(Uuid::new_v4())).await.unwrap_err();
    assert!(matches!(err, TransportError::Unavailable(ConnectionState::Reconnecting)));
    assert_eq!(err.error_code(), "E_TRANSPORT_UNAVAILABLE");
}

#[tokio::test]
async fn publish_succeeds_when_transport_recovers_during_backoff() {
    let hub = Arc::new(LocalHub::new());
    hub.set_state(ConnectionState::Reconnecting);
    let config = CoordinatorConfig { publish_retries: 5, publish_retry_base_ms: 20, ..test_config() };
    let canvas_id = Uuid::new_v4();
    let adapter = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let listener = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let (handler, mut rx) = collector();
    let _sub = listener.subscribe(handler).unwrap();

    let recover = {
        let hub = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            hub.set_state(ConnectionState::Connected);
        })
    };

    let id = Uuid::new_v4();
    adapter.publish(deleted(id)).await.unwrap();
    recover.await.unwrap();
    assert_eq!(recv_event(&mut rx).await, deleted(id));
}

#[tokio::test]
async fn failed_publish_does_not_burn_a_sequence_number() {
    let hub = Arc::new(LocalHub::new());
    let canvas_id = Uuid::new_v4();
    let config = CoordinatorConfig { publish_retries: 0, ..test_config() };
    let adapter = SyncChannelAdapter::new(hub.clone(), canvas_id, None, &config);
    let mut raw = hub.subscribe(&objects_channel(canvas_id)).unwrap();

    hub.set_state(ConnectionState::Error);
    assert!(adapter.publish(deleted(Uuid::new_v4())).await.is_err());
    hub.set_state(ConnectionState::Connected);
    adapter.publish(deleted(Uuid::new_v4())).await.unwrap();

    let envelope = raw.recv().await.unwrap();
    assert_eq!(envelope.seq, 1);
    assert_eq!(envelope.sender_id, adapter.sender_id());
}

#[tokio::test]
async fn on_reconnect_fires_only_after_a_lost_connection() {
    let hub = Arc::new(LocalHub::new());
    let adapter = SyncChannelAdapter::new(hub.clone(), Uuid::new_v4(), None, &test_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = adapter.on_reconnect(move || drop(tx.send(())));

    // Already connected; re-asserting it is not a reconnect.
    hub.set_state(ConnectionState::Connected);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(rx.try_recv().is_err());

    hub.set_state(ConnectionState::Reconnecting);
    tokio::time::sleep(Duration::from_millis(10)).await;
    hub.set_state(ConnectionState::Connected);

    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("reconnect callback timed out")
        .expect("callback channel closed");
}
