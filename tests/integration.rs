//! Integration Tests for the PerchMQ broker
//!
//! These tests run a real broker on loopback ports and drive it with the
//! library client or with raw sockets speaking the fixed-frame protocol.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use perchmq::broker::{Broker, BrokerConfig};
use perchmq::client::{Client, ClientOptions, Delivery};
use perchmq::codec::{decode_frame, frame_bytes, REJECTION_NOTICE};
use perchmq::protocol::{Frame, Request, FRAME_SIZE};
use perchmq::session::{ConnectionError, RetryPolicy};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(24000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const WAIT: Duration = Duration::from_secs(5);

/// Test configuration helper
fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        max_connections: 16,
        connect_policy: RetryPolicy::new(5, Duration::from_millis(50)),
        disconnect_policy: RetryPolicy::new(5, Duration::from_millis(50)),
        collector_interval: Duration::from_millis(20),
        ..BrokerConfig::default()
    }
}

/// A broker serving on a bound loopback listener
struct TestBroker {
    broker: Arc<Broker>,
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TestBroker {
    fn start(config: BrokerConfig) -> Self {
        let addr = config.bind_addr;
        let broker = Arc::new(Broker::new(config));
        let listener = broker.bind().expect("Failed to bind");

        let serving = broker.clone();
        let task = tokio::spawn(async move {
            serving.serve(listener).await.unwrap();
        });
        Self { broker, addr, task }
    }

    async fn client(&self) -> (Client, mpsc::Receiver<Delivery>) {
        let options = ClientOptions {
            connect: RetryPolicy::new(10, Duration::from_millis(100)),
            disconnect: RetryPolicy::new(10, Duration::from_millis(100)),
            ..ClientOptions::default()
        };
        Client::connect_with(self.addr, options)
            .await
            .expect("Failed to connect")
    }

    /// Poll until the registry holds `expected` connections
    async fn wait_for_connections(&self, expected: usize) {
        timeout(WAIT, async {
            while self.broker.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!(
                "expected {} connections, have {}",
                expected,
                self.broker.connection_count()
            )
        });
    }

    async fn stop(self) {
        self.broker.shutdown();
        timeout(WAIT, self.task)
            .await
            .expect("Broker did not stop")
            .unwrap();
    }
}

async fn next_delivery(rx: &mut mpsc::Receiver<Delivery>) -> Delivery {
    timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Delivery stream closed")
}

/// Round-trip a LIST so that every earlier frame from this client has been
/// handled by the broker
async fn sync_list(client: &Client, rx: &mut mpsc::Receiver<Delivery>) -> Vec<String> {
    client.list().await.unwrap();
    loop {
        if let Delivery::Subscriptions(topics) = next_delivery(rx).await {
            return topics;
        }
    }
}

// ============================================================================
// Publish / Subscribe
// ============================================================================

#[tokio::test]
async fn test_wildcard_subscription_sees_new_topic() {
    let broker = TestBroker::start(test_config(next_port()));

    let (a, mut a_rx) = broker.client().await;
    a.subscribe("sensors/+/temp").await.unwrap();
    assert_eq!(sync_list(&a, &mut a_rx).await, Vec::<String>::new());

    let (b, mut b_rx) = broker.client().await;
    b.publish("sensors/room1/temp", "21.5").await.unwrap();
    sync_list(&b, &mut b_rx).await;

    assert_eq!(
        broker.broker.router().topic_names(),
        vec!["sensors", "sensors/room1", "sensors/room1/temp"]
    );
    assert_eq!(
        next_delivery(&mut a_rx).await,
        Delivery::Message {
            topic: "sensors/room1/temp".to_string(),
            message: "21.5".to_string(),
            retained: false,
        }
    );
    assert_eq!(sync_list(&a, &mut a_rx).await, vec!["sensors/room1/temp"]);

    broker.stop().await;
}

#[tokio::test]
async fn test_retained_message_for_late_subscriber() {
    let broker = TestBroker::start(test_config(next_port()));

    let (a, mut a_rx) = broker.client().await;
    a.publish_retained("alerts/fire", "none").await.unwrap();
    sync_list(&a, &mut a_rx).await;

    let (b, mut b_rx) = broker.client().await;
    b.subscribe("alerts/fire").await.unwrap();
    assert_eq!(
        next_delivery(&mut b_rx).await,
        Delivery::Message {
            topic: "alerts/fire".to_string(),
            message: "none".to_string(),
            retained: true,
        }
    );

    broker.stop().await;
}

#[tokio::test]
async fn test_fan_out_to_multiple_subscribers() {
    let broker = TestBroker::start(test_config(next_port()));

    let (a, mut a_rx) = broker.client().await;
    let (b, mut b_rx) = broker.client().await;
    a.subscribe("chat/room").await.unwrap();
    sync_list(&a, &mut a_rx).await;
    b.subscribe("chat/#").await.unwrap();
    assert_eq!(sync_list(&b, &mut b_rx).await, vec!["chat/room"]);

    let (c, _c_rx) = broker.client().await;
    c.publish("chat/room", "hello").await.unwrap();

    for rx in [&mut a_rx, &mut b_rx] {
        assert_eq!(
            next_delivery(rx).await,
            Delivery::Message {
                topic: "chat/room".to_string(),
                message: "hello".to_string(),
                retained: false,
            }
        );
    }

    broker.stop().await;
}

#[tokio::test]
async fn test_duplicate_subscribe_and_list() {
    let broker = TestBroker::start(test_config(next_port()));

    let (a, mut a_rx) = broker.client().await;
    a.subscribe("a/b").await.unwrap();
    a.subscribe("c").await.unwrap();
    a.subscribe("a/b").await.unwrap();

    assert_eq!(sync_list(&a, &mut a_rx).await, vec!["a/b", "c"]);
    assert_eq!(broker.broker.router().subscribers("a/b").len(), 1);

    a.unsubscribe("a/b").await.unwrap();
    assert_eq!(sync_list(&a, &mut a_rx).await, vec!["c"]);

    broker.stop().await;
}

// ============================================================================
// Admission and handshakes
// ============================================================================

#[tokio::test]
async fn test_capacity_rejection() {
    let mut config = test_config(next_port());
    config.max_connections = 1;
    let broker = TestBroker::start(config);

    let (a, mut a_rx) = broker.client().await;
    a.subscribe("only/one").await.unwrap();
    sync_list(&a, &mut a_rx).await;

    match Client::connect(broker.addr).await {
        Err(ConnectionError::Rejected(text)) => assert_eq!(text, REJECTION_NOTICE),
        Err(e) => panic!("Expected rejection, got {}", e),
        Ok(_) => panic!("Expected rejection, connection was admitted"),
    }

    assert_eq!(broker.broker.connection_count(), 1);
    assert_eq!(broker.broker.router().subscribers("only/one").len(), 1);

    broker.stop().await;
}

#[tokio::test]
async fn test_disconnect_handshake() {
    let broker = TestBroker::start(test_config(next_port()));

    let (mut a, mut a_rx) = broker.client().await;
    a.subscribe("bye").await.unwrap();
    sync_list(&a, &mut a_rx).await;
    broker.wait_for_connections(1).await;

    a.disconnect().await.unwrap();
    let status = a.status();
    assert!(status.disconnected);
    assert!(status.cleanup);

    broker.wait_for_connections(0).await;
    assert!(broker.broker.router().subscribers("bye").is_empty());

    broker.stop().await;
}

#[tokio::test]
async fn test_disconnect_with_unread_deliveries() {
    let broker = TestBroker::start(test_config(next_port()));

    let options = ClientOptions {
        connect: RetryPolicy::new(10, Duration::from_millis(100)),
        disconnect: RetryPolicy::new(10, Duration::from_millis(100)),
        channel_capacity: 2,
    };
    let (mut a, mut a_rx) = Client::connect_with(broker.addr, options).await.unwrap();
    a.subscribe("t").await.unwrap();
    sync_list(&a, &mut a_rx).await;

    let (b, mut b_rx) = broker.client().await;
    for i in 0..5 {
        b.publish("t", &format!("m{}", i)).await.unwrap();
    }
    sync_list(&b, &mut b_rx).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Nobody reads a's deliveries, the disconnect must still go through
    timeout(WAIT, a.disconnect())
        .await
        .expect("Disconnect stalled behind a full delivery queue")
        .unwrap();
    assert!(a.status().disconnected);

    let mut messages = 0;
    while let Ok(Some(delivery)) = timeout(WAIT, a_rx.recv()).await {
        if let Delivery::Message { topic, .. } = delivery {
            assert_eq!(topic, "t");
            messages += 1;
        }
    }
    assert_eq!(messages, 2);

    broker.wait_for_connections(1).await;
    broker.stop().await;
}

#[tokio::test]
async fn test_handshake_timeout_closes_silent_peer() {
    let broker = TestBroker::start(test_config(next_port()));

    let mut raw = TcpStream::connect(broker.addr).await.unwrap();

    let mut buf = [0u8; FRAME_SIZE];
    timeout(WAIT, raw.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for notice")
        .unwrap();
    let frame = decode_frame(&buf).unwrap();
    assert_eq!(frame.request, Request::Unknown(REJECTION_NOTICE.to_string()));

    let n = timeout(WAIT, raw.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
    assert_eq!(broker.broker.connection_count(), 0);

    broker.stop().await;
}

#[tokio::test]
async fn test_raw_peer_ignores_short_reads() {
    let broker = TestBroker::start(test_config(next_port()));

    let mut raw = TcpStream::connect(broker.addr).await.unwrap();
    raw.write_all(&frame_bytes(&Frame::control(Request::Conn)))
        .await
        .unwrap();

    let mut buf = [0u8; FRAME_SIZE];
    timeout(WAIT, raw.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(decode_frame(&buf).unwrap().request, Request::ConnAck);

    // Noise, then a real LIST
    raw.write_all(b"junk").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    raw.write_all(&frame_bytes(&Frame::control(Request::List)))
        .await
        .unwrap();

    timeout(WAIT, raw.read_exact(&mut buf)).await.unwrap().unwrap();
    let reply = decode_frame(&buf).unwrap();
    assert_eq!(reply.request, Request::List);
    assert_eq!(reply.message, "");

    broker.stop().await;
}

#[tokio::test]
async fn test_peer_vanishing_is_reclaimed() {
    let broker = TestBroker::start(test_config(next_port()));

    let mut raw = TcpStream::connect(broker.addr).await.unwrap();
    raw.write_all(&frame_bytes(&Frame::control(Request::Conn)))
        .await
        .unwrap();
    let mut buf = [0u8; FRAME_SIZE];
    timeout(WAIT, raw.read_exact(&mut buf)).await.unwrap().unwrap();
    raw.write_all(&frame_bytes(&Frame::subscribe("gone")))
        .await
        .unwrap();
    raw.write_all(&frame_bytes(&Frame::control(Request::List)))
        .await
        .unwrap();
    timeout(WAIT, raw.read_exact(&mut buf)).await.unwrap().unwrap();
    broker.wait_for_connections(1).await;

    drop(raw);
    broker.wait_for_connections(0).await;
    assert!(broker.broker.router().subscribers("gone").is_empty());

    broker.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_disconnects_clients() {
    let broker = TestBroker::start(test_config(next_port()));

    let (mut a, mut a_rx) = broker.client().await;
    a.subscribe("x").await.unwrap();
    sync_list(&a, &mut a_rx).await;

    broker.broker.shutdown();

    // The delivery stream ends once the broker's DISC has been acknowledged
    timeout(WAIT, async { while a_rx.recv().await.is_some() {} })
        .await
        .expect("Client was not disconnected");
    let status = a.status();
    assert!(status.disconnected);
    assert!(status.cleanup);

    // The broker already closed the session
    assert!(matches!(a.disconnect().await, Err(ConnectionError::Closed)));

    let TestBroker { broker, task, .. } = broker;
    timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.topic_count(), 0);
}
