//! Integration tests
//!
//! Drive a real broker over TCP with a raw codec-backed client and validate
//! the protocol flows: pub/sub fan-out, retained replay, the QoS 2
//! handshake, wills, duplicate-client takeover and session restore.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use dynamq::broker::Broker;
use dynamq::codec::{Decoder, Encoder};
use dynamq::config::Config;
use dynamq::context::BrokerContext;
use dynamq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, Subscribe, SubscribeReturnCode, Subscription, Unsubscribe, Will,
};

// Atomic port counter to avoid conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19300);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

async fn start_broker() -> SocketAddr {
    let port = next_port();
    let addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));

    let mut config = Config::default();
    config.server.bind = addr;
    config.node.id = Some(format!("test-node-{}", port));
    config.redis.enabled = false;
    config.limits.rate_limit_enabled = false;

    let ctx = BrokerContext::initialize(config).await;
    let broker = Arc::new(Broker::new(ctx));
    let runner = broker.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    // Wait for the listener
    for _ in 0..50 {
        if TcpStream::connect(addr).await.is_ok() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("broker did not start on {}", addr);
}

/// Raw MQTT client for protocol-level assertions
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut out = BytesMut::new();
        self.encoder.encode(packet, &mut out).expect("encode failed");
        self.stream.write_all(&out).await.expect("write failed");
    }

    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                self.buf.advance(consumed);
                return Some(packet);
            }

            let mut chunk = vec![0u8; 4096];
            match timeout(Duration::from_secs(5), self.stream.read(&mut chunk)).await {
                Ok(Ok(n)) if n > 0 => self.buf.extend_from_slice(&chunk[..n]),
                _ => return None,
            }
        }
    }

    /// Expect no packet within the window
    async fn recv_nothing(&mut self, window: Duration) -> bool {
        let mut chunk = vec![0u8; 4096];
        match timeout(window, self.stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => {
                self.buf.extend_from_slice(&chunk[..n]);
                false
            }
            _ => self.decoder.decode(&self.buf).unwrap_or(None).is_none(),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_with_will(client_id, clean_session, None)
            .await
    }

    async fn mqtt_connect_with_will(
        &mut self,
        client_id: &str,
        clean_session: bool,
        will: Option<Will>,
    ) -> ConnAck {
        self.send(&Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive: 60,
            username: None,
            password: None,
            will,
        })))
        .await;

        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish_qos0(&mut self, topic: &str, payload: &[u8], retain: bool) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }

    async fn publish_qos1(&mut self, packet_id: u16, topic: &str, payload: &[u8]) -> PubAck {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: topic.into(),
            packet_id: Some(packet_id),
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;

        match self.recv().await {
            Some(Packet::PubAck(ack)) => ack,
            other => panic!("Expected PUBACK, got {:?}", other),
        }
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    async fn disconnect(&mut self) {
        self.send(&Packet::Disconnect).await;
    }
}

#[tokio::test]
async fn test_connect_connack() {
    let addr = start_broker().await;
    let mut client = TestClient::connect(addr).await;

    let ack = client.mqtt_connect("basic-1", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
    assert!(!ack.session_present);
}

#[tokio::test]
async fn test_empty_client_id_with_persistent_session_rejected() {
    let addr = start_broker().await;
    let mut client = TestClient::connect(addr).await;

    let ack = client.mqtt_connect("", false).await;
    assert_eq!(ack.return_code, ConnectReturnCode::IdentifierRejected);
}

#[tokio::test]
async fn test_empty_client_id_generated_for_clean_session() {
    let addr = start_broker().await;
    let mut client = TestClient::connect(addr).await;

    let ack = client.mqtt_connect("", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);
}

#[tokio::test]
async fn test_pingreq_pingresp() {
    let addr = start_broker().await;
    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("pinger", true).await;

    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}

#[tokio::test]
async fn test_basic_pub_sub_qos1() {
    let addr = start_broker().await;

    // Client A subscribes to a/+/c at QoS 1
    let mut a = TestClient::connect(addr).await;
    a.mqtt_connect("client-a", true).await;
    let suback = a.subscribe(1, "a/+/c", QoS::AtLeastOnce).await;
    assert_eq!(suback.return_codes, vec![SubscribeReturnCode::GrantedQoS1]);

    // Client B publishes to a/x/c
    let mut b = TestClient::connect(addr).await;
    b.mqtt_connect("client-b", true).await;
    let puback = b.publish_qos1(10, "a/x/c", b"hello").await;
    assert_eq!(puback.packet_id, 10);

    // A receives exactly one PUBLISH at QoS 1
    let publish = a.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "a/x/c");
    assert_eq!(publish.payload, Bytes::from("hello"));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    let packet_id = publish.packet_id.unwrap();
    a.send(&Packet::PubAck(PubAck::new(packet_id))).await;
}

#[tokio::test]
async fn test_wildcard_non_match_not_delivered() {
    let addr = start_broker().await;

    let mut a = TestClient::connect(addr).await;
    a.mqtt_connect("nomatch-sub", true).await;
    a.subscribe(1, "a/+/c", QoS::AtLeastOnce).await;

    let mut b = TestClient::connect(addr).await;
    b.mqtt_connect("nomatch-pub", true).await;
    b.publish_qos1(1, "a/b/d/c", b"nope").await;

    assert!(a.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_qos_downgrade_to_granted() {
    let addr = start_broker().await;

    // Subscriber granted QoS 0
    let mut a = TestClient::connect(addr).await;
    a.mqtt_connect("downgrade-sub", true).await;
    a.subscribe(1, "t/down", QoS::AtMostOnce).await;

    let mut b = TestClient::connect(addr).await;
    b.mqtt_connect("downgrade-pub", true).await;
    b.publish_qos1(2, "t/down", b"v").await;

    let publish = a.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(publish.packet_id.is_none());
}

#[tokio::test]
async fn test_retained_replay_on_subscribe() {
    let addr = start_broker().await;

    // Publisher retains "on" under lamp/1 at QoS 0
    let mut p = TestClient::connect(addr).await;
    p.mqtt_connect("retainer", true).await;
    p.publish_qos0("lamp/1", b"on", true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // New subscriber to lamp/# at QoS 2 gets the retained message
    let mut s = TestClient::connect(addr).await;
    s.mqtt_connect("late-sub", true).await;
    let suback = s.subscribe(1, "lamp/#", QoS::ExactlyOnce).await;
    assert_eq!(suback.return_codes, vec![SubscribeReturnCode::GrantedQoS2]);

    let publish = s.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "lamp/1");
    assert_eq!(publish.payload, Bytes::from("on"));
    assert!(publish.retain);
    // min(publish QoS 0, granted QoS 2)
    assert_eq!(publish.qos, QoS::AtMostOnce);
}

#[tokio::test]
async fn test_empty_retained_payload_deletes() {
    let addr = start_broker().await;

    let mut p = TestClient::connect(addr).await;
    p.mqtt_connect("clearer", true).await;
    p.publish_qos0("lamp/2", b"on", true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Empty payload with retain clears the slot
    p.publish_qos0("lamp/2", b"", true).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut s = TestClient::connect(addr).await;
    s.mqtt_connect("after-clear", true).await;
    s.subscribe(1, "lamp/2", QoS::AtMostOnce).await;

    assert!(s.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_qos2_round_trip() {
    let addr = start_broker().await;

    let mut b = TestClient::connect(addr).await;
    b.mqtt_connect("qos2-sub", true).await;
    b.subscribe(1, "t", QoS::ExactlyOnce).await;

    let mut a = TestClient::connect(addr).await;
    a.mqtt_connect("qos2-pub", true).await;

    // A -> broker: PUBLISH (QoS 2)
    a.send(&Packet::Publish(Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "t".into(),
        packet_id: Some(21),
        payload: Bytes::from("v"),
    }))
    .await;

    // broker -> A: PUBREC
    assert_eq!(a.recv().await, Some(Packet::PubRec(PubRec::new(21))));

    // A -> broker: PUBREL, broker -> A: PUBCOMP
    a.send(&Packet::PubRel(PubRel::new(21))).await;
    assert_eq!(a.recv().await, Some(Packet::PubComp(PubComp::new(21))));

    // broker -> B: PUBLISH at QoS 2, full handshake back
    let publish = b.expect_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    assert_eq!(publish.payload, Bytes::from("v"));
    let packet_id = publish.packet_id.unwrap();

    b.send(&Packet::PubRec(PubRec::new(packet_id))).await;
    assert_eq!(b.recv().await, Some(Packet::PubRel(PubRel::new(packet_id))));
    b.send(&Packet::PubComp(PubComp::new(packet_id))).await;

    // Exactly one delivery
    assert!(b.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_qos2_duplicate_publish_single_fanout() {
    let addr = start_broker().await;

    let mut b = TestClient::connect(addr).await;
    b.mqtt_connect("dedup-sub", true).await;
    b.subscribe(1, "dup/t", QoS::ExactlyOnce).await;

    let mut a = TestClient::connect(addr).await;
    a.mqtt_connect("dedup-pub", true).await;

    let publish = Publish {
        dup: false,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "dup/t".into(),
        packet_id: Some(5),
        payload: Bytes::from("once"),
    };
    a.send(&Packet::Publish(publish.clone())).await;
    assert_eq!(a.recv().await, Some(Packet::PubRec(PubRec::new(5))));

    // Retransmission of the same message id before PUBREL
    let mut dup = publish;
    dup.dup = true;
    a.send(&Packet::Publish(dup)).await;
    assert_eq!(a.recv().await, Some(Packet::PubRec(PubRec::new(5))));

    // B sees exactly one PUBLISH
    let delivery = b.expect_publish().await;
    assert_eq!(delivery.payload, Bytes::from("once"));
    let packet_id = delivery.packet_id.unwrap();
    b.send(&Packet::PubRec(PubRec::new(packet_id))).await;
    assert_eq!(b.recv().await, Some(Packet::PubRel(PubRel::new(packet_id))));
    b.send(&Packet::PubComp(PubComp::new(packet_id))).await;

    assert!(b.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_will_on_abnormal_close() {
    let addr = start_broker().await;

    // Subscriber L watches status/#
    let mut l = TestClient::connect(addr).await;
    l.mqtt_connect("watcher-l", true).await;
    l.subscribe(1, "status/#", QoS::AtLeastOnce).await;

    // W connects with a retained will and dies without DISCONNECT
    let mut w = TestClient::connect(addr).await;
    let ack = w
        .mqtt_connect_with_will(
            "client-w",
            true,
            Some(Will {
                topic: "status/W".to_string(),
                payload: Bytes::from("down"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        )
        .await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    drop(w);

    // L receives the will
    let publish = l.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "status/W");
    assert_eq!(publish.payload, Bytes::from("down"));
    if let Some(packet_id) = publish.packet_id {
        l.send(&Packet::PubAck(PubAck::new(packet_id))).await;
    }

    // A later subscriber M gets it as a retained delivery
    let mut m = TestClient::connect(addr).await;
    m.mqtt_connect("watcher-m", true).await;
    m.subscribe(1, "status/#", QoS::AtLeastOnce).await;

    let retained = m.expect_publish().await;
    assert_eq!(retained.topic.as_ref(), "status/W");
    assert_eq!(retained.payload, Bytes::from("down"));
    assert!(retained.retain);
}

#[tokio::test]
async fn test_clean_disconnect_discards_will() {
    let addr = start_broker().await;

    let mut l = TestClient::connect(addr).await;
    l.mqtt_connect("quiet-watcher", true).await;
    l.subscribe(1, "status/#", QoS::AtMostOnce).await;

    let mut w = TestClient::connect(addr).await;
    w.mqtt_connect_with_will(
        "polite-client",
        true,
        Some(Will {
            topic: "status/polite".to_string(),
            payload: Bytes::from("down"),
            qos: QoS::AtMostOnce,
            retain: false,
        }),
    )
    .await;

    w.disconnect().await;

    assert!(l.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_duplicate_client_id_evicts_old_connection() {
    let addr = start_broker().await;

    let mut first = TestClient::connect(addr).await;
    let ack = first.mqtt_connect("shared-id", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    let mut second = TestClient::connect(addr).await;
    let ack = second.mqtt_connect("shared-id", true).await;
    assert_eq!(ack.return_code, ConnectReturnCode::Accepted);

    // The first connection is closed by the broker
    let mut chunk = [0u8; 64];
    let closed = timeout(Duration::from_secs(5), first.stream.read(&mut chunk)).await;
    assert!(matches!(closed, Ok(Ok(0))), "old connection should close");

    // Messages for the id reach the new connection
    second.subscribe(1, "evict/check", QoS::AtMostOnce).await;
    let mut p = TestClient::connect(addr).await;
    p.mqtt_connect("evict-pub", true).await;
    p.publish_qos0("evict/check", b"new-owner", false).await;

    let publish = second.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("new-owner"));
}

#[tokio::test]
async fn test_takeover_keeps_new_connection_subscriptions() {
    let addr = start_broker().await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("migrant", true).await;
    first.subscribe(1, "old/filter", QoS::AtMostOnce).await;

    // Takeover: the new attachment subscribes right away
    let mut second = TestClient::connect(addr).await;
    second.mqtt_connect("migrant", true).await;
    second.subscribe(1, "new/filter", QoS::AtMostOnce).await;

    // Let the evicted handler finish its cleanup
    let mut chunk = [0u8; 64];
    let _ = timeout(Duration::from_secs(5), first.stream.read(&mut chunk)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The new attachment's subscription survives the old handler's exit,
    // and delivery happens exactly once
    let mut p = TestClient::connect(addr).await;
    p.mqtt_connect("takeover-pub", true).await;
    p.publish_qos0("new/filter", b"kept", false).await;

    let publish = second.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("kept"));
    assert!(second.recv_nothing(Duration::from_millis(300)).await);

    // The evicted attachment's own filter is gone
    p.publish_qos0("old/filter", b"stale", false).await;
    assert!(second.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_persistent_session_restore() {
    let addr = start_broker().await;

    // Persistent session subscribes, then disconnects cleanly
    let mut c = TestClient::connect(addr).await;
    let ack = c.mqtt_connect("durable-1", false).await;
    assert!(!ack.session_present);
    c.subscribe(1, "restore/t", QoS::AtLeastOnce).await;
    c.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect with cleanSession=false restores the subscription set
    let mut c = TestClient::connect(addr).await;
    let ack = c.mqtt_connect("durable-1", false).await;
    assert!(ack.session_present);

    // The restored subscription is live without a new SUBSCRIBE
    let mut p = TestClient::connect(addr).await;
    p.mqtt_connect("restore-pub", true).await;
    p.publish_qos1(1, "restore/t", b"back").await;

    let publish = c.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("back"));
    if let Some(packet_id) = publish.packet_id {
        c.send(&Packet::PubAck(PubAck::new(packet_id))).await;
    }
}

#[tokio::test]
async fn test_clean_session_discards_subscriptions() {
    let addr = start_broker().await;

    let mut c = TestClient::connect(addr).await;
    c.mqtt_connect("transient-1", true).await;
    c.subscribe(1, "gone/t", QoS::AtLeastOnce).await;
    c.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut c = TestClient::connect(addr).await;
    let ack = c.mqtt_connect("transient-1", false).await;
    assert!(!ack.session_present);

    // Nothing delivered for the discarded subscription
    let mut p = TestClient::connect(addr).await;
    p.mqtt_connect("gone-pub", true).await;
    p.publish_qos0("gone/t", b"lost", false).await;
    assert!(c.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_invalid_filter_gets_failure_return_code() {
    let addr = start_broker().await;

    let mut c = TestClient::connect(addr).await;
    c.mqtt_connect("bad-filter", true).await;

    // Second filter is invalid (# not last); SUBACK order is preserved
    c.send(&Packet::Subscribe(Subscribe {
        packet_id: 3,
        subscriptions: vec![
            Subscription {
                filter: "ok/topic".to_string(),
                qos: QoS::AtMostOnce,
            },
            Subscription {
                filter: "bad/#/tail".to_string(),
                qos: QoS::AtLeastOnce,
            },
        ],
    }))
    .await;

    match c.recv().await {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(ack.packet_id, 3);
            assert_eq!(
                ack.return_codes,
                vec![
                    SubscribeReturnCode::GrantedQoS0,
                    SubscribeReturnCode::Failure
                ]
            );
        }
        other => panic!("Expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let addr = start_broker().await;

    let mut c = TestClient::connect(addr).await;
    c.mqtt_connect("unsub-1", true).await;
    c.subscribe(1, "u/t", QoS::AtMostOnce).await;

    c.send(&Packet::Unsubscribe(Unsubscribe {
        packet_id: 2,
        filters: vec!["u/t".to_string()],
    }))
    .await;
    match c.recv().await {
        Some(Packet::UnsubAck(ack)) => assert_eq!(ack.packet_id, 2),
        other => panic!("Expected UNSUBACK, got {:?}", other),
    }

    let mut p = TestClient::connect(addr).await;
    p.mqtt_connect("unsub-pub", true).await;
    p.publish_qos0("u/t", b"ignored", false).await;

    assert!(c.recv_nothing(Duration::from_millis(300)).await);
}

#[tokio::test]
async fn test_second_connect_is_protocol_violation() {
    let addr = start_broker().await;

    let mut c = TestClient::connect(addr).await;
    c.mqtt_connect("double-connect", true).await;

    c.send(&Packet::Connect(Box::new(Connect {
        client_id: "double-connect".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })))
    .await;

    // The broker closes the connection
    let mut chunk = [0u8; 64];
    let closed = timeout(Duration::from_secs(5), c.stream.read(&mut chunk)).await;
    assert!(matches!(closed, Ok(Ok(0))));
}

#[tokio::test]
async fn test_publisher_receives_own_message_when_subscribed() {
    let addr = start_broker().await;

    let mut c = TestClient::connect(addr).await;
    c.mqtt_connect("self-sub", true).await;
    c.subscribe(1, "echo/t", QoS::AtMostOnce).await;

    c.publish_qos0("echo/t", b"loopback", false).await;

    let publish = c.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from("loopback"));
}
