//! End-to-end relay scenarios: producer → inbound → bridge → outbound → consumer

use std::time::Duration;

use relayd_core::outbound::BridgeState;
use relayd_core::transport::channel_url;
use relayd_core::{
    ConsumerClient, InboundServer, InboundServerOptions, MirroredState, OutboundServer,
    OutboundServerOptions, ProducerClient, RelayBridge, RelayBridgeOptions, RelayError,
};

struct Relay {
    inbound: InboundServer,
    outbound: OutboundServer,
    bridge: RelayBridge,
    inbound_port: u16,
    producer_url: String,
    consumer_url: String,
}

impl Relay {
    async fn start() -> Self {
        let mut inbound = InboundServer::new(InboundServerOptions {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        });
        let inbound_addr = inbound.start().await.unwrap();

        let mirror = MirroredState::shared();
        let mut bridge = RelayBridge::new(
            RelayBridgeOptions {
                peer_url: channel_url("127.0.0.1", inbound_addr.port(), "/red"),
                poll_interval: Duration::from_millis(25),
                peer_timeout: Duration::from_secs(1),
                max_backoff: Duration::from_secs(2),
                max_missed_polls: 10,
            },
            mirror.clone(),
        );
        bridge.start().await.unwrap();

        let mut outbound = OutboundServer::new(
            OutboundServerOptions {
                host: "127.0.0.1".to_string(),
                port: 0,
                consumer_channel: "/red".to_string(),
                fanout_interval: Duration::from_millis(20),
            },
            mirror,
        );
        let outbound_addr = outbound.start().await.unwrap();

        // Let the inbound side finish attaching the peer (it resets its backlog then)
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            inbound,
            outbound,
            bridge,
            inbound_port: inbound_addr.port(),
            producer_url: channel_url("127.0.0.1", inbound_addr.port(), "/green"),
            consumer_url: channel_url("127.0.0.1", outbound_addr.port(), "/red"),
        }
    }

    async fn producer(&self, id: &str) -> ProducerClient {
        let mut producer = ProducerClient::connect(&self.producer_url).await.unwrap();
        producer.join(id).await.unwrap();
        producer
    }

    /// Join once the bridge has mirrored the producer as active
    async fn consumer_for(&self, id: &str) -> ConsumerClient {
        let mut consumer = ConsumerClient::connect(&self.consumer_url).await.unwrap();
        for _ in 0..100 {
            match consumer.join(id).await {
                Ok(()) => return consumer,
                Err(RelayError::ProducerUnavailable(_)) => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                Err(e) => panic!("unexpected join error: {}", e),
            }
        }
        panic!("producer {} never became active", id);
    }

    async fn shutdown(mut self) {
        self.outbound.stop().await;
        self.bridge.stop().await;
        self.inbound.stop().await;
    }
}

async fn collect(consumer: &mut ConsumerClient, count: usize) -> Vec<String> {
    let mut received = Vec::new();
    while received.len() < count {
        let batch = tokio::time::timeout(Duration::from_secs(2), consumer.next_batch())
            .await
            .expect("timed out waiting for a batch")
            .unwrap()
            .expect("relay closed the connection");
        received.extend(batch);
    }
    received
}

#[tokio::test]
async fn producer_message_reaches_subscribed_consumer() {
    let relay = Relay::start().await;

    let mut producer = relay.producer("A").await;
    let mut consumer = relay.consumer_for("A").await;
    producer.send("hello").await.unwrap();

    assert_eq!(collect(&mut consumer, 1).await, vec!["hello"]);
    relay.shutdown().await;
}

#[tokio::test]
async fn messages_keep_per_producer_order() {
    let relay = Relay::start().await;

    let mut producer = relay.producer("A").await;
    let mut consumer = relay.consumer_for("A").await;
    let expected: Vec<String> = (0..20).map(|i| format!("msg-{}", i)).collect();
    for msg in &expected {
        producer.send(msg.clone()).await.unwrap();
    }

    assert_eq!(collect(&mut consumer, expected.len()).await, expected);
    relay.shutdown().await;
}

#[tokio::test]
async fn every_group_member_gets_the_batch() {
    let relay = Relay::start().await;

    let mut producer = relay.producer("7").await;
    let mut first = relay.consumer_for("7").await;
    let mut second = relay.consumer_for("7").await;
    producer.send("fan out").await.unwrap();

    assert_eq!(collect(&mut first, 1).await, vec!["fan out"]);
    assert_eq!(collect(&mut second, 1).await, vec!["fan out"]);

    let router = relay.outbound.router();
    assert_eq!(router.group_size(&"7".into()).await, 2);
    first.close().await.unwrap();
    second.close().await.unwrap();
    let mut emptied = false;
    for _ in 0..100 {
        if router.group_count().await == 0 {
            emptied = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(emptied);
    relay.shutdown().await;
}

#[tokio::test]
async fn consumer_for_absent_producer_is_aborted() {
    let relay = Relay::start().await;

    let mut consumer = ConsumerClient::connect(&relay.consumer_url).await.unwrap();
    let err = consumer.join("A").await.unwrap_err();
    assert!(matches!(err, RelayError::ProducerUnavailable(_)));
    assert!(consumer.last_abort().unwrap().contains("'A'"));

    // Traffic from another producer never reaches the aborted consumer
    let mut other = relay.producer("B").await;
    let _watcher = relay.consumer_for("B").await;
    other.send("not for you").await.unwrap();

    let nothing = tokio::time::timeout(Duration::from_millis(300), consumer.next_batch()).await;
    assert!(nothing.is_err());
    relay.shutdown().await;
}

#[tokio::test]
async fn duplicate_producer_is_rejected_and_first_keeps_sending() {
    let relay = Relay::start().await;

    let mut first = relay.producer("123").await;
    let mut second = ProducerClient::connect(&relay.producer_url).await.unwrap();
    let err = second.join("123").await.unwrap_err();
    assert!(matches!(err, RelayError::DuplicateId(_)));
    assert!(matches!(second.send("ignored").await, Err(RelayError::NotJoined)));

    let mut consumer = relay.consumer_for("123").await;
    first.send("from the first").await.unwrap();
    assert_eq!(collect(&mut consumer, 1).await, vec!["from the first"]);
    relay.shutdown().await;
}

#[tokio::test]
async fn departed_producer_becomes_unavailable() {
    let relay = Relay::start().await;

    let producer = relay.producer("A").await;
    let _consumer = relay.consumer_for("A").await;
    producer.close().await.unwrap();

    let mut late = ConsumerClient::connect(&relay.consumer_url).await.unwrap();
    let mut aborted = false;
    for _ in 0..100 {
        match late.join("A").await {
            Err(RelayError::ProducerUnavailable(_)) => {
                aborted = true;
                break;
            }
            Ok(()) => {
                late.leave().await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("unexpected join error: {}", e),
        }
    }
    assert!(aborted);
    relay.shutdown().await;
}

#[tokio::test]
async fn producer_id_is_free_again_after_disconnect() {
    let relay = Relay::start().await;

    let producer = relay.producer("42").await;
    producer.close().await.unwrap();

    let mut again = ProducerClient::connect(&relay.producer_url).await.unwrap();
    let mut joined = false;
    for _ in 0..50 {
        match again.join("42").await {
            Ok(()) => {
                joined = true;
                break;
            }
            Err(RelayError::DuplicateId(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("unexpected join error: {}", e),
        }
    }
    assert!(joined);
    relay.shutdown().await;
}

#[tokio::test]
async fn wrong_channel_is_reported() {
    let relay = Relay::start().await;

    let url = relay.producer_url.replace("/green", "/blue");
    let err = ProducerClient::connect(&url).await.err().unwrap();
    assert!(matches!(err, RelayError::ChannelMismatch { .. }));
    relay.shutdown().await;
}

#[tokio::test]
async fn second_outbound_relay_is_turned_away() {
    let relay = Relay::start().await;

    let mut intruder = RelayBridge::new(
        RelayBridgeOptions {
            peer_url: channel_url("127.0.0.1", relay.inbound_port, "/red"),
            ..Default::default()
        },
        MirroredState::shared(),
    );
    intruder.start().await.unwrap();
    let mut state_rx = intruder.subscribe();
    let done = tokio::time::timeout(
        Duration::from_secs(2),
        relayd_core::outbound::wait_disconnected(&mut state_rx),
    )
    .await;
    assert!(done.is_ok());

    // The attached bridge keeps working
    assert_eq!(relay.bridge.state(), BridgeState::Connected);
    let mut producer = relay.producer("A").await;
    let mut consumer = relay.consumer_for("A").await;
    producer.send("still relayed").await.unwrap();
    assert_eq!(collect(&mut consumer, 1).await, vec!["still relayed"]);
    relay.shutdown().await;
}

#[tokio::test]
async fn stopping_inbound_disconnects_bridge() {
    let mut relay = Relay::start().await;
    let mut state_rx = relay.bridge.subscribe();

    relay.inbound.stop().await;
    let done = tokio::time::timeout(
        Duration::from_secs(2),
        relayd_core::outbound::wait_disconnected(&mut state_rx),
    )
    .await;
    assert!(done.is_ok());
    assert_eq!(relay.bridge.state(), BridgeState::Disconnected);
    relay.shutdown().await;
}
