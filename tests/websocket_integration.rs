//! End-to-end tests of the full subscription stack against an
//! in-process WebSocket server.
//!
//! The server answers every subscribe message with three notifications
//! tagged with the requesting method, counts accepted connections and
//! keepalive pings, and otherwise echoes nothing.

use futures_util::{SinkExt, StreamExt};
use pulse_link::{PoolOptions, PulseLinkClient, PulseLinkTimeouts, SubscriptionHandle};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

struct TestServer {
    url: String,
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
}

async fn spawn_server() -> TestServer {
    let _ = env_logger::builder().is_test(true).try_init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let pings = Arc::new(AtomicUsize::new(0));

    let connections_counter = connections.clone();
    let pings_counter = pings.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            connections_counter.fetch_add(1, Ordering::SeqCst);
            let pings_counter = pings_counter.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(request) = serde_json::from_str::<serde_json::Value>(&text) else {
                        continue;
                    };
                    if request["method"] == "ping" {
                        pings_counter.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                    for seq in 0..3 {
                        let payload =
                            json!({"method": request["method"], "seq": seq}).to_string();
                        if ws.send(Message::Text(payload.into())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    TestServer {
        url: format!("ws://{}", addr),
        connections,
        pings,
    }
}

async fn next_event(subscription: &mut SubscriptionHandle) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("timed out waiting for a notification")
        .expect("stream ended unexpectedly")
        .expect("notification error")
}

#[tokio::test]
async fn test_subscribe_receives_notifications_end_to_end() {
    let server = spawn_server().await;
    let client = PulseLinkClient::builder()
        .url(&server.url)
        .timeouts(PulseLinkTimeouts::fast())
        .build()
        .unwrap();

    let mut subscription = client
        .subscribe("slotNotifications", json!({"commitment": "confirmed"}))
        .await
        .unwrap();

    for seq in 0..3 {
        let event = next_event(&mut subscription).await;
        assert_eq!(event["method"], "slotNotifications");
        assert_eq!(event["seq"], seq);
    }

    subscription.close().await.unwrap();
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_identical_subscriptions_coalesce_into_one_upstream() {
    let server = spawn_server().await;
    let client = PulseLinkClient::builder()
        .url(&server.url)
        .timeouts(PulseLinkTimeouts::fast())
        .build()
        .unwrap();

    let (a, b) = tokio::join!(
        client.subscribe("slotNotifications", json!(null)),
        client.subscribe("slotNotifications", json!(null)),
    );
    let mut subscription_a = a.unwrap();
    let mut subscription_b = b.unwrap();

    for seq in 0..3 {
        assert_eq!(next_event(&mut subscription_a).await["seq"], seq);
        assert_eq!(next_event(&mut subscription_b).await["seq"], seq);
    }

    // One upstream subscription means exactly three notifications per
    // caller; a duplicate subscribe would have produced three more.
    let extra = tokio::time::timeout(Duration::from_millis(300), subscription_a.next()).await;
    assert!(extra.is_err(), "no duplicate notifications may arrive");

    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sharded_capacity_one_subscriptions_use_distinct_connections() {
    let server = spawn_server().await;
    let client = PulseLinkClient::builder()
        .url(&server.url)
        .timeouts(PulseLinkTimeouts::fast())
        .pool_options(
            PoolOptions::new()
                .with_min_channels(1)
                .with_max_subscriptions_per_channel(1),
        )
        .shard_by(|payload| {
            payload
                .as_text()
                .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok())
                .and_then(|value| value["method"].as_str().map(str::to_owned))
                .unwrap_or_default()
        })
        .build()
        .unwrap();

    let (a, b) = tokio::join!(
        client.subscribe("slotNotifications", json!(null)),
        client.subscribe("rootNotifications", json!(null)),
    );
    let mut subscription_a = a.unwrap();
    let mut subscription_b = b.unwrap();

    for seq in 0..3 {
        let event = next_event(&mut subscription_a).await;
        assert_eq!(event["method"], "slotNotifications");
        assert_eq!(event["seq"], seq);
    }
    for seq in 0..3 {
        let event = next_event(&mut subscription_b).await;
        assert_eq!(event["method"], "rootNotifications");
        assert_eq!(event["seq"], seq);
    }

    assert_eq!(
        server.connections.load(Ordering::SeqCst),
        2,
        "distinct shard keys with capacity-one pooling open distinct connections"
    );
}

#[tokio::test]
async fn test_keepalive_pings_flow_on_an_idle_connection() {
    let server = spawn_server().await;
    let client = PulseLinkClient::builder()
        .url(&server.url)
        .timeouts(
            PulseLinkTimeouts::builder()
                .connection_timeout(Duration::from_secs(2))
                .ping_interval(Duration::from_millis(100))
                .build(),
        )
        .build()
        .unwrap();

    let mut subscription = client.subscribe("slotNotifications", json!(null)).await.unwrap();
    for _ in 0..3 {
        next_event(&mut subscription).await;
    }

    // The connection now sits idle; keepalive pings take over.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(
        server.pings.load(Ordering::SeqCst) > 0,
        "an idle connection must receive keepalive pings"
    );
}
