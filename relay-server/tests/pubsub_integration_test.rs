//! Retention timing and cross-node fan-out through a shared store.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn retained_message_is_delivered_to_a_subscriber_that_arrives_later() {
    let addr = spawn_server(ephemeral_config()).await;
    let topic = "11".repeat(32);

    let mut publisher = connect(addr).await;
    rpc(
        &mut publisher,
        "relay_publish",
        json!({"topic": topic, "message": "msg1", "ttl": 60}),
        1,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut subscriber = connect(addr).await;
    let sub = rpc(&mut subscriber, "relay_subscribe", json!({"topic": topic}), 1).await;
    assert!(sub["result"].is_string());

    let delivered = next_frame_timeout(&mut subscriber, Duration::from_secs(1))
        .await
        .expect("retained message should be replayed to the new subscriber");
    assert_eq!(delivered["params"]["data"]["message"], "msg1");
}

#[tokio::test]
async fn expired_message_is_not_delivered_to_a_late_subscriber() {
    let addr = spawn_server(ephemeral_config()).await;
    let topic = "22".repeat(32);

    let mut publisher = connect(addr).await;
    rpc(
        &mut publisher,
        "relay_publish",
        json!({"topic": topic, "message": "msg2", "ttl": 1}),
        1,
    )
    .await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut subscriber = connect(addr).await;
    rpc(&mut subscriber, "relay_subscribe", json!({"topic": topic}), 1).await;

    assert!(next_frame_timeout(&mut subscriber, Duration::from_millis(500))
        .await
        .is_none());
}

#[tokio::test]
async fn two_nodes_sharing_a_store_fan_out_across_each_other() {
    use relay_server::{SharedStore, SledStore};
    use std::sync::Arc;

    let store: Arc<dyn SharedStore> = Arc::new(SledStore::open_temporary().unwrap());

    let node1 = spawn_server_with_store(ephemeral_config(), store.clone()).await;
    let node2 = spawn_server_with_store(ephemeral_config(), store).await;

    let topic = "33".repeat(32);
    let mut subscriber = connect(node1).await;
    rpc(&mut subscriber, "relay_subscribe", json!({"topic": topic}), 1).await;

    let mut publisher = connect(node2).await;
    rpc(
        &mut publisher,
        "relay_publish",
        json!({"topic": topic, "message": "msg3", "ttl": 60}),
        1,
    )
    .await;

    let delivered = next_frame_timeout(&mut subscriber, Duration::from_secs(2))
        .await
        .expect("message published on node2 should reach node1's subscriber");
    assert_eq!(delivered["params"]["data"]["message"], "msg3");
}
