// Wire protocol integration: framing, checksum validation and the client
// query exchange against a live node.

use meshdb::client::DdbClient;
use meshdb::config::{ClusterConfig, Timings};
use meshdb::core::message::{self, Message, Payload};
use meshdb::core::node::NodeStatus;
use meshdb::node::MeshNode;
use meshdb::storage::{MemoryAdapter, StorageAdapter};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn two_node_config(base_port: u16) -> ClusterConfig {
    ClusterConfig::from_json(&format!(
        r#"{{"nodes": [
            {{"node_id": 1, "network": {{"host": "127.0.0.1", "port": {}}},
             "database": {{"host": "127.0.0.1", "user": "ddb", "password": "ddb", "database": "ddb1"}}}},
            {{"node_id": 2, "network": {{"host": "127.0.0.1", "port": {}}},
             "database": {{"host": "127.0.0.1", "user": "ddb", "password": "ddb", "database": "ddb2"}}}}
        ]}}"#,
        base_port,
        base_port + 1
    ))
    .unwrap()
}

fn quiet_timings() -> Timings {
    Timings {
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(60),
        election_timeout: Duration::from_millis(200),
        send_timeout: Duration::from_secs(1),
        decision_window: Duration::from_secs(1),
        replication_sweep_interval: Duration::from_secs(60),
        replication_timeout: Duration::from_secs(60),
        bootstrap_delay: Duration::from_millis(100),
    }
}

async fn start_single_node(base_port: u16) -> (Arc<MeshNode>, Arc<MemoryAdapter>) {
    let config = two_node_config(base_port);
    let storage = Arc::new(MemoryAdapter::new());
    let node = MeshNode::new(
        &config,
        1,
        storage.clone() as Arc<dyn StorageAdapter>,
        quiet_timings(),
    )
    .unwrap();
    node.clone().start().await.unwrap();
    (node, storage)
}

fn heartbeat_frame_from_node_2() -> String {
    message::encode(&Message::broadcast(
        Payload::Heartbeat {
            is_coordinator: false,
        },
        2,
    ))
    .unwrap()
}

#[tokio::test]
async fn test_tampered_frame_is_dropped() {
    let (node, _storage) = start_single_node(46200).await;
    node.peers().set_status(2, NodeStatus::Inactive);

    // Zero out the checksum of an otherwise valid heartbeat.
    let frame = heartbeat_frame_from_node_2();
    let value: Value = serde_json::from_str(&frame).unwrap();
    let mut map = value.as_object().cloned().unwrap();
    map.insert("checksum".to_string(), json!("0".repeat(32)));
    let tampered = Value::Object(map).to_string();

    let mut stream = TcpStream::connect(("127.0.0.1", 46200)).await.unwrap();
    stream.write_all(tampered.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The frame was dropped: node 2 is still considered inactive.
    assert_eq!(node.peers().status(2), Some(NodeStatus::Inactive));
    node.stop();
}

#[tokio::test]
async fn test_bad_frames_do_not_disconnect_the_peer() {
    let (node, _storage) = start_single_node(46210).await;
    node.peers().set_status(2, NodeStatus::Inactive);

    let mut stream = TcpStream::connect(("127.0.0.1", 46210)).await.unwrap();

    // Malformed JSON, then a valid heartbeat on the same connection.
    stream.write_all(b"this is not json\n").await.unwrap();
    stream
        .write_all(heartbeat_frame_from_node_2().as_bytes())
        .await
        .unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The valid frame behind the garbage still got through.
    assert_eq!(node.peers().status(2), Some(NodeStatus::Active));
    node.stop();
}

#[tokio::test]
async fn test_client_query_exchange() {
    let (node, storage) = start_single_node(46220).await;
    let config = two_node_config(46220);
    let client = DdbClient::new(&config);

    // A write: answered, committed locally.
    let result = client
        .send_query_to("INSERT INTO users VALUES (1, 'ada')", config.node(1).unwrap())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.node_id, Some(1));
    assert_eq!(result.rows_affected, Some(1));
    assert!(storage.contains("'ada'"));

    // A read: empty row set from the memory backend.
    let result = client
        .send_query_to("SELECT * FROM users", config.node(1).unwrap())
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.data, Some(Vec::new()));

    // The query counter moved with each execution.
    assert_eq!(node.peers().descriptor(1).unwrap().query_count, 2);
    node.stop();
}
