//! Cluster-mode discovery and MOVED redirection against mock nodes.

use bytes::Bytes;
use crimson::core::protocol::{RespFrame, RespFrameCodec};
use crimson::core::topology::ConnectedMode;
use crimson::{ClientBuilder, ClientConfig, CmdArgs, CommandControl, ReplyStatus};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn bulk(s: &str) -> RespFrame {
    RespFrame::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

fn args_of(frame: &RespFrame) -> Vec<String> {
    let RespFrame::Array(items) = frame else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            RespFrame::BulkString(b) => Some(String::from_utf8_lossy(b).to_string()),
            _ => None,
        })
        .collect()
}

fn cluster_nodes_reply(ports: &[u16]) -> RespFrame {
    let mut text = String::new();
    for (i, port) in ports.iter().enumerate() {
        text.push_str(&format!(
            "node{i:040} 127.0.0.1:{port}@{} master - 0 0 {i} connected\n",
            port + 10000
        ));
    }
    bulk(&text)
}

fn slots_entry(min: i64, max: i64, port: u16) -> RespFrame {
    RespFrame::Array(vec![
        RespFrame::Integer(min),
        RespFrame::Integer(max),
        RespFrame::Array(vec![bulk("127.0.0.1"), RespFrame::Integer(i64::from(port))]),
    ])
}

/// Slot layout before/after the simulated migration of the upper half.
fn cluster_slots_reply(split: bool, port1: u16, port2: u16) -> RespFrame {
    if split {
        RespFrame::Array(vec![
            slots_entry(0, 8191, port1),
            slots_entry(8192, 16383, port2),
        ])
    } else {
        RespFrame::Array(vec![slots_entry(0, 16383, port1)])
    }
}

struct NodePorts {
    node1: u16,
    node2: u16,
}

/// Two mock nodes; "foo" (slot 12182) starts on node1, then node1 answers
/// MOVED and both nodes report the migrated slot layout.
async fn spawn_cluster(moved: Arc<AtomicBool>, slots_queries: Arc<AtomicUsize>) -> NodePorts {
    let listener1 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port1 = listener1.local_addr().unwrap().port();
    drop(listener1);
    let listener2 = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port2 = listener2.local_addr().unwrap().port();
    drop(listener2);

    // Rebind the reserved ports inside the generic server helper.
    let moved1 = moved.clone();
    let queries1 = slots_queries.clone();
    let node1 = spawn_node_on(port1, move |args| {
        match args.first().map(String::as_str) {
            Some("PING") => Some(RespFrame::SimpleString("PONG".into())),
            Some("READONLY") => Some(RespFrame::SimpleString("OK".into())),
            Some("CLUSTER") => match args.get(1).map(String::as_str) {
                Some("NODES") => Some(cluster_nodes_reply(&[port1, port2])),
                Some("SLOTS") => {
                    queries1.fetch_add(1, Ordering::SeqCst);
                    Some(cluster_slots_reply(
                        moved1.load(Ordering::SeqCst),
                        port1,
                        port2,
                    ))
                }
                _ => Some(RespFrame::Error("ERR unknown subcommand".into())),
            },
            Some("GET") => {
                moved1.store(true, Ordering::SeqCst);
                Some(RespFrame::Error(format!("MOVED 12182 127.0.0.1:{port2}")))
            }
            _ => Some(RespFrame::Error("ERR unknown command".into())),
        }
    })
    .await;
    let moved2 = moved.clone();
    let node2 = spawn_node_on(port2, move |args| {
        match args.first().map(String::as_str) {
            Some("PING") => Some(RespFrame::SimpleString("PONG".into())),
            Some("READONLY") => Some(RespFrame::SimpleString("OK".into())),
            Some("CLUSTER") => match args.get(1).map(String::as_str) {
                Some("NODES") => Some(cluster_nodes_reply(&[port1, port2])),
                Some("SLOTS") => Some(cluster_slots_reply(
                    moved2.load(Ordering::SeqCst),
                    port1,
                    port2,
                )),
                _ => Some(RespFrame::Error("ERR unknown subcommand".into())),
            },
            Some("GET") => Some(bulk("relocated")),
            _ => Some(RespFrame::Error("ERR unknown command".into())),
        }
    })
    .await;
    NodePorts { node1, node2 }
}

async fn spawn_node_on<F>(port: u16, handler: F) -> u16
where
    F: Fn(Vec<String>) -> Option<RespFrame> + Send + Sync + 'static,
{
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(socket, RespFrameCodec);
                while let Some(Ok(frame)) = framed.next().await {
                    if let Some(reply) = handler(args_of(&frame)) {
                        if framed.send(reply).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    port
}

fn fast_timings(config: &mut ClientConfig) {
    config.timings.topology_poll_interval = Duration::from_millis(100);
    config.timings.explore_nodes_interval = Duration::from_millis(100);
    config.timings.waiting_commands_interval = Duration::from_millis(200);
    config.timings.connect_timeout = Duration::from_millis(500);
}

#[tokio::test]
async fn cluster_topology_is_discovered() {
    init_tracing();
    let moved = Arc::new(AtomicBool::new(false));
    let queries = Arc::new(AtomicUsize::new(0));
    let ports = spawn_cluster(moved, queries).await;

    let client = ClientBuilder::cluster()
        .seed("127.0.0.1", ports.node1)
        .config(fast_timings)
        .build()
        .unwrap();

    client
        .wait_connected_once(ConnectedMode::MasterOnly, Duration::from_secs(5), true)
        .await
        .unwrap();
    assert_eq!(client.shards_count(), 1);
    // Both nodes are known; slot 12182 maps to the only shard.
    assert_eq!(client.shard_by_key(b"foo"), Some(0));

    client.stop();
    let _ = ports.node2;
}

#[tokio::test]
async fn moved_reply_redirects_and_refreshes_topology() {
    init_tracing();
    let moved = Arc::new(AtomicBool::new(false));
    let queries = Arc::new(AtomicUsize::new(0));
    let ports = spawn_cluster(moved.clone(), queries.clone()).await;

    let client = ClientBuilder::cluster()
        .seed("127.0.0.1", ports.node1)
        .config(fast_timings)
        .build()
        .unwrap();
    client
        .wait_connected_once(ConnectedMode::MasterOnly, Duration::from_secs(5), true)
        .await
        .unwrap();

    let control = CommandControl {
        timeout_single: Some(Duration::from_millis(500)),
        timeout_all: Some(Duration::from_secs(5)),
        max_retries: Some(8),
        ..Default::default()
    };
    let queries_before = queries.load(Ordering::SeqCst);
    let reply = client
        .request(CmdArgs::new("GET").arg("foo"), "foo", true, Some(control))
        .await;

    // The redirected command lands on the new owner.
    assert_eq!(reply.status, ReplyStatus::Ok, "reply: {reply:?}");
    assert_eq!(reply.data.as_text().as_deref(), Some("relocated"));

    // The MOVED asked the topology holder to refresh.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while queries.load(Ordering::SeqCst) <= queries_before {
        assert!(std::time::Instant::now() < deadline, "no topology refresh");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Once the new layout is installed, the key routes straight to the new
    // owner and fresh GETs stop producing MOVED.
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while client.shards_count() != 2 {
        assert!(
            std::time::Instant::now() < deadline,
            "migrated layout never installed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let reply = client
        .request(CmdArgs::new("GET").arg("foo"), "foo", true, None)
        .await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.data.as_text().as_deref(), Some("relocated"));

    client.stop();
}
