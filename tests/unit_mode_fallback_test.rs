//! Cluster-to-sentinel fallback: a cluster-mode client pointed at a
//! deployment with cluster support disabled switches to sentinel discovery,
//! and subscription tokens taken before the switch keep working.

use bytes::Bytes;
use crimson::core::protocol::{RespFrame, RespFrameCodec};
use crimson::core::topology::ConnectedMode;
use crimson::{ClientBuilder, ClientConfig, CmdArgs, ReplyStatus};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
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

/// Serves RESP; each request may produce several frames (pub/sub pushes).
async fn spawn_server<F>(handler: F) -> u16
where
    F: Fn(Vec<String>) -> Vec<RespFrame> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
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
                    for reply in handler(args_of(&frame)) {
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

const CLUSTER_DISABLED: &str = "ERR This instance has cluster support disabled";

#[tokio::test]
async fn non_cluster_signal_switches_to_sentinel_mode() {
    init_tracing();
    // The data node: answers pub/sub and GET, refuses CLUSTER commands.
    let redis_port = spawn_server(|args| match args.first().map(String::as_str) {
        Some("PING") => vec![RespFrame::SimpleString("PONG".into())],
        Some("CLUSTER") => vec![RespFrame::Error(CLUSTER_DISABLED.into())],
        Some("GET") => vec![bulk("value")],
        Some("SUBSCRIBE") => {
            let channel = args.get(1).cloned().unwrap_or_default();
            vec![
                RespFrame::Array(vec![
                    bulk("subscribe"),
                    bulk(&channel),
                    RespFrame::Integer(1),
                ]),
                // A message right behind the confirmation.
                RespFrame::Array(vec![bulk("message"), bulk(&channel), bulk("payload")]),
            ]
        }
        _ => vec![RespFrame::Error("ERR unknown command".into())],
    })
    .await;

    // The seed: a sentinel that also refuses CLUSTER commands.
    let sentinel_port = spawn_server(move |args| match args.first().map(String::as_str) {
        Some("PING") => vec![RespFrame::SimpleString("PONG".into())],
        Some("CLUSTER") => vec![RespFrame::Error(CLUSTER_DISABLED.into())],
        Some("SENTINEL") => match args.get(1).map(String::as_str) {
            Some("MASTERS") => vec![RespFrame::Array(vec![RespFrame::Array(vec![
                bulk("name"),
                bulk("shard0"),
                bulk("ip"),
                bulk("127.0.0.1"),
                bulk("port"),
                bulk(&redis_port.to_string()),
                bulk("flags"),
                bulk("master"),
            ])])],
            Some("SLAVES") => vec![RespFrame::Array(Vec::new())],
            _ => vec![RespFrame::Error("ERR unknown subcommand".into())],
        },
        _ => vec![RespFrame::Error("ERR unknown command".into())],
    })
    .await;

    let client = ClientBuilder::cluster()
        .seed("127.0.0.1", sentinel_port)
        .shard("shard0")
        .config(|config: &mut ClientConfig| {
            config.timings.topology_poll_interval = Duration::from_millis(100);
            config.timings.explore_nodes_interval = Duration::from_millis(100);
            config.timings.waiting_commands_interval = Duration::from_millis(200);
            config.timings.connect_timeout = Duration::from_millis(500);
        })
        .build()
        .unwrap();

    // Subscribe while still in (not yet disproven) cluster mode.
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let _token = client.subscribe(
        "events",
        Arc::new(move |_channel, payload| {
            sink.lock().push(String::from_utf8_lossy(payload).to_string());
        }),
    );

    // The disabled-cluster error must flip the client into sentinel mode.
    client
        .wait_connected_once(ConnectedMode::MasterOnly, Duration::from_secs(5), true)
        .await
        .unwrap();
    assert_eq!(client.shards_count(), 1);

    let reply = client
        .request(CmdArgs::new("GET").arg("k"), "k", true, None)
        .await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.data.as_text().as_deref(), Some("value"));

    // The pre-switch subscription materialized against the sentinel
    // topology and delivers messages.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while delivered.lock().is_empty() {
        assert!(
            std::time::Instant::now() < deadline,
            "subscription never delivered after the mode switch"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(delivered.lock()[0], "payload");

    client.stop();
}
