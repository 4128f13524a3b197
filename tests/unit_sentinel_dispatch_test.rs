//! End-to-end dispatch against mock sentinel and data servers.

use bytes::Bytes;
use crimson::core::protocol::{RespFrame, RespFrameCodec};
use crimson::{ClientBuilder, CmdArgs, CommandControl, ReplyStatus};
use crimson::core::topology::ConnectedMode;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
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

/// Serves RESP on an ephemeral port, answering with `handler`. Returns the
/// bound port.
async fn spawn_server<F>(handler: F) -> u16
where
    F: Fn(Vec<String>) -> Option<RespFrame> + Send + Sync + 'static,
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
                    let args = args_of(&frame);
                    if let Some(reply) = handler(args) {
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

fn sentinel_masters_reply(shard: &str, redis_port: u16) -> RespFrame {
    RespFrame::Array(vec![RespFrame::Array(vec![
        bulk("name"),
        bulk(shard),
        bulk("ip"),
        bulk("127.0.0.1"),
        bulk("port"),
        bulk(&redis_port.to_string()),
        bulk("flags"),
        bulk("master"),
    ])])
}

async fn spawn_sentinel(shard: &'static str, redis_port: u16) -> u16 {
    spawn_server(move |args| {
        match args.first().map(String::as_str) {
            Some("PING") => Some(RespFrame::SimpleString("PONG".into())),
            Some("SENTINEL") => match args.get(1).map(String::as_str) {
                Some("MASTERS") => Some(sentinel_masters_reply(shard, redis_port)),
                Some("SLAVES") => Some(RespFrame::Array(Vec::new())),
                _ => Some(RespFrame::Error("ERR unknown sentinel subcommand".into())),
            },
            _ => Some(RespFrame::Error("ERR unknown command".into())),
        }
    })
    .await
}

fn fast_timings(config: &mut crimson::ClientConfig) {
    config.timings.topology_poll_interval = Duration::from_millis(100);
    config.timings.waiting_commands_interval = Duration::from_millis(200);
    config.timings.connect_timeout = Duration::from_millis(500);
}

#[tokio::test]
async fn get_round_trips_through_master() {
    init_tracing();
    let redis_port = spawn_server(|args| match args.first().map(String::as_str) {
        Some("PING") => Some(RespFrame::SimpleString("PONG".into())),
        Some("GET") if args.get(1).map(String::as_str) == Some("answer") => Some(bulk("42")),
        Some("GET") => Some(RespFrame::Null),
        _ => Some(RespFrame::Error("ERR unknown command".into())),
    })
    .await;
    let sentinel_port = spawn_sentinel("shard0", redis_port).await;

    let client = ClientBuilder::sentinel()
        .seed("127.0.0.1", sentinel_port)
        .shard("shard0")
        .config(fast_timings)
        .build()
        .unwrap();

    client
        .wait_connected_once(ConnectedMode::MasterOnly, Duration::from_secs(5), true)
        .await
        .unwrap();

    let reply = client
        .request(CmdArgs::new("GET").arg("answer"), "answer", true, None)
        .await;
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.data.as_text().as_deref(), Some("42"));

    let reply = client
        .request(CmdArgs::new("GET").arg("missing"), "missing", true, None)
        .await;
    assert!(reply.data.is_nil());

    client.stop();
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    init_tracing();
    let get_attempts = Arc::new(AtomicUsize::new(0));
    let attempts = get_attempts.clone();
    // Swallow GETs: every attempt times out client-side.
    let redis_port = spawn_server(move |args| match args.first().map(String::as_str) {
        Some("PING") => Some(RespFrame::SimpleString("PONG".into())),
        Some("GET") => {
            attempts.fetch_add(1, Ordering::SeqCst);
            None
        }
        _ => Some(RespFrame::Error("ERR unknown command".into())),
    })
    .await;
    let sentinel_port = spawn_sentinel("shard0", redis_port).await;

    let client = ClientBuilder::sentinel()
        .seed("127.0.0.1", sentinel_port)
        .shard("shard0")
        .config(fast_timings)
        .build()
        .unwrap();
    client
        .wait_connected_once(ConnectedMode::MasterOnly, Duration::from_secs(5), true)
        .await
        .unwrap();

    let control = CommandControl {
        timeout_single: Some(Duration::from_millis(100)),
        timeout_all: Some(Duration::from_millis(450)),
        max_retries: Some(4),
        ..Default::default()
    };
    let started = std::time::Instant::now();
    let reply = client
        .request(CmdArgs::new("GET").arg("slow"), "slow", true, Some(control))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(reply.status, ReplyStatus::Timeout);
    // Attempts are bounded by max_retries; the total time by timeout_all
    // plus scheduler slack.
    let observed = get_attempts.load(Ordering::SeqCst);
    assert!((1..=4).contains(&observed), "observed {observed} attempts");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    client.stop();
}

#[tokio::test]
async fn submissions_after_stop_fail_with_not_ready() {
    init_tracing();
    let redis_port = spawn_server(|args| match args.first().map(String::as_str) {
        Some("PING") => Some(RespFrame::SimpleString("PONG".into())),
        _ => Some(RespFrame::Null),
    })
    .await;
    let sentinel_port = spawn_sentinel("shard0", redis_port).await;

    let client = ClientBuilder::sentinel()
        .seed("127.0.0.1", sentinel_port)
        .shard("shard0")
        .config(fast_timings)
        .build()
        .unwrap();
    client.stop();

    let reply = client
        .request(CmdArgs::new("GET").arg("k"), "k", true, None)
        .await;
    assert_eq!(reply.status, ReplyStatus::NotReady);
}

#[tokio::test]
async fn cancelled_future_reports_cancelled() {
    init_tracing();
    let redis_port = spawn_server(|args| match args.first().map(String::as_str) {
        Some("PING") => Some(RespFrame::SimpleString("PONG".into())),
        Some("GET") => None, // never answer
        _ => Some(RespFrame::Null),
    })
    .await;
    let sentinel_port = spawn_sentinel("shard0", redis_port).await;

    let client = ClientBuilder::sentinel()
        .seed("127.0.0.1", sentinel_port)
        .shard("shard0")
        .config(fast_timings)
        .build()
        .unwrap();
    client
        .wait_connected_once(ConnectedMode::MasterOnly, Duration::from_secs(5), true)
        .await
        .unwrap();

    let mut future = client.request(CmdArgs::new("GET").arg("k"), "k", true, None);
    future.cancel();
    let reply = future.await;
    assert_eq!(reply.status, ReplyStatus::Cancelled);

    client.stop();
}
