use bytes::Bytes;
use crimson::core::command::Command;
use crimson::core::reply::{Reply, ReplyData, ReplyStatus};
use crimson::core::subscription::{ServerWeights, SubscriptionStorage};
use crimson::core::types::ServerId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

type Captured = Arc<Mutex<Vec<(usize, Arc<Command>)>>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn storage_with_sinks(shards: usize) -> (SubscriptionStorage, Captured, Captured) {
    init_tracing();
    let storage = SubscriptionStorage::new(shards, false, Duration::from_millis(50));
    let subscribes: Captured = Arc::new(Mutex::new(Vec::new()));
    let unsubscribes: Captured = Arc::new(Mutex::new(Vec::new()));
    let sink = subscribes.clone();
    storage.set_subscribe_sink(Box::new(move |shard, cmd| {
        sink.lock().push((shard, cmd));
    }));
    let sink = unsubscribes.clone();
    storage.set_unsubscribe_sink(Box::new(move |shard, cmd| {
        sink.lock().push((shard, cmd));
    }));
    (storage, subscribes, unsubscribes)
}

fn subscribe_ok(channel: &str, server_id: ServerId) -> Reply {
    Reply {
        status: ReplyStatus::Ok,
        cmd: "SUBSCRIBE".into(),
        data: ReplyData::Array(vec![
            ReplyData::String("subscribe".into()),
            ReplyData::String(Bytes::copy_from_slice(channel.as_bytes())),
            ReplyData::Integer(1),
        ]),
        server_id,
        time: Duration::ZERO,
        status_text: String::new(),
    }
}

fn unsubscribe_confirmation(channel: &str, server_id: ServerId) -> Reply {
    Reply {
        status: ReplyStatus::Ok,
        cmd: "SUBSCRIBE".into(),
        data: ReplyData::Array(vec![
            ReplyData::String("unsubscribe".into()),
            ReplyData::String(Bytes::copy_from_slice(channel.as_bytes())),
            ReplyData::Integer(0),
        ]),
        server_id,
        time: Duration::ZERO,
        status_text: String::new(),
    }
}

fn message(channel: &str, payload: &str, server_id: ServerId) -> Reply {
    Reply {
        status: ReplyStatus::Ok,
        cmd: "SUBSCRIBE".into(),
        data: ReplyData::Array(vec![
            ReplyData::String("message".into()),
            ReplyData::String(Bytes::copy_from_slice(channel.as_bytes())),
            ReplyData::String(Bytes::copy_from_slice(payload.as_bytes())),
        ]),
        server_id,
        time: Duration::ZERO,
        status_text: String::new(),
    }
}

fn channel_of(cmd: &Arc<Command>) -> String {
    String::from_utf8_lossy(&cmd.args.commands[0][1]).to_string()
}

/// Waits until `captured` holds at least `count` shard-0 subscribe commands
/// past `skip`, or panics.
async fn wait_for_captured(captured: &Captured, skip: usize, count: usize) {
    for _ in 0..100 {
        if captured.lock().len() >= skip + count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} new captured commands, have {} total",
        count,
        captured.lock().len()
    );
}

/// Six equal-weight servers, six subscriptions all on the first server:
/// a rebalance moves five of them, one per remaining server.
#[tokio::test]
async fn rebalance_spreads_subscriptions_evenly() {
    let (storage, subscribes, _unsubscribes) = storage_with_sinks(3);
    let servers: Vec<ServerId> = (0..6)
        .map(|i| ServerId::generate(format!("host{i}:6379")))
        .collect();

    let counter = Arc::new(Mutex::new(0usize));
    let mut tokens = Vec::new();
    for i in 0..6 {
        let counter = counter.clone();
        tokens.push(storage.subscribe(
            &format!("channel{i}"),
            Arc::new(move |_channel, _payload| {
                *counter.lock() += 1;
            }),
        ));
    }

    // Three FSMs per channel (one per shard); confirm the shard-0 ones all
    // on host0.
    let initial: Vec<(usize, Arc<Command>)> = subscribes.lock().clone();
    assert_eq!(initial.len(), 18);
    for (shard, cmd) in &initial {
        if *shard == 0 {
            cmd.invoke(subscribe_ok(&channel_of(cmd), servers[0]));
        }
    }

    let weights: ServerWeights = servers.iter().map(|s| (*s, 1)).collect();
    let before = subscribes.lock().len();
    storage.request_rebalance(0, weights.clone());
    wait_for_captured(&subscribes, before, 5).await;

    let moved: Vec<(usize, Arc<Command>)> = subscribes.lock()[before..].to_vec();
    assert_eq!(moved.len(), 5);
    let mut targets = HashSet::new();
    for (shard, cmd) in &moved {
        assert_eq!(*shard, 0);
        let target = cmd.control.lock().force_server_id.expect("rebalance forces a server");
        assert_ne!(target, servers[0]);
        targets.insert(target);
    }
    // Five distinct receivers: every server except host0 gets exactly one.
    assert_eq!(targets.len(), 5);

    drop(tokens);
}

/// After a completed rebalance, a second one with identical weights
/// produces no actions.
#[tokio::test]
async fn rebalance_is_idempotent() {
    let (storage, subscribes, unsubscribes) = storage_with_sinks(1);
    storage.set_rebalance_min_interval(Duration::from_millis(20));
    let servers: Vec<ServerId> = (0..3)
        .map(|i| ServerId::generate(format!("node{i}:6379")))
        .collect();

    let _tokens: Vec<_> = (0..3)
        .map(|i| {
            storage.subscribe(
                &format!("queue{i}"),
                Arc::new(|_channel, _payload| {}),
            )
        })
        .collect();

    let initial: Vec<(usize, Arc<Command>)> = subscribes.lock().clone();
    assert_eq!(initial.len(), 3);
    for (_, cmd) in &initial {
        cmd.invoke(subscribe_ok(&channel_of(cmd), servers[0]));
    }

    let weights: ServerWeights = servers.iter().map(|s| (*s, 1)).collect();
    let before = subscribes.lock().len();
    storage.request_rebalance(0, weights.clone());
    wait_for_captured(&subscribes, before, 2).await;

    // Complete the moves: confirm on the new servers, then confirm the
    // unsubscription from the old one.
    let moved: Vec<(usize, Arc<Command>)> = subscribes.lock()[before..].to_vec();
    assert_eq!(moved.len(), 2);
    for (_, cmd) in &moved {
        let target = cmd.control.lock().force_server_id.expect("forced server");
        cmd.invoke(subscribe_ok(&channel_of(cmd), target));
    }
    for (_, cmd) in &initial {
        let channel = channel_of(cmd);
        let was_moved = moved.iter().any(|(_, m)| channel_of(m) == channel);
        if was_moved {
            cmd.invoke(unsubscribe_confirmation(&channel, servers[0]));
        }
    }

    // Let the debounce window pass, then rebalance again: at quota, no
    // subscribe or unsubscribe may be emitted.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let subs_before = subscribes.lock().len();
    let unsubs_before = unsubscribes.lock().len();
    storage.request_rebalance(0, weights);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(subscribes.lock().len(), subs_before);
    assert_eq!(unsubscribes.lock().len(), unsubs_before);
}

/// While a channel sits between two servers mid-rebalance, messages from
/// both are delivered exactly once each; traffic from the non-current
/// server is counted as alien.
#[tokio::test]
async fn messages_across_rebalance_are_delivered_once() {
    let (storage, subscribes, _unsubscribes) = storage_with_sinks(1);
    let server_a = ServerId::generate("a:6379".into());
    let server_b = ServerId::generate("b:6379".into());

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let _token = storage.subscribe(
        "channel0",
        Arc::new(move |_channel, payload| {
            sink.lock().push(String::from_utf8_lossy(payload).to_string());
        }),
    );

    let first = subscribes.lock()[0].1.clone();
    first.invoke(subscribe_ok("channel0", server_a));

    // Move to B but do not confirm A's unsubscription yet: the FSM stays
    // in the wait-unsubscribe phase with B current.
    let weights: ServerWeights = [(server_b, 1)].into_iter().collect();
    storage.request_rebalance(0, weights);
    wait_for_captured(&subscribes, 1, 1).await;
    let second = subscribes.lock()[1].1.clone();
    second.invoke(subscribe_ok("channel0", server_b));

    for i in 0..3 {
        first.invoke(message("channel0", &format!("a{i}"), server_a));
        second.invoke(message("channel0", &format!("b{i}"), server_b));
    }

    let seen = delivered.lock().clone();
    assert_eq!(seen.len(), 6);
    for expected in ["a0", "a1", "a2", "b0", "b1", "b2"] {
        assert_eq!(seen.iter().filter(|m| *m == expected).count(), 1);
    }

    let stats = storage.shard_statistics(0);
    let channel_stats = &stats.by_channel["channel0"];
    assert_eq!(channel_stats.messages + channel_stats.alien_messages, 6);
    assert!(channel_stats.alien_messages <= 3);
}

/// Unsubscribing the last token tears the channel down through the FSM
/// lifecycle, and a later subscribe starts a fresh one.
#[tokio::test]
async fn unsubscribe_drives_channel_teardown() {
    let (storage, subscribes, unsubscribes) = storage_with_sinks(1);
    let server = ServerId::generate("solo:6379".into());

    let token = storage.subscribe("events", Arc::new(|_c, _p| {}));
    let first = subscribes.lock()[0].1.clone();
    first.invoke(subscribe_ok("events", server));
    assert_eq!(storage.channels_count(), 1);

    drop(token);
    // The FSM emits an unsubscribe towards the current server.
    assert_eq!(unsubscribes.lock().len(), 1);
    let unsub = unsubscribes.lock()[0].1.clone();
    assert_eq!(
        unsub.control.lock().force_server_id,
        Some(server)
    );

    // Confirming the unsubscription deletes the FSM and the record.
    first.invoke(unsubscribe_confirmation("events", server));
    assert_eq!(storage.channels_count(), 0);

    let _token = storage.subscribe("events", Arc::new(|_c, _p| {}));
    assert_eq!(storage.channels_count(), 1);
    assert_eq!(subscribes.lock().len(), 2);
}
