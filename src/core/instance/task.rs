// src/core/instance/task.rs

//! The connection task: owns the socket, transmits queued commands, matches
//! FIFO replies, arms per-command timers, issues inactivity pings and routes
//! pub/sub push frames.

use super::{Instance, InstanceCreationSettings, InstanceMsg, InstanceState};
use crate::config::CommandsBufferingSettings;
use crate::core::command::Command;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use crate::core::reply::{Reply, ReplyData, ReplyStatus};
use crate::core::stats::InstanceStats;
use crate::core::types::{ConnectionInfo, ServerId};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

/// Consecutive inactivity-ping failures that force a disconnect.
const MAX_FAILED_PINGS: u32 = 2;

/// A deadline far enough away to act as "no timer armed".
fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

struct InFlight {
    /// `None` for entries whose reply is discarded (ASKING prefix, pings).
    cmd: Option<Arc<Command>>,
    deadline: Instant,
    sent_at: Instant,
    timed_out: bool,
    is_ping: bool,
    /// Countdown shared by all sub-request entries of one submission; the
    /// last completion releases the handle's in-flight slot.
    remaining: Option<Arc<std::sync::atomic::AtomicUsize>>,
}

struct SubEntry {
    cmd: Arc<Command>,
}

pub(super) async fn run_connection(
    info: ConnectionInfo,
    id: ServerId,
    settings: InstanceCreationSettings,
    state_tx: watch::Sender<InstanceState>,
    mut msg_rx: mpsc::UnboundedReceiver<InstanceMsg>,
    stats: Arc<InstanceStats>,
    handle: Weak<Instance>,
) {
    let framed = match connect(&info, id, &settings, &state_tx).await {
        Some(framed) => framed,
        None => {
            // Connect failed; fail whatever was queued while we tried.
            drain_queued(&mut msg_rx, &handle);
            let _ = state_tx.send(InstanceState::Disconnected);
            let _ = state_tx.send(InstanceState::ExitReady);
            return;
        }
    };

    let mut conn = Connection {
        id,
        framed,
        state_tx,
        stats,
        handle,
        buffering: settings.buffering,
        monitoring_enabled: settings.monitoring.enable_monitoring,
        in_flight: VecDeque::new(),
        subs: HashMap::new(),
        failed_pings: 0,
        last_write: Instant::now(),
        flush_deadline: None,
    };
    let _ = conn.state_tx.send(InstanceState::Connected);
    debug!(server_id = %id, addr = %info, "instance connected");

    conn.run(&mut msg_rx, settings.ping_interval, settings.ping_timeout)
        .await;

    conn.teardown(&mut msg_rx);
}

/// Resolves addresses, opens the socket and performs the AUTH/READONLY
/// handshake. On failure leaves the state at the corresponding error value.
async fn connect(
    info: &ConnectionInfo,
    id: ServerId,
    settings: &InstanceCreationSettings,
    state_tx: &watch::Sender<InstanceState>,
) -> Option<Framed<TcpStream, RespFrameCodec>> {
    if info.tls {
        warn!(addr = %info, "TLS connections are not supported; refusing to connect");
        let _ = state_tx.send(InstanceState::InitError);
        return None;
    }

    let addrs: Vec<SocketAddr> = if info.resolved.is_empty() {
        match tokio::net::lookup_host((info.host.as_str(), info.port)).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                warn!(addr = %info, error = %e, "address resolution failed");
                let _ = state_tx.send(InstanceState::InitError);
                return None;
            }
        }
    } else {
        info.resolved.clone()
    };
    if addrs.is_empty() {
        let _ = state_tx.send(InstanceState::InitError);
        return None;
    }

    let mut stream = None;
    for addr in &addrs {
        match timeout(settings.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => {
                stream = Some(s);
                break;
            }
            Ok(Err(e)) => debug!(server_id = %id, %addr, error = %e, "connect failed"),
            Err(_) => debug!(server_id = %id, %addr, "connect timed out"),
        }
    }
    let Some(stream) = stream else {
        let _ = state_tx.send(InstanceState::ConnectError);
        return None;
    };
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, RespFrameCodec);

    if let Some(password) = &info.password
        && !handshake(&mut framed, settings, &["AUTH", password.as_str()]).await
    {
        warn!(server_id = %id, addr = %info, "AUTH failed");
        let _ = state_tx.send(InstanceState::ConnectCodecError);
        return None;
    }
    if settings.send_readonly && !handshake(&mut framed, settings, &["READONLY"]).await {
        warn!(server_id = %id, addr = %info, "READONLY failed");
        let _ = state_tx.send(InstanceState::ConnectCodecError);
        return None;
    }

    Some(framed)
}

/// Sends one handshake command and expects a non-error reply.
async fn handshake(
    framed: &mut Framed<TcpStream, RespFrameCodec>,
    settings: &InstanceCreationSettings,
    args: &[&str],
) -> bool {
    let frame = RespFrame::command(args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())));
    if framed.send(frame).await.is_err() {
        return false;
    }
    match timeout(settings.connect_timeout, framed.next()).await {
        Ok(Some(Ok(reply))) => !matches!(reply, RespFrame::Error(_)),
        _ => false,
    }
}

/// Fails commands that were queued but never transmitted.
fn drain_queued(msg_rx: &mut mpsc::UnboundedReceiver<InstanceMsg>, handle: &Weak<Instance>) {
    msg_rx.close();
    while let Ok(msg) = msg_rx.try_recv() {
        if let InstanceMsg::Command(cmd) = msg {
            for args in &cmd.args.commands {
                let name = String::from_utf8_lossy(&args[0]).to_uppercase();
                cmd.invoke(Reply::status_only(
                    name,
                    ReplyStatus::NotReady,
                    "instance is not connected",
                ));
            }
            if let Some(instance) = handle.upgrade() {
                instance.complete_one();
            }
        }
    }
}

struct Connection {
    id: ServerId,
    framed: Framed<TcpStream, RespFrameCodec>,
    state_tx: watch::Sender<InstanceState>,
    stats: Arc<InstanceStats>,
    handle: Weak<Instance>,
    buffering: CommandsBufferingSettings,
    monitoring_enabled: bool,
    in_flight: VecDeque<InFlight>,
    /// Pub/sub slots keyed by channel or pattern.
    subs: HashMap<Bytes, SubEntry>,
    failed_pings: u32,
    last_write: Instant,
    flush_deadline: Option<Instant>,
}

impl Connection {
    async fn run(
        &mut self,
        msg_rx: &mut mpsc::UnboundedReceiver<InstanceMsg>,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) {
        enum Event {
            Msg(Option<InstanceMsg>),
            Frame(Option<Result<RespFrame, crate::core::CrimsonError>>),
            Timer,
            Flush,
            PingTick,
        }

        let mut ping_tick = tokio::time::interval(ping_interval);
        ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let timer_deadline = self.next_deadline();
            let flush_deadline = self.flush_deadline.unwrap_or_else(far_deadline);

            let event = tokio::select! {
                msg = msg_rx.recv() => Event::Msg(msg),
                frame = self.framed.next() => Event::Frame(frame),
                _ = sleep_until(timer_deadline.into()) => Event::Timer,
                _ = sleep_until(flush_deadline.into()) => Event::Flush,
                _ = ping_tick.tick() => Event::PingTick,
            };

            match event {
                Event::Msg(Some(InstanceMsg::Command(cmd))) => {
                    if !self.transmit(cmd).await {
                        return;
                    }
                }
                Event::Msg(Some(InstanceMsg::SetBuffering(settings))) => {
                    self.buffering = settings;
                    if !self.buffering.enabled && self.flush().await.is_err() {
                        return;
                    }
                }
                Event::Msg(Some(InstanceMsg::SetMonitoring(settings))) => {
                    self.monitoring_enabled = settings.enable_monitoring;
                }
                Event::Msg(Some(InstanceMsg::Stop)) | Event::Msg(None) => return,
                Event::Frame(Some(Ok(frame))) => self.on_frame(frame),
                Event::Frame(Some(Err(e))) => {
                    warn!(server_id = %self.id, error = %e, "protocol error, disconnecting");
                    return;
                }
                Event::Frame(None) => {
                    debug!(server_id = %self.id, "connection closed by peer");
                    return;
                }
                Event::Timer => {
                    if !self.expire_timed_out() {
                        return;
                    }
                }
                Event::Flush => {
                    self.flush_deadline = None;
                    if self.flush().await.is_err() {
                        return;
                    }
                }
                Event::PingTick => {
                    if !self.maybe_ping(ping_interval, ping_timeout).await {
                        return;
                    }
                }
            }
        }
    }

    /// Earliest per-command deadline among live entries.
    fn next_deadline(&self) -> Instant {
        self.in_flight
            .iter()
            .filter(|e| !e.timed_out)
            .map(|e| e.deadline)
            .min()
            .unwrap_or_else(far_deadline)
    }

    /// Writes one command to the socket, registering reply slots.
    /// Returns false on a fatal write error.
    async fn transmit(&mut self, cmd: Arc<Command>) -> bool {
        let name = cmd.command_name();
        match name.as_str() {
            "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" => self.transmit_subscribe(cmd).await,
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" | "SUNSUBSCRIBE" => {
                self.transmit_fire_and_forget(cmd).await
            }
            _ => self.transmit_regular(cmd).await,
        }
    }

    async fn transmit_regular(&mut self, cmd: Arc<Command>) -> bool {
        let timeout_single = cmd.control.lock().timeout_single();
        let now = Instant::now();
        let deadline = now + timeout_single;
        let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(
            cmd.args.sub_request_count(),
        ));

        // Register every reply slot before writing: a write failure then
        // tears the connection down and fails the slots uniformly.
        if cmd.asking.load(Ordering::Acquire) {
            self.in_flight.push_back(InFlight {
                cmd: None,
                deadline,
                sent_at: now,
                timed_out: false,
                is_ping: false,
                remaining: None,
            });
            let asking = RespFrame::command([Bytes::from_static(b"ASKING")]);
            if self.feed(asking).await.is_err() {
                return false;
            }
        }

        for args in &cmd.args.commands {
            self.in_flight.push_back(InFlight {
                cmd: Some(cmd.clone()),
                deadline,
                sent_at: now,
                timed_out: false,
                is_ping: false,
                remaining: Some(remaining.clone()),
            });
            let frame = RespFrame::command(args.iter().cloned());
            if self.feed(frame).await.is_err() {
                return false;
            }
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.after_write().await
    }

    /// SUBSCRIBE-family commands: no FIFO slot and no timeout bookkeeping;
    /// confirmations and messages arrive as push frames routed by channel.
    async fn transmit_subscribe(&mut self, cmd: Arc<Command>) -> bool {
        for args in &cmd.args.commands {
            for channel in args.iter().skip(1) {
                self.subs
                    .insert(channel.clone(), SubEntry { cmd: cmd.clone() });
            }
            let frame = RespFrame::command(args.iter().cloned());
            if self.feed(frame).await.is_err() {
                return false;
            }
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
        self.after_write().await
    }

    async fn transmit_fire_and_forget(&mut self, cmd: Arc<Command>) -> bool {
        for args in &cmd.args.commands {
            let frame = RespFrame::command(args.iter().cloned());
            if self.feed(frame).await.is_err() {
                return false;
            }
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        self.release_slot();
        self.after_write().await
    }

    async fn feed(&mut self, frame: RespFrame) -> Result<(), crate::core::CrimsonError> {
        self.last_write = Instant::now();
        self.framed.feed(frame).await
    }

    /// Applies the buffering policy after queuing writes.
    async fn after_write(&mut self) -> bool {
        let pending = self.framed.write_buffer().len();
        if !self.buffering.enabled || pending >= self.buffering.buffer_size_threshold {
            self.flush_deadline = None;
            return self.flush().await.is_ok();
        }
        if self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + self.buffering.timeout);
        }
        true
    }

    async fn flush(&mut self) -> Result<(), crate::core::CrimsonError> {
        self.framed.flush().await
    }

    fn release_slot(&self) {
        if let Some(instance) = self.handle.upgrade() {
            instance.complete_one();
        }
    }

    /// Completes entries whose timer fired. Returns false when repeated ping
    /// failures force a disconnect.
    fn expire_timed_out(&mut self) -> bool {
        let now = Instant::now();
        let mut disconnect = false;
        for entry in self.in_flight.iter_mut() {
            if entry.timed_out || entry.deadline > now {
                continue;
            }
            entry.timed_out = true;
            if entry.is_ping {
                self.failed_pings += 1;
                warn!(server_id = %self.id, failed = self.failed_pings, "inactivity ping timed out");
                if self.failed_pings >= MAX_FAILED_PINGS {
                    disconnect = true;
                }
                continue;
            }
            if let Some(cmd) = &entry.cmd {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                cmd.invoke(Reply::status_only(
                    cmd.command_name(),
                    ReplyStatus::Timeout,
                    "command timed out",
                ));
                if let Some(remaining) = &entry.remaining
                    && remaining.fetch_sub(1, Ordering::AcqRel) == 1
                    && let Some(instance) = self.handle.upgrade()
                {
                    instance.complete_one();
                }
            }
        }
        !disconnect
    }

    /// Sends an inactivity PING when the connection has been idle. Subscribe
    /// mode connections skip the ping bookkeeping entirely.
    async fn maybe_ping(&mut self, ping_interval: Duration, ping_timeout: Duration) -> bool {
        if !self.subs.is_empty() || self.last_write.elapsed() < ping_interval {
            return true;
        }
        let now = Instant::now();
        if self.feed(RespFrame::command([Bytes::from_static(b"PING")])).await.is_err()
            || self.flush().await.is_err()
        {
            return false;
        }
        self.in_flight.push_back(InFlight {
            cmd: None,
            deadline: now + ping_timeout,
            sent_at: now,
            timed_out: false,
            is_ping: true,
            remaining: None,
        });

        if self.monitoring_enabled
            && self
                .feed(RespFrame::command([
                    Bytes::from_static(b"INFO"),
                    Bytes::from_static(b"replication"),
                ]))
                .await
                .is_ok()
            && self.flush().await.is_ok()
        {
            self.in_flight.push_back(InFlight {
                cmd: None,
                deadline: now + ping_timeout,
                sent_at: now,
                timed_out: false,
                is_ping: false,
                remaining: None,
            });
        }
        true
    }

    fn on_frame(&mut self, frame: RespFrame) {
        if !self.subs.is_empty()
            && let Some(kind) = push_kind(&frame)
        {
            self.on_push(kind, frame);
            return;
        }

        let Some(entry) = self.in_flight.pop_front() else {
            warn!(server_id = %self.id, "unexpected reply with empty in-flight queue");
            return;
        };
        if entry.timed_out {
            // Late reply for an evicted slot; the FIFO position is consumed
            // and the payload dropped.
            trace!(server_id = %self.id, "discarding late reply");
            return;
        }
        if entry.is_ping {
            self.failed_pings = 0;
            let latency = entry.sent_at.elapsed();
            self.stats
                .ping_latency_us
                .store(latency.as_micros() as u64, Ordering::Relaxed);
            return;
        }
        let Some(cmd) = entry.cmd else {
            // ASKING prefix or monitoring probe.
            if self.monitoring_enabled
                && let RespFrame::BulkString(body) = &frame
            {
                self.parse_replication_info(body);
            }
            return;
        };

        let data = ReplyData::from(frame);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        cmd.invoke(Reply::ok(
            cmd.command_name(),
            data,
            self.id,
            entry.sent_at.elapsed(),
        ));
        if let Some(remaining) = &entry.remaining
            && remaining.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.release_slot();
        }
    }

    fn parse_replication_info(&self, body: &Bytes) {
        let text = String::from_utf8_lossy(body);
        let syncing = text
            .lines()
            .any(|line| line.trim() == "master_sync_in_progress:1");
        if let Some(instance) = self.handle.upgrade() {
            instance.set_syncing(syncing);
        }
    }

    /// Routes a pub/sub push frame to the subscription that owns its channel.
    fn on_push(&mut self, kind: PushKind, frame: RespFrame) {
        let RespFrame::Array(items) = &frame else {
            return;
        };
        let Some(RespFrame::BulkString(key)) = items.get(1) else {
            warn!(server_id = %self.id, "malformed push frame");
            return;
        };
        let key = key.clone();
        let Some(entry) = self.subs.get(&key) else {
            debug!(server_id = %self.id, channel = %String::from_utf8_lossy(&key),
                   "push frame for unknown channel");
            return;
        };
        let cmd = entry.cmd.clone();
        cmd.invoke(Reply::ok(
            cmd.command_name(),
            ReplyData::from(frame),
            self.id,
            Duration::ZERO,
        ));
        if kind == PushKind::Unsubscribe {
            self.subs.remove(&key);
        }
    }

    /// Fails everything still pending and publishes the terminal states.
    fn teardown(&mut self, msg_rx: &mut mpsc::UnboundedReceiver<InstanceMsg>) {
        let _ = self.state_tx.send(InstanceState::Disconnected);
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);

        for entry in std::mem::take(&mut self.in_flight) {
            if entry.timed_out || entry.is_ping {
                continue;
            }
            if let Some(cmd) = entry.cmd {
                cmd.invoke(Reply::status_only(
                    cmd.command_name(),
                    ReplyStatus::OtherError,
                    "connection closed",
                ));
                if let Some(remaining) = &entry.remaining
                    && remaining.fetch_sub(1, Ordering::AcqRel) == 1
                {
                    self.release_slot();
                }
            }
        }

        // Subscription slots learn about the loss through an error reply
        // carrying this connection's id, so their FSMs recognize the lost
        // server and resubscribe elsewhere.
        for (_, entry) in std::mem::take(&mut self.subs) {
            let mut reply = Reply::status_only(
                entry.cmd.command_name(),
                ReplyStatus::OtherError,
                "connection closed",
            );
            reply.server_id = self.id;
            entry.cmd.invoke(reply);
        }

        drain_queued(msg_rx, &self.handle);
        let _ = self.state_tx.send(InstanceState::ExitReady);
        debug!(server_id = %self.id, "instance exited");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushKind {
    Subscribe,
    Unsubscribe,
    Message,
}

/// Classifies a frame as a pub/sub push, if it is one.
fn push_kind(frame: &RespFrame) -> Option<PushKind> {
    let RespFrame::Array(items) = frame else {
        return None;
    };
    let RespFrame::BulkString(kind) = items.first()? else {
        return None;
    };
    match kind.as_ref() {
        b"subscribe" | b"psubscribe" | b"ssubscribe" => Some(PushKind::Subscribe),
        b"unsubscribe" | b"punsubscribe" | b"sunsubscribe" => Some(PushKind::Unsubscribe),
        b"message" | b"smessage" => Some(PushKind::Message),
        b"pmessage" => Some(PushKind::Message),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_push_frames() {
        let push = RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from_static(b"message")),
            RespFrame::BulkString(Bytes::from_static(b"news")),
            RespFrame::BulkString(Bytes::from_static(b"hello")),
        ]);
        assert_eq!(push_kind(&push), Some(PushKind::Message));

        let confirm = RespFrame::Array(vec![
            RespFrame::BulkString(Bytes::from_static(b"subscribe")),
            RespFrame::BulkString(Bytes::from_static(b"news")),
            RespFrame::Integer(1),
        ]);
        assert_eq!(push_kind(&confirm), Some(PushKind::Subscribe));

        let plain = RespFrame::Array(vec![RespFrame::Integer(1)]);
        assert_eq!(push_kind(&plain), None);
        assert_eq!(push_kind(&RespFrame::Integer(1)), None);
    }
}
