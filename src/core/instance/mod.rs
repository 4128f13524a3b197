// src/core/instance/mod.rs

//! One TCP connection to one Redis process.
//!
//! An [`Instance`] is a cheap handle; the socket is owned by a spawned
//! connection task ([`task`]) that transmits queued commands, matches FIFO
//! replies, arms per-command timers, issues inactivity pings and routes
//! pub/sub push frames. State transitions are broadcast on a watch channel.

pub mod task;

use crate::config::{CommandsBufferingSettings, ReplicationMonitoringSettings};
use crate::core::command::Command;
use crate::core::stats::InstanceStats;
use crate::core::types::{ConnectionInfo, ServerId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{mpsc, watch};

/// Connection lifecycle. Terminal state is `ExitReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InstanceState {
    Init,
    Connected,
    /// Address resolution or local setup failed.
    InitError,
    /// TCP connect failed or timed out.
    ConnectError,
    /// The AUTH/READONLY handshake failed.
    ConnectCodecError,
    Disconnected,
    ExitReady,
}

impl InstanceState {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            InstanceState::InitError
                | InstanceState::ConnectError
                | InstanceState::ConnectCodecError
        )
    }
}

/// Creation knobs fixed for the connection lifetime.
#[derive(Debug, Clone)]
pub struct InstanceCreationSettings {
    /// Issue `READONLY` after connecting (cluster replicas).
    pub send_readonly: bool,
    /// Fallback password for infos that carry none of their own.
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub buffering: CommandsBufferingSettings,
    pub monitoring: ReplicationMonitoringSettings,
}

impl Default for InstanceCreationSettings {
    fn default() -> Self {
        Self {
            send_readonly: false,
            password: None,
            connect_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(2),
            ping_timeout: Duration::from_secs(4),
            buffering: CommandsBufferingSettings::default(),
            monitoring: ReplicationMonitoringSettings::default(),
        }
    }
}

pub(crate) enum InstanceMsg {
    Command(Arc<Command>),
    SetBuffering(CommandsBufferingSettings),
    SetMonitoring(ReplicationMonitoringSettings),
    Stop,
}

/// Handle to one connection. Cloned freely via `Arc`; shards and the nodes
/// storage may share the same instance.
pub struct Instance {
    id: ServerId,
    info: ConnectionInfo,
    state_rx: watch::Receiver<InstanceState>,
    msg_tx: mpsc::UnboundedSender<InstanceMsg>,
    in_flight: AtomicUsize,
    destroying: AtomicBool,
    syncing: AtomicBool,
    stats: Arc<InstanceStats>,
}

impl Instance {
    /// Creates the handle and spawns the connection task.
    pub fn spawn(info: ConnectionInfo, settings: InstanceCreationSettings) -> Arc<Instance> {
        let id = ServerId::generate(info.host_port());
        let (state_tx, state_rx) = watch::channel(InstanceState::Init);
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(InstanceStats::default());

        let instance = Arc::new(Instance {
            id,
            info: info.clone(),
            state_rx,
            msg_tx,
            in_flight: AtomicUsize::new(0),
            destroying: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            stats: stats.clone(),
        });

        tokio::spawn(task::run_connection(
            info,
            id,
            settings,
            state_tx,
            msg_rx,
            stats,
            Arc::downgrade(&instance),
        ));

        instance
    }

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn host_port(&self) -> String {
        self.info.host_port()
    }

    pub fn state(&self) -> InstanceState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<InstanceState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> &Arc<InstanceStats> {
        &self.stats
    }

    /// Number of commands submitted but not yet answered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Last measured PING round trip; `None` before the first ping.
    pub fn ping_latency(&self) -> Option<Duration> {
        let us = self.stats.ping_latency_us.load(Ordering::Relaxed);
        (us > 0).then(|| Duration::from_micros(us))
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    /// Connected and accepting commands.
    pub fn is_available(&self) -> bool {
        !self.is_destroying() && self.state() == InstanceState::Connected
    }

    /// Enqueues a command for transmission. Returns false when the instance
    /// is destroying, disconnected or its task has exited.
    pub fn send_command(&self, cmd: Arc<Command>) -> bool {
        if self.is_destroying() {
            return false;
        }
        match self.state() {
            InstanceState::Init | InstanceState::Connected => {}
            _ => return false,
        }
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        if self.msg_tx.send(InstanceMsg::Command(cmd)).is_err() {
            self.in_flight.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// A replica still syncing from its master, per replication monitoring.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Relaxed)
    }

    pub(crate) fn set_syncing(&self, syncing: bool) {
        self.syncing.store(syncing, Ordering::Relaxed);
    }

    pub(crate) fn complete_one(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_commands_buffering_settings(&self, settings: CommandsBufferingSettings) {
        let _ = self.msg_tx.send(InstanceMsg::SetBuffering(settings));
    }

    pub fn set_replication_monitoring_settings(&self, settings: ReplicationMonitoringSettings) {
        let _ = self.msg_tx.send(InstanceMsg::SetMonitoring(settings));
    }

    /// Requests teardown. The task disconnects, fails the remaining queued
    /// commands and transitions to `ExitReady`.
    pub fn destroy(&self) {
        if !self.destroying.swap(true, Ordering::AcqRel) {
            let _ = self.msg_tx.send(InstanceMsg::Stop);
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.id.retire();
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("addr", &self.info.host_port())
            .field("state", &self.state())
            .finish()
    }
}
