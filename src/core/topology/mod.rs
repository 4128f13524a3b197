// src/core/topology/mod.rs

//! Topology discovery and maintenance.
//!
//! A [`TopologyHolder`] tracks which instances serve which shards and
//! publishes immutable [`Topology`] snapshots through an atomically swapped
//! cell. Two variants exist: [`sentinel::SentinelTopologyHolder`] and
//! [`cluster::ClusterTopologyHolder`], selected at construction. Switching
//! modes replaces the holder behind the shared handle (see the client
//! facade).

pub mod cluster;
pub mod nodes;
pub mod parse;
pub mod sentinel;

use crate::config::{CommandsBufferingSettings, ReplicationMonitoringSettings};
use crate::core::command::{CmdArgs, Command, CommandControl};
use crate::core::keyshard::NUM_SLOTS;
use crate::core::reply::{Reply, ReplyStatus};
use crate::core::shard::Shard;
use crate::core::types::ServerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

/// Which roles must be connected for [`wait_connected_once`] to succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectedMode {
    MasterOnly,
    SlaveOnly,
    MasterOrSlave,
    MasterAndSlave,
}

/// An immutable topology snapshot. Readers hold the `Arc` for as long as
/// they need; the holder publishes new values without waiting for them.
pub struct Topology {
    /// Strictly increasing across publishes.
    pub version: u64,
    pub created_at: Instant,
    pub shards: Vec<Arc<Shard>>,
    /// Slot to shard-index table, cluster mode only.
    slots: Option<Box<[u16]>>,
    host_port_to_shard: HashMap<String, usize>,
}

impl Topology {
    pub fn empty() -> Arc<Topology> {
        Arc::new(Topology {
            version: 0,
            created_at: Instant::now(),
            shards: Vec::new(),
            slots: None,
            host_port_to_shard: HashMap::new(),
        })
    }

    pub fn new(
        version: u64,
        shards: Vec<Arc<Shard>>,
        slots: Option<Box<[u16]>>,
        host_port_to_shard: HashMap<String, usize>,
    ) -> Arc<Topology> {
        if let Some(slots) = &slots {
            assert_eq!(slots.len(), NUM_SLOTS, "slot table must cover every slot");
        }
        Arc::new(Topology {
            version,
            created_at: Instant::now(),
            shards,
            slots,
            host_port_to_shard,
        })
    }

    pub fn shards_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard serving a cluster slot. `None` outside cluster mode.
    pub fn shard_by_slot(&self, slot: u16) -> Option<usize> {
        let slots = self.slots.as_ref()?;
        let idx = slots[usize::from(slot)];
        (usize::from(idx) < self.shards.len()).then_some(usize::from(idx))
    }

    /// Shard that a "host:port" belongs to, for redirect resolution.
    pub fn shard_by_host_port(&self, host_port: &str) -> Option<usize> {
        self.host_port_to_shard.get(host_port).copied()
    }

    /// True when every shard satisfies the connected-mode predicate.
    pub fn is_connected(&self, mode: ConnectedMode) -> bool {
        !self.shards.is_empty()
            && self.shards.iter().all(|shard| {
                let (master, replica) = shard.connected_roles();
                match mode {
                    ConnectedMode::MasterOnly => master,
                    ConnectedMode::SlaveOnly => replica,
                    ConnectedMode::MasterOrSlave => master || replica,
                    ConnectedMode::MasterAndSlave => master && replica,
                }
            })
    }
}

/// Redirect resolution result: where to send the retried command.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectTarget {
    pub shard_idx: Option<usize>,
    pub server_id: Option<ServerId>,
}

/// Shared construction knobs for both holder variants.
#[derive(Clone)]
pub struct HolderSettings {
    /// Template for data-path instances (masters and replicas).
    pub data_instance: crate::core::instance::InstanceCreationSettings,
    /// Template for the probe pool (sentinels / cluster seed nodes).
    pub probe_instance: crate::core::instance::InstanceCreationSettings,
    /// Control applied to discovery queries.
    pub probe_control: CommandControl,
    pub timings: crate::config::Timings,
    pub local_dc: Option<String>,
    pub stats: crate::core::stats::SharedClientStats,
}

impl Default for HolderSettings {
    fn default() -> Self {
        Self {
            data_instance: Default::default(),
            probe_instance: Default::default(),
            probe_control: CommandControl {
                timeout_single: Some(Duration::from_millis(500)),
                timeout_all: Some(Duration::from_millis(2000)),
                max_retries: Some(1),
                ..Default::default()
            },
            timings: Default::default(),
            local_dc: None,
            stats: Default::default(),
        }
    }
}

/// Discovers shards and their instance sets and publishes topology
/// snapshots. Implemented by the sentinel and cluster variants.
pub trait TopologyHolder: Send + Sync {
    /// The current snapshot; valid for the caller's scope even if
    /// superseded.
    fn topology(&self) -> Arc<Topology>;

    /// Whether at least one topology has been received from the deployment.
    fn topology_received(&self) -> bool;

    /// Signals each published version.
    fn version_watch(&self) -> watch::Receiver<u64>;

    /// Requests an out-of-band refresh (debounced inside the holder).
    fn request_topology_update(&self);

    /// Resolves a MOVED/ASK "host:port" to a retry target.
    fn redirect_target(&self, host_port: &str) -> RedirectTarget;

    fn is_cluster(&self) -> bool;

    fn set_commands_buffering_settings(&self, settings: CommandsBufferingSettings);

    fn set_replication_monitoring_settings(&self, settings: ReplicationMonitoringSettings);

    /// Stops timers and disconnects instances. Idempotent.
    fn stop(&self);
}

/// Waits until a topology is received and every shard satisfies `mode`.
///
/// With `throw_on_fail` the timeout surfaces as an error; otherwise it is
/// logged and `Ok` is returned, matching the fire-and-forget warmup style.
pub async fn wait_connected_once(
    holder: &dyn TopologyHolder,
    mode: ConnectedMode,
    wait_timeout: Duration,
    throw_on_fail: bool,
) -> Result<(), crate::core::CrimsonError> {
    let deadline = Instant::now() + wait_timeout;
    loop {
        if holder.topology_received() && holder.topology().is_connected(mode) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            let text = format!("{mode:?} not reached in {wait_timeout:?}");
            if throw_on_fail {
                return Err(crate::core::CrimsonError::WaitConnectedTimeout(text));
            }
            tracing::warn!(mode = ?mode, "wait_connected_once timed out");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Sends one probe command through a shard and awaits the reply. Used by the
/// holders for SENTINEL/CLUSTER queries.
pub(crate) async fn query_shard(shard: &Arc<Shard>, args: CmdArgs, control: &CommandControl) -> Reply {
    let name = args.command_name();
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    let cmd = Command::new(
        args,
        control.clone(),
        true,
        Box::new(move |reply| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(reply);
            }
        }),
    );
    if !shard.send(cmd, false, control) {
        return Reply::status_only(name, ReplyStatus::NotReady, "no probe instance available");
    }
    await_reply(name, rx, control).await
}

/// Sends one probe command to a concrete instance and awaits the reply.
pub(crate) async fn query_instance(
    instance: &Arc<crate::core::instance::Instance>,
    args: CmdArgs,
    control: &CommandControl,
) -> Reply {
    let name = args.command_name();
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    let cmd = Command::new(
        args,
        control.clone(),
        true,
        Box::new(move |reply| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(reply);
            }
        }),
    );
    if !instance.send_command(cmd) {
        return Reply::status_only(name, ReplyStatus::NotReady, "instance is not connected");
    }
    await_reply(name, rx, control).await
}

async fn await_reply(
    name: String,
    rx: oneshot::Receiver<Reply>,
    control: &CommandControl,
) -> Reply {
    // The connection task already enforces the per-command timer; the grace
    // here only covers a task that died without answering.
    let grace = control.timeout_single() + Duration::from_secs(1);
    match tokio::time::timeout(grace, rx).await {
        Ok(Ok(reply)) => reply,
        _ => Reply::status_only(name, ReplyStatus::Timeout, "probe reply dropped"),
    }
}
