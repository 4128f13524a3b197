// src/config.rs

//! Client configuration: connection seeds, mode selection, timings and
//! runtime-adjustable settings.

use crate::core::command::CommandControl;
use crate::core::types::ConnectionInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which topology discovery mode the client starts in.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMode {
    /// Shards are discovered through `SENTINEL MASTERS` / `SENTINEL SLAVES`.
    #[default]
    Sentinel,
    /// Shards are discovered through `CLUSTER NODES` / `CLUSTER SLOTS`.
    Cluster,
}

/// Which key shard function routes keys in sentinel mode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum KeyShardKind {
    #[default]
    Crc32,
    /// Route everything to shard 0 (single-shard deployments).
    Zero,
}

/// Nagle-like grouping of outbound commands, adjustable at runtime.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandsBufferingSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Flush once this many bytes are pending.
    #[serde(default = "default_buffer_size_threshold")]
    pub buffer_size_threshold: usize,
    /// Flush at the latest after this delay.
    #[serde(default = "default_buffering_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CommandsBufferingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            buffer_size_threshold: default_buffer_size_threshold(),
            timeout: default_buffering_timeout(),
        }
    }
}

/// Replica monitoring knobs carried by every instance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplicationMonitoringSettings {
    /// Track replica sync state via INFO polling.
    #[serde(default)]
    pub enable_monitoring: bool,
    /// Exclude syncing replicas from the read pool.
    #[serde(default)]
    pub restrict_requests: bool,
}

/// Periodic timer intervals. Defaults follow the reference deployment.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Sentinel topology poll / cluster slots refresh period.
    #[serde(default = "default_topology_poll_interval", with = "humantime_serde")]
    pub topology_poll_interval: Duration,
    /// `CLUSTER NODES` exploration period.
    #[serde(default = "default_explore_nodes_interval", with = "humantime_serde")]
    pub explore_nodes_interval: Duration,
    /// Waiting-commands queue retry tick.
    #[serde(default = "default_waiting_commands_interval", with = "humantime_serde")]
    pub waiting_commands_interval: Duration,
    /// Inactivity PING period per connection.
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Timeout for one inactivity PING.
    #[serde(default = "default_ping_timeout", with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Timeout for establishing one TCP connection.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Minimum pause between two rebalances of one shard.
    #[serde(default = "default_rebalance_min_interval", with = "humantime_serde")]
    pub rebalance_min_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            topology_poll_interval: default_topology_poll_interval(),
            explore_nodes_interval: default_explore_nodes_interval(),
            waiting_commands_interval: default_waiting_commands_interval(),
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
            connect_timeout: default_connect_timeout(),
            rebalance_min_interval: default_rebalance_min_interval(),
        }
    }
}

/// Top-level client configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClientConfig {
    #[serde(default)]
    pub mode: ClientMode,
    /// Sentinel addresses (sentinel mode) or cluster seed nodes (cluster mode).
    pub seeds: Vec<ConnectionInfo>,
    /// Shard (master) names tracked in sentinel mode.
    #[serde(default)]
    pub shards: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Datacenter tag of the caller, for the locality-aware strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_datacenter: Option<String>,
    #[serde(default)]
    pub key_shard: KeyShardKind,
    /// Defaults merged into every command's control.
    #[serde(default)]
    pub default_command_control: CommandControl,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default)]
    pub commands_buffering: CommandsBufferingSettings,
    #[serde(default)]
    pub replication_monitoring: ReplicationMonitoringSettings,
    /// Automatically fall back to sentinel mode on the non-cluster signal.
    #[serde(default = "default_cluster_auto_topology")]
    pub cluster_auto_topology: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mode: ClientMode::default(),
            seeds: Vec::new(),
            shards: Vec::new(),
            password: None,
            local_datacenter: None,
            key_shard: KeyShardKind::default(),
            default_command_control: CommandControl::default(),
            timings: Timings::default(),
            commands_buffering: CommandsBufferingSettings::default(),
            replication_monitoring: ReplicationMonitoringSettings::default(),
            cluster_auto_topology: default_cluster_auto_topology(),
        }
    }
}

fn default_buffer_size_threshold() -> usize {
    8 * 1024
}
fn default_buffering_timeout() -> Duration {
    Duration::from_millis(5)
}
fn default_topology_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_explore_nodes_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_waiting_commands_interval() -> Duration {
    Duration::from_secs(3)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_ping_timeout() -> Duration {
    Duration::from_secs(4)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_rebalance_min_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_cluster_auto_topology() -> bool {
    true
}
