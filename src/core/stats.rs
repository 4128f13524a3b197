// src/core/stats.rs

//! Statistics counters exported by the client.
//!
//! Counters are plain relaxed atomics bumped on the hot paths; snapshots are
//! assembled on demand by walking the current topology.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-instance counters, owned by the connection task's handle.
#[derive(Debug, Default)]
pub struct InstanceStats {
    pub sent: AtomicU64,
    pub completed: AtomicU64,
    pub timeouts: AtomicU64,
    pub reconnects: AtomicU64,
    /// Last measured PING round-trip, microseconds.
    pub ping_latency_us: AtomicU64,
}

impl InstanceStats {
    pub fn snapshot(&self) -> InstanceStatsSnapshot {
        InstanceStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            ping_latency_us: self.ping_latency_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceStatsSnapshot {
    pub sent: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub reconnects: u64,
    pub ping_latency_us: u64,
}

/// Per-shard command counters, owned by each [`Shard`](crate::core::shard::Shard).
#[derive(Debug, Default)]
pub struct ShardStats {
    pub sent: AtomicU64,
    pub completed: AtomicU64,
    pub timeouts: AtomicU64,
    pub retries: AtomicU64,
}

impl ShardStats {
    pub fn snapshot(&self) -> ShardStatsSnapshot {
        ShardStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardStatsSnapshot {
    pub sent: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub retries: u64,
}

/// Dispatcher-level counters not attributable to a single shard.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Commands completed with NotReady (queue overflow, stop, no instance).
    pub not_ready: AtomicU64,
    /// Commands parked in the waiting queue at least once.
    pub queued: AtomicU64,
}

/// Counters for the topology holders.
#[derive(Debug, Default)]
pub struct TopologyStats {
    pub cluster_slots_updates: AtomicU64,
    pub topology_versions: AtomicU64,
}

/// Message counters for one (channel, shard) subscription slot.
#[derive(Debug, Default)]
pub struct ChannelShardStats {
    pub messages: AtomicU64,
    pub message_bytes: AtomicU64,
    /// Messages delivered by a server other than the FSM's current one.
    pub alien_messages: AtomicU64,
}

impl ChannelShardStats {
    pub fn account_message(&self, bytes: usize) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.message_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn account_alien_message(&self) {
        self.alien_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelShardStatsSnapshot {
        ChannelShardStatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            message_bytes: self.message_bytes.load(Ordering::Relaxed),
            alien_messages: self.alien_messages.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelShardStatsSnapshot {
    pub messages: u64,
    pub message_bytes: u64,
    pub alien_messages: u64,
}

/// Pub/sub statistics for one shard: per-channel counters plus the number of
/// subscriptions held on each host.
#[derive(Debug, Clone, Default)]
pub struct PubsubShardStatsSnapshot {
    pub by_channel: HashMap<String, ChannelShardStatsSnapshot>,
    pub subscriptions_by_host: HashMap<String, u64>,
}

/// Full client statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClientStatsSnapshot {
    pub by_shard: Vec<ShardStatsSnapshot>,
    pub by_instance: HashMap<String, InstanceStatsSnapshot>,
    pub pubsub_by_shard: Vec<PubsubShardStatsSnapshot>,
    pub cluster_slots_updates: u64,
    pub not_ready: u64,
}

/// Shared counter bundle wired through the dispatcher and holders.
#[derive(Debug, Default)]
pub struct ClientStats {
    pub dispatcher: DispatcherStats,
    pub topology: TopologyStats,
}

pub type SharedClientStats = Arc<ClientStats>;
