// src/client/mod.rs

//! The user-facing client: construction for sentinel and cluster modes,
//! command submission, pub/sub subscriptions, runtime settings and the
//! cluster-to-sentinel fallback switcher.

use crate::config::{
    ClientConfig, ClientMode, CommandsBufferingSettings, KeyShardKind,
    ReplicationMonitoringSettings,
};
use crate::core::CrimsonError;
use crate::core::command::{CmdArgs, CommandControl};
use crate::core::dispatcher::{Dispatcher, Target};
use crate::core::instance::InstanceCreationSettings;
use crate::core::keyshard::{KeyShard, KeyShardCrc32, KeyShardZero, KeysForShards};
use crate::core::request::RequestFuture;
use crate::core::stats::{ClientStatsSnapshot, SharedClientStats};
use crate::core::subscription::{
    MessageCallback, PmessageCallback, ServerWeights, SubscriptionStorage,
};
use crate::core::topology::cluster::ClusterTopologyHolder;
use crate::core::topology::sentinel::SentinelTopologyHolder;
use crate::core::topology::{ConnectedMode, HolderSettings, TopologyHolder, wait_connected_once};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

pub use crate::core::subscription::SubscriptionToken;

/// Builder for [`Client`]. Thin sugar over [`ClientConfig`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn sentinel() -> Self {
        let mut builder = Self::default();
        builder.config.mode = ClientMode::Sentinel;
        builder
    }

    pub fn cluster() -> Self {
        let mut builder = Self::default();
        builder.config.mode = ClientMode::Cluster;
        builder
    }

    pub fn seed(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config
            .seeds
            .push(crate::core::types::ConnectionInfo::new(host, port));
        self
    }

    pub fn shard(mut self, name: impl Into<String>) -> Self {
        self.config.shards.push(name.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut ClientConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> Result<Client, CrimsonError> {
        Client::new(self.config)
    }
}

/// An async Redis client for Sentinel-managed and Cluster deployments.
///
/// Must be created inside a tokio runtime: topology discovery, connections
/// and timers run as spawned tasks.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    dispatcher: Dispatcher,
    storage: SubscriptionStorage,
    stats: SharedClientStats,
    cluster_auto_topology: AtomicBool,
    stopped: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Client, CrimsonError> {
        if config.seeds.is_empty() {
            return Err(CrimsonError::InvalidConfig("no seed addresses".into()));
        }
        if config.mode == ClientMode::Sentinel && config.shards.is_empty() {
            return Err(CrimsonError::InvalidConfig(
                "sentinel mode requires shard names".into(),
            ));
        }

        let stats: SharedClientStats = Default::default();
        let holder_settings = holder_settings(&config, stats.clone());

        let mut cluster_holder = None;
        let (holder, key_shard): (Arc<dyn TopologyHolder>, Option<Arc<dyn KeyShard>>) =
            match config.mode {
                ClientMode::Sentinel => {
                    let holder = SentinelTopologyHolder::new(
                        config.seeds.clone(),
                        config.shards.clone(),
                        holder_settings,
                    );
                    holder.start();
                    let key_shard = make_key_shard(config.key_shard, config.shards.len());
                    (holder as Arc<dyn TopologyHolder>, Some(key_shard))
                }
                ClientMode::Cluster => {
                    let holder = ClusterTopologyHolder::new(config.seeds.clone(), holder_settings);
                    holder.start();
                    cluster_holder = Some(holder.clone());
                    (holder as Arc<dyn TopologyHolder>, None)
                }
            };

        let dispatcher = Dispatcher::new(
            holder.clone(),
            key_shard,
            config.default_command_control.clone(),
            stats.clone(),
        );
        dispatcher.start(config.timings.waiting_commands_interval);

        let initial_shards = match config.mode {
            ClientMode::Sentinel => config.shards.len(),
            ClientMode::Cluster => 0,
        };
        let storage = SubscriptionStorage::new(
            initial_shards,
            config.mode == ClientMode::Cluster,
            config.timings.rebalance_min_interval,
        );

        let inner = Arc::new(ClientInner {
            cluster_auto_topology: AtomicBool::new(config.cluster_auto_topology),
            config,
            dispatcher,
            storage,
            stats,
            stopped: AtomicBool::new(false),
        });
        inner.wire_subscription_sinks();
        inner.clone().spawn_topology_follower();
        if let Some(cluster_holder) = cluster_holder {
            inner.clone().spawn_mode_switcher(cluster_holder);
        }

        Ok(Client { inner })
    }

    /// Submits a command routed by key. `master` directs writes to the
    /// master pool; reads go to the replica pool with master fallback.
    pub fn request(
        &self,
        args: CmdArgs,
        key: impl Into<Bytes>,
        master: bool,
        control: Option<CommandControl>,
    ) -> RequestFuture {
        self.inner
            .dispatcher
            .request(args, Target::Key(key.into()), master, control)
    }

    /// Submits a command to an explicit shard.
    pub fn request_to_shard(
        &self,
        args: CmdArgs,
        shard_idx: usize,
        master: bool,
        control: Option<CommandControl>,
    ) -> RequestFuture {
        self.inner
            .dispatcher
            .request(args, Target::Shard(shard_idx), master, control)
    }

    /// Submits a pipelined (or `EXEC`-terminated) argument list to a single
    /// shard decided by the given keys; fails on cross-shard keys.
    pub fn request_same_shard<'a, I>(
        &self,
        args: CmdArgs,
        keys: I,
        master: bool,
        control: Option<CommandControl>,
    ) -> Result<RequestFuture, CrimsonError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let shard_idx = self.inner.dispatcher.shard_for_keys(keys)?;
        Ok(self.request_to_shard(args, shard_idx, master, control))
    }

    pub fn shard_by_key(&self, key: &[u8]) -> Option<usize> {
        self.inner.dispatcher.shard_by_key(key)
    }

    pub fn shards_count(&self) -> usize {
        self.inner.dispatcher.shards_count()
    }

    /// Minimum-length keys that land in each shard, for commands that need
    /// a concrete key argument when the caller only has a shard index.
    pub fn keys_for_shards(&self, max_len: usize) -> Result<KeysForShards, CrimsonError> {
        let count = self.shards_count();
        if count == 0 {
            return Err(CrimsonError::Internal("topology not received yet".into()));
        }
        let dispatcher = &self.inner.dispatcher;
        KeysForShards::generate(
            count,
            |key| dispatcher.shard_by_key(key.as_bytes()).unwrap_or(0),
            max_len,
        )
    }

    /// Subscribes to a channel. The returned token unsubscribes on drop.
    pub fn subscribe(&self, channel: &str, callback: MessageCallback) -> SubscriptionToken {
        self.inner.storage.subscribe(channel, callback)
    }

    pub fn subscribe_with_control(
        &self,
        channel: &str,
        callback: MessageCallback,
        control: CommandControl,
    ) -> SubscriptionToken {
        self.inner
            .storage
            .subscribe_with_control(channel, callback, control)
    }

    /// Subscribes to a glob-style pattern.
    pub fn psubscribe(&self, pattern: &str, callback: PmessageCallback) -> SubscriptionToken {
        self.inner.storage.psubscribe(pattern, callback)
    }

    pub fn psubscribe_with_control(
        &self,
        pattern: &str,
        callback: PmessageCallback,
        control: CommandControl,
    ) -> SubscriptionToken {
        self.inner
            .storage
            .psubscribe_with_control(pattern, callback, control)
    }

    /// Requests a weighted rebalance of one shard's subscriptions.
    pub fn request_subscription_rebalance(&self, shard_idx: usize, weights: ServerWeights) {
        self.inner.storage.request_rebalance(shard_idx, weights);
    }

    /// Blocks until a topology is received and every shard satisfies `mode`.
    /// The holder is re-read every poll so a mode switch mid-wait is
    /// followed.
    pub async fn wait_connected_once(
        &self,
        mode: ConnectedMode,
        timeout: Duration,
        throw_on_fail: bool,
    ) -> Result<(), CrimsonError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let holder = self.inner.dispatcher.topology_holder();
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if wait_connected_once(holder.as_ref(), mode, remaining.min(Duration::from_millis(200)), true)
                .await
                .is_ok()
            {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                let text = format!("{mode:?} not reached in {timeout:?}");
                if throw_on_fail {
                    return Err(CrimsonError::WaitConnectedTimeout(text));
                }
                warn!(mode = ?mode, "wait_connected_once timed out");
                return Ok(());
            }
        }
    }

    pub fn set_commands_buffering_settings(&self, settings: CommandsBufferingSettings) {
        self.inner
            .dispatcher
            .topology_holder()
            .set_commands_buffering_settings(settings);
    }

    pub fn set_replication_monitoring_settings(&self, settings: ReplicationMonitoringSettings) {
        self.inner
            .dispatcher
            .topology_holder()
            .set_replication_monitoring_settings(settings);
    }

    pub fn set_rebalance_min_interval(&self, interval: Duration) {
        self.inner.storage.set_rebalance_min_interval(interval);
    }

    pub fn set_cluster_auto_topology(&self, enabled: bool) {
        self.inner
            .cluster_auto_topology
            .store(enabled, Ordering::Relaxed);
    }

    pub fn set_config_default_command_control(&self, control: CommandControl) {
        self.inner
            .dispatcher
            .set_config_default_command_control(control.clone());
        self.inner.storage.set_command_control(control);
    }

    /// Full statistics snapshot.
    pub fn statistics(&self) -> ClientStatsSnapshot {
        let topology = self.inner.dispatcher.topology_holder().topology();
        let mut snapshot = ClientStatsSnapshot {
            cluster_slots_updates: self
                .inner
                .stats
                .topology
                .cluster_slots_updates
                .load(Ordering::Relaxed),
            not_ready: self
                .inner
                .stats
                .dispatcher
                .not_ready
                .load(Ordering::Relaxed),
            ..Default::default()
        };
        for (idx, shard) in topology.shards.iter().enumerate() {
            snapshot.by_shard.push(shard.stats().snapshot());
            for (server, _) in shard.available_servers() {
                if let Some(instance) = shard.instance_by_id(server) {
                    snapshot
                        .by_instance
                        .insert(instance.host_port(), instance.stats().snapshot());
                }
            }
            snapshot
                .pubsub_by_shard
                .push(self.inner.storage.shard_statistics(idx));
        }
        snapshot
    }

    /// Stops the client: fails parked commands, tears down discovery and
    /// connections, drops subscriptions. Further submissions fail with
    /// NotReady.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping client");
        self.inner.dispatcher.stop();
        self.inner.dispatcher.topology_holder().stop();
        self.inner.storage.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.dispatcher.stop();
        self.dispatcher.topology_holder().stop();
        self.storage.stop();
    }
}

impl ClientInner {
    /// Routes subscribe/unsubscribe commands from the storage into the
    /// dispatcher.
    fn wire_subscription_sinks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.storage.set_subscribe_sink(Box::new(move |shard, cmd| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatcher.send_command(cmd, Target::Shard(shard), false);
            }
        }));
        let weak = Arc::downgrade(self);
        self.storage
            .set_unsubscribe_sink(Box::new(move |shard, cmd| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatcher.send_command(cmd, Target::Shard(shard), false);
                }
            }));
    }

    /// Follows topology versions: keeps the storage's shard count in sync
    /// and re-arms the per-shard rebalance triggers for each new snapshot.
    fn spawn_topology_follower(self: Arc<Self>) {
        tokio::spawn(async move {
            let (generation_tx, _) = tokio::sync::watch::channel(0u64);
            let mut generation = 0u64;
            loop {
                if self.stopped.load(Ordering::Acquire) {
                    return;
                }
                let holder = self.dispatcher.topology_holder();
                let topology = holder.topology();
                self.storage.set_shards_count(topology.shards_count());

                // One watcher per shard, cancelled when the next snapshot
                // arrives.
                generation += 1;
                generation_tx.send_replace(generation);
                for (shard_idx, shard) in topology.shards.iter().enumerate() {
                    let weak = Arc::downgrade(&self);
                    let shard = shard.clone();
                    let mut cancel = generation_tx.subscribe();
                    let my_generation = generation;
                    tokio::spawn(async move {
                        let mut epoch_rx = shard.instances_epoch_watch();
                        loop {
                            tokio::select! {
                                changed = epoch_rx.changed() => {
                                    if changed.is_err() {
                                        return;
                                    }
                                }
                                _ = cancel.changed() => {
                                    if *cancel.borrow() != my_generation {
                                        return;
                                    }
                                    continue;
                                }
                            }
                            let Some(inner) = weak.upgrade() else { return };
                            if inner.stopped.load(Ordering::Acquire) {
                                return;
                            }
                            inner.rebalance_shard_subscriptions(shard_idx, &shard);
                        }
                    });
                }

                let mut version_rx = holder.version_watch();
                tokio::select! {
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            // Holder swapped; re-subscribe to the new one.
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                    // Fallback poll in case a swap happened while the old
                    // holder was still publishing.
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
            }
        });
    }

    /// Equal-weight rebalance trigger on instance-set changes; callers can
    /// issue weighted requests through the client API.
    fn rebalance_shard_subscriptions(&self, shard_idx: usize, shard: &Arc<crate::core::shard::Shard>) {
        let weights: ServerWeights = shard
            .available_servers()
            .into_iter()
            .map(|(server, _)| (server, 1))
            .collect();
        if weights.is_empty() {
            return;
        }
        self.storage.request_rebalance(shard_idx, weights);
    }

    /// Watches the cluster holder's non-cluster signal and falls back to
    /// sentinel mode, keeping subscription tokens alive.
    fn spawn_mode_switcher(self: Arc<Self>, cluster_holder: Arc<ClusterTopologyHolder>) {
        tokio::spawn(async move {
            let mut non_cluster_rx = cluster_holder.non_cluster_watch();
            loop {
                if non_cluster_rx.changed().await.is_err() {
                    return;
                }
                if !*non_cluster_rx.borrow() {
                    continue;
                }
                if !self.cluster_auto_topology.load(Ordering::Relaxed) {
                    warn!("non-cluster signal received but auto topology is disabled");
                    continue;
                }
                if self.config.shards.is_empty() {
                    warn!("non-cluster signal received but no sentinel shard names configured");
                    return;
                }
                info!("non-cluster signal received; switching to sentinel mode");

                // Probe settings follow sentinel-mode conventions from here
                // on (sentinels are unauthenticated).
                let mut sentinel_config = self.config.clone();
                sentinel_config.mode = ClientMode::Sentinel;
                let settings = holder_settings(&sentinel_config, self.stats.clone());
                let sentinel = SentinelTopologyHolder::new(
                    sentinel_config.seeds.clone(),
                    sentinel_config.shards.clone(),
                    settings,
                );
                sentinel.start();
                let key_shard =
                    make_key_shard(self.config.key_shard, self.config.shards.len());
                let old = self
                    .dispatcher
                    .swap_holder(sentinel, Some(key_shard));
                old.stop();

                self.storage.set_shards_count(self.config.shards.len());
                self.storage.switch_to_non_cluster_mode();
                return;
            }
        });
    }
}

fn make_key_shard(kind: KeyShardKind, shards_count: usize) -> Arc<dyn KeyShard> {
    match kind {
        KeyShardKind::Crc32 => Arc::new(KeyShardCrc32::new(shards_count.max(1))),
        KeyShardKind::Zero => Arc::new(KeyShardZero),
    }
}

fn holder_settings(config: &ClientConfig, stats: SharedClientStats) -> HolderSettings {
    let data_instance = InstanceCreationSettings {
        send_readonly: false,
        password: config.password.clone(),
        connect_timeout: config.timings.connect_timeout,
        ping_interval: config.timings.ping_interval,
        ping_timeout: config.timings.ping_timeout,
        buffering: config.commands_buffering,
        monitoring: config.replication_monitoring,
    };
    let probe_instance = InstanceCreationSettings {
        send_readonly: false,
        // Sentinels are unauthenticated; cluster seeds share the data
        // password.
        password: match config.mode {
            ClientMode::Sentinel => None,
            ClientMode::Cluster => config.password.clone(),
        },
        connect_timeout: config.timings.connect_timeout,
        ping_interval: config.timings.ping_interval,
        ping_timeout: config.timings.ping_timeout,
        buffering: CommandsBufferingSettings::default(),
        monitoring: ReplicationMonitoringSettings::default(),
    };
    HolderSettings {
        data_instance,
        probe_instance,
        probe_control: CommandControl {
            timeout_single: Some(Duration::from_millis(500)),
            timeout_all: Some(Duration::from_millis(2000)),
            max_retries: Some(1),
            ..Default::default()
        },
        timings: config.timings,
        local_dc: config.local_datacenter.clone(),
        stats,
    }
}
