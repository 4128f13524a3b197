// src/core/topology/cluster.rs

//! Cluster-mode topology discovery: `CLUSTER NODES` exploration feeding the
//! nodes storage, plus quorum-gated `CLUSTER SLOTS` snapshots.

use super::nodes::NodesStorage;
use super::parse::{ClusterShardInfos, parse_cluster_nodes, parse_cluster_slots};
use super::{HolderSettings, RedirectTarget, Topology, TopologyHolder, query_instance, query_shard};
use crate::config::{CommandsBufferingSettings, ReplicationMonitoringSettings};
use crate::core::command::CmdArgs;
use crate::core::instance::InstanceCreationSettings;
use crate::core::keyshard::NUM_SLOTS;
use crate::core::shard::{DesiredInstance, Shard, ShardEntry};
use crate::core::types::{ConnectionInfo, ServerId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

pub struct ClusterTopologyHolder {
    /// Seed pool used for `CLUSTER NODES` exploration.
    probe_shard: Arc<Shard>,
    nodes: NodesStorage,
    data_settings: InstanceCreationSettings,
    topology: RwLock<Arc<Topology>>,
    /// Last installed shard infos, for the identical-update skip.
    current_infos: Mutex<ClusterShardInfos>,
    /// Host:ports seen in the latest `CLUSTER NODES` response.
    last_explored: Mutex<BTreeSet<String>>,
    version: AtomicU64,
    version_tx: watch::Sender<u64>,
    received: AtomicBool,
    nodes_received: AtomicBool,
    /// Collapses concurrent update requests.
    update_in_progress: AtomicBool,
    update_notify: Arc<Notify>,
    /// Raised when the deployment answers "not a cluster"; the client falls
    /// back to sentinel mode.
    non_cluster_tx: watch::Sender<bool>,
    stopped_tx: watch::Sender<bool>,
    settings: HolderSettings,
}

impl ClusterTopologyHolder {
    pub fn new(seeds: Vec<ConnectionInfo>, settings: HolderSettings) -> Arc<Self> {
        let probe_shard = Shard::new(
            "(cluster-seeds)",
            false,
            settings.probe_instance.clone(),
            settings.local_dc.clone(),
        );
        probe_shard.set_connection_info(
            seeds
                .into_iter()
                .map(|info| DesiredInstance {
                    info,
                    is_master: false,
                })
                .collect(),
        );

        // Cluster data connections allow reads from possibly stale replicas.
        let mut data_settings = settings.data_instance.clone();
        data_settings.send_readonly = true;

        let (version_tx, _) = watch::channel(0);
        let (non_cluster_tx, _) = watch::channel(false);
        let (stopped_tx, _) = watch::channel(false);

        Arc::new(Self {
            probe_shard,
            nodes: NodesStorage::new(),
            data_settings,
            topology: RwLock::new(Topology::empty()),
            current_infos: Mutex::new(Vec::new()),
            last_explored: Mutex::new(BTreeSet::new()),
            version: AtomicU64::new(0),
            version_tx,
            received: AtomicBool::new(false),
            nodes_received: AtomicBool::new(false),
            update_in_progress: AtomicBool::new(false),
            update_notify: Arc::new(Notify::new()),
            non_cluster_tx,
            stopped_tx,
            settings,
        })
    }

    /// Spawns the explore-nodes and update-slots tasks.
    pub fn start(self: &Arc<Self>) {
        self.probe_shard.process_creation();

        let holder = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(holder.settings.timings.explore_nodes_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stopped = holder.stopped_tx.subscribe();
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = stopped.changed() => return,
                }
                if *holder.stopped_tx.borrow() {
                    return;
                }
                holder.explore_nodes().await;
            }
        });

        let holder = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(holder.settings.timings.topology_poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stopped = holder.stopped_tx.subscribe();
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = holder.update_notify.notified() => {}
                    _ = stopped.changed() => return,
                }
                if *holder.stopped_tx.borrow() {
                    return;
                }
                holder.update_slots().await;
            }
        });
    }

    /// Watch raised on the "not a cluster" signal.
    pub fn non_cluster_watch(&self) -> watch::Receiver<bool> {
        self.non_cluster_tx.subscribe()
    }

    /// `CLUSTER NODES` against the seed pool: creates instances for newly
    /// observed nodes; the first full reception arms the slot update.
    async fn explore_nodes(&self) {
        self.probe_shard.process_creation();

        let reply = query_shard(
            &self.probe_shard,
            CmdArgs::new("CLUSTER").arg("NODES"),
            &self.settings.probe_control,
        )
        .await;
        if !reply.is_ok() {
            debug!(status = ?reply.status, "CLUSTER NODES query failed");
            return;
        }
        if reply.data.is_non_cluster_error() {
            warn!("deployment is not a cluster; raising the non-cluster signal");
            self.non_cluster_tx.send_replace(true);
            return;
        }
        let Some(host_ports) = parse_cluster_nodes(&reply.data) else {
            warn!("failed to parse CLUSTER NODES response");
            return;
        };

        let mut got_new_node = false;
        for host_port in &host_ports {
            if let Some(existing) = self.nodes.get(host_port) {
                if existing.is_available()
                    || existing.state() == crate::core::instance::InstanceState::Init
                {
                    continue;
                }
                // Dead entry: drop it so a fresh connection is attempted.
                self.nodes.remove(host_port);
            }
            if self
                .nodes
                .get_or_create(host_port, &self.data_settings)
                .is_some()
            {
                got_new_node = true;
            }
        }
        *self.last_explored.lock() = host_ports;

        if got_new_node {
            debug!(total = self.nodes.len(), "got new cluster nodes");
        }
        if !self.nodes_received.swap(true, Ordering::AcqRel) {
            self.update_notify.notify_one();
        }
    }

    /// `CLUSTER SLOTS` fan-out with quorum aggregation, installing a new
    /// copy-on-write snapshot when the shard infos changed.
    async fn update_slots(&self) {
        if !self.nodes_received.load(Ordering::Acquire) {
            debug!("skip updating cluster topology: no nodes yet");
            return;
        }
        if self.update_in_progress.swap(true, Ordering::AcqRel) {
            return;
        }
        let result = self.update_slots_inner().await;
        self.update_in_progress.store(false, Ordering::Release);
        if result {
            self.settings
                .stats
                .topology
                .cluster_slots_updates
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn update_slots_inner(&self) -> bool {
        let instances = self.nodes.available_instances();
        if instances.is_empty() {
            debug!("no connected cluster nodes to query for slots");
            return false;
        }

        let requests_sent = instances.len();
        let replies = futures::future::join_all(instances.iter().map(|instance| {
            query_instance(
                instance,
                CmdArgs::new("CLUSTER").arg("SLOTS"),
                &self.settings.probe_control,
            )
        }))
        .await;

        let mut parsed: Vec<ClusterShardInfos> = Vec::new();
        for reply in &replies {
            if reply.data.is_non_cluster_error() {
                warn!("deployment is not a cluster; raising the non-cluster signal");
                self.non_cluster_tx.send_replace(true);
                return true;
            }
            if !reply.is_ok() {
                continue;
            }
            match parse_cluster_slots(&reply.data) {
                Some(infos) => parsed.push(infos),
                None => warn!(server_id = %reply.server_id, "dropping malformed CLUSTER SLOTS response"),
            }
        }

        let quorum = requests_sent / 2 + 1;
        if parsed.len() < quorum {
            warn!(
                requests_sent,
                responses_parsed = parsed.len(),
                "too many CLUSTER SLOTS requests failed"
            );
            return false;
        }

        // Nodes may answer from slightly different epochs; install the view
        // the majority of them agree on.
        let mut counts: Vec<(ClusterShardInfos, usize)> = Vec::new();
        for infos in parsed {
            match counts.iter_mut().find(|(known, _)| *known == infos) {
                Some((_, count)) => *count += 1,
                None => counts.push((infos, 1)),
            }
        }
        counts.sort_by_key(|(_, count)| std::cmp::Reverse(*count));
        let (chosen, _) = counts.into_iter().next().expect("quorum implies non-empty");

        if *self.current_infos.lock() == chosen {
            return true;
        }
        self.install(chosen);
        true
    }

    fn install(&self, infos: ClusterShardInfos) {
        let mut shards = Vec::with_capacity(infos.len());
        let mut host_port_to_shard = HashMap::new();
        let mut slots = vec![0u16; NUM_SLOTS].into_boxed_slice();

        for (idx, info) in infos.iter().enumerate() {
            let mut entries = Vec::new();
            if let Some(master) = self.nodes.get_or_create(&info.master, &self.data_settings) {
                entries.push(ShardEntry {
                    instance: master,
                    is_master: true,
                });
            }
            host_port_to_shard.insert(info.master.clone(), idx);
            for replica in &info.replicas {
                if let Some(instance) = self.nodes.get_or_create(replica, &self.data_settings) {
                    entries.push(ShardEntry {
                        instance,
                        is_master: false,
                    });
                }
                host_port_to_shard.insert(replica.clone(), idx);
            }
            for &(slot_min, slot_max) in &info.slot_ranges {
                for slot in slot_min..=slot_max {
                    slots[usize::from(slot)] = idx as u16;
                }
            }
            shards.push(Shard::for_cluster(
                format!("shard{idx}"),
                entries,
                self.data_settings.clone(),
                self.settings.local_dc.clone(),
            ));
        }

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let topology = Topology::new(version, shards, Some(slots), host_port_to_shard);
        {
            let old = std::mem::replace(&mut *self.topology.write(), topology);
            // Retired shard objects stop watching; their instances stay alive
            // in the nodes storage for the new snapshot to reuse.
            drop(old);
        }
        *self.current_infos.lock() = infos;
        self.received.store(true, Ordering::Release);
        self.version_tx.send_replace(version);
        self.settings
            .stats
            .topology
            .topology_versions
            .fetch_add(1, Ordering::Relaxed);
        info!(version, shards = self.topology().shards_count(), "cluster topology updated");

        // Lazy cleanup: drop nodes referenced neither by the new topology
        // nor by the latest exploration.
        let mut referenced: HashSet<String> = self
            .current_infos
            .lock()
            .iter()
            .flat_map(|info| {
                std::iter::once(info.master.clone()).chain(info.replicas.iter().cloned())
            })
            .collect();
        referenced.extend(self.last_explored.lock().iter().cloned());
        self.nodes.retain_referenced(&referenced);
    }
}

impl TopologyHolder for ClusterTopologyHolder {
    fn topology(&self) -> Arc<Topology> {
        self.topology.read().clone()
    }

    fn topology_received(&self) -> bool {
        self.received.load(Ordering::Acquire)
    }

    fn version_watch(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    fn request_topology_update(&self) {
        self.update_notify.notify_one();
    }

    fn redirect_target(&self, host_port: &str) -> RedirectTarget {
        let shard_idx = self.topology().shard_by_host_port(host_port);
        // A MOVED may point at a node we have never seen; connect to it
        // eagerly so the retry (or the next one) can land there.
        let server_id: Option<ServerId> = self
            .nodes
            .get_or_create(host_port, &self.data_settings)
            .filter(|i| i.is_available())
            .map(|i| i.id());
        RedirectTarget {
            shard_idx,
            server_id,
        }
    }

    fn is_cluster(&self) -> bool {
        true
    }

    fn set_commands_buffering_settings(&self, settings: CommandsBufferingSettings) {
        for shard in &self.topology().shards {
            shard.set_commands_buffering_settings(settings);
        }
    }

    fn set_replication_monitoring_settings(&self, settings: ReplicationMonitoringSettings) {
        for shard in &self.topology().shards {
            shard.set_replication_monitoring_settings(settings);
        }
    }

    fn stop(&self) {
        self.stopped_tx.send_replace(true);
        for shard in &self.topology().shards {
            shard.clean();
        }
        self.probe_shard.clean();
        self.nodes.clear();
    }
}
