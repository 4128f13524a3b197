// src/core/topology/sentinel.rs

//! Sentinel-mode topology discovery: periodic `SENTINEL MASTERS` plus
//! per-shard `SENTINEL SLAVES`, filtered and applied to a fixed shard set.

use super::parse::{SentinelInstance, parse_sentinel_instances};
use super::{HolderSettings, RedirectTarget, Topology, TopologyHolder, query_shard};
use crate::config::{CommandsBufferingSettings, ReplicationMonitoringSettings};
use crate::core::command::CmdArgs;
use crate::core::shard::{DesiredInstance, Shard};
use crate::core::types::ConnectionInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

pub struct SentinelTopologyHolder {
    /// Pool of sentinel connections used for discovery queries.
    probe_shard: Arc<Shard>,
    /// Data shards, one per configured shard name, fixed for the lifetime.
    shards: Vec<Arc<Shard>>,
    shard_names: HashMap<String, usize>,
    topology: RwLock<Arc<Topology>>,
    version: AtomicU64,
    version_tx: watch::Sender<u64>,
    received: AtomicBool,
    update_notify: Arc<Notify>,
    stopped_tx: watch::Sender<bool>,
    settings: HolderSettings,
}

impl SentinelTopologyHolder {
    pub fn new(
        seeds: Vec<ConnectionInfo>,
        shard_names: Vec<String>,
        settings: HolderSettings,
    ) -> Arc<Self> {
        let probe_shard = Shard::new(
            "(sentinels)",
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

        let shards: Vec<Arc<Shard>> = shard_names
            .iter()
            .map(|name| {
                Shard::new(
                    name.clone(),
                    false,
                    settings.data_instance.clone(),
                    settings.local_dc.clone(),
                )
            })
            .collect();
        let shard_names = shard_names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name, idx))
            .collect();

        let (version_tx, _) = watch::channel(0);
        let (stopped_tx, _) = watch::channel(false);
        let topology = Topology::new(0, shards.clone(), None, HashMap::new());

        Arc::new(Self {
            probe_shard,
            shards,
            shard_names,
            topology: RwLock::new(topology),
            version: AtomicU64::new(0),
            version_tx,
            received: AtomicBool::new(false),
            update_notify: Arc::new(Notify::new()),
            stopped_tx,
            settings,
        })
    }

    /// Spawns the periodic refresh task.
    pub fn start(self: &Arc<Self>) {
        self.probe_shard.process_creation();
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
                holder.refresh_once().await;
            }
        });
    }

    async fn refresh_once(&self) {
        self.probe_shard.process_creation();

        let masters = self.query_masters().await;
        let Some(masters) = masters else {
            // Keep driving reconnects even when discovery is unavailable.
            for shard in &self.shards {
                shard.process_creation();
            }
            return;
        };

        // Fetch replicas for every tracked master concurrently.
        let slave_queries = masters.iter().map(|master| {
            let name = master.name.clone();
            async move {
                let reply = query_shard(
                    &self.probe_shard,
                    CmdArgs::new("SENTINEL").arg("SLAVES").arg(name.clone()),
                    &self.settings.probe_control,
                )
                .await;
                if !reply.is_ok() || reply.data.is_error() {
                    warn!(shard = %name, "SENTINEL SLAVES query failed");
                    return (name, Vec::new());
                }
                let slaves = parse_sentinel_instances(&reply.data, Some(&name));
                (name, slaves)
            }
        });
        let slaves: HashMap<String, Vec<SentinelInstance>> =
            futures::future::join_all(slave_queries).await.into_iter().collect();

        self.apply(masters, slaves);
    }

    async fn query_masters(&self) -> Option<Vec<SentinelInstance>> {
        let reply = query_shard(
            &self.probe_shard,
            CmdArgs::new("SENTINEL").arg("MASTERS"),
            &self.settings.probe_control,
        )
        .await;
        if !reply.is_ok() || reply.data.is_error() {
            debug!(status = ?reply.status, "SENTINEL MASTERS query failed");
            return None;
        }
        let mut masters = parse_sentinel_instances(&reply.data, None);
        masters.retain(|m| self.shard_names.contains_key(&m.name));
        Some(masters)
    }

    /// Applies a discovery result to the shard set and publishes a new
    /// snapshot when membership changed.
    fn apply(
        &self,
        masters: Vec<SentinelInstance>,
        slaves: HashMap<String, Vec<SentinelInstance>>,
    ) {
        let mut host_port_to_shard = HashMap::new();
        let mut changed = false;

        for (name, &shard_idx) in &self.shard_names {
            let shard = &self.shards[shard_idx];
            // A shard missing from the response keeps its previous
            // membership; sentinels flap during failover.
            if let Some(master) = masters.iter().find(|m| &m.name == name) {
                let mut desired = Vec::new();
                host_port_to_shard.insert(master.host_port(), shard_idx);
                desired.push(DesiredInstance {
                    info: ConnectionInfo::new(master.host.clone(), master.port),
                    is_master: true,
                });
                for slave in slaves.get(name).into_iter().flatten() {
                    host_port_to_shard.insert(slave.host_port(), shard_idx);
                    desired.push(DesiredInstance {
                        info: ConnectionInfo::new(slave.host.clone(), slave.port),
                        is_master: false,
                    });
                }
                changed |= shard.set_connection_info(desired);
            } else {
                for desired in shard.desired_infos() {
                    host_port_to_shard.insert(desired.info.host_port(), shard_idx);
                }
            }
            shard.process_creation();
        }

        let first = !self.received.swap(true, Ordering::AcqRel);
        if changed || first {
            let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
            let topology = Topology::new(version, self.shards.clone(), None, host_port_to_shard);
            *self.topology.write() = topology;
            self.version_tx.send_replace(version);
            self.settings
                .stats
                .topology
                .topology_versions
                .fetch_add(1, Ordering::Relaxed);
            info!(version, "sentinel topology updated");
        }
    }
}

impl TopologyHolder for SentinelTopologyHolder {
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
        RedirectTarget {
            shard_idx: self.topology().shard_by_host_port(host_port),
            server_id: None,
        }
    }

    fn is_cluster(&self) -> bool {
        false
    }

    fn set_commands_buffering_settings(&self, settings: CommandsBufferingSettings) {
        for shard in &self.shards {
            shard.set_commands_buffering_settings(settings);
        }
    }

    fn set_replication_monitoring_settings(&self, settings: ReplicationMonitoringSettings) {
        for shard in &self.shards {
            shard.set_replication_monitoring_settings(settings);
        }
    }

    fn stop(&self) {
        self.stopped_tx.send_replace(true);
        for shard in &self.shards {
            shard.clean();
        }
        self.probe_shard.clean();
    }
}
