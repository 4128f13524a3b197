// src/core/shard.rs

//! A shard: the set of instances serving one logical partition, with the
//! per-command instance selection policy and the desired-vs-actual
//! reconciliation loop.

use crate::config::{CommandsBufferingSettings, ReplicationMonitoringSettings};
use crate::core::command::{Command, CommandControl, ServerSelectionStrategy};
use crate::core::instance::{Instance, InstanceCreationSettings, InstanceState};
use crate::core::stats::ShardStats;
use crate::core::types::{ConnectionInfo, ServerId};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

/// One desired member of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredInstance {
    pub info: ConnectionInfo,
    pub is_master: bool,
}

#[derive(Clone)]
pub struct ShardEntry {
    pub instance: Arc<Instance>,
    pub is_master: bool,
}

#[derive(Default)]
struct ShardState {
    desired: Vec<DesiredInstance>,
    /// Connected members serving commands.
    active: Vec<ShardEntry>,
    /// Created but not yet connected.
    pending: Vec<ShardEntry>,
    /// Undesired members draining before destruction.
    clean_wait: Vec<Arc<Instance>>,
}

/// Set of instances serving one logical shard. Master first by convention;
/// members are tagged with a master flag either way.
pub struct Shard {
    name: String,
    cluster_mode: bool,
    /// When false (cluster mode) the nodes storage owns instance lifecycle
    /// and reconciliation never destroys members.
    owns_instances: bool,
    creation_settings: RwLock<InstanceCreationSettings>,
    local_dc: Option<String>,
    state: RwLock<ShardState>,
    rr_counter: AtomicUsize,
    ready_tx: watch::Sender<bool>,
    /// Epoch bumped whenever the connected-instance set changes.
    instances_epoch_tx: watch::Sender<u64>,
    last_ready: Mutex<Option<Instant>>,
    last_available: Mutex<Vec<ServerId>>,
    stats: Arc<ShardStats>,
    restrict_syncing_replicas: std::sync::atomic::AtomicBool,
}

impl Shard {
    pub fn new(
        name: impl Into<String>,
        cluster_mode: bool,
        creation_settings: InstanceCreationSettings,
        local_dc: Option<String>,
    ) -> Arc<Shard> {
        let (ready_tx, _) = watch::channel(false);
        let (instances_epoch_tx, _) = watch::channel(0);
        Arc::new(Shard {
            name: name.into(),
            cluster_mode,
            owns_instances: true,
            restrict_syncing_replicas: std::sync::atomic::AtomicBool::new(
                creation_settings.monitoring.restrict_requests,
            ),
            creation_settings: RwLock::new(creation_settings),
            local_dc,
            state: RwLock::new(ShardState::default()),
            rr_counter: AtomicUsize::new(0),
            ready_tx,
            instances_epoch_tx,
            last_ready: Mutex::new(None),
            last_available: Mutex::new(Vec::new()),
            stats: Arc::new(ShardStats::default()),
        })
    }

    /// Builds a cluster-mode shard over instances owned by the nodes storage.
    pub fn for_cluster(
        name: impl Into<String>,
        entries: Vec<ShardEntry>,
        creation_settings: InstanceCreationSettings,
        local_dc: Option<String>,
    ) -> Arc<Shard> {
        let (ready_tx, _) = watch::channel(false);
        let (instances_epoch_tx, _) = watch::channel(0);
        let shard = Arc::new(Shard {
            name: name.into(),
            cluster_mode: true,
            owns_instances: false,
            restrict_syncing_replicas: std::sync::atomic::AtomicBool::new(
                creation_settings.monitoring.restrict_requests,
            ),
            creation_settings: RwLock::new(creation_settings),
            local_dc,
            state: RwLock::new(ShardState::default()),
            rr_counter: AtomicUsize::new(0),
            ready_tx,
            instances_epoch_tx,
            last_ready: Mutex::new(None),
            last_available: Mutex::new(Vec::new()),
            stats: Arc::new(ShardStats::default()),
        });
        {
            let mut state = shard.state.write();
            for entry in entries {
                shard.spawn_state_watcher(&entry.instance);
                if entry.instance.is_available() {
                    state.active.push(entry);
                } else {
                    state.pending.push(entry);
                }
            }
        }
        shard.refresh_readiness();
        shard
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<ShardStats> {
        &self.stats
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Watch for connected-instance set changes; drives rebalancing.
    pub fn instances_epoch_watch(&self) -> watch::Receiver<u64> {
        self.instances_epoch_tx.subscribe()
    }

    pub fn last_ready_time(&self) -> Option<Instant> {
        *self.last_ready.lock()
    }

    /// Whether the shard currently has a connected master / replica.
    pub fn connected_roles(&self) -> (bool, bool) {
        let state = self.state.read();
        let master = state
            .active
            .iter()
            .any(|e| e.is_master && e.instance.is_available());
        let replica = state
            .active
            .iter()
            .any(|e| !e.is_master && e.instance.is_available());
        (master, replica)
    }

    /// The desired member set this shard converges to.
    pub fn desired_infos(&self) -> Vec<DesiredInstance> {
        self.state.read().desired.clone()
    }

    /// Available read-pool servers with their measured ping, for
    /// subscription placement weighting.
    pub fn available_servers(&self) -> Vec<(ServerId, Option<Duration>)> {
        let state = self.state.read();
        state
            .active
            .iter()
            .filter(|e| e.instance.is_available())
            .map(|e| (e.instance.id(), e.instance.ping_latency()))
            .collect()
    }

    /// Looks up a member by id.
    pub fn instance_by_id(&self, id: ServerId) -> Option<Arc<Instance>> {
        let state = self.state.read();
        state
            .active
            .iter()
            .chain(state.pending.iter())
            .find(|e| e.instance.id() == id)
            .map(|e| e.instance.clone())
    }

    pub fn set_commands_buffering_settings(&self, settings: CommandsBufferingSettings) {
        self.creation_settings.write().buffering = settings;
        let state = self.state.read();
        for entry in state.active.iter().chain(state.pending.iter()) {
            entry.instance.set_commands_buffering_settings(settings);
        }
    }

    pub fn set_replication_monitoring_settings(&self, settings: ReplicationMonitoringSettings) {
        self.creation_settings.write().monitoring = settings;
        self.restrict_syncing_replicas
            .store(settings.restrict_requests, Ordering::Relaxed);
        let state = self.state.read();
        for entry in state.active.iter().chain(state.pending.iter()) {
            entry.instance.set_replication_monitoring_settings(settings);
        }
    }

    /// Replaces the desired member set. Returns true when it differs from
    /// the previous desired set; the change is applied by the next
    /// [`Shard::process_creation`].
    pub fn set_connection_info(self: &Arc<Self>, desired: Vec<DesiredInstance>) -> bool {
        let mut state = self.state.write();
        if state.desired == desired {
            return false;
        }
        state.desired = desired;
        true
    }

    /// Reconciles desired vs. actual membership: creates missing instances
    /// (in pending until connected), retires undesired or dead ones.
    pub fn process_creation(self: &Arc<Self>) {
        if !self.owns_instances {
            return;
        }
        let settings = self.creation_settings.read().clone();
        let mut created = Vec::new();
        {
            let mut state = self.state.write();

            // Retire members that are no longer desired or whose connection
            // reached a terminal state.
            let desired = state.desired.clone();
            let mut retired = Vec::new();
            let retain = |entry: &ShardEntry, retired: &mut Vec<Arc<Instance>>| {
                let wanted = desired
                    .iter()
                    .any(|d| d.info == *entry.instance.info() && d.is_master == entry.is_master);
                let dead = matches!(
                    entry.instance.state(),
                    InstanceState::Disconnected | InstanceState::ExitReady
                ) || entry.instance.state().is_error();
                if wanted && !dead {
                    true
                } else {
                    retired.push(entry.instance.clone());
                    false
                }
            };
            state.active.retain(|e| retain(e, &mut retired));
            state.pending.retain(|e| retain(e, &mut retired));
            for instance in retired {
                debug!(shard = %self.name, addr = %instance.info(), "retiring instance");
                instance.destroy();
                state.clean_wait.push(instance);
            }

            // Drop drained members.
            state
                .clean_wait
                .retain(|i| i.state() != InstanceState::ExitReady);

            // Create what is missing.
            for desired in state.desired.clone() {
                let present = state
                    .active
                    .iter()
                    .chain(state.pending.iter())
                    .any(|e| *e.instance.info() == desired.info && e.is_master == desired.is_master);
                if present {
                    continue;
                }
                let mut settings = settings.clone();
                // Cluster-mode connections allow reads from possibly stale
                // replicas; sentinel replicas need no READONLY.
                settings.send_readonly = self.cluster_mode;
                let mut info = desired.info.clone();
                if info.password.is_none() {
                    info.password = settings.password.clone();
                }
                let instance = Instance::spawn(info, settings);
                debug!(shard = %self.name, addr = %instance.info(),
                       is_master = desired.is_master, "creating instance");
                created.push(instance.clone());
                state.pending.push(ShardEntry {
                    instance,
                    is_master: desired.is_master,
                });
            }
        }
        for instance in created {
            self.spawn_state_watcher(&instance);
        }
        self.refresh_readiness();
    }

    /// Follows one instance's state signal, promoting it into the active
    /// vector on connect and retiring it on terminal states.
    fn spawn_state_watcher(self: &Arc<Self>, instance: &Arc<Instance>) {
        let weak: Weak<Shard> = Arc::downgrade(self);
        let instance = instance.clone();
        tokio::spawn(async move {
            let mut rx = instance.state_watch();
            loop {
                let state = *rx.borrow_and_update();
                if let Some(shard) = weak.upgrade() {
                    shard.on_instance_state(&instance, state);
                } else {
                    return;
                }
                if state == InstanceState::ExitReady {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    fn on_instance_state(self: &Arc<Self>, instance: &Arc<Instance>, new_state: InstanceState) {
        match new_state {
            InstanceState::Connected => {
                let mut state = self.state.write();
                if let Some(pos) = state
                    .pending
                    .iter()
                    .position(|e| e.instance.id() == instance.id())
                {
                    let entry = state.pending.remove(pos);
                    info!(shard = %self.name, addr = %instance.info(), "instance connected");
                    state.active.push(entry);
                }
            }
            InstanceState::Disconnected | InstanceState::ExitReady => {
                let mut state = self.state.write();
                let id = instance.id();
                state.active.retain(|e| e.instance.id() != id);
                state.pending.retain(|e| e.instance.id() != id);
                state
                    .clean_wait
                    .retain(|i| i.state() != InstanceState::ExitReady);
            }
            _ => {}
        }
        self.refresh_readiness();
    }

    fn refresh_readiness(&self) {
        let mut available: Vec<ServerId> = {
            let state = self.state.read();
            state
                .active
                .iter()
                .filter(|e| e.instance.is_available())
                .map(|e| e.instance.id())
                .collect()
        };
        available.sort_unstable();
        let ready = !available.is_empty();

        let was_ready = *self.ready_tx.borrow();
        if ready && !was_ready {
            *self.last_ready.lock() = Some(Instant::now());
            info!(shard = %self.name, "shard is ready");
        }
        if ready != was_ready {
            self.ready_tx.send_replace(ready);
        }

        let mut last = self.last_available.lock();
        if *last != available {
            *last = available;
            self.instances_epoch_tx.send_modify(|epoch| *epoch += 1);
        }
    }

    /// Submits a command to an instance chosen by the selection policy.
    /// Returns false when no usable instance exists.
    pub fn send(&self, cmd: Arc<Command>, master: bool, control: &CommandControl) -> bool {
        let Some(instance) = self.select_instance(master, control, &cmd) else {
            return false;
        };
        *cmd.prev_instance.lock() = Some(instance.id());
        if instance.send_command(cmd) {
            if control.account_in_statistics != Some(false) {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            true
        } else {
            false
        }
    }

    /// The §4.2 selection policy: forced server, then the strategy's
    /// candidate set, then fewest-in-flight with previous-instance avoidance
    /// and round-robin tie-breaking.
    fn select_instance(
        &self,
        master: bool,
        control: &CommandControl,
        cmd: &Command,
    ) -> Option<Arc<Instance>> {
        let state = self.state.read();

        if let Some(forced) = control.force_server_id
            && !forced.is_any()
        {
            return state
                .active
                .iter()
                .find(|e| e.instance.id() == forced && e.instance.is_available())
                .map(|e| e.instance.clone());
        }

        let want_master = master || control.force_request_to_master.unwrap_or(false);
        let restrict_syncing = self.restrict_syncing_replicas.load(Ordering::Relaxed);

        let mut candidates: Vec<&ShardEntry> = if want_master {
            state
                .active
                .iter()
                .filter(|e| e.is_master && e.instance.is_available())
                .collect()
        } else {
            let mut replicas: Vec<&ShardEntry> = state
                .active
                .iter()
                .filter(|e| {
                    !e.is_master
                        && e.instance.is_available()
                        && !(restrict_syncing && e.instance.is_syncing())
                })
                .collect();
            if replicas.is_empty() || control.allow_reads_from_master.unwrap_or(false) {
                replicas.extend(
                    state
                        .active
                        .iter()
                        .filter(|e| e.is_master && e.instance.is_available()),
                );
            }
            replicas
        };

        if let Some(max_ping) = control.max_ping_latency {
            let filtered: Vec<&ShardEntry> = candidates
                .iter()
                .copied()
                .filter(|e| e.instance.ping_latency().is_none_or(|p| p <= max_ping))
                .collect();
            if !filtered.is_empty() {
                candidates = filtered;
            }
        }

        match control.strategy() {
            ServerSelectionStrategy::EveryDc => {
                // All instances stay eligible, weighted inversely by
                // measured ping: a pair is drawn without replacement so
                // slow servers are proportionally less likely to be
                // considered, and fewest-in-flight decides between the
                // drawn ones.
                if candidates.len() > 2 {
                    candidates = draw_by_inverse_ping(candidates, 2);
                }
            }
            ServerSelectionStrategy::NearestServerPing => {
                let best = control.best_dc_count.unwrap_or(1).max(1);
                candidates.sort_by_key(|e| {
                    e.instance
                        .ping_latency()
                        .unwrap_or(Duration::from_secs(3600))
                });
                candidates.truncate(best);
            }
            ServerSelectionStrategy::LocalDcConductor => {
                if let Some(local_dc) = &self.local_dc {
                    let local: Vec<&ShardEntry> = candidates
                        .iter()
                        .copied()
                        .filter(|e| e.instance.info().datacenter.as_ref() == Some(local_dc))
                        .collect();
                    if !local.is_empty() {
                        candidates = local;
                    }
                }
            }
        }

        if candidates.is_empty() {
            return None;
        }

        // Prefer not to reuse the previous attempt's instance so that
        // retries naturally spread.
        let prev = *cmd.prev_instance.lock();
        if candidates.len() > 1
            && let Some(prev) = prev
        {
            candidates.retain(|e| e.instance.id() != prev);
        }

        let min_in_flight = candidates
            .iter()
            .map(|e| e.instance.in_flight())
            .min()
            .expect("candidates are non-empty");
        let ties: Vec<&ShardEntry> = candidates
            .iter()
            .copied()
            .filter(|e| e.instance.in_flight() == min_in_flight)
            .collect();
        let rr = self.rr_counter.fetch_add(1, Ordering::Relaxed);
        Some(ties[rr % ties.len()].instance.clone())
    }

    /// Retires every member. Used on stop and on holder teardown.
    pub fn clean(&self) {
        let mut state = self.state.write();
        state.desired.clear();
        for entry in state.active.drain(..) {
            entry.instance.destroy();
        }
        for entry in state.pending.drain(..) {
            entry.instance.destroy();
        }
        state.clean_wait.clear();
        self.ready_tx.send_replace(false);
    }
}

/// Inverse-ping weight for the `EveryDc` draw. Unmeasured connections weigh
/// as much as a zero-latency one so fresh instances still receive traffic.
fn inverse_ping_weight(ping: Option<Duration>) -> u64 {
    const BASE_US: u64 = 1_000_000;
    match ping {
        Some(ping) => (BASE_US / (ping.as_micros() as u64 + 1)).max(1),
        None => BASE_US,
    }
}

/// Draws `take` entries without replacement, each draw weighted by the
/// inverse of the instance's measured ping.
fn draw_by_inverse_ping(mut candidates: Vec<&ShardEntry>, take: usize) -> Vec<&ShardEntry> {
    let mut weights: Vec<u64> = candidates
        .iter()
        .map(|e| inverse_ping_weight(e.instance.ping_latency()))
        .collect();
    let mut rng = rand::thread_rng();
    let mut picked = Vec::with_capacity(take);
    while picked.len() < take && !candidates.is_empty() {
        let sum: u64 = weights.iter().sum();
        let mut draw = rng.gen_range(0..sum);
        for idx in 0..candidates.len() {
            if draw < weights[idx] {
                picked.push(candidates.swap_remove(idx));
                weights.swap_remove(idx);
                break;
            }
            draw -= weights[idx];
        }
    }
    picked
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Shard")
            .field("name", &self.name)
            .field("active", &state.active.len())
            .field("pending", &state.pending.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_ping_weight_favors_fast_servers() {
        let fast = inverse_ping_weight(Some(Duration::from_micros(200)));
        let slow = inverse_ping_weight(Some(Duration::from_millis(20)));
        assert!(fast > slow);
        // Even multi-second pings keep a non-zero chance.
        assert_eq!(inverse_ping_weight(Some(Duration::from_secs(5))), 1);
        // Unmeasured connections weigh like a zero-latency one.
        assert_eq!(
            inverse_ping_weight(None),
            inverse_ping_weight(Some(Duration::ZERO))
        );
    }
}
