// src/core/subscription/storage.rs

//! The subscription catalog: callbacks per channel, one FSM per
//! (channel, shard), message dispatch and the glue that turns FSM actions
//! into SUBSCRIBE/UNSUBSCRIBE commands.

use super::fsm::{Action, ActionKind, Event, EventKind, Fsm};
use super::rebalance::RebalanceScheduler;
use super::{CommandSink, MessageCallback, PmessageCallback, ServerWeights, SubscriptionId};
use crate::core::command::{CmdArgs, Command, CommandControl};
use crate::core::reply::Reply;
use crate::core::stats::{ChannelShardStats, PubsubShardStatsSnapshot};
use crate::core::types::ServerId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Channel or pattern name, carried alongside FSMs so actions know what to
/// subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ChannelName {
    pub name: String,
    pub pattern: bool,
}

impl ChannelName {
    fn subscribe_command(&self) -> &'static str {
        if self.pattern { "PSUBSCRIBE" } else { "SUBSCRIBE" }
    }

    fn unsubscribe_command(&self) -> &'static str {
        if self.pattern { "PUNSUBSCRIBE" } else { "UNSUBSCRIBE" }
    }
}

type FsmPtr = Arc<Mutex<Fsm>>;

/// One (channel, shard) slot: the FSM (absent for cluster-mode fake slots)
/// plus message statistics.
pub(crate) struct ShardChannelInfo {
    pub fsm: Option<FsmPtr>,
    pub stats: Arc<ChannelShardStats>,
}

impl ShardChannelInfo {
    fn new(fsm: Option<FsmPtr>) -> Self {
        Self {
            fsm,
            stats: Arc::new(ChannelShardStats::default()),
        }
    }

    /// Accounts one delivered message, counting it as alien when it came
    /// from a server other than the FSM's current one. Expected while a
    /// rebalance is in flight; persistent alien traffic is a bug.
    fn account_message(&self, server_id: ServerId, message_size: usize) {
        let current = self
            .fsm
            .as_ref()
            .map(|fsm| fsm.lock().current_server_id())
            .unwrap_or_default();
        if current == server_id {
            self.stats.account_message(message_size);
        } else {
            debug!(
                origin = %server_id,
                current = %current,
                "alien message on subscription; possible while rebalancing"
            );
            self.stats.account_alien_message();
        }
    }
}

pub(crate) struct ChannelRecord<C> {
    pub callbacks: HashMap<SubscriptionId, C>,
    pub infos: Vec<ShardChannelInfo>,
    pub control: CommandControl,
    pub active_fsm_count: usize,
}

struct StorageState {
    cluster_mode: bool,
    shards_count: usize,
    shard_rotate_counter: usize,
    next_subscription_id: SubscriptionId,
    channels: HashMap<String, ChannelRecord<MessageCallback>>,
    patterns: HashMap<String, ChannelRecord<PmessageCallback>>,
}

pub struct SubscriptionStorage {
    inner: Arc<StorageInner>,
}

pub(crate) struct StorageInner {
    state: Mutex<StorageState>,
    subscribe_sink: RwLock<Option<CommandSink>>,
    unsubscribe_sink: RwLock<Option<CommandSink>>,
    common_control: Mutex<CommandControl>,
    schedulers: Mutex<Vec<Arc<RebalanceScheduler>>>,
    rebalance_min_interval: Mutex<Duration>,
}

/// RAII subscription handle; dropping it unsubscribes.
pub struct SubscriptionToken {
    storage: Weak<StorageInner>,
    id: SubscriptionId,
}

impl SubscriptionToken {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Explicitly releases the subscription.
    pub fn unsubscribe(&mut self) {
        if self.id == 0 {
            return;
        }
        debug!(id = self.id, "unsubscribe");
        if let Some(storage) = self.storage.upgrade() {
            storage.unsubscribe(self.id);
        }
        self.id = 0;
    }
}

impl Drop for SubscriptionToken {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl SubscriptionStorage {
    pub fn new(shards_count: usize, cluster_mode: bool, rebalance_min_interval: Duration) -> Self {
        let inner = Arc::new(StorageInner {
            state: Mutex::new(StorageState {
                cluster_mode,
                shards_count,
                shard_rotate_counter: rand::random::<usize>() % shards_count.max(1),
                next_subscription_id: 1,
                channels: HashMap::new(),
                patterns: HashMap::new(),
            }),
            subscribe_sink: RwLock::new(None),
            unsubscribe_sink: RwLock::new(None),
            common_control: Mutex::new(CommandControl {
                max_retries: Some(1),
                ..Default::default()
            }),
            schedulers: Mutex::new(Vec::new()),
            rebalance_min_interval: Mutex::new(rebalance_min_interval),
        });
        let storage = Self { inner };
        storage.resize_schedulers(shards_count);
        storage
    }

    pub fn set_subscribe_sink(&self, sink: CommandSink) {
        *self.inner.subscribe_sink.write() = Some(sink);
    }

    pub fn set_unsubscribe_sink(&self, sink: CommandSink) {
        *self.inner.unsubscribe_sink.write() = Some(sink);
    }

    /// Control merged into every subscribe command. Subscriptions never
    /// retry through the dispatcher: the FSM owns recovery.
    pub fn set_command_control(&self, control: CommandControl) {
        let mut stored = control;
        stored.max_retries = Some(1);
        *self.inner.common_control.lock() = stored;
    }

    pub fn set_rebalance_min_interval(&self, interval: Duration) {
        *self.inner.rebalance_min_interval.lock() = interval;
        for scheduler in self.inner.schedulers.lock().iter() {
            scheduler.set_min_interval(interval);
        }
    }

    /// Adjusts the shard count after a topology change, extending existing
    /// channel records with fake slots (cluster) or live FSMs (sentinel).
    pub fn set_shards_count(&self, shards_count: usize) {
        {
            let mut state = self.inner.state.lock();
            if state.shards_count == shards_count {
                return;
            }
            state.shards_count = shards_count;
            let inner = &self.inner;
            let cluster_mode = state.cluster_mode;
            let mut rotate = state.shard_rotate_counter;
            for (name, record) in state.channels.iter_mut() {
                extend_infos(
                    inner,
                    record,
                    &ChannelName {
                        name: name.clone(),
                        pattern: false,
                    },
                    shards_count,
                    cluster_mode,
                    &mut rotate,
                );
            }
            for (name, record) in state.patterns.iter_mut() {
                extend_infos(
                    inner,
                    record,
                    &ChannelName {
                        name: name.clone(),
                        pattern: true,
                    },
                    shards_count,
                    cluster_mode,
                    &mut rotate,
                );
            }
            state.shard_rotate_counter = rotate;
        }
        self.resize_schedulers(shards_count);
    }

    fn resize_schedulers(&self, shards_count: usize) {
        let mut schedulers = self.inner.schedulers.lock();
        let interval = *self.inner.rebalance_min_interval.lock();
        while schedulers.len() < shards_count {
            let shard_idx = schedulers.len();
            schedulers.push(RebalanceScheduler::spawn(
                Arc::downgrade(&self.inner),
                shard_idx,
                interval,
            ));
        }
        while schedulers.len() > shards_count {
            let scheduler = schedulers.pop().expect("len checked");
            scheduler.stop();
        }
    }

    pub fn subscribe(&self, channel: &str, callback: MessageCallback) -> SubscriptionToken {
        self.subscribe_with_control(channel, callback, CommandControl::default())
    }

    pub fn subscribe_with_control(
        &self,
        channel: &str,
        callback: MessageCallback,
        control: CommandControl,
    ) -> SubscriptionToken {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let id = state.next_id();
        debug!(channel, id, "subscribe");
        let channel_name = ChannelName {
            name: channel.to_string(),
            pattern: false,
        };
        let shards_count = state.shards_count;
        let cluster_mode = state.cluster_mode;
        let rotate = if cluster_mode {
            let idx = state.shard_rotate_counter % shards_count.max(1);
            state.shard_rotate_counter = state.shard_rotate_counter.wrapping_add(1);
            idx
        } else {
            0
        };

        let record = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| ChannelRecord {
                callbacks: HashMap::new(),
                infos: Vec::new(),
                control: control.clone(),
                active_fsm_count: 0,
            });
        if record.infos.is_empty() {
            populate_infos(inner, record, &channel_name, shards_count, cluster_mode, rotate);
        } else {
            request_subscribe(inner, record, &channel_name);
        }
        record.callbacks.insert(id, callback);

        SubscriptionToken {
            storage: Arc::downgrade(inner),
            id,
        }
    }

    pub fn psubscribe(&self, pattern: &str, callback: PmessageCallback) -> SubscriptionToken {
        self.psubscribe_with_control(pattern, callback, CommandControl::default())
    }

    pub fn psubscribe_with_control(
        &self,
        pattern: &str,
        callback: PmessageCallback,
        control: CommandControl,
    ) -> SubscriptionToken {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let id = state.next_id();
        debug!(pattern, id, "psubscribe");
        let channel_name = ChannelName {
            name: pattern.to_string(),
            pattern: true,
        };
        let shards_count = state.shards_count;
        let cluster_mode = state.cluster_mode;
        let rotate = if cluster_mode {
            let idx = state.shard_rotate_counter % shards_count.max(1);
            state.shard_rotate_counter = state.shard_rotate_counter.wrapping_add(1);
            idx
        } else {
            0
        };

        let record = state
            .patterns
            .entry(pattern.to_string())
            .or_insert_with(|| ChannelRecord {
                callbacks: HashMap::new(),
                infos: Vec::new(),
                control: control.clone(),
                active_fsm_count: 0,
            });
        if record.infos.is_empty() {
            populate_infos(inner, record, &channel_name, shards_count, cluster_mode, rotate);
        } else {
            request_subscribe(inner, record, &channel_name);
        }
        record.callbacks.insert(id, callback);

        SubscriptionToken {
            storage: Arc::downgrade(inner),
            id,
        }
    }

    /// Queues a rebalance of one shard with the given weights (debounced).
    pub fn request_rebalance(&self, shard_idx: usize, weights: ServerWeights) {
        let schedulers = self.inner.schedulers.lock();
        if let Some(scheduler) = schedulers.get(shard_idx) {
            scheduler.request(weights);
        }
    }

    /// Lazily instantiates real FSMs in the fake slots after a fallback
    /// from cluster to sentinel mode.
    pub fn switch_to_non_cluster_mode(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.cluster_mode {
            return;
        }
        state.cluster_mode = false;
        info!("subscription storage switching to non-cluster mode");

        let shards_count = state.shards_count;
        for (name, record) in state.channels.iter_mut() {
            if record.callbacks.is_empty() {
                continue;
            }
            let channel_name = ChannelName {
                name: name.clone(),
                pattern: false,
            };
            materialize_fake_slots(inner, record, &channel_name, shards_count);
        }
        for (name, record) in state.patterns.iter_mut() {
            if record.callbacks.is_empty() {
                continue;
            }
            let channel_name = ChannelName {
                name: name.clone(),
                pattern: true,
            };
            materialize_fake_slots(inner, record, &channel_name, shards_count);
        }
    }

    pub fn channels_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.channels.len() + state.patterns.len()
    }

    /// Pub/sub statistics for one shard.
    pub fn shard_statistics(&self, shard_idx: usize) -> PubsubShardStatsSnapshot {
        let state = self.inner.state.lock();
        let mut snapshot = PubsubShardStatsSnapshot::default();
        let mut account = |name: &str, info: &ShardChannelInfo| {
            if let Some(fsm) = &info.fsm {
                snapshot
                    .by_channel
                    .insert(name.to_string(), info.stats.snapshot());
                let current = fsm.lock().current_server_id();
                if !current.is_any() {
                    *snapshot
                        .subscriptions_by_host
                        .entry(current.description())
                        .or_default() += 1;
                }
            }
        };
        for (name, record) in &state.channels {
            if let Some(info) = record.infos.get(shard_idx) {
                account(name, info);
            }
        }
        for (name, record) in &state.patterns {
            if let Some(info) = record.infos.get(shard_idx) {
                account(name, info);
            }
        }
        snapshot
    }

    /// Drops every subscription and stops the schedulers.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.channels.clear();
            state.patterns.clear();
        }
        for scheduler in self.inner.schedulers.lock().drain(..) {
            scheduler.stop();
        }
    }
}

impl StorageState {
    fn next_id(&mut self) -> SubscriptionId {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        id
    }
}

/// Creates the per-shard info vector for a new channel record.
fn populate_infos<C>(
    inner: &Arc<StorageInner>,
    record: &mut ChannelRecord<C>,
    channel_name: &ChannelName,
    shards_count: usize,
    cluster_mode: bool,
    selected_shard: usize,
) {
    record.active_fsm_count = if cluster_mode {
        shards_count.min(1)
    } else {
        shards_count
    };
    record.infos.reserve(shards_count);
    for shard_idx in 0..shards_count {
        let fake = cluster_mode && shard_idx != selected_shard;
        if fake {
            record.infos.push(ShardChannelInfo::new(None));
        } else {
            let fsm = Arc::new(Mutex::new(Fsm::new(shard_idx, ServerId::any())));
            record.infos.push(ShardChannelInfo::new(Some(fsm.clone())));
            read_actions(inner, &fsm, channel_name, &record.control);
        }
    }
}

/// Sends SubscribeRequested to every live FSM of an existing record.
fn request_subscribe<C>(
    inner: &Arc<StorageInner>,
    record: &mut ChannelRecord<C>,
    channel_name: &ChannelName,
) {
    for info in &record.infos {
        let Some(fsm) = &info.fsm else { continue };
        fsm.lock()
            .on_event(Event::requested(EventKind::SubscribeRequested));
        read_actions(inner, fsm, channel_name, &record.control);
    }
}

/// Extends a record's info vector up to a new shard count. In cluster mode
/// a record that holds no real FSM yet (subscribed before the first
/// topology) gets one placed by the rotate counter.
fn extend_infos<C>(
    inner: &Arc<StorageInner>,
    record: &mut ChannelRecord<C>,
    channel_name: &ChannelName,
    shards_count: usize,
    cluster_mode: bool,
    rotate: &mut usize,
) {
    while record.infos.len() < shards_count {
        let shard_idx = record.infos.len();
        if cluster_mode {
            record.infos.push(ShardChannelInfo::new(None));
        } else {
            record.active_fsm_count += 1;
            let fsm = Arc::new(Mutex::new(Fsm::new(shard_idx, ServerId::any())));
            record.infos.push(ShardChannelInfo::new(Some(fsm.clone())));
            read_actions(inner, &fsm, channel_name, &record.control);
        }
    }
    if cluster_mode
        && shards_count > 0
        && !record.callbacks.is_empty()
        && record.infos.iter().all(|info| info.fsm.is_none())
    {
        let shard_idx = *rotate % shards_count;
        *rotate = rotate.wrapping_add(1);
        record.active_fsm_count += 1;
        let fsm = Arc::new(Mutex::new(Fsm::new(shard_idx, ServerId::any())));
        record.infos[shard_idx].fsm = Some(fsm.clone());
        read_actions(inner, &fsm, channel_name, &record.control);
    }
}

/// Instantiates FSMs in fake slots after the cluster-to-sentinel fallback.
fn materialize_fake_slots<C>(
    inner: &Arc<StorageInner>,
    record: &mut ChannelRecord<C>,
    channel_name: &ChannelName,
    shards_count: usize,
) {
    while record.infos.len() < shards_count {
        record.infos.push(ShardChannelInfo::new(None));
    }
    for (shard_idx, info) in record.infos.iter_mut().enumerate() {
        if info.fsm.is_none() {
            record.active_fsm_count += 1;
            let fsm = Arc::new(Mutex::new(Fsm::new(shard_idx, ServerId::any())));
            debug!(shard_idx, channel = %channel_name.name, "creating fsm for non-cluster mode");
            info.fsm = Some(fsm.clone());
            read_actions(inner, &fsm, channel_name, &record.control);
        }
    }
}

/// Pops pending FSM actions and executes them.
fn read_actions(
    inner: &Arc<StorageInner>,
    fsm: &FsmPtr,
    channel_name: &ChannelName,
    control: &CommandControl,
) {
    let actions = fsm.lock().pop_all_pending_actions();
    for action in actions {
        handle_channel_action(inner, fsm, action, channel_name, control);
    }
}

fn handle_channel_action(
    inner: &Arc<StorageInner>,
    fsm: &FsmPtr,
    action: Action,
    channel_name: &ChannelName,
    control: &CommandControl,
) {
    let shard_idx = fsm.lock().shard_idx();
    match action.kind {
        ActionKind::Subscribe => {
            let cmd = prepare_subscribe_command(
                inner,
                fsm,
                channel_name,
                control,
                shard_idx,
                action.server_id,
            );
            if let Some(sink) = inner.subscribe_sink.read().as_ref() {
                sink(shard_idx, cmd);
            }
        }
        ActionKind::Unsubscribe => {
            let cmd = prepare_unsubscribe_command(inner, channel_name, action.server_id);
            if let Some(sink) = inner.unsubscribe_sink.read().as_ref() {
                sink(shard_idx, cmd);
            }
        }
        ActionKind::DeleteFsm => {
            inner.delete_channel(channel_name, fsm);
        }
    }
}

/// Builds a (P)SUBSCRIBE command whose callback feeds the FSM and delivers
/// messages. A weak FSM reference is kept: the FSM may be deleted before
/// the subscribe reply arrives.
fn prepare_subscribe_command(
    inner: &Arc<StorageInner>,
    fsm: &FsmPtr,
    channel_name: &ChannelName,
    control: &CommandControl,
    shard_idx: usize,
    server_id: ServerId,
) -> Arc<Command> {
    let mut control = control.merged_with(&inner.common_control.lock());
    control.max_retries = Some(1);
    control.force_server_id = (!server_id.is_any()).then_some(server_id);

    let weak_inner = Arc::downgrade(inner);
    let weak_fsm = Arc::downgrade(fsm);
    let channel_name = channel_name.clone();
    let args = CmdArgs::new(channel_name.subscribe_command()).arg(channel_name.name.clone());

    Command::new(
        args,
        control,
        true,
        Box::new(move |reply: Reply| {
            let Some(inner) = weak_inner.upgrade() else {
                return;
            };
            inner.on_subscribe_reply(&weak_fsm, &channel_name, shard_idx, reply);
        }),
    )
}

fn prepare_unsubscribe_command(
    inner: &Arc<StorageInner>,
    channel_name: &ChannelName,
    server_id: ServerId,
) -> Arc<Command> {
    let mut control = inner.common_control.lock().clone();
    control.max_retries = Some(1);
    control.force_server_id = (!server_id.is_any()).then_some(server_id);
    let args = CmdArgs::new(channel_name.unsubscribe_command()).arg(channel_name.name.clone());
    Command::new(args, control, true, Box::new(|_reply| {}))
}

impl StorageInner {
    /// Parses one reply on a subscribe connection and routes it: lifecycle
    /// confirmations become FSM events, messages go to user callbacks.
    fn on_subscribe_reply(
        self: &Arc<Self>,
        weak_fsm: &Weak<Mutex<Fsm>>,
        channel_name: &ChannelName,
        shard_idx: usize,
        reply: Reply,
    ) {
        let server_id = reply.server_id;
        let items = reply.data.as_array();
        if !reply.is_ok() || items.is_none() {
            // Subscribe error or disconnect.
            self.handle_subscriber_event(weak_fsm, channel_name, server_id, false);
            return;
        }
        let items = items.expect("checked above");
        let Some(kind) = items.first().and_then(|k| k.as_text()) else {
            warn!("malformed subscribe reply without a kind");
            self.handle_subscriber_event(weak_fsm, channel_name, server_id, false);
            return;
        };

        match kind.as_str() {
            "subscribe" | "psubscribe" | "ssubscribe" => {
                // A zero count is the server telling us we are not, in
                // fact, subscribed any more.
                let count = items.get(2).and_then(|c| c.as_integer()).unwrap_or(0);
                self.handle_subscriber_event(weak_fsm, channel_name, server_id, count > 0);
            }
            "unsubscribe" | "punsubscribe" | "sunsubscribe" => {
                self.handle_subscriber_event(weak_fsm, channel_name, server_id, false);
            }
            "message" | "smessage" => {
                let (Some(channel), Some(payload)) = (
                    items.get(1).and_then(|c| c.as_text()),
                    items.get(2),
                ) else {
                    warn!("malformed message push");
                    return;
                };
                self.on_message(server_id, &channel, payload_bytes(payload), shard_idx);
            }
            "pmessage" => {
                let (Some(pattern), Some(channel), Some(payload)) = (
                    items.get(1).and_then(|p| p.as_text()),
                    items.get(2).and_then(|c| c.as_text()),
                    items.get(3),
                ) else {
                    warn!("malformed pmessage push");
                    return;
                };
                self.on_pmessage(server_id, &pattern, &channel, payload_bytes(payload), shard_idx);
            }
            other => warn!(kind = other, "unexpected push kind on subscribe connection"),
        }
    }

    /// Feeds a connected/disconnected event into the FSM and executes the
    /// resulting actions.
    fn handle_subscriber_event(
        self: &Arc<Self>,
        weak_fsm: &Weak<Mutex<Fsm>>,
        channel_name: &ChannelName,
        server_id: ServerId,
        connected: bool,
    ) {
        let Some(fsm) = weak_fsm.upgrade() else {
            // Possible after stop or unsubscribe only.
            return;
        };
        let control = {
            let state = self.state.lock();
            let control = if channel_name.pattern {
                state.patterns.get(&channel_name.name).map(|r| r.control.clone())
            } else {
                state.channels.get(&channel_name.name).map(|r| r.control.clone())
            };
            let kind = if connected {
                EventKind::SubscribeReplyOk
            } else {
                EventKind::SubscribeReplyError
            };
            fsm.lock().on_event(Event::new(kind, server_id));
            control
        };
        let control = control.unwrap_or_default();
        read_actions(self, &fsm, channel_name, &control);
    }

    fn on_message(self: &Arc<Self>, server_id: ServerId, channel: &str, payload: &[u8], shard_idx: usize) {
        let state = self.state.lock();
        let Some(record) = state.channels.get(channel) else {
            error!(channel, "got MESSAGE while not subscribed to it");
            return;
        };
        for callback in record.callbacks.values() {
            let callback = callback.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(channel, payload))).is_err() {
                error!(channel, "panic in subscriber callback");
            }
        }
        if let Some(info) = record.infos.get(shard_idx) {
            info.account_message(server_id, payload.len());
        }
    }

    fn on_pmessage(
        self: &Arc<Self>,
        server_id: ServerId,
        pattern: &str,
        channel: &str,
        payload: &[u8],
        shard_idx: usize,
    ) {
        let state = self.state.lock();
        let Some(record) = state.patterns.get(pattern) else {
            error!(pattern, "got PMESSAGE while not subscribed to it");
            return;
        };
        for callback in record.callbacks.values() {
            let callback = callback.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(pattern, channel, payload)))
                .is_err()
            {
                error!(pattern, "panic in subscriber callback");
            }
        }
        if let Some(info) = record.infos.get(shard_idx) {
            info.account_message(server_id, payload.len());
        }
    }

    pub(crate) fn unsubscribe(self: &Arc<Self>, id: SubscriptionId) {
        if self.do_unsubscribe(id, false) {
            return;
        }
        if self.do_unsubscribe(id, true) {
            return;
        }
        error!(id, "unsubscribe called with an unknown subscription id");
    }

    fn do_unsubscribe(self: &Arc<Self>, id: SubscriptionId, pattern: bool) -> bool {
        let mut pending: Vec<(FsmPtr, ChannelName, CommandControl)> = Vec::new();
        let found = {
            let mut state = self.state.lock();
            let mut found = false;
            if pattern {
                for (name, record) in state.patterns.iter_mut() {
                    if record.callbacks.remove(&id).is_some() {
                        found = true;
                        if record.callbacks.is_empty() {
                            let channel_name = ChannelName {
                                name: name.clone(),
                                pattern: true,
                            };
                            for info in &record.infos {
                                if let Some(fsm) = &info.fsm {
                                    fsm.lock().on_event(Event::requested(
                                        EventKind::UnsubscribeRequested,
                                    ));
                                    pending.push((
                                        fsm.clone(),
                                        channel_name.clone(),
                                        record.control.clone(),
                                    ));
                                }
                            }
                        }
                        break;
                    }
                }
            } else {
                for (name, record) in state.channels.iter_mut() {
                    if record.callbacks.remove(&id).is_some() {
                        found = true;
                        if record.callbacks.is_empty() {
                            let channel_name = ChannelName {
                                name: name.clone(),
                                pattern: false,
                            };
                            for info in &record.infos {
                                if let Some(fsm) = &info.fsm {
                                    fsm.lock().on_event(Event::requested(
                                        EventKind::UnsubscribeRequested,
                                    ));
                                    pending.push((
                                        fsm.clone(),
                                        channel_name.clone(),
                                        record.control.clone(),
                                    ));
                                }
                            }
                        }
                        break;
                    }
                }
            }
            found
        };
        for (fsm, channel_name, control) in pending {
            read_actions(self, &fsm, &channel_name, &control);
        }
        found
    }

    /// Handles a DeleteFsm action: decrements the channel's live-FSM count
    /// and erases the record once the last FSM is gone.
    fn delete_channel(self: &Arc<Self>, channel_name: &ChannelName, fsm: &FsmPtr) {
        enum Outcome {
            Unknown,
            Resubscribe,
            Erase,
            Keep,
        }
        let outcome = {
            let mut state = self.state.lock();
            let record_state = if channel_name.pattern {
                state
                    .patterns
                    .get_mut(&channel_name.name)
                    .map(|r| {
                        let has_callbacks = !r.callbacks.is_empty();
                        if !has_callbacks {
                            r.active_fsm_count -= 1;
                        }
                        (has_callbacks, r.active_fsm_count)
                    })
            } else {
                state.channels.get_mut(&channel_name.name).map(|r| {
                    let has_callbacks = !r.callbacks.is_empty();
                    if !has_callbacks {
                        r.active_fsm_count -= 1;
                    }
                    (has_callbacks, r.active_fsm_count)
                })
            };
            match record_state {
                None => Outcome::Unknown,
                Some((true, _)) => Outcome::Resubscribe,
                Some((false, 0)) => {
                    if channel_name.pattern {
                        state.patterns.remove(&channel_name.name);
                    } else {
                        state.channels.remove(&channel_name.name);
                    }
                    Outcome::Erase
                }
                Some((false, _)) => Outcome::Keep,
            }
        };
        match outcome {
            Outcome::Unknown => {
                error!(channel = %channel_name.name, "DeleteFsm for an unknown channel");
            }
            Outcome::Resubscribe => {
                // Somebody subscribed while the FSM was shutting down;
                // revive it instead of deleting.
                error!(channel = %channel_name.name,
                       "DeleteFsm while callbacks remain; resubscribing");
                fsm.lock()
                    .on_event(Event::requested(EventKind::SubscribeRequested));
                let control = self.common_control.lock().clone();
                read_actions(self, fsm, channel_name, &control);
            }
            Outcome::Erase => {
                debug!(channel = %channel_name.name, "channel record erased");
            }
            Outcome::Keep => {}
        }
    }

    /// The weighted rebalance of one shard; called by the scheduler.
    pub(crate) fn do_rebalance(self: &Arc<Self>, shard_idx: usize, weights: ServerWeights) {
        super::rebalance::rebalance_shard(self, shard_idx, weights);
    }

    pub(crate) fn gather_rebalanceable(
        &self,
        shard_idx: usize,
    ) -> Vec<(ChannelName, FsmPtr, CommandControl, ServerId)> {
        let state = self.state.lock();
        let mut result = Vec::new();
        for (name, record) in &state.channels {
            if let Some(info) = record.infos.get(shard_idx)
                && let Some(fsm) = &info.fsm
            {
                let guard = fsm.lock();
                if guard.can_be_rebalanced() && !guard.current_server_id().is_any() {
                    result.push((
                        ChannelName {
                            name: name.clone(),
                            pattern: false,
                        },
                        fsm.clone(),
                        record.control.clone(),
                        guard.current_server_id(),
                    ));
                }
            }
        }
        for (name, record) in &state.patterns {
            if let Some(info) = record.infos.get(shard_idx)
                && let Some(fsm) = &info.fsm
            {
                let guard = fsm.lock();
                if guard.can_be_rebalanced() && !guard.current_server_id().is_any() {
                    result.push((
                        ChannelName {
                            name: name.clone(),
                            pattern: true,
                        },
                        fsm.clone(),
                        record.control.clone(),
                        guard.current_server_id(),
                    ));
                }
            }
        }
        result
    }

    pub(crate) fn has_subscriptions(&self) -> bool {
        let state = self.state.lock();
        !state.channels.is_empty() || !state.patterns.is_empty()
    }

    pub(crate) fn send_rebalance_event(
        self: &Arc<Self>,
        fsm: &FsmPtr,
        channel_name: &ChannelName,
        control: &CommandControl,
        new_server: ServerId,
    ) {
        fsm.lock()
            .on_event(Event::new(EventKind::RebalanceRequested, new_server));
        read_actions(self, fsm, channel_name, control);
    }
}

fn payload_bytes(data: &crate::core::reply::ReplyData) -> &[u8] {
    match data {
        crate::core::reply::ReplyData::String(b) => b.as_ref(),
        _ => &[],
    }
}
