// src/core/dispatcher.rs

//! The command dispatcher: routes submissions to shards, enforces retry
//! budgets, follows MOVED/ASK redirections and parks commands that cannot be
//! placed yet in a waiting queue.

use crate::core::command::{CmdArgs, Command, CommandControl};
use crate::core::keyshard::{KeyShard, hash_slot};
use crate::core::reply::{RedirectKind, Reply, ReplyStatus};
use crate::core::request::RequestFuture;
use crate::core::stats::SharedClientStats;
use crate::core::topology::TopologyHolder;
use crate::core::types::ServerId;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Where a submission should land.
#[derive(Debug, Clone)]
pub enum Target {
    Shard(usize),
    Key(Bytes),
}

struct WaitingCommand {
    cmd: Arc<Command>,
    target: Target,
    master: bool,
}

pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    holder: RwLock<Arc<dyn TopologyHolder>>,
    /// Key router for sentinel deployments; `None` routes by cluster slots.
    key_shard: RwLock<Option<Arc<dyn KeyShard>>>,
    default_control: RwLock<CommandControl>,
    waiting: Mutex<Vec<WaitingCommand>>,
    stopped: AtomicBool,
    stopped_tx: tokio::sync::watch::Sender<bool>,
    stats: SharedClientStats,
}

impl Dispatcher {
    pub fn new(
        holder: Arc<dyn TopologyHolder>,
        key_shard: Option<Arc<dyn KeyShard>>,
        default_control: CommandControl,
        stats: SharedClientStats,
    ) -> Self {
        let (stopped_tx, _) = tokio::sync::watch::channel(false);
        Self {
            inner: Arc::new(DispatcherInner {
                holder: RwLock::new(holder),
                key_shard: RwLock::new(key_shard),
                default_control: RwLock::new(default_control),
                waiting: Mutex::new(Vec::new()),
                stopped: AtomicBool::new(false),
                stopped_tx,
                stats,
            }),
        }
    }

    /// Spawns the waiting-commands tick. Also reprocesses the queue after
    /// every topology publish.
    pub fn start(&self, waiting_interval: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(waiting_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stopped = inner.stopped_tx.subscribe();
            loop {
                // Re-subscribe each round so a swapped holder is followed.
                let mut version_rx = inner.holder.read().version_watch();
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = version_rx.changed() => {}
                    _ = stopped.changed() => return,
                }
                if inner.stopped.load(Ordering::Acquire) {
                    return;
                }
                inner.process_waiting_commands();
            }
        });
    }

    pub fn stats(&self) -> &SharedClientStats {
        &self.inner.stats
    }

    pub fn topology_holder(&self) -> Arc<dyn TopologyHolder> {
        self.inner.holder.read().clone()
    }

    /// Atomically replaces the topology holder (mode switch). Parked
    /// commands are re-resolved against the new holder on the next tick.
    pub fn swap_holder(
        &self,
        holder: Arc<dyn TopologyHolder>,
        key_shard: Option<Arc<dyn KeyShard>>,
    ) -> Arc<dyn TopologyHolder> {
        *self.inner.key_shard.write() = key_shard;
        let old = std::mem::replace(&mut *self.inner.holder.write(), holder);
        self.inner.process_waiting_commands();
        old
    }

    pub fn set_config_default_command_control(&self, control: CommandControl) {
        *self.inner.default_control.write() = control;
    }

    pub fn default_command_control(&self) -> CommandControl {
        self.inner.default_control.read().clone()
    }

    /// Resolves the shard for a key under the current routing function.
    pub fn shard_by_key(&self, key: &[u8]) -> Option<usize> {
        self.inner.shard_by_key(key)
    }

    pub fn shards_count(&self) -> usize {
        let key_shard = self.inner.key_shard.read();
        match key_shard.as_ref() {
            Some(ks) => ks.shards_count(),
            None => self.inner.holder.read().topology().shards_count(),
        }
    }

    /// Verifies that all keys route to one shard and returns it.
    pub fn shard_for_keys<'a, I>(&self, keys: I) -> Result<usize, crate::core::CrimsonError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut shard = None;
        for key in keys {
            let key_shard = self
                .shard_by_key(key)
                .ok_or(crate::core::CrimsonError::Internal(
                    "no shard for key".into(),
                ))?;
            match shard {
                None => shard = Some(key_shard),
                Some(existing) if existing == key_shard => {}
                Some(_) => return Err(crate::core::CrimsonError::CrossShard),
            }
        }
        shard.ok_or(crate::core::CrimsonError::Internal("no keys given".into()))
    }

    /// Submits a command and returns its future. The caller-provided
    /// control wins over the config default, which wins over the built-ins.
    pub fn request(
        &self,
        args: CmdArgs,
        target: Target,
        master: bool,
        control: Option<CommandControl>,
    ) -> RequestFuture {
        let control = control
            .unwrap_or_default()
            .merged_with(&self.inner.default_control.read());
        let sub_requests = args.sub_request_count().max(1);
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let mut seen = 0usize;
        let cmd = Command::new(
            args,
            control,
            !master,
            Box::new(move |reply| {
                // Pipelined submissions resolve with their last sub-reply.
                seen += 1;
                if seen >= sub_requests
                    && let Some(tx) = tx.take()
                {
                    let _ = tx.send(reply);
                }
            }),
        );
        let future = RequestFuture::new(rx, cmd.clone());
        self.send_command(cmd, target, master);
        future
    }

    /// Submits a prepared command (used by the subscription storage, which
    /// owns its callbacks and forces concrete servers).
    pub fn send_command(&self, cmd: Arc<Command>, target: Target, master: bool) {
        if self.inner.stopped.load(Ordering::Acquire) {
            self.inner.complete_not_ready(&cmd, "client is stopped");
            return;
        }
        if !self.inner.try_send(&cmd, &target, master, None) {
            self.inner.park(cmd, target, master);
        }
    }

    /// Fails parked commands and rejects further submissions.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.stopped_tx.send_replace(true);
        let drained: Vec<WaitingCommand> = self.inner.waiting.lock().drain(..).collect();
        for waiting in drained {
            self.inner.complete_not_ready(
                &waiting.cmd,
                "stopping, killing commands remaining in send queue",
            );
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl DispatcherInner {
    fn shard_by_key(&self, key: &[u8]) -> Option<usize> {
        let key_shard = self.key_shard.read();
        match key_shard.as_ref() {
            Some(ks) => Some(ks.shard_by_key(key)),
            None => {
                let topology = self.holder.read().topology();
                topology.shard_by_slot(hash_slot(key))
            }
        }
    }

    fn resolve_target(&self, target: &Target) -> Option<usize> {
        match target {
            Target::Shard(idx) => Some(*idx),
            Target::Key(key) => self.shard_by_key(key),
        }
    }

    /// One dispatch attempt. Builds the per-attempt wrapper whose callback
    /// applies the retry policy, then asks the shard to place it.
    fn try_send(
        self: &Arc<Self>,
        cmd: &Arc<Command>,
        target: &Target,
        master: bool,
        force_server: Option<ServerId>,
    ) -> bool {
        let mut control = cmd.control.lock().clone();
        control.force_server_id = force_server.or(control.force_server_id);

        let Some(shard_idx) = control
            .force_shard_idx
            .or_else(|| self.resolve_target(target))
        else {
            return false;
        };

        let topology = self.holder.read().topology();
        let Some(shard) = topology.shards.get(shard_idx) else {
            return false;
        };

        let wrapped = self.make_attempt(cmd, shard_idx, master, &control);
        *wrapped.prev_instance.lock() = *cmd.prev_instance.lock();
        if !shard.send(wrapped.clone(), master, &control) {
            return false;
        }
        *cmd.prev_instance.lock() = *wrapped.prev_instance.lock();
        true
    }

    fn make_attempt(
        self: &Arc<Self>,
        cmd: &Arc<Command>,
        shard_idx: usize,
        master: bool,
        control: &CommandControl,
    ) -> Arc<Command> {
        let inner = self.clone();
        let user = cmd.clone();
        let counter_at_send = cmd.attempt();
        let wrapped = Command::new(
            cmd.args.clone(),
            control.clone(),
            cmd.read_only,
            Box::new(move |reply| {
                inner.on_reply(&user, shard_idx, master, counter_at_send, reply);
            }),
        );
        wrapped
            .asking
            .store(cmd.asking.load(Ordering::Acquire), Ordering::Release);
        wrapped
    }

    /// The reply handler: stale drop, redirect handling, retry budget
    /// arithmetic, terminal surfacing.
    fn on_reply(
        self: &Arc<Self>,
        cmd: &Arc<Command>,
        shard_idx: usize,
        master: bool,
        counter_at_send: u32,
        mut reply: Reply,
    ) {
        if counter_at_send != cmd.attempt() {
            // A newer attempt superseded this reply.
            return;
        }
        let now = Instant::now();
        let control = cmd.control.lock().clone();

        let redirect = reply.redirect();
        let readonly_error = reply.data.is_readonly_error();
        let unusable_error = reply
            .data
            .error_text()
            .is_some_and(|e| e.contains("unusable instance"));
        let nil_from_replica = reply.is_ok()
            && reply.data.is_nil()
            && cmd.read_only
            && !master
            && control.force_retries_to_master_on_nil_reply.unwrap_or(false);

        let retryable = !reply.is_ok()
            || redirect.is_some()
            || readonly_error
            || unusable_error
            || nil_from_replica;

        if retryable {
            let mut new_shard = shard_idx;
            let mut new_master = master;
            let mut force_server = None;
            let mut first_redirect = false;

            if let Some(redirect) = &redirect {
                let holder = self.holder.read().clone();
                if redirect.kind == RedirectKind::Moved {
                    // Debounced inside the holder.
                    holder.request_topology_update();
                }
                let target = holder.redirect_target(&redirect.host_port());
                if let Some(idx) = target.shard_idx {
                    new_shard = idx;
                }
                force_server = target.server_id;
                if redirect.kind == RedirectKind::Ask {
                    cmd.asking.store(true, Ordering::Release);
                }
                first_redirect = !cmd.redirected.swap(true, Ordering::AcqRel);
                // A MOVED that resolves back to the same shard means our
                // replica view is stale; go to the master.
                if redirect.kind == RedirectKind::Moved && new_shard == shard_idx {
                    new_master = true;
                }
                debug!(
                    cmd = %reply.cmd,
                    kind = ?redirect.kind,
                    slot = redirect.slot,
                    to = %redirect.host_port(),
                    "following redirect"
                );
            }
            if readonly_error || nil_from_replica {
                new_master = true;
            }

            let until = cmd.start + control.timeout_all();
            if now < until && control.max_retries() > 1 {
                let timeout_all = until - now;
                // The first redirect preserves the retry budget.
                let consumed = u32::from(!(redirect.is_some() && first_redirect));
                {
                    let mut stored = cmd.control.lock();
                    stored.timeout_single = Some(control.timeout_single().min(timeout_all));
                    stored.timeout_all = Some(timeout_all);
                    stored.max_retries = Some(control.max_retries() - consumed);
                }
                cmd.bump_attempt();
                self.account_retry(shard_idx, &control);

                if !self.try_send(cmd, &Target::Shard(new_shard), new_master, force_server) {
                    self.park(cmd.clone(), Target::Shard(new_shard), new_master);
                }
                return;
            }
        }

        reply.time = now - cmd.start;
        self.account_terminal(shard_idx, &reply, &control);
        cmd.invoke(reply);
    }

    fn account_retry(&self, shard_idx: usize, control: &CommandControl) {
        if control.account_in_statistics == Some(false) {
            return;
        }
        let topology = self.holder.read().topology();
        if let Some(shard) = topology.shards.get(shard_idx) {
            shard.stats().retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn account_terminal(&self, shard_idx: usize, reply: &Reply, control: &CommandControl) {
        if control.account_in_statistics == Some(false) {
            return;
        }
        let topology = self.holder.read().topology();
        if let Some(shard) = topology.shards.get(shard_idx) {
            match reply.status {
                ReplyStatus::Timeout => {
                    shard.stats().timeouts.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    shard.stats().completed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn park(&self, cmd: Arc<Command>, target: Target, master: bool) {
        if self.stopped.load(Ordering::Acquire) {
            self.complete_not_ready(&cmd, "client is stopped");
            return;
        }
        debug!(cmd = %cmd.command_name(), "no instance available, parking command");
        self.stats.dispatcher.queued.fetch_add(1, Ordering::Relaxed);
        self.waiting.lock().push(WaitingCommand {
            cmd,
            target,
            master,
        });
    }

    /// Retries parked commands; expires the ones whose total budget is gone.
    fn process_waiting_commands(self: &Arc<Self>) {
        let drained: Vec<WaitingCommand> = {
            let mut waiting = self.waiting.lock();
            waiting.drain(..).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "processing waiting commands");
        }

        let now = Instant::now();
        for waiting in drained {
            let timeout_all = waiting.cmd.control.lock().timeout_all();
            if waiting.cmd.start + timeout_all < now {
                self.complete_timed_out(&waiting.cmd, "command in the send queue timed out");
                continue;
            }
            if !self.try_send(&waiting.cmd, &waiting.target, waiting.master, None) {
                self.waiting.lock().push(waiting);
            }
        }
    }

    fn complete_not_ready(&self, cmd: &Arc<Command>, text: &str) {
        self.stats
            .dispatcher
            .not_ready
            .fetch_add(1, Ordering::Relaxed);
        for args in &cmd.args.commands {
            let name = args
                .first()
                .map(|n| String::from_utf8_lossy(n).to_uppercase())
                .unwrap_or_default();
            cmd.invoke(Reply::status_only(name, ReplyStatus::NotReady, text));
        }
    }

    fn complete_timed_out(&self, cmd: &Arc<Command>, text: &str) {
        warn!(cmd = %cmd.command_name(), "waiting command timed out");
        for args in &cmd.args.commands {
            let name = args
                .first()
                .map(|n| String::from_utf8_lossy(n).to_uppercase())
                .unwrap_or_default();
            cmd.invoke(Reply::status_only(name, ReplyStatus::Timeout, text));
        }
    }
}
