// src/core/command.rs

//! Commands, per-command control knobs and the attempt bookkeeping shared
//! between the dispatcher and the connection tasks.

use crate::core::reply::Reply;
use crate::core::types::ServerId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Built-in command control defaults.
pub const DEFAULT_TIMEOUT_SINGLE: Duration = Duration::from_millis(500);
pub const DEFAULT_TIMEOUT_ALL: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// How a shard picks the candidate instance set for a read command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSelectionStrategy {
    /// All instances, weighted inversely by measured ping.
    #[default]
    EveryDc,
    /// The `best_dc_count` instances with the smallest measured ping.
    NearestServerPing,
    /// Instances whose datacenter tag matches the caller's.
    LocalDcConductor,
}

/// Per-command knobs. Every field is optional; unset fields fall back to the
/// dynamic config default and then to the built-in defaults, merged with
/// [`CommandControl::merged_with`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CommandControl {
    #[serde(default, with = "humantime_serde::option")]
    pub timeout_single: Option<Duration>,
    #[serde(default, with = "humantime_serde::option")]
    pub timeout_all: Option<Duration>,
    pub max_retries: Option<u32>,
    pub strategy: Option<ServerSelectionStrategy>,
    pub best_dc_count: Option<usize>,
    pub force_request_to_master: Option<bool>,
    #[serde(default, with = "humantime_serde::option")]
    pub max_ping_latency: Option<Duration>,
    pub allow_reads_from_master: Option<bool>,
    pub account_in_statistics: Option<bool>,
    pub force_shard_idx: Option<usize>,
    pub chunk_size: Option<usize>,
    #[serde(skip)]
    pub force_server_id: Option<ServerId>,
    pub force_retries_to_master_on_nil_reply: Option<bool>,
}

impl CommandControl {
    /// Returns `self` with unset fields taken from `defaults`.
    pub fn merged_with(&self, defaults: &CommandControl) -> CommandControl {
        CommandControl {
            timeout_single: self.timeout_single.or(defaults.timeout_single),
            timeout_all: self.timeout_all.or(defaults.timeout_all),
            max_retries: self.max_retries.or(defaults.max_retries),
            strategy: self.strategy.or(defaults.strategy),
            best_dc_count: self.best_dc_count.or(defaults.best_dc_count),
            force_request_to_master: self
                .force_request_to_master
                .or(defaults.force_request_to_master),
            max_ping_latency: self.max_ping_latency.or(defaults.max_ping_latency),
            allow_reads_from_master: self
                .allow_reads_from_master
                .or(defaults.allow_reads_from_master),
            account_in_statistics: self
                .account_in_statistics
                .or(defaults.account_in_statistics),
            force_shard_idx: self.force_shard_idx.or(defaults.force_shard_idx),
            chunk_size: self.chunk_size.or(defaults.chunk_size),
            force_server_id: self.force_server_id.or(defaults.force_server_id),
            force_retries_to_master_on_nil_reply: self
                .force_retries_to_master_on_nil_reply
                .or(defaults.force_retries_to_master_on_nil_reply),
        }
    }

    pub fn timeout_single(&self) -> Duration {
        self.timeout_single.unwrap_or(DEFAULT_TIMEOUT_SINGLE)
    }

    pub fn timeout_all(&self) -> Duration {
        self.timeout_all.unwrap_or(DEFAULT_TIMEOUT_ALL)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn strategy(&self) -> ServerSelectionStrategy {
        self.strategy.unwrap_or_default()
    }
}

/// Argument lists of a submission: one entry per sub-request. Pipelines and
/// `EXEC`-terminated transactions carry several; plain commands carry one.
#[derive(Debug, Clone, Default)]
pub struct CmdArgs {
    pub commands: Vec<Vec<Bytes>>,
}

impl CmdArgs {
    pub fn new(name: &str) -> Self {
        CmdArgs {
            commands: vec![vec![Bytes::copy_from_slice(name.as_bytes())]],
        }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.commands
            .last_mut()
            .expect("CmdArgs always holds at least one sub-request")
            .push(arg.into());
        self
    }

    /// Starts a new sub-request (pipelining).
    pub fn then(mut self, name: &str) -> Self {
        self.commands
            .push(vec![Bytes::copy_from_slice(name.as_bytes())]);
        self
    }

    /// Name of the first sub-request, uppercased for reply annotation.
    pub fn command_name(&self) -> String {
        self.commands
            .first()
            .and_then(|c| c.first())
            .map(|n| String::from_utf8_lossy(n).to_uppercase())
            .unwrap_or_default()
    }

    pub fn sub_request_count(&self) -> usize {
        self.commands.len()
    }
}

/// Callback invoked with each reply to a command. Pub/sub commands receive
/// many replies over the connection lifetime; regular commands receive one
/// per sub-request.
pub type ReplyCallback = Box<dyn FnMut(Reply) + Send>;

/// One command in flight through the client.
///
/// Immutable after submission apart from the attempt bookkeeping: the
/// counter is bumped on every retry so that replies to superseded attempts
/// are recognized and dropped, and `control` shrinks its budget per attempt.
pub struct Command {
    pub args: CmdArgs,
    pub control: Mutex<CommandControl>,
    /// Attempt counter compared against the value captured at send time.
    pub counter: AtomicU32,
    /// ASK redirection in progress: the next attempt is prefixed with ASKING.
    pub asking: AtomicBool,
    /// Set once a MOVED/ASK redirect has been followed.
    pub redirected: AtomicBool,
    pub read_only: bool,
    pub start: Instant,
    /// Instance used by the previous attempt, so retries naturally spread.
    pub prev_instance: Mutex<Option<ServerId>>,
    callback: Mutex<Option<ReplyCallback>>,
}

impl Command {
    pub fn new(
        args: CmdArgs,
        control: CommandControl,
        read_only: bool,
        callback: ReplyCallback,
    ) -> Arc<Command> {
        Arc::new(Command {
            args,
            control: Mutex::new(control),
            counter: AtomicU32::new(0),
            asking: AtomicBool::new(false),
            redirected: AtomicBool::new(false),
            read_only,
            start: Instant::now(),
            prev_instance: Mutex::new(None),
            callback: Mutex::new(Some(callback)),
        })
    }

    pub fn attempt(&self) -> u32 {
        self.counter.load(Ordering::Acquire)
    }

    pub fn bump_attempt(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn command_name(&self) -> String {
        self.args.command_name()
    }

    /// Invokes the user callback, catching panics so they never poison a
    /// connection task.
    pub fn invoke(&self, reply: Reply) {
        let mut guard = self.callback.lock();
        let Some(cb) = guard.as_mut() else {
            return;
        };
        let cmd_name = reply.cmd.clone();
        if std::panic::catch_unwind(AssertUnwindSafe(|| cb(reply))).is_err() {
            warn!(cmd = %cmd_name, "panic in command callback");
        }
    }

    /// Drops the callback; any further replies are discarded.
    pub fn take_callback(&self) -> Option<ReplyCallback> {
        self.callback.lock().take()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("cmd", &self.command_name())
            .field("sub_requests", &self.args.sub_request_count())
            .field("attempt", &self.attempt())
            .finish()
    }
}
