// src/core/subscription/mod.rs

//! Durable pub/sub subscriptions: per-(channel, shard) state machines, the
//! subscription catalog and the weighted rebalancer.

pub mod fsm;
pub mod rebalance;
pub mod storage;

use crate::core::command::Command;
use crate::core::types::ServerId;
use std::collections::HashMap;
use std::sync::Arc;

/// Monotonic identity of one subscription token.
pub type SubscriptionId = u64;

/// Target capacity weights for one shard's instances.
pub type ServerWeights = HashMap<ServerId, u64>;

/// Callback for channel messages: `(channel, payload)`.
pub type MessageCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback for pattern messages: `(pattern, channel, payload)`.
pub type PmessageCallback = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;

/// Sink wiring subscribe/unsubscribe commands into the dispatcher:
/// `(shard_idx, command)`.
pub type CommandSink = Box<dyn Fn(usize, Arc<Command>) + Send + Sync>;

pub use storage::{SubscriptionStorage, SubscriptionToken};
