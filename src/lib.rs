// src/lib.rs

pub mod client;
pub mod config;
pub mod core;

// Re-export
pub use crate::client::{Client, ClientBuilder, SubscriptionToken};
pub use crate::config::{ClientConfig, ClientMode};
pub use crate::core::CrimsonError;
pub use crate::core::command::{CmdArgs, CommandControl, ServerSelectionStrategy};
pub use crate::core::reply::{Reply, ReplyData, ReplyStatus};
pub use crate::core::types::{ConnectionInfo, ServerId};
