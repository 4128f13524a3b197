// src/core/protocol/mod.rs

//! RESP (REdis Serialization Protocol) framing for the client connections.

pub mod resp_frame;

pub use resp_frame::{RespFrame, RespFrameCodec};
