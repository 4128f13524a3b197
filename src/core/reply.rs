// src/core/reply.rs

//! Command replies as seen by retry logic and user callbacks.

use crate::core::protocol::RespFrame;
use crate::core::types::{ServerId, split_host_port};
use bytes::Bytes;
use std::time::Duration;

/// Outcome class of one command attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    /// Per-attempt or cumulative timeout.
    Timeout,
    /// No connected instance for the target shard, or the client is stopping.
    NotReady,
    /// The caller cancelled the request future.
    Cancelled,
    /// Connection-level or protocol-level failure.
    OtherError,
}

/// Parsed RESP value carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyData {
    Nil,
    String(Bytes),
    Status(String),
    Integer(i64),
    Array(Vec<ReplyData>),
    Error(String),
}

impl ReplyData {
    pub fn is_nil(&self) -> bool {
        matches!(self, ReplyData::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReplyData::Error(_))
    }

    pub fn error_text(&self) -> Option<&str> {
        match self {
            ReplyData::Error(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ReplyData]> {
        match self {
            ReplyData::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Lossy string view of scalar payloads, used for topology parsing.
    pub fn as_text(&self) -> Option<String> {
        match self {
            ReplyData::String(b) => Some(String::from_utf8_lossy(b).to_string()),
            ReplyData::Status(s) => Some(s.clone()),
            ReplyData::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ReplyData::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// True for `READONLY ...` error replies from a demoted replica.
    pub fn is_readonly_error(&self) -> bool {
        self.error_text().is_some_and(|e| e.starts_with("READONLY"))
    }

    /// True for the cluster-disabled / unknown-command answers to `CLUSTER`
    /// subcommands, used as the mode-fallback signal.
    pub fn is_non_cluster_error(&self) -> bool {
        self.error_text().is_some_and(|e| {
            e.contains("cluster support disabled")
                || (e.starts_with("ERR unknown command") && e.contains("CLUSTER"))
        })
    }
}

impl From<RespFrame> for ReplyData {
    fn from(frame: RespFrame) -> Self {
        match frame {
            RespFrame::SimpleString(s) => ReplyData::Status(s),
            RespFrame::Error(e) => ReplyData::Error(e),
            RespFrame::Integer(i) => ReplyData::Integer(i),
            RespFrame::BulkString(b) => ReplyData::String(b),
            RespFrame::Null | RespFrame::NullArray => ReplyData::Nil,
            RespFrame::Array(items) => {
                ReplyData::Array(items.into_iter().map(Into::into).collect())
            }
        }
    }
}

/// Redirection kind extracted from an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    Moved,
    Ask,
}

/// A parsed `MOVED <slot> <host:port>` / `ASK <slot> <host:port>` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub host: String,
    pub port: u16,
}

impl Redirect {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The reply to one command attempt.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: ReplyStatus,
    /// Name of the originating command ("GET", "SUBSCRIBE", ...).
    pub cmd: String,
    pub data: ReplyData,
    /// The instance that produced the reply, or `any` for synthetic replies.
    pub server_id: ServerId,
    /// Round-trip (or total, once terminal) duration.
    pub time: Duration,
    /// Error text for synthetic non-OK replies (timeouts, not-ready).
    pub status_text: String,
}

impl Reply {
    pub fn ok(cmd: String, data: ReplyData, server_id: ServerId, time: Duration) -> Self {
        Reply {
            status: ReplyStatus::Ok,
            cmd,
            data,
            server_id,
            time,
            status_text: String::new(),
        }
    }

    /// A synthetic reply carrying only a status, for timeouts and teardown.
    pub fn status_only(cmd: String, status: ReplyStatus, status_text: impl Into<String>) -> Self {
        Reply {
            status,
            cmd,
            data: ReplyData::Nil,
            server_id: ServerId::any(),
            time: Duration::ZERO,
            status_text: status_text.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// The redirection carried by this reply, if any.
    pub fn redirect(&self) -> Option<Redirect> {
        parse_redirect(self.data.error_text()?)
    }
}

/// Parses `MOVED <slot> <host>:<port>` and `ASK <slot> <host>:<port>`.
/// The host may be a bracketed IPv6 literal.
pub fn parse_redirect(error: &str) -> Option<Redirect> {
    let mut parts = error.splitn(3, ' ');
    let kind = match parts.next()? {
        "MOVED" => RedirectKind::Moved,
        "ASK" => RedirectKind::Ask,
        _ => return None,
    };
    let slot = parts.next()?.parse::<u16>().ok()?;
    let (host, port) = split_host_port(parts.next()?)?;
    Some(Redirect {
        kind,
        slot,
        host,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_moved_and_ask() {
        let moved = parse_redirect("MOVED 5 10.0.0.2:6379").unwrap();
        assert_eq!(moved.kind, RedirectKind::Moved);
        assert_eq!(moved.slot, 5);
        assert_eq!(moved.host_port(), "10.0.0.2:6379");

        let ask = parse_redirect("ASK 12182 [2001:db8::2]:7001").unwrap();
        assert_eq!(ask.kind, RedirectKind::Ask);
        assert_eq!(ask.host, "2001:db8::2");
        assert_eq!(ask.port, 7001);
    }

    #[test]
    fn ordinary_errors_are_not_redirects() {
        assert!(parse_redirect("ERR wrong number of arguments").is_none());
        assert!(parse_redirect("MOVED notaslot 10.0.0.2:6379").is_none());
        assert!(parse_redirect("MOVED 5").is_none());
    }

    #[test]
    fn classifies_special_errors() {
        let readonly = ReplyData::Error("READONLY You can't write against a read only replica.".into());
        assert!(readonly.is_readonly_error());

        let disabled = ReplyData::Error("ERR This instance has cluster support disabled".into());
        assert!(disabled.is_non_cluster_error());

        let unknown = ReplyData::Error("ERR unknown command 'CLUSTER'".into());
        assert!(unknown.is_non_cluster_error());

        assert!(!ReplyData::Error("ERR nope".into()).is_non_cluster_error());
    }
}
