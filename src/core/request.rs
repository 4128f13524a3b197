// src/core/request.rs

//! The caller-facing request future: awaitable, cancellable, deadline-aware.

use crate::core::command::Command;
use crate::core::reply::{Reply, ReplyStatus};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Future for one submitted command. Resolves with the terminal [`Reply`].
///
/// Cancellation completes the future with [`ReplyStatus::Cancelled`]; the
/// in-flight command is not interrupted, but its reply is discarded against
/// the attempt counter.
pub struct RequestFuture {
    rx: Option<oneshot::Receiver<Reply>>,
    cmd: Arc<Command>,
    cmd_name: String,
}

impl RequestFuture {
    pub(crate) fn new(rx: oneshot::Receiver<Reply>, cmd: Arc<Command>) -> Self {
        let cmd_name = cmd.command_name();
        Self {
            rx: Some(rx),
            cmd,
            cmd_name,
        }
    }

    /// Cancels the request. Any in-flight reply becomes stale and is
    /// dropped; awaiting the future afterwards yields a cancelled reply.
    pub fn cancel(&mut self) {
        if self.rx.take().is_some() {
            self.cmd.bump_attempt();
            drop(self.cmd.take_callback());
        }
    }

    /// Awaits the reply for at most `limit`, cancelling on expiry.
    pub async fn wait_for(mut self, limit: Duration) -> Reply {
        match tokio::time::timeout(limit, &mut self).await {
            Ok(reply) => reply,
            Err(_) => {
                self.cancel();
                Reply::status_only(
                    self.cmd_name.clone(),
                    ReplyStatus::Cancelled,
                    "request wait deadline reached",
                )
            }
        }
    }

    fn cancelled_reply(&self) -> Reply {
        Reply::status_only(
            self.cmd_name.clone(),
            ReplyStatus::Cancelled,
            "request cancelled",
        )
    }
}

impl Future for RequestFuture {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(self.cancelled_reply());
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(Reply::status_only(
                self.cmd_name.clone(),
                ReplyStatus::NotReady,
                "request dropped before completion",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}
