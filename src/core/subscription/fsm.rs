// src/core/subscription/fsm.rs

//! The per-(channel, shard) subscription state machine.
//!
//! Events arrive from subscribe-command replies and from the storage
//! (subscribe/unsubscribe/rebalance requests); actions accumulate in a
//! pending queue the storage pops and executes after every event.

use crate::core::types::ServerId;
use std::time::Instant;
use strum_macros::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum State {
    Subscribing,
    Subscribed,
    Unsubscribing,
    RebalancingWaitSubscribe,
    RebalancingWaitUnsubscribe,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscribeRequested,
    SubscribeReplyOk,
    SubscribeReplyError,
    RebalanceRequested,
    UnsubscribeRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub server_id: ServerId,
}

impl Event {
    pub fn new(kind: EventKind, server_id: ServerId) -> Self {
        Self { kind, server_id }
    }

    pub fn requested(kind: EventKind) -> Self {
        Self {
            kind,
            server_id: ServerId::any(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Subscribe,
    Unsubscribe,
    DeleteFsm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    pub server_id: ServerId,
}

impl Action {
    fn new(kind: ActionKind, server_id: ServerId) -> Self {
        Self { kind, server_id }
    }
}

pub struct Fsm {
    shard_idx: usize,
    state: State,
    current_server_id: ServerId,
    rebalancing_server_id: ServerId,
    need_subscription: bool,
    subscribed_at: Option<Instant>,
    pending_actions: Vec<Action>,
}

impl Fsm {
    /// A new FSM immediately tries to subscribe: to anybody by default, or
    /// to the given server when one is specified.
    pub fn new(shard_idx: usize, server_id: ServerId) -> Self {
        let mut fsm = Fsm {
            shard_idx,
            state: State::Subscribing,
            current_server_id: ServerId::any(),
            rebalancing_server_id: ServerId::any(),
            need_subscription: true,
            subscribed_at: None,
            pending_actions: Vec::new(),
        };
        fsm.emit(Action::new(ActionKind::Subscribe, server_id));
        fsm
    }

    pub fn shard_idx(&self) -> usize {
        self.shard_idx
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn current_server_id(&self) -> ServerId {
        self.current_server_id
    }

    pub fn need_subscription(&self) -> bool {
        self.need_subscription
    }

    pub fn subscribed_at(&self) -> Option<Instant> {
        self.subscribed_at
    }

    pub fn can_be_rebalanced(&self) -> bool {
        self.state == State::Subscribed && self.need_subscription
    }

    pub fn pop_all_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    pub fn on_event(&mut self, event: Event) {
        debug!(
            state = %self.state,
            current = %self.current_server_id,
            rebalancing = %self.rebalancing_server_id,
            event = ?event,
            "fsm event"
        );
        match self.state {
            State::Subscribing => self.handle_subscribing(event),
            State::Subscribed => self.handle_subscribed(event),
            State::Unsubscribing => self.handle_unsubscribing(event),
            State::RebalancingWaitSubscribe => self.handle_rebalancing_wait_subscribe(event),
            State::RebalancingWaitUnsubscribe => self.handle_rebalancing_wait_unsubscribe(event),
            State::Unsubscribed => self.handle_unsubscribed(event),
        }
    }

    fn handle_subscribing(&mut self, event: Event) {
        if !self.current_server_id.is_any() || !self.rebalancing_server_id.is_any() {
            warn!("server ids must be unset while subscribing; buggy fsm?");
            return;
        }
        match event.kind {
            EventKind::SubscribeRequested => self.set_need_subscription(true),
            EventKind::SubscribeReplyOk => {
                self.subscribed_at = Some(Instant::now());
                self.current_server_id = event.server_id;
                self.change_state(State::Subscribed);
                if !self.need_subscription {
                    self.emit(Action::new(ActionKind::Unsubscribe, self.current_server_id));
                    self.change_state(State::Unsubscribing);
                }
            }
            EventKind::SubscribeReplyError => {
                if self.need_subscription {
                    // Stubborn: try again against any server.
                    self.change_state(State::Subscribing);
                    warn!(server_id = %event.server_id, "subscription failed, retrying on any server");
                    self.emit(Action::new(ActionKind::Subscribe, ServerId::any()));
                } else {
                    self.change_state(State::Unsubscribed);
                    self.emit(Action::new(ActionKind::DeleteFsm, ServerId::any()));
                }
            }
            EventKind::RebalanceRequested => {
                warn!("ignoring rebalance request while subscribing");
            }
            EventKind::UnsubscribeRequested => self.set_need_subscription(false),
        }
    }

    fn handle_subscribed(&mut self, event: Event) {
        if self.current_server_id.is_any()
            || !self.rebalancing_server_id.is_any()
            || !self.need_subscription
        {
            warn!("invalid subscribed-state invariants; buggy fsm?");
            return;
        }
        match event.kind {
            EventKind::SubscribeRequested => {
                warn!("subscribe requested while already subscribed");
            }
            EventKind::SubscribeReplyOk => {
                if event.server_id != self.current_server_id {
                    self.handle_ok_reply_from_other_server(event.server_id);
                } else {
                    warn!(server_id = %event.server_id, "duplicate OK subscribe reply");
                    self.subscribed_at = Some(Instant::now());
                }
            }
            EventKind::SubscribeReplyError => {
                if event.server_id == self.current_server_id {
                    // Reset the current instance; reconnect anywhere.
                    self.current_server_id = ServerId::any();
                    self.change_state(State::Subscribing);
                    self.emit(Action::new(ActionKind::Subscribe, ServerId::any()));
                } else {
                    self.handle_error_reply_from_other_server(event.server_id);
                }
            }
            EventKind::RebalanceRequested => {
                if event.server_id != self.current_server_id {
                    self.rebalancing_server_id = event.server_id;
                    self.change_state(State::RebalancingWaitSubscribe);
                    self.emit(Action::new(ActionKind::Subscribe, self.rebalancing_server_id));
                } else {
                    warn!(server_id = %event.server_id, "rebalance to the current server ignored");
                }
            }
            EventKind::UnsubscribeRequested => {
                self.set_need_subscription(false);
                self.emit(Action::new(ActionKind::Unsubscribe, self.current_server_id));
                self.change_state(State::Unsubscribing);
            }
        }
    }

    fn handle_unsubscribing(&mut self, event: Event) {
        if self.current_server_id.is_any() || !self.rebalancing_server_id.is_any() {
            warn!("invalid unsubscribing-state invariants; buggy fsm?");
            return;
        }
        match event.kind {
            EventKind::SubscribeRequested => self.set_need_subscription(true),
            EventKind::SubscribeReplyOk => {
                if event.server_id != self.current_server_id {
                    self.handle_ok_reply_from_other_server(event.server_id);
                } else {
                    warn!(server_id = %event.server_id, "duplicate OK subscribe reply");
                    self.subscribed_at = Some(Instant::now());
                }
            }
            EventKind::SubscribeReplyError => {
                if event.server_id == self.current_server_id {
                    self.current_server_id = ServerId::any();
                    if self.need_subscription {
                        self.change_state(State::Subscribing);
                        self.emit(Action::new(ActionKind::Subscribe, ServerId::any()));
                    } else {
                        self.change_state(State::Unsubscribed);
                        self.emit(Action::new(ActionKind::DeleteFsm, ServerId::any()));
                    }
                } else {
                    self.handle_error_reply_from_other_server(event.server_id);
                }
            }
            EventKind::RebalanceRequested => {
                warn!("ignoring rebalance request while unsubscribing");
            }
            EventKind::UnsubscribeRequested => self.set_need_subscription(false),
        }
    }

    fn handle_rebalancing_wait_subscribe(&mut self, event: Event) {
        if self.current_server_id.is_any() || self.rebalancing_server_id.is_any() {
            warn!("invalid rebalancing-state invariants; buggy fsm?");
            return;
        }
        match event.kind {
            EventKind::SubscribeRequested => self.set_need_subscription(true),
            EventKind::SubscribeReplyOk => {
                if event.server_id == self.current_server_id {
                    warn!(server_id = %event.server_id, "OK subscribe reply from an already-subscribed server");
                } else if event.server_id == self.rebalancing_server_id {
                    self.subscribed_at = Some(Instant::now());
                    debug!(server_id = %event.server_id, "subscribed after rebalancing");
                    std::mem::swap(
                        &mut self.current_server_id,
                        &mut self.rebalancing_server_id,
                    );
                    self.emit(Action::new(
                        ActionKind::Unsubscribe,
                        self.rebalancing_server_id,
                    ));
                    // No subscribe request may be issued until the old
                    // server confirms the unsubscription.
                    self.change_state(State::RebalancingWaitUnsubscribe);
                } else {
                    self.handle_ok_reply_from_other_server(event.server_id);
                }
            }
            EventKind::SubscribeReplyError => {
                if event.server_id == self.current_server_id {
                    self.current_server_id = ServerId::any();
                    self.rebalancing_server_id = ServerId::any();
                    self.change_state(State::Subscribing);
                } else if event.server_id == self.rebalancing_server_id {
                    warn!(server_id = %self.rebalancing_server_id, "rebalance subscription failed");
                    self.rebalancing_server_id = ServerId::any();
                    self.change_state(State::Subscribed);
                    if !self.need_subscription {
                        self.emit(Action::new(ActionKind::Unsubscribe, self.current_server_id));
                        self.change_state(State::Unsubscribing);
                    }
                } else {
                    self.handle_error_reply_from_other_server(event.server_id);
                }
            }
            EventKind::RebalanceRequested => {
                info!(state = %self.state, "ignoring rebalance request");
            }
            EventKind::UnsubscribeRequested => self.set_need_subscription(false),
        }
    }

    fn handle_rebalancing_wait_unsubscribe(&mut self, event: Event) {
        if self.current_server_id.is_any() || self.rebalancing_server_id.is_any() {
            warn!("invalid rebalancing-state invariants; buggy fsm?");
            return;
        }
        match event.kind {
            EventKind::SubscribeRequested => self.set_need_subscription(true),
            EventKind::SubscribeReplyOk => {
                if event.server_id == self.current_server_id
                    || event.server_id == self.rebalancing_server_id
                {
                    warn!(server_id = %event.server_id, "OK subscribe reply from an already-subscribed server");
                } else {
                    self.handle_ok_reply_from_other_server(event.server_id);
                }
            }
            EventKind::SubscribeReplyError => {
                if event.server_id == self.current_server_id {
                    // Adopt the rebalancing target; still waiting for an
                    // unsubscribe confirmation, now from it.
                    self.current_server_id = self.rebalancing_server_id;
                    self.rebalancing_server_id = ServerId::any();
                    self.change_state(State::Unsubscribing);
                } else if event.server_id == self.rebalancing_server_id {
                    self.rebalancing_server_id = ServerId::any();
                    self.change_state(State::Subscribed);
                    if !self.need_subscription {
                        self.emit(Action::new(ActionKind::Unsubscribe, self.current_server_id));
                        self.change_state(State::Unsubscribing);
                    }
                } else {
                    self.handle_error_reply_from_other_server(event.server_id);
                }
            }
            EventKind::RebalanceRequested => {
                info!(state = %self.state, "ignoring rebalance request");
            }
            EventKind::UnsubscribeRequested => self.set_need_subscription(false),
        }
    }

    fn handle_unsubscribed(&mut self, event: Event) {
        if !self.current_server_id.is_any()
            || !self.rebalancing_server_id.is_any()
            || self.need_subscription
        {
            warn!("invalid unsubscribed-state invariants; buggy fsm?");
            return;
        }
        match event.kind {
            EventKind::SubscribeRequested => {
                self.set_need_subscription(true);
                self.emit(Action::new(ActionKind::Subscribe, ServerId::any()));
                self.change_state(State::Subscribing);
            }
            EventKind::SubscribeReplyOk => self.handle_ok_reply_from_other_server(event.server_id),
            EventKind::SubscribeReplyError => {
                self.handle_error_reply_from_other_server(event.server_id)
            }
            EventKind::RebalanceRequested => {
                info!(state = %self.state, "ignoring rebalance request");
            }
            EventKind::UnsubscribeRequested => {
                warn!("unsubscribe requested while already unsubscribed");
            }
        }
    }

    /// Stray subscriber cleanup: a confirmation from a server we never chose
    /// gets an immediate unsubscribe.
    fn handle_ok_reply_from_other_server(&mut self, other: ServerId) {
        warn!(
            other = %other,
            current = %self.current_server_id,
            rebalancing = %self.rebalancing_server_id,
            "OK subscribe reply from an unexpected server, unsubscribing from it"
        );
        self.emit(Action::new(ActionKind::Unsubscribe, other));
    }

    fn handle_error_reply_from_other_server(&mut self, other: ServerId) {
        warn!(
            other = %other,
            current = %self.current_server_id,
            rebalancing = %self.rebalancing_server_id,
            "error subscribe reply from an unexpected server, ignoring"
        );
    }

    fn set_need_subscription(&mut self, need: bool) {
        if self.need_subscription == need {
            return;
        }
        self.need_subscription = need;
        info!(need, state = %self.state, "fsm need_subscription switched");
    }

    fn emit(&mut self, action: Action) {
        debug!(action = ?action, "emitting fsm action");
        self.pending_actions.push(action);
    }

    fn change_state(&mut self, new_state: State) {
        info!(
            from = %self.state,
            to = %new_state,
            need = self.need_subscription,
            "fsm state switch"
        );
        self.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(raw: i64) -> ServerId {
        ServerId::from_raw(raw)
    }

    fn drain(fsm: &mut Fsm) -> Vec<Action> {
        fsm.pop_all_pending_actions()
    }

    #[test]
    fn fresh_fsm_subscribes_to_any() {
        let mut fsm = Fsm::new(0, ServerId::any());
        let actions = drain(&mut fsm);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Subscribe);
        assert!(actions[0].server_id.is_any());
        assert_eq!(fsm.state(), State::Subscribing);
    }

    #[test]
    fn subscribe_ok_records_server() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(7)));
        assert_eq!(fsm.state(), State::Subscribed);
        assert_eq!(fsm.current_server_id(), server(7));
        assert!(fsm.can_be_rebalanced());
        assert!(fsm.subscribed_at().is_some());
        assert!(drain(&mut fsm).is_empty());
    }

    #[test]
    fn subscribe_ok_without_need_unsubscribes_immediately() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::requested(EventKind::UnsubscribeRequested));
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(7)));
        assert_eq!(fsm.state(), State::Unsubscribing);
        let actions = drain(&mut fsm);
        assert_eq!(actions, vec![Action::new(ActionKind::Unsubscribe, server(7))]);
    }

    #[test]
    fn subscribe_error_retries_while_needed() {
        let mut fsm = Fsm::new(0, server(3));
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(3)));
        assert_eq!(fsm.state(), State::Subscribing);
        let actions = drain(&mut fsm);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Subscribe);
        assert!(actions[0].server_id.is_any());
    }

    #[test]
    fn subscribe_error_without_need_deletes_fsm() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::requested(EventKind::UnsubscribeRequested));
        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(3)));
        assert_eq!(fsm.state(), State::Unsubscribed);
        let actions = drain(&mut fsm);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::DeleteFsm);
    }

    #[test]
    fn full_rebalance_round_trip() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(1)));
        drain(&mut fsm);

        fsm.on_event(Event::new(EventKind::RebalanceRequested, server(2)));
        assert_eq!(fsm.state(), State::RebalancingWaitSubscribe);
        assert_eq!(
            drain(&mut fsm),
            vec![Action::new(ActionKind::Subscribe, server(2))]
        );

        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(2)));
        assert_eq!(fsm.state(), State::RebalancingWaitUnsubscribe);
        assert_eq!(fsm.current_server_id(), server(2));
        assert_eq!(
            drain(&mut fsm),
            vec![Action::new(ActionKind::Unsubscribe, server(1))]
        );

        // Unsubscribe confirmations arrive as error events from the old id.
        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(1)));
        assert_eq!(fsm.state(), State::Subscribed);
        assert_eq!(fsm.current_server_id(), server(2));
        assert!(drain(&mut fsm).is_empty());
    }

    #[test]
    fn rebalance_subscribe_failure_keeps_current() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(1)));
        fsm.on_event(Event::new(EventKind::RebalanceRequested, server(2)));
        drain(&mut fsm);

        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(2)));
        assert_eq!(fsm.state(), State::Subscribed);
        assert_eq!(fsm.current_server_id(), server(1));
        assert!(drain(&mut fsm).is_empty());
    }

    #[test]
    fn losing_current_during_rebalance_adopts_target() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(1)));
        fsm.on_event(Event::new(EventKind::RebalanceRequested, server(2)));
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(2)));
        drain(&mut fsm);

        // Current (old server 1 is now rebalancing after the swap): losing
        // the new current adopts the pending unsubscribe target.
        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(2)));
        assert_eq!(fsm.state(), State::Unsubscribing);
        assert_eq!(fsm.current_server_id(), server(1));
    }

    #[test]
    fn stray_subscriber_is_cleaned_up() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(1)));
        drain(&mut fsm);

        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(9)));
        let actions = drain(&mut fsm);
        assert_eq!(actions, vec![Action::new(ActionKind::Unsubscribe, server(9))]);
        assert_eq!(fsm.state(), State::Subscribed);
        assert_eq!(fsm.current_server_id(), server(1));
    }

    #[test]
    fn rebalance_ignored_outside_subscribed() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::RebalanceRequested, server(5)));
        assert_eq!(fsm.state(), State::Subscribing);
        assert!(drain(&mut fsm).is_empty());
        assert!(!fsm.can_be_rebalanced());
    }

    #[test]
    fn resubscribe_after_unsubscribed() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::requested(EventKind::UnsubscribeRequested));
        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(1)));
        assert_eq!(fsm.state(), State::Unsubscribed);
        drain(&mut fsm);

        fsm.on_event(Event::requested(EventKind::SubscribeRequested));
        assert_eq!(fsm.state(), State::Subscribing);
        let actions = drain(&mut fsm);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, ActionKind::Subscribe);
    }

    /// Liveness: from a mid-rebalance state, non-rebalance events drive the
    /// machine to Subscribed or Unsubscribed.
    #[test]
    fn drives_to_terminal_state() {
        let mut fsm = Fsm::new(0, ServerId::any());
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyOk, server(1)));
        fsm.on_event(Event::new(EventKind::RebalanceRequested, server(2)));
        drain(&mut fsm);

        fsm.on_event(Event::requested(EventKind::UnsubscribeRequested));
        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(2)));
        assert_eq!(fsm.state(), State::Unsubscribing);
        drain(&mut fsm);
        fsm.on_event(Event::new(EventKind::SubscribeReplyError, server(1)));
        assert_eq!(fsm.state(), State::Unsubscribed);
        assert!(!fsm.need_subscription());
    }
}
