//! Table-driven finite state machine
//!
//! Both connection endpoints are driven by the same machine shape: string
//! states, string event names, and one rule per `(state, event)` pair. A
//! rule names the next state and an action tag; the caller executes the tag
//! and may fold follow-up events into the same dispatch pass, which makes a
//! self-fired transition observable immediately after the first one.
//!
//! Dispatch must be serialized by the owner. The machine itself holds no
//! lock; the connection keeps it behind the mutex that also guards the
//! receive-state snapshot.

use std::collections::HashMap;

use tracing::warn;

use crate::ConnPacket;

/// One event presented to the machine: a name plus the decoded frame that
/// caused it, if any.
#[derive(Debug, Clone)]
pub struct Event<'a> {
    /// Event name looked up in the rule table
    pub name: &'static str,
    /// Frame that produced this event; `None` for internally fired events
    pub packet: Option<ConnPacket<'a>>,
}

impl<'a> Event<'a> {
    /// An internally fired event carrying no frame
    pub fn internal(name: &'static str) -> Self {
        Self { name, packet: None }
    }

    /// An event carrying the frame that produced it
    pub fn frame(name: &'static str, packet: ConnPacket<'a>) -> Self {
        Self {
            name,
            packet: Some(packet),
        }
    }
}

struct Rule<A> {
    to: &'static str,
    action: A,
}

/// Table-driven state machine returning action tags.
///
/// `on_event` transitions **first** and hands the action tag back **second**;
/// an event with no rule in the current state is logged and ignored rather
/// than failing the process.
pub struct Fsm<A: Copy> {
    current: &'static str,
    rules: HashMap<(&'static str, &'static str), Rule<A>>,
}

impl<A: Copy> Fsm<A> {
    /// Create a machine resting in `init`.
    pub fn new(init: &'static str) -> Self {
        Self {
            current: init,
            rules: HashMap::new(),
        }
    }

    /// Register a rule: in `from`, event `event` moves to `to` and runs `action`.
    pub fn add_rule(&mut self, from: &'static str, event: &'static str, to: &'static str, action: A) {
        self.rules.insert((from, event), Rule { to, action });
    }

    /// Present an event. Returns the action tag to execute, or `None` when
    /// the current state has no rule for it.
    pub fn on_event(&mut self, event: &'static str) -> Option<A> {
        match self.rules.get(&(self.current, event)) {
            Some(rule) => {
                self.current = rule.to;
                Some(rule.action)
            }
            None => {
                warn!("state {} has no event {}", self.current, event);
                None
            }
        }
    }

    /// Name of the current state
    pub fn current(&self) -> &'static str {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Open,
        Close,
        Nop,
    }

    fn door() -> Fsm<Action> {
        let mut fsm = Fsm::new("closed");
        fsm.add_rule("closed", "open", "opened", Action::Open);
        fsm.add_rule("opened", "close", "closed", Action::Close);
        fsm.add_rule("opened", "knock", "opened", Action::Nop);
        fsm
    }

    #[test]
    fn test_transition_then_action() {
        let mut fsm = door();
        assert_eq!(fsm.current(), "closed");

        let action = fsm.on_event("open");
        // The state has already moved by the time the action is handed back.
        assert_eq!(fsm.current(), "opened");
        assert_eq!(action, Some(Action::Open));

        assert_eq!(fsm.on_event("close"), Some(Action::Close));
        assert_eq!(fsm.current(), "closed");
    }

    #[test]
    fn test_unknown_event_ignored() {
        let mut fsm = door();
        assert_eq!(fsm.on_event("close"), None);
        assert_eq!(fsm.current(), "closed");
        // Repeating the unmatched event changes nothing either.
        assert_eq!(fsm.on_event("close"), None);
        assert_eq!(fsm.current(), "closed");
    }

    #[test]
    fn test_self_loop() {
        let mut fsm = door();
        fsm.on_event("open");
        assert_eq!(fsm.on_event("knock"), Some(Action::Nop));
        assert_eq!(fsm.current(), "opened");
    }

    #[test]
    fn test_rule_per_state_event_pair() {
        // Two rules out of the same state stay independent.
        let mut fsm = Fsm::new("a");
        fsm.add_rule("a", "x", "b", Action::Open);
        fsm.add_rule("a", "y", "c", Action::Close);

        assert_eq!(fsm.on_event("y"), Some(Action::Close));
        assert_eq!(fsm.current(), "c");
    }
}
