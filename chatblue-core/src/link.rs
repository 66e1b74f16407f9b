//! Connection state machine. Pure: the runtime supervisor owns one `LinkState`
//! behind a lock and performs the side effects each transition asks for.

use std::fmt;

use serde::Serialize;

use crate::error::LinkError;

/// Default attempt budget: the first try plus one role-flipped retry.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Group-owner intent bounds (Wi-Fi Direct semantics).
const GO_INTENT_MIN: u8 = 0;
const GO_INTENT_MAX: u8 = 15;

/// Hint for which side hosts the listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleIntent {
    /// Prefer to dial (group-owner intent 0).
    #[default]
    Client,
    /// Prefer to host (group-owner intent 15).
    Owner,
}

impl RoleIntent {
    /// Low intent flips to high and vice versa.
    pub fn flipped(self) -> Self {
        if self.group_owner_intent() < 8 {
            RoleIntent::Owner
        } else {
            RoleIntent::Client
        }
    }

    pub fn group_owner_intent(self) -> u8 {
        match self {
            RoleIntent::Client => GO_INTENT_MIN,
            RoleIntent::Owner => GO_INTENT_MAX,
        }
    }

    /// Intents below 8 lean client.
    pub fn from_group_owner_intent(intent: u8) -> Self {
        if intent.min(GO_INTENT_MAX) < 8 {
            RoleIntent::Client
        } else {
            RoleIntent::Owner
        }
    }
}

/// Identifies one live session. Monotonic per supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Discovering,
    AwaitingRole,
    Connecting { attempt: u32, role: RoleIntent },
    Connected { session: SessionId },
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Which worker produced a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPath {
    /// Outbound attempt (client path, or owner role negotiated by the attempt).
    Attempt,
    /// Server endpoint accepted an inbound peer.
    Accept,
}

/// What the runtime must do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, role: RoleIntent },
    GiveUp,
}

/// Side effects a `begin_connect` asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectPlan {
    pub cancel_discovery: bool,
    pub replace_session: Option<SessionId>,
}

#[derive(Debug)]
pub struct LinkState {
    state: ConnectionState,
    accepting: bool,
    max_attempts: u32,
    next_session: u64,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl LinkState {
    /// `max_attempts` is clamped to `1..=DEFAULT_MAX_ATTEMPTS`: one retry at most.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            accepting: false,
            max_attempts: max_attempts.clamp(1, DEFAULT_MAX_ATTEMPTS),
            next_session: 1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    pub fn session(&self) -> Option<SessionId> {
        match self.state {
            ConnectionState::Connected { session } => Some(session),
            _ => None,
        }
    }

    /// State to fall back to when nothing is in progress.
    fn resting(&self) -> ConnectionState {
        if self.accepting {
            ConnectionState::AwaitingRole
        } else {
            ConnectionState::Idle
        }
    }

    pub fn start_discovery(&mut self) -> Result<(), LinkError> {
        match self.state {
            ConnectionState::Idle | ConnectionState::AwaitingRole | ConnectionState::Discovering => {
                self.state = ConnectionState::Discovering;
                Ok(())
            }
            _ => Err(LinkError::Busy("discovery unavailable while connecting or connected")),
        }
    }

    /// Returns true if discovery was active.
    pub fn finish_discovery(&mut self) -> bool {
        if self.state == ConnectionState::Discovering {
            self.state = self.resting();
            true
        } else {
            false
        }
    }

    /// Open the accepting endpoint. Returns the session to replace, if any.
    pub fn start_server(&mut self) -> Option<SessionId> {
        let replaced = self.session();
        self.accepting = true;
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Connected { .. } | ConnectionState::Disconnecting
        ) {
            self.state = ConnectionState::AwaitingRole;
        }
        replaced
    }

    pub fn stop_server(&mut self) {
        self.accepting = false;
        if self.state == ConnectionState::AwaitingRole {
            self.state = ConnectionState::Idle;
        }
    }

    /// Enter `Connecting(1, Client)` from any state.
    pub fn begin_connect(&mut self) -> ConnectPlan {
        let plan = ConnectPlan {
            cancel_discovery: self.state == ConnectionState::Discovering,
            replace_session: self.session(),
        };
        self.state = ConnectionState::Connecting {
            attempt: 1,
            role: RoleIntent::default(),
        };
        plan
    }

    /// Apply the one-retry-with-role-flip policy.
    pub fn connect_failed(&mut self, retryable: bool) -> RetryDecision {
        let ConnectionState::Connecting { attempt, role } = self.state else {
            return RetryDecision::GiveUp;
        };
        if retryable && attempt < self.max_attempts {
            let next = ConnectionState::Connecting {
                attempt: attempt + 1,
                role: role.flipped(),
            };
            self.state = next;
            RetryDecision::Retry {
                attempt: attempt + 1,
                role: role.flipped(),
            }
        } else {
            self.state = self.resting();
            RetryDecision::GiveUp
        }
    }

    /// Abandon a pending attempt (disconnect or shutdown).
    pub fn cancel_connect(&mut self) -> bool {
        if matches!(self.state, ConnectionState::Connecting { .. }) {
            self.state = self.resting();
            true
        } else {
            false
        }
    }

    /// Whether a stream arriving on `path` may become the session.
    pub fn may_open(&self, path: OpenPath) -> bool {
        match (self.state, path) {
            (ConnectionState::Connecting { .. }, _) => true,
            (
                ConnectionState::Idle | ConnectionState::Discovering | ConnectionState::AwaitingRole,
                OpenPath::Accept,
            ) => self.accepting,
            _ => false,
        }
    }

    /// Install a session. The accepting endpoint closes: one connection at a time.
    pub fn open_session(&mut self, path: OpenPath) -> Result<SessionId, LinkError> {
        if !self.may_open(path) {
            return Err(LinkError::Busy("a session is already open"));
        }
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.accepting = false;
        self.state = ConnectionState::Connected { session: id };
        Ok(id)
    }

    /// Local close request. Returns the session to cancel.
    pub fn begin_disconnect(&mut self) -> Option<SessionId> {
        let id = self.session()?;
        self.state = ConnectionState::Disconnecting;
        Some(id)
    }

    pub fn finish_disconnect(&mut self) {
        if self.state == ConnectionState::Disconnecting {
            self.state = self.resting();
        }
    }

    /// Session ended on its own (EOF, I/O). Stale ids are ignored.
    pub fn session_closed(&mut self, id: SessionId) -> bool {
        if self.session() == Some(id) {
            self.state = self.resting();
            true
        } else {
            false
        }
    }

    /// Full teardown.
    pub fn reset(&mut self) {
        self.accepting = false;
        self.state = ConnectionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_flip_and_intents() {
        assert_eq!(RoleIntent::Client.flipped(), RoleIntent::Owner);
        assert_eq!(RoleIntent::Owner.flipped(), RoleIntent::Client);
        assert_eq!(RoleIntent::Client.group_owner_intent(), 0);
        assert_eq!(RoleIntent::Owner.group_owner_intent(), 15);
        assert_eq!(RoleIntent::from_group_owner_intent(7), RoleIntent::Client);
        assert_eq!(RoleIntent::from_group_owner_intent(8), RoleIntent::Owner);
        assert_eq!(RoleIntent::from_group_owner_intent(200), RoleIntent::Owner);
    }

    #[test]
    fn discovery_then_connect() {
        let mut s = LinkState::default();
        s.start_discovery().unwrap();
        assert_eq!(s.state(), ConnectionState::Discovering);
        let plan = s.begin_connect();
        assert!(plan.cancel_discovery);
        assert_eq!(plan.replace_session, None);
        assert_eq!(
            s.state(),
            ConnectionState::Connecting {
                attempt: 1,
                role: RoleIntent::Client
            }
        );
    }

    #[test]
    fn retryable_failure_retries_once_with_flip() {
        let mut s = LinkState::default();
        s.begin_connect();
        assert_eq!(
            s.connect_failed(true),
            RetryDecision::Retry {
                attempt: 2,
                role: RoleIntent::Owner
            }
        );
        assert_eq!(s.connect_failed(true), RetryDecision::GiveUp);
        assert_eq!(s.state(), ConnectionState::Idle);
    }

    #[test]
    fn fatal_failure_gives_up_immediately() {
        let mut s = LinkState::default();
        s.begin_connect();
        assert_eq!(s.connect_failed(false), RetryDecision::GiveUp);
        assert_eq!(s.state(), ConnectionState::Idle);
    }

    #[test]
    fn attempt_budget_never_exceeds_one_retry() {
        let mut s = LinkState::new(5);
        s.begin_connect();
        assert!(matches!(s.connect_failed(true), RetryDecision::Retry { attempt: 2, .. }));
        assert_eq!(s.connect_failed(true), RetryDecision::GiveUp);

        let mut s = LinkState::new(0);
        s.begin_connect();
        assert_eq!(s.connect_failed(true), RetryDecision::GiveUp);
    }

    #[test]
    fn give_up_returns_to_awaiting_role_when_server_open() {
        let mut s = LinkState::default();
        s.start_server();
        assert_eq!(s.state(), ConnectionState::AwaitingRole);
        s.begin_connect();
        s.connect_failed(false);
        assert_eq!(s.state(), ConnectionState::AwaitingRole);
    }

    #[test]
    fn at_most_one_session() {
        let mut s = LinkState::default();
        s.begin_connect();
        let id = s.open_session(OpenPath::Attempt).unwrap();
        assert_eq!(s.state(), ConnectionState::Connected { session: id });
        assert!(!s.may_open(OpenPath::Attempt));
        assert!(!s.may_open(OpenPath::Accept));
        assert!(s.open_session(OpenPath::Accept).is_err());
    }

    #[test]
    fn accept_requires_open_endpoint() {
        let mut s = LinkState::default();
        assert!(!s.may_open(OpenPath::Accept));
        s.start_server();
        let id = s.open_session(OpenPath::Accept).unwrap();
        assert!(!s.is_accepting());
        assert!(s.session_closed(id));
        assert_eq!(s.state(), ConnectionState::Idle);
    }

    #[test]
    fn connect_while_connected_replaces() {
        let mut s = LinkState::default();
        s.begin_connect();
        let first = s.open_session(OpenPath::Attempt).unwrap();
        let plan = s.begin_connect();
        assert_eq!(plan.replace_session, Some(first));
        let second = s.open_session(OpenPath::Attempt).unwrap();
        assert_ne!(first, second);
        assert!(!s.session_closed(first), "stale close must be ignored");
        assert!(s.state().is_connected());
    }

    #[test]
    fn server_start_while_connected_replaces() {
        let mut s = LinkState::default();
        s.begin_connect();
        let id = s.open_session(OpenPath::Attempt).unwrap();
        assert_eq!(s.start_server(), Some(id));
        assert_eq!(s.state(), ConnectionState::AwaitingRole);
    }

    #[test]
    fn manual_disconnect() {
        let mut s = LinkState::default();
        s.begin_connect();
        let id = s.open_session(OpenPath::Attempt).unwrap();
        assert_eq!(s.begin_disconnect(), Some(id));
        assert_eq!(s.state(), ConnectionState::Disconnecting);
        s.finish_disconnect();
        assert_eq!(s.state(), ConnectionState::Idle);
        assert_eq!(s.begin_disconnect(), None);
    }

    #[test]
    fn discovery_rejected_while_connecting() {
        let mut s = LinkState::default();
        s.begin_connect();
        assert!(matches!(s.start_discovery(), Err(LinkError::Busy(_))));
        assert!(!s.finish_discovery());
    }

    #[test]
    fn single_attempt_budget_never_retries() {
        let mut s = LinkState::new(1);
        s.begin_connect();
        assert_eq!(s.connect_failed(true), RetryDecision::GiveUp);
    }
}
