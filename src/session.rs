//! Sans-I/O gateway session state machine.
//!
//! [`ShardMachine`] consumes decoded gateway events and transport
//! notifications and answers with [`Action`]s for the shard task to carry out.
//! It never touches a socket or a clock, so every transition is unit tested
//! here without a network.

use crate::close::CloseReason;
use crate::config::GatewayConfig;
use crate::dispatch::DispatchEvent;
use crate::payload::{
    GatewayCommand, GatewayEvent, Identify, IdentifyProperties, Intents, PresenceUpdate, Resume,
};
use crate::token::Token;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardState {
    /// Not connected, not trying to
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open, waiting for hello
    AwaitingHello,
    /// Identify sent, waiting for the first dispatch
    Identifying,
    /// Resume sent, waiting for the first dispatch
    Resuming,
    /// Session established
    Connected,
    /// Transport is being closed
    Closing,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardState::Disconnected => "disconnected",
            ShardState::Connecting => "connecting",
            ShardState::AwaitingHello => "awaiting_hello",
            ShardState::Identifying => "identifying",
            ShardState::Resuming => "resuming",
            ShardState::Connected => "connected",
            ShardState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// A server-side session that can be resumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Session id from READY
    pub id: String,
    /// Sequence of the last dispatch delivered
    pub sequence: Option<u64>,
    /// Gateway URL to reconnect to when resuming
    pub resume_url: Option<String>,
}

/// Work for the shard task
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Write a command to the socket
    Send(GatewayCommand),
    /// Hello arrived: arm the heartbeat timer with this interval
    Hello(Duration),
    /// Record a heartbeat ack
    HeartbeatAck,
    /// The session is established
    Connected { resumed: bool },
    /// Forward a dispatch to the owner
    Dispatch(DispatchEvent),
    /// Close the socket with this reason's code, then call
    /// [`ShardMachine::transport_closed`]
    Close(CloseReason),
}

/// What happens after the transport closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Stay disconnected
    Stop { reason: CloseReason },
    /// Reconnect; `resume` says whether the stored session will be resumed
    Reconnect { reason: CloseReason, resume: bool },
    /// The owner decides through [`ShardMachine::authorize_reconnect`]
    AskOwner { reason: CloseReason },
}

#[derive(Debug, Clone, Copy)]
struct PendingClose {
    reason: CloseReason,
    /// Reconnect and resume without asking the owner
    forced_resume: bool,
}

/// Close code used when the session must survive the close
const RESUMABLE_CLOSE: CloseReason = CloseReason::UnknownError;

/// Identify and resume state for one shard
#[derive(Debug)]
pub struct ShardMachine {
    shard_id: u32,
    shard_count: u32,
    token: Token,
    intents: Intents,
    large_threshold: Option<u8>,
    properties: IdentifyProperties,
    presence: Option<PresenceUpdate>,

    state: ShardState,
    session: Option<Session>,
    pending_close: Option<PendingClose>,
    stop_requested: bool,
}

impl ShardMachine {
    pub fn new(shard_id: u32, shard_count: u32, config: &GatewayConfig) -> Self {
        Self {
            shard_id,
            shard_count,
            token: config.token.clone(),
            intents: config.intents,
            large_threshold: config.large_threshold,
            properties: IdentifyProperties::default(),
            presence: None,
            state: ShardState::Disconnected,
            session: None,
            pending_close: None,
            stop_requested: false,
        }
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Sequence of the last dispatch delivered in the current session
    pub fn sequence(&self) -> Option<u64> {
        self.session.as_ref().and_then(|s| s.sequence)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Presence sent with every later identify
    pub fn set_presence(&mut self, presence: PresenceUpdate) {
        self.presence = Some(presence);
    }

    /// Heartbeat carrying the last sequence
    pub fn heartbeat(&self) -> GatewayCommand {
        GatewayCommand::Heartbeat(self.sequence())
    }

    fn identify(&self) -> GatewayCommand {
        GatewayCommand::Identify(Box::new(Identify {
            token: self.token.secret().to_string(),
            properties: self.properties.clone(),
            compress: false,
            large_threshold: self.large_threshold,
            shard: [self.shard_id, self.shard_count],
            presence: self.presence.clone(),
            intents: self.intents,
        }))
    }

    /// The transport is being opened
    pub fn begin_connect(&mut self) {
        self.state = ShardState::Connecting;
        self.pending_close = None;
    }

    /// The transport is open
    pub fn transport_opened(&mut self) {
        self.state = ShardState::AwaitingHello;
    }

    /// The transport could not be opened
    pub fn open_failed(&mut self) -> CloseReason {
        self.state = ShardState::Disconnected;
        CloseReason::Unknown
    }

    /// Feed one decoded event
    pub fn handle_event(&mut self, event: GatewayEvent) -> Vec<Action> {
        match event {
            GatewayEvent::Hello(hello) => self.on_hello(Duration::from_millis(hello.heartbeat_interval)),
            GatewayEvent::Dispatch { sequence, event } => self.on_dispatch(sequence, event),
            GatewayEvent::Heartbeat => vec![Action::Send(self.heartbeat())],
            GatewayEvent::HeartbeatAck => vec![Action::HeartbeatAck],
            GatewayEvent::Reconnect => {
                info!("[SHARD-{}] Server requested reconnect", self.shard_id);
                vec![self.close_with(RESUMABLE_CLOSE, true)]
            }
            GatewayEvent::InvalidSession { resumable } => self.on_invalid_session(resumable),
        }
    }

    fn on_hello(&mut self, interval: Duration) -> Vec<Action> {
        if self.state != ShardState::AwaitingHello {
            warn!("[SHARD-{}] Hello received while {}", self.shard_id, self.state);
        }

        let command = match &self.session {
            Some(session) => {
                debug!(
                    "[SHARD-{}] Resuming session {} at sequence {:?}",
                    self.shard_id, session.id, session.sequence
                );
                self.state = ShardState::Resuming;
                GatewayCommand::Resume(Resume {
                    token: self.token.secret().to_string(),
                    session_id: session.id.clone(),
                    seq: session.sequence,
                })
            }
            None => {
                debug!("[SHARD-{}] Identifying", self.shard_id);
                self.state = ShardState::Identifying;
                self.identify()
            }
        };

        vec![Action::Hello(interval), Action::Send(command)]
    }

    fn on_dispatch(&mut self, sequence: Option<u64>, event: DispatchEvent) -> Vec<Action> {
        // An undecodable READY leaves no session to resume
        if matches!(&event, DispatchEvent::Unhandled { name, .. } if name == "READY") {
            warn!("[SHARD-{}] Undecodable READY, closing", self.shard_id);
            return vec![self.protocol_error()];
        }

        let mut actions = Vec::with_capacity(2);

        if let DispatchEvent::Ready(ready) = &event {
            self.session = Some(Session {
                id: ready.session_id.clone(),
                sequence: None,
                resume_url: ready.resume_gateway_url.clone(),
            });
        }

        match &mut self.session {
            Some(session) => {
                if sequence.is_some() {
                    session.sequence = sequence;
                }
            }
            None => debug!(
                "[SHARD-{}] {} before READY, sequence {:?} not stored",
                self.shard_id,
                event.name(),
                sequence
            ),
        }

        match self.state {
            ShardState::Identifying | ShardState::Resuming => {
                let resumed = self.state == ShardState::Resuming;
                self.state = ShardState::Connected;
                info!(
                    "[SHARD-{}] Connected ({})",
                    self.shard_id,
                    if resumed { "resumed" } else { "new session" }
                );
                actions.push(Action::Connected { resumed });
            }
            ShardState::Connected => {}
            other => debug!(
                "[SHARD-{}] {} received while {}",
                self.shard_id,
                event.name(),
                other
            ),
        }

        actions.push(Action::Dispatch(event));
        actions
    }

    fn on_invalid_session(&mut self, resumable: bool) -> Vec<Action> {
        if resumable {
            info!("[SHARD-{}] Session invalidated, resumable", self.shard_id);
            return vec![self.close_with(RESUMABLE_CLOSE, true)];
        }

        self.session = None;
        if self.state == ShardState::Resuming {
            info!("[SHARD-{}] Resume rejected, identifying", self.shard_id);
            self.state = ShardState::Identifying;
            return vec![Action::Send(self.identify())];
        }

        warn!("[SHARD-{}] Session invalidated", self.shard_id);
        vec![self.close_with(CloseReason::InvalidSequence, false)]
    }

    fn close_with(&mut self, reason: CloseReason, forced_resume: bool) -> Action {
        self.state = ShardState::Closing;
        self.pending_close = Some(PendingClose {
            reason,
            forced_resume,
        });
        Action::Close(reason)
    }

    /// Heartbeats went unacknowledged; close as timed out
    pub fn zombied(&mut self) -> Action {
        warn!("[SHARD-{}] Heartbeat not acknowledged, connection zombied", self.shard_id);
        self.close_with(CloseReason::SessionTimeout, false)
    }

    /// Tear the connection down after a protocol violation
    pub fn protocol_error(&mut self) -> Action {
        self.close_with(RESUMABLE_CLOSE, false)
    }

    /// Close for good
    pub fn request_stop(&mut self) -> Action {
        self.stop_requested = true;
        self.close_with(CloseReason::Normal, false)
    }

    /// Closes resumably and reconnects without asking the owner
    pub fn request_reconnect(&mut self) -> Action {
        self.close_with(RESUMABLE_CLOSE, true)
    }

    /// The transport closed; `observed` is the code the socket reported.
    ///
    /// A close this machine initiated wins over the observed code.
    pub fn transport_closed(&mut self, observed: CloseReason) -> CloseOutcome {
        let pending = self.pending_close.take();
        self.state = ShardState::Disconnected;

        if self.stop_requested {
            return CloseOutcome::Stop {
                reason: pending.map_or(observed, |p| p.reason),
            };
        }

        let (reason, forced_resume) = match pending {
            Some(p) => (p.reason, p.forced_resume),
            None => (observed, false),
        };

        if reason.is_fatal() {
            warn!("[SHARD-{}] Closed with fatal reason {}", self.shard_id, reason);
            self.session = None;
            return CloseOutcome::Stop { reason };
        }

        if forced_resume {
            self.state = ShardState::Connecting;
            return CloseOutcome::Reconnect {
                reason,
                resume: self.session.is_some(),
            };
        }

        CloseOutcome::AskOwner { reason }
    }

    /// Apply the owner's answer to [`CloseOutcome::AskOwner`]
    pub fn authorize_reconnect(&mut self, reason: CloseReason, authorized: bool) -> CloseOutcome {
        if !authorized {
            return CloseOutcome::Stop { reason };
        }

        if !reason.is_resumable() {
            self.session = None;
        }
        self.state = ShardState::Connecting;
        CloseOutcome::Reconnect {
            reason,
            resume: self.session.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Ready;
    use crate::model::User;
    use crate::payload::Hello;
    use crate::snowflake::Snowflake;
    use serde_json::json;

    fn machine() -> ShardMachine {
        let config = GatewayConfig::builder(Token::bot("secret"))
            .shard_count(2)
            .build()
            .unwrap();
        ShardMachine::new(1, 2, &config)
    }

    fn hello() -> GatewayEvent {
        GatewayEvent::Hello(Hello {
            heartbeat_interval: 41_250,
        })
    }

    fn ready(seq: u64) -> GatewayEvent {
        GatewayEvent::Dispatch {
            sequence: Some(seq),
            event: DispatchEvent::Ready(Box::new(Ready {
                version: 10,
                user: User {
                    id: Snowflake::new(1),
                    username: "bot".to_string(),
                    discriminator: None,
                    global_name: None,
                    avatar: None,
                    bot: true,
                },
                guilds: vec![],
                session_id: "session-1".to_string(),
                resume_gateway_url: Some("wss://resume.example".to_string()),
                shard: Some([1, 2]),
                application: None,
            })),
        }
    }

    fn unhandled(seq: u64) -> GatewayEvent {
        GatewayEvent::Dispatch {
            sequence: Some(seq),
            event: DispatchEvent::Unhandled {
                name: "SOMETHING_NEW".to_string(),
                data: json!({}),
            },
        }
    }

    fn connected_machine() -> ShardMachine {
        let mut m = machine();
        m.begin_connect();
        m.transport_opened();
        m.handle_event(hello());
        m.handle_event(ready(1));
        m
    }

    fn sent(actions: &[Action]) -> Vec<&GatewayCommand> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_hello_then_ready_connects() {
        let mut m = machine();
        m.begin_connect();
        assert_eq!(m.state(), ShardState::Connecting);
        m.transport_opened();
        assert_eq!(m.state(), ShardState::AwaitingHello);

        let actions = m.handle_event(hello());
        assert_eq!(m.state(), ShardState::Identifying);
        assert_eq!(actions[0], Action::Hello(Duration::from_millis(41_250)));
        match sent(&actions)[0] {
            GatewayCommand::Identify(identify) => {
                assert_eq!(identify.token, "secret");
                assert_eq!(identify.shard, [1, 2]);
            }
            other => panic!("expected identify, got {:?}", other),
        }

        let actions = m.handle_event(ready(7));
        assert_eq!(m.state(), ShardState::Connected);
        assert_eq!(actions[0], Action::Connected { resumed: false });
        assert!(matches!(actions[1], Action::Dispatch(DispatchEvent::Ready(_))));
        assert_eq!(m.sequence(), Some(7));
        assert_eq!(m.session().unwrap().id, "session-1");
    }

    #[test]
    fn test_unhandled_dispatch_advances_sequence() {
        let mut m = connected_machine();
        let actions = m.handle_event(unhandled(2));
        assert_eq!(m.sequence(), Some(2));
        assert!(matches!(&actions[0], Action::Dispatch(e) if e.is_unhandled()));
        assert_eq!(m.heartbeat(), GatewayCommand::Heartbeat(Some(2)));
    }

    #[test]
    fn test_undecodable_ready_closes_and_reidentifies() {
        let mut m = machine();
        m.begin_connect();
        m.transport_opened();
        m.handle_event(hello());

        let actions = m.handle_event(GatewayEvent::Dispatch {
            sequence: Some(1),
            event: DispatchEvent::Unhandled {
                name: "READY".to_string(),
                data: json!({"session_id": 5}),
            },
        });
        assert_eq!(actions, vec![Action::Close(RESUMABLE_CLOSE)]);
        assert_eq!(m.state(), ShardState::Closing);
        assert!(m.session().is_none());
        assert_eq!(m.sequence(), None);

        let outcome = match m.transport_closed(CloseReason::Unknown) {
            CloseOutcome::AskOwner { reason } => m.authorize_reconnect(reason, true),
            other => other,
        };
        assert_eq!(
            outcome,
            CloseOutcome::Reconnect {
                reason: RESUMABLE_CLOSE,
                resume: false
            }
        );

        m.begin_connect();
        m.transport_opened();
        let actions = m.handle_event(hello());
        assert!(matches!(sent(&actions)[0], GatewayCommand::Identify(_)));
    }

    #[test]
    fn test_server_heartbeat_request_is_answered() {
        let mut m = connected_machine();
        let actions = m.handle_event(GatewayEvent::Heartbeat);
        assert_eq!(actions, vec![Action::Send(GatewayCommand::Heartbeat(Some(1)))]);
    }

    #[test]
    fn test_reconnect_request_resumes() {
        let mut m = connected_machine();
        let actions = m.handle_event(GatewayEvent::Reconnect);
        assert_eq!(actions, vec![Action::Close(RESUMABLE_CLOSE)]);
        assert_eq!(m.state(), ShardState::Closing);

        let outcome = m.transport_closed(CloseReason::Unknown);
        assert_eq!(
            outcome,
            CloseOutcome::Reconnect {
                reason: RESUMABLE_CLOSE,
                resume: true
            }
        );

        m.begin_connect();
        m.transport_opened();
        let actions = m.handle_event(hello());
        assert_eq!(m.state(), ShardState::Resuming);
        assert_eq!(
            sent(&actions),
            vec![&GatewayCommand::Resume(Resume {
                token: "secret".to_string(),
                session_id: "session-1".to_string(),
                seq: Some(1),
            })]
        );

        let actions = m.handle_event(GatewayEvent::Dispatch {
            sequence: None,
            event: DispatchEvent::Resumed,
        });
        assert_eq!(actions[0], Action::Connected { resumed: true });
        assert_eq!(m.sequence(), Some(1));
    }

    #[test]
    fn test_non_resumable_close_discards_session() {
        let mut m = connected_machine();
        let outcome = m.transport_closed(CloseReason::InvalidSequence);
        assert_eq!(
            outcome,
            CloseOutcome::AskOwner {
                reason: CloseReason::InvalidSequence
            }
        );
        let outcome = m.authorize_reconnect(CloseReason::InvalidSequence, true);
        assert_eq!(
            outcome,
            CloseOutcome::Reconnect {
                reason: CloseReason::InvalidSequence,
                resume: false
            }
        );
        assert!(m.session().is_none());

        m.begin_connect();
        m.transport_opened();
        let actions = m.handle_event(hello());
        assert!(matches!(sent(&actions)[0], GatewayCommand::Identify(_)));
    }

    #[test]
    fn test_fatal_close_stops_regardless_of_owner() {
        let mut m = connected_machine();
        let outcome = m.transport_closed(CloseReason::AuthenticationFailed);
        assert_eq!(
            outcome,
            CloseOutcome::Stop {
                reason: CloseReason::AuthenticationFailed
            }
        );
        assert!(m.session().is_none());
        assert_eq!(m.state(), ShardState::Disconnected);
    }

    #[test]
    fn test_owner_refusal_stops() {
        let mut m = connected_machine();
        let outcome = m.transport_closed(CloseReason::GoingAway);
        assert_eq!(outcome, CloseOutcome::AskOwner { reason: CloseReason::GoingAway });
        assert_eq!(
            m.authorize_reconnect(CloseReason::GoingAway, false),
            CloseOutcome::Stop { reason: CloseReason::GoingAway }
        );
        assert_eq!(m.state(), ShardState::Disconnected);
    }

    #[test]
    fn test_zombie_resumes_when_authorized() {
        let mut m = connected_machine();
        assert_eq!(m.zombied(), Action::Close(CloseReason::SessionTimeout));
        let outcome = m.transport_closed(CloseReason::Unknown);
        assert_eq!(outcome, CloseOutcome::AskOwner { reason: CloseReason::SessionTimeout });
        assert_eq!(
            m.authorize_reconnect(CloseReason::SessionTimeout, true),
            CloseOutcome::Reconnect {
                reason: CloseReason::SessionTimeout,
                resume: true
            }
        );
    }

    #[test]
    fn test_invalid_session_while_resuming_reidentifies_in_place() {
        let mut m = connected_machine();
        m.handle_event(GatewayEvent::Reconnect);
        m.transport_closed(CloseReason::Unknown);
        m.begin_connect();
        m.transport_opened();
        m.handle_event(hello());
        assert_eq!(m.state(), ShardState::Resuming);

        let actions = m.handle_event(GatewayEvent::InvalidSession { resumable: false });
        assert_eq!(m.state(), ShardState::Identifying);
        assert!(m.session().is_none());
        assert!(matches!(sent(&actions)[0], GatewayCommand::Identify(_)));
    }

    #[test]
    fn test_invalid_session_while_connected_closes() {
        let mut m = connected_machine();
        let actions = m.handle_event(GatewayEvent::InvalidSession { resumable: false });
        assert_eq!(actions, vec![Action::Close(CloseReason::InvalidSequence)]);
        assert!(m.session().is_none());
    }

    #[test]
    fn test_resumable_invalid_session_keeps_session() {
        let mut m = connected_machine();
        m.handle_event(GatewayEvent::InvalidSession { resumable: true });
        let outcome = m.transport_closed(CloseReason::Unknown);
        assert!(matches!(outcome, CloseOutcome::Reconnect { resume: true, .. }));
    }

    #[test]
    fn test_stop_wins_over_everything() {
        let mut m = connected_machine();
        assert_eq!(m.request_stop(), Action::Close(CloseReason::Normal));
        let outcome = m.transport_closed(CloseReason::GoingAway);
        assert_eq!(outcome, CloseOutcome::Stop { reason: CloseReason::Normal });
        assert!(m.is_stop_requested());
    }
}
