//! Gateway envelope `{op, d, s, t}` and the typed commands and events it carries.

use crate::dispatch::DispatchEvent;
use crate::error::Error;
use crate::model::Activity;
use crate::snowflake::{ChannelId, GuildId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Gateway opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl Opcode {
    /// Map a numeric opcode, `None` if it is not part of the protocol
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::PresenceUpdate => 3,
            Self::VoiceStateUpdate => 4,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::RequestGuildMembers => 8,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

bitflags::bitflags! {
    /// Event groups the client subscribes to when identifying.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Intents: u64 {
        const GUILDS = 1 << 0;
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_MODERATION = 1 << 2;
        const GUILD_EMOJIS_AND_STICKERS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        const MESSAGE_CONTENT = 1 << 15;
    }
}

impl Intents {
    /// Intents that do not need to be enabled in the developer portal
    pub fn unprivileged() -> Self {
        Self::all() - Self::GUILD_MEMBERS - Self::GUILD_PRESENCES - Self::MESSAGE_CONTENT
    }
}

impl Default for Intents {
    fn default() -> Self {
        Self::unprivileged()
    }
}

/// Sent by the server right after the socket opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats
    pub heartbeat_interval: u64,
}

/// Client properties reported in identify
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Starts a new session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    #[serde(default)]
    pub compress: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,
    /// `[shard_index, shard_count]`
    pub shard: [u32; 2],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdate>,
    pub intents: Intents,
}

/// Re-attaches to an existing session, replaying missed events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: Option<u64>,
}

/// Online status shown to other users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Online,
    Dnd,
    Idle,
    Invisible,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Unix millis when the client went idle
    pub since: Option<u64>,
    pub activities: Vec<Activity>,
    pub status: Status,
    pub afk: bool,
}

/// Join, move or leave a voice channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    /// `None` disconnects
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Ask for a GUILD_MEMBERS_CHUNK stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    pub guild_id: GuildId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// A payload sent by the client
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCommand {
    /// Carries the last received sequence, if any
    Heartbeat(Option<u64>),
    Identify(Box<Identify>),
    PresenceUpdate(PresenceUpdate),
    VoiceStateUpdate(VoiceStateUpdate),
    Resume(Resume),
    RequestGuildMembers(RequestGuildMembers),
}

#[derive(Serialize)]
struct OutboundEnvelope<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

impl GatewayCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Heartbeat(_) => Opcode::Heartbeat,
            Self::Identify(_) => Opcode::Identify,
            Self::PresenceUpdate(_) => Opcode::PresenceUpdate,
            Self::VoiceStateUpdate(_) => Opcode::VoiceStateUpdate,
            Self::Resume(_) => Opcode::Resume,
            Self::RequestGuildMembers(_) => Opcode::RequestGuildMembers,
        }
    }

    /// Encode as envelope JSON text
    pub fn encode(&self) -> Result<String, Error> {
        let op = self.opcode().code();
        let text = match self {
            Self::Heartbeat(seq) => serde_json::to_string(&OutboundEnvelope { op, d: seq }),
            Self::Identify(identify) => serde_json::to_string(&OutboundEnvelope { op, d: identify }),
            Self::PresenceUpdate(p) => serde_json::to_string(&OutboundEnvelope { op, d: p }),
            Self::VoiceStateUpdate(v) => serde_json::to_string(&OutboundEnvelope { op, d: v }),
            Self::Resume(resume) => serde_json::to_string(&OutboundEnvelope { op, d: resume }),
            Self::RequestGuildMembers(r) => serde_json::to_string(&OutboundEnvelope { op, d: r }),
        }?;
        Ok(text)
    }
}

/// A payload received from the server
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A named state change; `sequence` must be stored for resuming
    Dispatch {
        sequence: Option<u64>,
        event: DispatchEvent,
    },
    /// The server asks for an immediate heartbeat
    Heartbeat,
    /// Reconnect and resume
    Reconnect,
    /// The session was invalidated; the flag says whether it may be resumed
    InvalidSession { resumable: bool },
    Hello(Hello),
    HeartbeatAck,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    op: u64,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default, with = "crate::codec::option_string_or_u64")]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

impl GatewayEvent {
    /// Decode envelope JSON text.
    ///
    /// Fails on malformed JSON, on opcodes that only flow client to server and
    /// on opcodes outside the protocol. Dispatches never fail because of their
    /// event name or payload shape; see [`DispatchEvent::decode`].
    pub fn decode(text: &str) -> Result<Self, Error> {
        let envelope: InboundEnvelope = serde_json::from_str(text)?;
        let opcode = u8::try_from(envelope.op)
            .ok()
            .and_then(Opcode::from_code)
            .ok_or(Error::UnknownOpcode(envelope.op))?;

        Ok(match opcode {
            Opcode::Dispatch => {
                let name = envelope.t.ok_or_else(|| {
                    Error::Protocol("dispatch payload without an event name".to_string())
                })?;
                GatewayEvent::Dispatch {
                    sequence: envelope.s,
                    event: DispatchEvent::decode(name, envelope.d),
                }
            }
            Opcode::Heartbeat => GatewayEvent::Heartbeat,
            Opcode::Reconnect => GatewayEvent::Reconnect,
            Opcode::InvalidSession => GatewayEvent::InvalidSession {
                resumable: envelope.d.as_bool().unwrap_or(false),
            },
            Opcode::Hello => GatewayEvent::Hello(serde_json::from_value(envelope.d)?),
            Opcode::HeartbeatAck => GatewayEvent::HeartbeatAck,
            Opcode::Identify
            | Opcode::PresenceUpdate
            | Opcode::VoiceStateUpdate
            | Opcode::Resume
            | Opcode::RequestGuildMembers => {
                return Err(Error::Protocol(format!(
                    "client-only opcode {} received from server",
                    opcode
                )))
            }
        })
    }
}
