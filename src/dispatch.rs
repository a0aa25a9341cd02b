//! Named dispatch events (opcode 0).
//!
//! The catalogue is closed; names outside it, and known names whose payload
//! does not match the expected shape, decode to [`DispatchEvent::Unhandled`]
//! so a new or changed server event never tears down a connection.

use crate::codec::Timestamp;
use crate::model::{
    Channel, Emoji, Guild, Interaction, Member, Message, MessageUpdate, PartialApplication, Role,
    UnavailableGuild, User, VoiceState,
};
use crate::snowflake::{ChannelId, GuildId, MessageId, RoleId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// First dispatch of a fresh session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    #[serde(rename = "v")]
    pub version: u8,
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    pub session_id: String,
    /// Gateway URL to use when resuming this session
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
    #[serde(default)]
    pub application: Option<PartialApplication>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelete {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeleteBulk {
    pub ids: Vec<MessageId>,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRemoveAll {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildBan {
    pub guild_id: GuildId,
    pub user: User,
}

/// GUILD_MEMBER_ADD carries a member plus the guild it joined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildMemberAdd {
    pub guild_id: GuildId,
    #[serde(flatten)]
    pub member: Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildMemberUpdate {
    pub guild_id: GuildId,
    pub user: User,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub nick: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildMemberRemove {
    pub guild_id: GuildId,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildRole {
    pub guild_id: GuildId,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildRoleDelete {
    pub guild_id: GuildId,
    pub role_id: RoleId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPinsUpdate {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub last_pin_timestamp: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingStart {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub user_id: UserId,
    /// Unix seconds
    pub timestamp: u64,
}

/// PRESENCE_UPDATE only guarantees the user id; the rest is kept raw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdateEvent {
    pub user: PresenceUser,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub activities: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: GuildId,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhooksUpdate {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

/// A decoded dispatch
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Ready(Box<Ready>),
    Resumed,
    MessageCreate(Box<Message>),
    MessageUpdate(Box<MessageUpdate>),
    MessageDelete(MessageDelete),
    MessageDeleteBulk(MessageDeleteBulk),
    MessageReactionAdd(Box<Reaction>),
    MessageReactionRemove(Box<Reaction>),
    MessageReactionRemoveAll(ReactionRemoveAll),
    GuildCreate(Box<Guild>),
    GuildUpdate(Box<Guild>),
    GuildDelete(UnavailableGuild),
    GuildBanAdd(GuildBan),
    GuildBanRemove(GuildBan),
    GuildMemberAdd(Box<GuildMemberAdd>),
    GuildMemberUpdate(Box<GuildMemberUpdate>),
    GuildMemberRemove(GuildMemberRemove),
    GuildRoleCreate(GuildRole),
    GuildRoleUpdate(GuildRole),
    GuildRoleDelete(GuildRoleDelete),
    ChannelCreate(Box<Channel>),
    ChannelUpdate(Box<Channel>),
    ChannelDelete(Box<Channel>),
    ChannelPinsUpdate(ChannelPinsUpdate),
    ThreadCreate(Box<Channel>),
    ThreadUpdate(Box<Channel>),
    ThreadDelete(Box<Channel>),
    TypingStart(TypingStart),
    PresenceUpdate(Box<PresenceUpdateEvent>),
    UserUpdate(Box<User>),
    VoiceStateUpdate(Box<VoiceState>),
    VoiceServerUpdate(VoiceServerUpdate),
    WebhooksUpdate(WebhooksUpdate),
    InteractionCreate(Box<Interaction>),
    /// A name outside the catalogue, or a payload that did not match
    Unhandled { name: String, data: Value },
}

fn parse<T: DeserializeOwned>(name: &str, data: &Value) -> Option<T> {
    match T::deserialize(data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Malformed {} payload, delivering as unhandled: {}", name, e);
            None
        }
    }
}

impl DispatchEvent {
    /// Decode a dispatch by event name. Never fails.
    pub fn decode(name: String, data: Value) -> Self {
        let decoded = match name.as_str() {
            "READY" => parse(&name, &data).map(|r| Self::Ready(Box::new(r))),
            "RESUMED" => Some(Self::Resumed),
            "MESSAGE_CREATE" => parse(&name, &data).map(|m| Self::MessageCreate(Box::new(m))),
            "MESSAGE_UPDATE" => parse(&name, &data).map(|m| Self::MessageUpdate(Box::new(m))),
            "MESSAGE_DELETE" => parse(&name, &data).map(Self::MessageDelete),
            "MESSAGE_DELETE_BULK" => parse(&name, &data).map(Self::MessageDeleteBulk),
            "MESSAGE_REACTION_ADD" => {
                parse(&name, &data).map(|r| Self::MessageReactionAdd(Box::new(r)))
            }
            "MESSAGE_REACTION_REMOVE" => {
                parse(&name, &data).map(|r| Self::MessageReactionRemove(Box::new(r)))
            }
            "MESSAGE_REACTION_REMOVE_ALL" => {
                parse(&name, &data).map(Self::MessageReactionRemoveAll)
            }
            "GUILD_CREATE" => parse(&name, &data).map(|g| Self::GuildCreate(Box::new(g))),
            "GUILD_UPDATE" => parse(&name, &data).map(|g| Self::GuildUpdate(Box::new(g))),
            "GUILD_DELETE" => parse(&name, &data).map(Self::GuildDelete),
            "GUILD_BAN_ADD" => parse(&name, &data).map(Self::GuildBanAdd),
            "GUILD_BAN_REMOVE" => parse(&name, &data).map(Self::GuildBanRemove),
            "GUILD_MEMBER_ADD" => parse(&name, &data).map(|m| Self::GuildMemberAdd(Box::new(m))),
            "GUILD_MEMBER_UPDATE" => {
                parse(&name, &data).map(|m| Self::GuildMemberUpdate(Box::new(m)))
            }
            "GUILD_MEMBER_REMOVE" => parse(&name, &data).map(Self::GuildMemberRemove),
            "GUILD_ROLE_CREATE" => parse(&name, &data).map(Self::GuildRoleCreate),
            "GUILD_ROLE_UPDATE" => parse(&name, &data).map(Self::GuildRoleUpdate),
            "GUILD_ROLE_DELETE" => parse(&name, &data).map(Self::GuildRoleDelete),
            "CHANNEL_CREATE" => parse(&name, &data).map(|c| Self::ChannelCreate(Box::new(c))),
            "CHANNEL_UPDATE" => parse(&name, &data).map(|c| Self::ChannelUpdate(Box::new(c))),
            "CHANNEL_DELETE" => parse(&name, &data).map(|c| Self::ChannelDelete(Box::new(c))),
            "CHANNEL_PINS_UPDATE" => parse(&name, &data).map(Self::ChannelPinsUpdate),
            "THREAD_CREATE" => parse(&name, &data).map(|c| Self::ThreadCreate(Box::new(c))),
            "THREAD_UPDATE" => parse(&name, &data).map(|c| Self::ThreadUpdate(Box::new(c))),
            "THREAD_DELETE" => parse(&name, &data).map(|c| Self::ThreadDelete(Box::new(c))),
            "TYPING_START" => parse(&name, &data).map(Self::TypingStart),
            "PRESENCE_UPDATE" => parse(&name, &data).map(|p| Self::PresenceUpdate(Box::new(p))),
            "USER_UPDATE" => parse(&name, &data).map(|u| Self::UserUpdate(Box::new(u))),
            "VOICE_STATE_UPDATE" => {
                parse(&name, &data).map(|v| Self::VoiceStateUpdate(Box::new(v)))
            }
            "VOICE_SERVER_UPDATE" => parse(&name, &data).map(Self::VoiceServerUpdate),
            "WEBHOOKS_UPDATE" => parse(&name, &data).map(Self::WebhooksUpdate),
            "INTERACTION_CREATE" => {
                parse(&name, &data).map(|i| Self::InteractionCreate(Box::new(i)))
            }
            _ => None,
        };

        decoded.unwrap_or(Self::Unhandled { name, data })
    }

    /// The wire name of this event
    pub fn name(&self) -> &str {
        match self {
            Self::Ready(_) => "READY",
            Self::Resumed => "RESUMED",
            Self::MessageCreate(_) => "MESSAGE_CREATE",
            Self::MessageUpdate(_) => "MESSAGE_UPDATE",
            Self::MessageDelete(_) => "MESSAGE_DELETE",
            Self::MessageDeleteBulk(_) => "MESSAGE_DELETE_BULK",
            Self::MessageReactionAdd(_) => "MESSAGE_REACTION_ADD",
            Self::MessageReactionRemove(_) => "MESSAGE_REACTION_REMOVE",
            Self::MessageReactionRemoveAll(_) => "MESSAGE_REACTION_REMOVE_ALL",
            Self::GuildCreate(_) => "GUILD_CREATE",
            Self::GuildUpdate(_) => "GUILD_UPDATE",
            Self::GuildDelete(_) => "GUILD_DELETE",
            Self::GuildBanAdd(_) => "GUILD_BAN_ADD",
            Self::GuildBanRemove(_) => "GUILD_BAN_REMOVE",
            Self::GuildMemberAdd(_) => "GUILD_MEMBER_ADD",
            Self::GuildMemberUpdate(_) => "GUILD_MEMBER_UPDATE",
            Self::GuildMemberRemove(_) => "GUILD_MEMBER_REMOVE",
            Self::GuildRoleCreate(_) => "GUILD_ROLE_CREATE",
            Self::GuildRoleUpdate(_) => "GUILD_ROLE_UPDATE",
            Self::GuildRoleDelete(_) => "GUILD_ROLE_DELETE",
            Self::ChannelCreate(_) => "CHANNEL_CREATE",
            Self::ChannelUpdate(_) => "CHANNEL_UPDATE",
            Self::ChannelDelete(_) => "CHANNEL_DELETE",
            Self::ChannelPinsUpdate(_) => "CHANNEL_PINS_UPDATE",
            Self::ThreadCreate(_) => "THREAD_CREATE",
            Self::ThreadUpdate(_) => "THREAD_UPDATE",
            Self::ThreadDelete(_) => "THREAD_DELETE",
            Self::TypingStart(_) => "TYPING_START",
            Self::PresenceUpdate(_) => "PRESENCE_UPDATE",
            Self::UserUpdate(_) => "USER_UPDATE",
            Self::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            Self::VoiceServerUpdate(_) => "VOICE_SERVER_UPDATE",
            Self::WebhooksUpdate(_) => "WEBHOOKS_UPDATE",
            Self::InteractionCreate(_) => "INTERACTION_CREATE",
            Self::Unhandled { name, .. } => name,
        }
    }

    pub fn is_unhandled(&self) -> bool {
        matches!(self, Self::Unhandled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_ready() {
        let data = json!({
            "v": 10,
            "user": {"id": "80351110224678912", "username": "bot", "bot": true},
            "guilds": [{"id": "41771983423143937", "unavailable": true}],
            "session_id": "abc123",
            "resume_gateway_url": "wss://resume.example",
            "shard": [0, 2]
        });
        match DispatchEvent::decode("READY".to_string(), data) {
            DispatchEvent::Ready(ready) => {
                assert_eq!(ready.session_id, "abc123");
                assert_eq!(ready.shard, Some([0, 2]));
                assert_eq!(ready.guilds.len(), 1);
                assert!(ready.user.bot);
            }
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_message_delete() {
        let event = DispatchEvent::decode(
            "MESSAGE_DELETE".to_string(),
            json!({"id": "5", "channel_id": "6"}),
        );
        assert_eq!(
            event,
            DispatchEvent::MessageDelete(MessageDelete {
                id: MessageId::new(5),
                channel_id: ChannelId::new(6),
                guild_id: None,
            })
        );
        assert_eq!(event.name(), "MESSAGE_DELETE");
    }

    #[test]
    fn test_guild_member_add_flattens_member() {
        let event = DispatchEvent::decode(
            "GUILD_MEMBER_ADD".to_string(),
            json!({
                "guild_id": "9",
                "user": {"id": "10", "username": "new"},
                "roles": ["11"],
                "deaf": false,
                "mute": false
            }),
        );
        match event {
            DispatchEvent::GuildMemberAdd(add) => {
                assert_eq!(add.guild_id.get(), 9);
                assert_eq!(add.member.roles, vec![RoleId::new(11)]);
            }
            other => panic!("expected member add, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_name_is_unhandled() {
        let event = DispatchEvent::decode("SOUNDBOARD_SOUNDS".to_string(), json!([1, 2]));
        assert!(event.is_unhandled());
        assert_eq!(event.name(), "SOUNDBOARD_SOUNDS");
    }

    #[test]
    fn test_malformed_known_payload_is_unhandled() {
        let event = DispatchEvent::decode("MESSAGE_CREATE".to_string(), json!({"id": "not a number"}));
        assert_eq!(
            event,
            DispatchEvent::Unhandled {
                name: "MESSAGE_CREATE".to_string(),
                data: json!({"id": "not a number"}),
            }
        );
    }
}
