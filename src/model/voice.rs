use serde::{Deserialize, Serialize};

use super::Snowflake;

/// `VOICE_SERVER_UPDATE` payload as the gateway delivers it.
///
/// Field names stay snake_case: the node expects this object verbatim inside `voiceUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceServerUpdate {
    pub guild_id: Snowflake,
    pub token: String,
    pub endpoint: String,
}

/// The bot's own `VOICE_STATE_UPDATE`. A `None` channel means the bot left voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: Snowflake,
    pub channel_id: Option<Snowflake>,
    pub session_id: String,
    /// When present, updates for other users are ignored.
    #[serde(default)]
    pub user_id: Option<Snowflake>,
}

/// Everything a node needs to open the Discord voice connection for a guild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceCredentials {
    pub guild_id: Snowflake,
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl VoiceCredentials {
    pub(crate) fn server_update(&self) -> VoiceServerUpdate {
        VoiceServerUpdate {
            guild_id: self.guild_id.clone(),
            token: self.token.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}
