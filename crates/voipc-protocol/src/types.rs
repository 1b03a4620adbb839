use serde::{Deserialize, Serialize};

/// 16-byte client identity used on the UDP voice plane. Assigned on HELLO and
/// stable for the client's lifetime; distinct from the WebSocket client id.
pub type ClientId = [u8; 16];

/// Identity assigned to a WebSocket connection on accept: `user_<base36 time>_<rand>`.
/// A single account may hold several of these at once (multiple tabs/devices).
pub type WsClientId = String;

/// The persistent account id from a verified bearer token.
pub type AccountId = String;

/// A signaling room name: `global`, a numeric text-channel id, or a voice channel name.
pub type RoomId = String;

/// A named voice channel on the UDP relay.
pub type VoiceChannelName = String;

pub fn format_client_id(id: &ClientId) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn parse_client_id(hex: &str) -> Option<ClientId> {
    if hex.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// A connected user as reported to other signaling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(rename = "clientId")]
    pub client_id: WsClientId,
    pub username: String,
}

/// Snapshot of one voice channel's occupancy, pushed to every connected socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceChannelSnapshot {
    #[serde(rename = "channelId")]
    pub channel_id: RoomId,
    pub users: Vec<UserSummary>,
}
