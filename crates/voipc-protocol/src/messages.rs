use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{RoomId, VoiceChannelSnapshot, WsClientId};

/// A signaling message as received from a client socket, tagged by `type`.
/// The only variant accepted before authentication is `Auth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Auth {
        token: String,
    },

    Join {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(default)]
        username: Option<String>,
    },

    Leave,

    Offer {
        #[serde(default)]
        to: Option<WsClientId>,
        data: Value,
    },

    Answer {
        #[serde(default)]
        to: Option<WsClientId>,
        data: Value,
    },

    IceCandidate {
        to: WsClientId,
        data: Value,
    },

    ScreenShareStart {
        #[serde(default)]
        quality: Option<String>,
    },

    ScreenShareStop,

    TypingStart,

    TypingStop,

    Ping,

    Pong,
}

/// A signaling message sent to a client socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent once, right before closing an unauthenticated socket at the 10 s mark.
    AuthRequired,

    AuthSuccess {
        user: AuthUser,
    },

    AuthFailed {
        error: String,
    },

    /// A user joined the sender's room (chat/text presence, not voice).
    UserJoined {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "clientId")]
        client_id: WsClientId,
        username: String,
    },

    /// A user left a room, including on disconnect.
    UserLeft {
        #[serde(rename = "roomId")]
        room_id: RoomId,
        #[serde(rename = "clientId")]
        client_id: WsClientId,
    },

    Offer {
        from: WsClientId,
        data: Value,
    },

    Answer {
        from: WsClientId,
        data: Value,
    },

    IceCandidate {
        from: WsClientId,
        data: Value,
    },

    ScreenShareStart {
        #[serde(rename = "clientId")]
        client_id: WsClientId,
        username: String,
        quality: String,
    },

    ScreenShareDenied {
        reason: String,
    },

    ScreenShareStop {
        #[serde(rename = "clientId")]
        client_id: WsClientId,
    },

    TypingStart {
        #[serde(rename = "clientId")]
        client_id: WsClientId,
        username: String,
    },

    TypingStop {
        #[serde(rename = "clientId")]
        client_id: WsClientId,
    },

    /// Full voice-occupancy snapshot, pushed to every connected socket.
    VoiceChannelUpdate {
        channels: Vec<VoiceChannelSnapshot>,
    },

    Pong,

    /// A malformed-but-socket-preserving message was rejected (logged, not closed).
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// WebSocket close codes used by the signaling handshake.
pub mod close_codes {
    /// No `auth` message arrived within the 10 s auth timer.
    pub const AUTH_TIMEOUT: u16 = 4001;
    /// First message after connect lacked a `token` field.
    pub const MISSING_TOKEN: u16 = 4002;
    /// Token failed verification against every active secret.
    pub const BAD_TOKEN: u16 = 4003;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_parses_from_json() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Auth { token } if token == "abc"));
    }

    #[test]
    fn join_message_uses_camel_case_room_id() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join","roomId":"lounge"}"#).unwrap();
        match msg {
            ClientMessage::Join { room_id, username } => {
                assert_eq!(room_id, "lounge");
                assert_eq!(username, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ice_candidate_requires_to_field() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"ice-candidate","data":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let result: Result<ClientMessage, _> = serde_json::from_str(r#"{"type":"nonsense"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn auth_success_serializes_with_kebab_case_tag() {
        let msg = ServerMessage::AuthSuccess {
            user: AuthUser {
                id: "1".into(),
                username: "alice".into(),
                display_name: None,
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"auth-success\""));
        assert!(!json.contains("displayName"));
    }

    #[test]
    fn voice_channel_update_serializes() {
        let msg = ServerMessage::VoiceChannelUpdate { channels: vec![] };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"voice-channel-update\""));
    }
}
