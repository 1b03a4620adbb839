//! Wire types shared between the voice relay and the signaling hub.
//!
//! Two distinct serializations live here: the UDP voice-plane frames in
//! [`voice`] (fixed big-endian binary layouts) and the WebSocket signaling
//! envelope in [`messages`] (tagged-union JSON).

pub mod error;
pub mod messages;
pub mod types;
pub mod voice;

pub use error::ProtocolError;
pub use messages::{AuthUser, ClientMessage, ServerMessage};
pub use types::{AccountId, ClientId, RoomId, VoiceChannelName, VoiceChannelSnapshot, WsClientId};
pub use voice::VoiceFrame;
