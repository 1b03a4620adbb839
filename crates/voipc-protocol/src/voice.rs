use crate::error::ProtocolError;
use crate::types::ClientId;

/// Client announces or refreshes itself. `0x01 flags:u8 client_id:16 uname_len:u8 uname:utf8[..]`.
pub const TYPE_HELLO: u8 = 0x01;
/// Relay's reply to HELLO. `0x02 flags:u8 current_key_id:u32`.
pub const TYPE_WELCOME: u8 = 0x02;
/// `0x10 _:u8 client_id:16 chan_len:u8 chan:utf8[..]`.
pub const TYPE_JOIN_CHANNEL: u8 = 0x10;
/// `0x11 _:u8 client_id:16`.
pub const TYPE_LEAVE_CHANNEL: u8 = 0x11;
/// Cleartext voice data, only ever seen unwrapped on intra-server generation.
/// `0x20 _:u8 seq:u32 ts:u32 opus_payload..`.
pub const TYPE_VOICE_PACKET: u8 = 0x20;
/// `VOICE_PACKET | 0x80`. `0xA0 chan_len:u8 chan:utf8 base_seq:u32 parity..`.
pub const TYPE_VOICE_FEC: u8 = 0xA0;
/// `0x30 _:u8 speaking:u8 client_id:16`.
pub const TYPE_SPEAKING_STATE: u8 = 0x30;
/// `0x50 new_key_id:u32`.
pub const TYPE_KEY_SYNC: u8 = 0x50;
/// `0xFE inner_type:u8 key_id:u32 nonce:12 tag:16 ciphertext..`.
pub const TYPE_ENCRYPTED_WRAPPER: u8 = 0xFE;
pub const TYPE_KEEPALIVE: u8 = 0xFF;

/// Well under the 1472-byte UDP MTU once wrapper overhead is added.
pub const MAX_VOICE_PACKET_SIZE: usize = 1400;

/// A parsed UDP voice-plane frame. Wire layout per type is given in the
/// constants above; `encode`/`decode` are the single source of truth for it.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceFrame {
    Hello {
        flags: u8,
        client_id: ClientId,
        username: String,
    },
    Welcome {
        flags: u8,
        current_key_id: u32,
    },
    JoinChannel {
        client_id: ClientId,
        channel: String,
    },
    LeaveChannel {
        client_id: ClientId,
    },
    VoicePacket {
        seq: u32,
        ts: u32,
        payload: Vec<u8>,
    },
    VoiceFec {
        channel: String,
        base_seq: u32,
        parity: Vec<u8>,
    },
    SpeakingState {
        speaking: bool,
        client_id: ClientId,
    },
    KeySync {
        new_key_id: u32,
    },
    EncryptedWrapper {
        inner_type: u8,
        key_id: u32,
        nonce: [u8; 12],
        tag: [u8; 16],
        ciphertext: Vec<u8>,
    },
    Keepalive,
}

fn read_client_id(data: &[u8], at: usize) -> Result<ClientId, ProtocolError> {
    data.get(at..at + 16)
        .map(|s| {
            let mut id = [0u8; 16];
            id.copy_from_slice(s);
            id
        })
        .ok_or(ProtocolError::PacketTooShort {
            expected: at + 16,
            got: data.len(),
        })
}

fn read_length_prefixed_str(data: &[u8], at: usize) -> Result<(String, usize), ProtocolError> {
    let len = *data.get(at).ok_or(ProtocolError::PacketTooShort {
        expected: at + 1,
        got: data.len(),
    })? as usize;
    let bytes = data
        .get(at + 1..at + 1 + len)
        .ok_or(ProtocolError::PacketTooShort {
            expected: at + 1 + len,
            got: data.len(),
        })?;
    let s = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();
    Ok((s, at + 1 + len))
}

impl VoiceFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            VoiceFrame::Hello {
                flags,
                client_id,
                username,
            } => {
                let uname = username.as_bytes();
                let mut buf = Vec::with_capacity(3 + 16 + uname.len());
                buf.push(TYPE_HELLO);
                buf.push(*flags);
                buf.extend_from_slice(client_id);
                buf.push(uname.len() as u8);
                buf.extend_from_slice(uname);
                buf
            }
            VoiceFrame::Welcome {
                flags,
                current_key_id,
            } => {
                let mut buf = Vec::with_capacity(6);
                buf.push(TYPE_WELCOME);
                buf.push(*flags);
                buf.extend_from_slice(&current_key_id.to_be_bytes());
                buf
            }
            VoiceFrame::JoinChannel { client_id, channel } => {
                let chan = channel.as_bytes();
                let mut buf = Vec::with_capacity(3 + 16 + chan.len());
                buf.push(TYPE_JOIN_CHANNEL);
                buf.push(0);
                buf.extend_from_slice(client_id);
                buf.push(chan.len() as u8);
                buf.extend_from_slice(chan);
                buf
            }
            VoiceFrame::LeaveChannel { client_id } => {
                let mut buf = Vec::with_capacity(18);
                buf.push(TYPE_LEAVE_CHANNEL);
                buf.push(0);
                buf.extend_from_slice(client_id);
                buf
            }
            VoiceFrame::VoicePacket { seq, ts, payload } => {
                let mut buf = Vec::with_capacity(10 + payload.len());
                buf.push(TYPE_VOICE_PACKET);
                buf.push(0);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.extend_from_slice(&ts.to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
            VoiceFrame::VoiceFec {
                channel,
                base_seq,
                parity,
            } => {
                let chan = channel.as_bytes();
                let mut buf = Vec::with_capacity(6 + chan.len() + parity.len());
                buf.push(TYPE_VOICE_FEC);
                buf.push(chan.len() as u8);
                buf.extend_from_slice(chan);
                buf.extend_from_slice(&base_seq.to_be_bytes());
                buf.extend_from_slice(parity);
                buf
            }
            VoiceFrame::SpeakingState {
                speaking,
                client_id,
            } => {
                let mut buf = Vec::with_capacity(19);
                buf.push(TYPE_SPEAKING_STATE);
                buf.push(0);
                buf.push(if *speaking { 1 } else { 0 });
                buf.extend_from_slice(client_id);
                buf
            }
            VoiceFrame::KeySync { new_key_id } => {
                let mut buf = Vec::with_capacity(5);
                buf.push(TYPE_KEY_SYNC);
                buf.extend_from_slice(&new_key_id.to_be_bytes());
                buf
            }
            VoiceFrame::EncryptedWrapper {
                inner_type,
                key_id,
                nonce,
                tag,
                ciphertext,
            } => {
                let mut buf = Vec::with_capacity(34 + ciphertext.len());
                buf.push(TYPE_ENCRYPTED_WRAPPER);
                buf.push(*inner_type);
                buf.extend_from_slice(&key_id.to_be_bytes());
                buf.extend_from_slice(nonce);
                buf.extend_from_slice(tag);
                buf.extend_from_slice(ciphertext);
                buf
            }
            VoiceFrame::Keepalive => vec![TYPE_KEEPALIVE],
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let type_byte = *data.first().ok_or(ProtocolError::PacketTooShort {
            expected: 1,
            got: 0,
        })?;

        match type_byte {
            TYPE_HELLO => {
                let flags = *data.get(1).ok_or(ProtocolError::PacketTooShort {
                    expected: 2,
                    got: data.len(),
                })?;
                let client_id = read_client_id(data, 2)?;
                let (username, _) = read_length_prefixed_str(data, 18)?;
                Ok(VoiceFrame::Hello {
                    flags,
                    client_id,
                    username,
                })
            }
            TYPE_WELCOME => {
                if data.len() < 6 {
                    return Err(ProtocolError::PacketTooShort {
                        expected: 6,
                        got: data.len(),
                    });
                }
                Ok(VoiceFrame::Welcome {
                    flags: data[1],
                    current_key_id: u32::from_be_bytes(data[2..6].try_into().unwrap()),
                })
            }
            TYPE_JOIN_CHANNEL => {
                let client_id = read_client_id(data, 2)?;
                let (channel, _) = read_length_prefixed_str(data, 18)?;
                Ok(VoiceFrame::JoinChannel { client_id, channel })
            }
            TYPE_LEAVE_CHANNEL => {
                let client_id = read_client_id(data, 2)?;
                Ok(VoiceFrame::LeaveChannel { client_id })
            }
            TYPE_VOICE_PACKET => {
                if data.len() < 10 {
                    return Err(ProtocolError::PacketTooShort {
                        expected: 10,
                        got: data.len(),
                    });
                }
                Ok(VoiceFrame::VoicePacket {
                    seq: u32::from_be_bytes(data[2..6].try_into().unwrap()),
                    ts: u32::from_be_bytes(data[6..10].try_into().unwrap()),
                    payload: data[10..].to_vec(),
                })
            }
            TYPE_VOICE_FEC => {
                let (channel, after_chan) = read_length_prefixed_str(data, 1)?;
                if data.len() < after_chan + 4 {
                    return Err(ProtocolError::PacketTooShort {
                        expected: after_chan + 4,
                        got: data.len(),
                    });
                }
                let base_seq =
                    u32::from_be_bytes(data[after_chan..after_chan + 4].try_into().unwrap());
                let parity = data[after_chan + 4..].to_vec();
                Ok(VoiceFrame::VoiceFec {
                    channel,
                    base_seq,
                    parity,
                })
            }
            TYPE_SPEAKING_STATE => {
                if data.len() < 19 {
                    return Err(ProtocolError::PacketTooShort {
                        expected: 19,
                        got: data.len(),
                    });
                }
                let client_id = read_client_id(data, 3)?;
                Ok(VoiceFrame::SpeakingState {
                    speaking: data[2] != 0,
                    client_id,
                })
            }
            TYPE_KEY_SYNC => {
                if data.len() < 5 {
                    return Err(ProtocolError::PacketTooShort {
                        expected: 5,
                        got: data.len(),
                    });
                }
                Ok(VoiceFrame::KeySync {
                    new_key_id: u32::from_be_bytes(data[1..5].try_into().unwrap()),
                })
            }
            TYPE_ENCRYPTED_WRAPPER => {
                if data.len() < 34 {
                    return Err(ProtocolError::PacketTooShort {
                        expected: 34,
                        got: data.len(),
                    });
                }
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&data[6..18]);
                let mut tag = [0u8; 16];
                tag.copy_from_slice(&data[18..34]);
                Ok(VoiceFrame::EncryptedWrapper {
                    inner_type: data[1],
                    key_id: u32::from_be_bytes(data[2..6].try_into().unwrap()),
                    nonce,
                    tag,
                    ciphertext: data[34..].to_vec(),
                })
            }
            TYPE_KEEPALIVE => Ok(VoiceFrame::Keepalive),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }

    /// For an `EncryptedWrapper`, the `key_id ‖ nonce ‖ tag ‖ ciphertext`
    /// buffer a `CryptoCore` expects — the wrapper's framing is that layout
    /// with two header bytes (type, inner_type) stripped off the front.
    pub fn encrypted_payload(&self) -> Option<Vec<u8>> {
        match self {
            VoiceFrame::EncryptedWrapper {
                key_id,
                nonce,
                tag,
                ciphertext,
                ..
            } => {
                let mut buf = Vec::with_capacity(4 + 12 + 16 + ciphertext.len());
                buf.extend_from_slice(&key_id.to_be_bytes());
                buf.extend_from_slice(nonce);
                buf.extend_from_slice(tag);
                buf.extend_from_slice(ciphertext);
                Some(buf)
            }
            _ => None,
        }
    }

    /// Build an `EncryptedWrapper` around a `CryptoCore::seal` output, which
    /// is already laid out as `key_id ‖ nonce ‖ tag ‖ ciphertext`.
    pub fn wrap_sealed(inner_type: u8, sealed: &[u8]) -> Option<Self> {
        if sealed.len() < 32 {
            return None;
        }
        let key_id = u32::from_be_bytes(sealed[0..4].try_into().ok()?);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&sealed[4..16]);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&sealed[16..32]);
        Some(VoiceFrame::EncryptedWrapper {
            inner_type,
            key_id,
            nonce,
            tag,
            ciphertext: sealed[32..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_hello() {
        let frame = VoiceFrame::Hello {
            flags: 0,
            client_id: [0xaa; 16],
            username: "alice".into(),
        };
        let decoded = VoiceFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_hello_empty_username() {
        let frame = VoiceFrame::Hello {
            flags: 0,
            client_id: [0x01; 16],
            username: String::new(),
        };
        let decoded = VoiceFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_welcome() {
        let frame = VoiceFrame::Welcome {
            flags: 0,
            current_key_id: 7,
        };
        assert_eq!(VoiceFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn roundtrip_join_and_leave_channel() {
        let join = VoiceFrame::JoinChannel {
            client_id: [0xbb; 16],
            channel: "general".into(),
        };
        assert_eq!(VoiceFrame::decode(&join.encode()).unwrap(), join);

        let leave = VoiceFrame::LeaveChannel {
            client_id: [0xbb; 16],
        };
        assert_eq!(VoiceFrame::decode(&leave.encode()).unwrap(), leave);
    }

    #[test]
    fn roundtrip_voice_packet() {
        let frame = VoiceFrame::VoicePacket {
            seq: 42,
            ts: 123456,
            payload: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(VoiceFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn roundtrip_voice_fec() {
        let frame = VoiceFrame::VoiceFec {
            channel: "general".into(),
            base_seq: 100,
            parity: vec![9, 9, 9],
        };
        let bytes = frame.encode();
        assert_eq!(bytes[0], TYPE_VOICE_FEC);
        assert_eq!(VoiceFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn roundtrip_speaking_state() {
        let frame = VoiceFrame::SpeakingState {
            speaking: true,
            client_id: [0xcc; 16],
        };
        assert_eq!(VoiceFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn roundtrip_key_sync() {
        let frame = VoiceFrame::KeySync { new_key_id: 3 };
        assert_eq!(VoiceFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn roundtrip_encrypted_wrapper() {
        let frame = VoiceFrame::EncryptedWrapper {
            inner_type: TYPE_VOICE_PACKET,
            key_id: 2,
            nonce: [1u8; 12],
            tag: [2u8; 16],
            ciphertext: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        assert_eq!(VoiceFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn roundtrip_keepalive() {
        let frame = VoiceFrame::Keepalive;
        assert_eq!(VoiceFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn empty_packet_is_too_short() {
        assert!(matches!(
            VoiceFrame::decode(&[]),
            Err(ProtocolError::PacketTooShort { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(matches!(
            VoiceFrame::decode(&[0x77]),
            Err(ProtocolError::UnknownPacketType(0x77))
        ));
    }

    #[test]
    fn truncated_encrypted_wrapper_is_too_short() {
        assert!(matches!(
            VoiceFrame::decode(&[TYPE_ENCRYPTED_WRAPPER, 0x20, 0, 0]),
            Err(ProtocolError::PacketTooShort { .. })
        ));
    }

    #[test]
    fn wrap_sealed_and_encrypted_payload_are_inverses() {
        let sealed = {
            let mut buf = vec![0u8; 4];
            buf[3] = 9; // key_id = 9
            buf.extend_from_slice(&[1u8; 12]); // nonce
            buf.extend_from_slice(&[2u8; 16]); // tag
            buf.extend_from_slice(&[0xAB, 0xCD]); // ciphertext
            buf
        };
        let wrapped = VoiceFrame::wrap_sealed(TYPE_VOICE_PACKET, &sealed).unwrap();
        assert_eq!(wrapped.encrypted_payload().unwrap(), sealed);
    }

    #[test]
    fn fec_type_byte_is_voice_packet_high_bit_set() {
        assert_eq!(TYPE_VOICE_FEC, TYPE_VOICE_PACKET | 0x80);
    }
}
