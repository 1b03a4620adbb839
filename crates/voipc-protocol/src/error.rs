use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("unknown UDP packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("invalid UTF-8 in packet field")]
    InvalidUtf8,

    #[error("message too large: {0} bytes (max 65536)")]
    MessageTooLarge(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_too_short_display() {
        let e = ProtocolError::PacketTooShort { expected: 19, got: 5 };
        let msg = e.to_string();
        assert!(msg.contains("19"));
        assert!(msg.contains('5'));
    }

    #[test]
    fn unknown_packet_type_display() {
        let e = ProtocolError::UnknownPacketType(0xAB);
        let msg = e.to_string();
        assert!(msg.contains("0xab"));
    }

    #[test]
    fn message_too_large_display() {
        let e = ProtocolError::MessageTooLarge(100000);
        let msg = e.to_string();
        assert!(msg.contains("100000"));
    }

    #[test]
    fn from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let proto_err: ProtocolError = json_err.into();
        assert!(matches!(proto_err, ProtocolError::Json(_)));
    }
}
