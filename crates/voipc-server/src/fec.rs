//! Per-channel XOR forward error correction over fixed 4-packet blocks.

use dashmap::DashMap;

pub const BLOCK_SIZE: usize = 4;
/// `VOICE_PACKET | 0x80` — the high bit on the voice packet type marks FEC.
pub const FEC_TYPE_MARKER: u8 = 0x80;

#[derive(Default)]
struct ChannelAccumulator {
    base_seq: Option<u32>,
    buffers: Vec<Vec<u8>>,
}

/// One completed FEC block: the sequence number of its first packet and the
/// XOR parity covering all four.
pub struct ParityBlock {
    pub base_seq: u32,
    pub parity: Vec<u8>,
}

/// Accumulates forwarded voice payloads per channel and emits an XOR parity
/// packet every 4 packets, recovering any single loss within the block.
#[derive(Default)]
pub struct FecEncoder {
    channels: DashMap<String, ChannelAccumulator>,
}

impl FecEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one forwarded packet's sequence and payload for `channel`.
    /// Returns a completed parity block once every 4 packets.
    pub fn on_forwarded_packet(
        &self,
        channel: &str,
        sequence: u32,
        payload: &[u8],
    ) -> Option<ParityBlock> {
        let mut acc = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(ChannelAccumulator::default);

        if acc.buffers.is_empty() {
            acc.base_seq = Some(sequence);
        }
        acc.buffers.push(payload.to_vec());

        if acc.buffers.len() < BLOCK_SIZE {
            return None;
        }

        let max_len = acc.buffers.iter().map(Vec::len).max().unwrap_or(0);
        let mut parity = vec![0u8; max_len];
        for buf in &acc.buffers {
            for (i, b) in buf.iter().enumerate() {
                parity[i] ^= b;
            }
        }
        let base_seq = acc.base_seq.take().unwrap_or(sequence);
        acc.buffers.clear();

        Some(ParityBlock { base_seq, parity })
    }

    /// Drop all accumulator state for a channel (channel emptied/deleted).
    pub fn reset_channel(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_parity_every_four_packets() {
        let enc = FecEncoder::new();
        assert!(enc.on_forwarded_packet("general", 0, &[1, 2]).is_none());
        assert!(enc.on_forwarded_packet("general", 1, &[3, 4]).is_none());
        assert!(enc.on_forwarded_packet("general", 2, &[5, 6]).is_none());
        let block = enc.on_forwarded_packet("general", 3, &[7, 8]).unwrap();
        assert_eq!(block.base_seq, 0);
        assert_eq!(block.parity, vec![1 ^ 3 ^ 5 ^ 7, 2 ^ 4 ^ 6 ^ 8]);
    }

    #[test]
    fn parity_recovers_any_single_missing_packet() {
        let enc = FecEncoder::new();
        enc.on_forwarded_packet("general", 0, &[10]);
        enc.on_forwarded_packet("general", 1, &[20]);
        enc.on_forwarded_packet("general", 2, &[30]);
        let block = enc.on_forwarded_packet("general", 3, &[40]).unwrap();
        // A receiver missing packet seq=2 recovers it by XOR-ing the parity
        // with the three packets it did receive.
        let recovered = block.parity[0] ^ 10 ^ 20 ^ 40;
        assert_eq!(recovered, 30);
    }

    #[test]
    fn handles_variable_length_payloads() {
        let enc = FecEncoder::new();
        enc.on_forwarded_packet("general", 0, &[1, 2, 3]);
        enc.on_forwarded_packet("general", 1, &[1]);
        enc.on_forwarded_packet("general", 2, &[1, 1]);
        let block = enc.on_forwarded_packet("general", 3, &[]).unwrap();
        assert_eq!(block.parity.len(), 3);
    }

    #[test]
    fn blocks_are_independent_per_channel() {
        let enc = FecEncoder::new();
        enc.on_forwarded_packet("general", 0, &[1]);
        enc.on_forwarded_packet("lounge", 0, &[9]);
        assert!(enc.on_forwarded_packet("general", 1, &[1]).is_none());
        assert!(enc.on_forwarded_packet("lounge", 1, &[9]).is_none());
    }

    #[test]
    fn next_block_base_seq_continues_from_reset_point() {
        let enc = FecEncoder::new();
        for n in 0..4u32 {
            enc.on_forwarded_packet("general", n, &[n as u8]);
        }
        let block = enc.on_forwarded_packet("general", 4, &[4]);
        assert!(block.is_none());
        for n in 5..8u32 {
            enc.on_forwarded_packet("general", n, &[n as u8]);
        }
        let block = enc.on_forwarded_packet("general", 8, &[8]).unwrap();
        assert_eq!(block.base_seq, 4);
    }
}
