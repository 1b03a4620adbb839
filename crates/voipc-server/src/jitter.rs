//! Per-(receiver, sender) jitter buffering and adaptive playout delay.
//!
//! The relay's source mixed senders into one FIFO per receiver, which left it
//! ambiguous whether release order was guaranteed across senders. We split
//! the buffer by (receiver, sender) pair so release order is well-defined
//! within a sender and stats (loss, jitter) never blend two speakers.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use voipc_protocol::ClientId;

pub const TARGET_DELAY_INITIAL: Duration = Duration::from_millis(40);
pub const TARGET_DELAY_MIN: Duration = Duration::from_millis(10);
pub const TARGET_DELAY_MAX: Duration = Duration::from_millis(200);
pub const WIDEN_FACTOR: f64 = 1.15;
pub const NARROW_FACTOR: f64 = 1.0 - 0.075;
pub const JITTER_ADAPTATION_RATE: f64 = 0.15;
pub const MAX_QUEUED_ENTRIES: usize = 20;
pub const LATE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone)]
struct Entry {
    sequence: u32,
    sender_ts: u32,
    received_at: Instant,
    payload: Vec<u8>,
}

struct PairState {
    delay: Duration,
    entries: Vec<Entry>,
    last_seq: Option<u32>,
    last_ts: Option<u32>,
    last_received_at: Option<Instant>,
    late_count: u32,
    jitter_ewma_ms: f64,
    packets_received: u64,
    packets_lost: u64,
}

impl Default for PairState {
    fn default() -> Self {
        Self {
            delay: TARGET_DELAY_INITIAL,
            entries: Vec::new(),
            last_seq: None,
            last_ts: None,
            last_received_at: None,
            late_count: 0,
            jitter_ewma_ms: 0.0,
            packets_received: 0,
            packets_lost: 0,
        }
    }
}

/// One payload released from the buffer, with the sequence/timestamp it was
/// originally sent under so the forwarder can re-seal it correctly.
#[derive(Debug, Clone)]
pub struct Released {
    pub sequence: u32,
    pub sender_ts: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PairStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub avg_jitter_ms: f64,
    pub delay_ms: u64,
}

/// Reorders voice frames per (receiver, sender), smooths arrival jitter with
/// an adaptive playout delay, and hands the forwarder a mostly in-order
/// stream. Every UDP client owns only the rows it receives for — the relay's
/// single datagram loop is the only caller, so interior mutability here is
/// about ergonomics, not contended locking.
#[derive(Default)]
pub struct JitterBuffer {
    pairs: DashMap<(ClientId, ClientId), PairState>,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one arrived packet from `sender` as observed by `receiver`'s
    /// forwarding path. Returns payloads now eligible for release, in order.
    pub fn on_packet_arrival(
        &self,
        receiver: ClientId,
        sender: ClientId,
        sequence: u32,
        sender_ts: u32,
        payload: Vec<u8>,
        now: Instant,
    ) -> Vec<Released> {
        let mut state = self.pairs.entry((receiver, sender)).or_default();

        state.packets_received += 1;

        if let (Some(last_ts), Some(last_received_at)) = (state.last_ts, state.last_received_at) {
            let ts_delta = sender_ts.wrapping_sub(last_ts) as i64;
            let expected_arrival = last_received_at + Duration::from_millis(ts_delta.max(0) as u64);
            let sample_ms = duration_abs_ms(now, expected_arrival);
            state.jitter_ewma_ms += (sample_ms - state.jitter_ewma_ms) * JITTER_ADAPTATION_RATE;
        }

        if let Some(last_seq) = state.last_seq {
            if sequence > last_seq + 1 {
                state.packets_lost += (sequence - last_seq - 1) as u64;
            }
            if sequence <= last_seq {
                state.late_count += 1;
                if state.late_count >= LATE_THRESHOLD {
                    let widened = state.delay.as_secs_f64() * WIDEN_FACTOR;
                    state.delay = Duration::from_secs_f64(widened).min(TARGET_DELAY_MAX);
                    state.late_count = 0;
                }
            }
        }

        let insert_at = state
            .entries
            .binary_search_by_key(&sequence, |e| e.sequence)
            .unwrap_or_else(|pos| pos);
        state.entries.insert(
            insert_at,
            Entry {
                sequence,
                sender_ts,
                received_at: now,
                payload,
            },
        );

        let mut released = Vec::new();
        let to_released = |e: Entry| Released {
            sequence: e.sequence,
            sender_ts: e.sender_ts,
            payload: e.payload,
        };

        while state.entries.len() > MAX_QUEUED_ENTRIES {
            released.push(to_released(state.entries.remove(0)));
        }

        let delay = state.delay;
        let mut i = 0;
        while i < state.entries.len() {
            if now.saturating_duration_since(state.entries[i].received_at) >= delay {
                released.push(to_released(state.entries.remove(i)));
            } else {
                i += 1;
            }
        }

        if state.entries.len() < 2 && state.delay > TARGET_DELAY_MIN {
            let narrowed = state.delay.as_secs_f64() * NARROW_FACTOR;
            state.delay = Duration::from_secs_f64(narrowed).max(TARGET_DELAY_MIN);
        }

        state.last_seq = Some(state.last_seq.map_or(sequence, |l| l.max(sequence)));
        state.last_ts = Some(sender_ts);
        state.last_received_at = Some(now);

        released
    }

    /// Discard all state involving `client`, either as a receiver or as a
    /// sender other receivers were tracking (leave/rejoin, eviction).
    pub fn reset_client(&self, client: ClientId) {
        self.pairs.retain(|(r, s), _| *r != client && *s != client);
    }

    pub fn stats(&self, receiver: ClientId, sender: ClientId) -> Option<PairStats> {
        self.pairs.get(&(receiver, sender)).map(|s| PairStats {
            packets_received: s.packets_received,
            packets_lost: s.packets_lost,
            avg_jitter_ms: s.jitter_ewma_ms,
            delay_ms: s.delay.as_millis() as u64,
        })
    }
}

fn duration_abs_ms(a: Instant, b: Instant) -> f64 {
    if a >= b {
        a.duration_since(b).as_secs_f64() * 1000.0
    } else {
        b.duration_since(a).as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> ClientId {
        [b; 16]
    }

    #[test]
    fn in_order_packets_release_after_delay() {
        let jb = JitterBuffer::new();
        let r = id(1);
        let s = id(2);
        let t0 = Instant::now();

        let released = jb.on_packet_arrival(r, s, 0, 0, vec![0], t0);
        assert!(released.is_empty());

        let released = jb.on_packet_arrival(r, s, 1, 20, vec![1], t0 + Duration::from_millis(20));
        assert!(released.is_empty());

        // 50ms later the first entry (40ms delay) should have aged out.
        let released = jb.on_packet_arrival(
            r,
            s,
            2,
            40,
            vec![2],
            t0 + Duration::from_millis(60),
        );
        assert!(!released.is_empty());
    }

    #[test]
    fn out_of_order_arrival_tracked_as_loss_then_recovered() {
        let jb = JitterBuffer::new();
        let r = id(1);
        let s = id(2);
        let t0 = Instant::now();

        jb.on_packet_arrival(r, s, 0, 0, vec![0], t0);
        // seq 2 arrives before seq 1 "lost" count increments once relative to last_seq.
        jb.on_packet_arrival(r, s, 2, 40, vec![2], t0 + Duration::from_millis(40));
        let stats = jb.stats(r, s).unwrap();
        assert_eq!(stats.packets_lost, 1);
    }

    #[test]
    fn forced_release_past_capacity() {
        let jb = JitterBuffer::new();
        let r = id(1);
        let s = id(2);
        let t0 = Instant::now();

        let mut total_released = 0;
        for n in 0..30u32 {
            let released = jb.on_packet_arrival(r, s, n, n * 20, vec![n as u8], t0);
            total_released += released.len();
        }
        // Every packet beyond the 20-entry cap must be forced out immediately.
        assert!(total_released >= 10);
    }

    #[test]
    fn late_duplicate_widens_delay_after_threshold() {
        let jb = JitterBuffer::new();
        let r = id(1);
        let s = id(2);
        let t0 = Instant::now();

        jb.on_packet_arrival(r, s, 10, 0, vec![0], t0);
        for _ in 0..LATE_THRESHOLD {
            jb.on_packet_arrival(r, s, 5, 0, vec![0], t0);
        }
        let stats = jb.stats(r, s).unwrap();
        assert!(stats.delay_ms > TARGET_DELAY_INITIAL.as_millis() as u64);
    }

    #[test]
    fn reset_client_drops_all_its_sender_pairs() {
        let jb = JitterBuffer::new();
        let r = id(1);
        jb.on_packet_arrival(r, id(2), 0, 0, vec![0], Instant::now());
        jb.on_packet_arrival(r, id(3), 0, 0, vec![0], Instant::now());
        jb.reset_client(r);
        assert!(jb.stats(r, id(2)).is_none());
        assert!(jb.stats(r, id(3)).is_none());
    }

    #[test]
    fn distinct_senders_to_same_receiver_are_independent() {
        let jb = JitterBuffer::new();
        let r = id(1);
        jb.on_packet_arrival(r, id(2), 5, 0, vec![0], Instant::now());
        jb.on_packet_arrival(r, id(3), 0, 0, vec![0], Instant::now());
        // sender id(3) starting at seq 0 must not be seen as "late" relative to sender id(2).
        let stats = jb.stats(r, id(3)).unwrap();
        assert_eq!(stats.packets_lost, 0);
    }
}
