//! VoiceRelay — terminates the UDP wire protocol, owns client/channel
//! registries, and forwards media through CryptoCore, the jitter buffer and
//! the FEC encoder.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::time::Instant;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use voipc_crypto::CryptoCore;
use voipc_protocol::types::format_client_id;
use voipc_protocol::voice::{VoiceFrame, TYPE_VOICE_PACKET};
use voipc_protocol::ClientId;

use crate::fec::FecEncoder;
use crate::jitter::JitterBuffer;

/// Evict UDP clients idle for longer than this.
pub const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const STALE_REAPER_INTERVAL: Duration = Duration::from_secs(30);
pub const KEY_ROTATION_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

struct ClientEntry {
    endpoint: SocketAddr,
    username: String,
    channel: Option<String>,
    last_seen: Instant,
    seq_counter: AtomicU32,
    decryption_failures: AtomicU32,
}

/// Owns the UDP socket, client/channel registries, and the address→id index.
/// All mutation happens from the single datagram receive loop in
/// [`VoiceRelay::run`]; the DashMaps exist for ergonomic per-key access, not
/// to support genuine concurrent writers.
pub struct VoiceRelay {
    socket: Arc<UdpSocket>,
    crypto: Arc<CryptoCore>,
    jitter: JitterBuffer,
    fec: FecEncoder,
    clients: DashMap<ClientId, ClientEntry>,
    channels: DashMap<String, HashSet<ClientId>>,
    addr_index: DashMap<SocketAddr, ClientId>,
}

impl VoiceRelay {
    pub fn new(socket: Arc<UdpSocket>, crypto: Arc<CryptoCore>) -> Arc<Self> {
        Arc::new(Self {
            socket,
            crypto,
            jitter: JitterBuffer::new(),
            fec: FecEncoder::new(),
            clients: DashMap::new(),
            channels: DashMap::new(),
            addr_index: DashMap::new(),
        })
    }

    pub async fn run(self: Arc<Self>) {
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STALE_REAPER_INTERVAL);
            loop {
                ticker.tick().await;
                reaper.reap_stale_clients().await;
            }
        });

        let rotator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEY_ROTATION_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                rotator.key_rotation_sweep().await;
            }
        });

        let mut buf = vec![0u8; 1500];
        loop {
            let (len, src_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("UDP recv error: {e}");
                    continue;
                }
            };
            self.handle_datagram(&buf[..len], src_addr).await;
        }
    }

    async fn handle_datagram(&self, data: &[u8], src_addr: SocketAddr) {
        let frame = match VoiceFrame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                warn!(src = %src_addr, "malformed UDP frame: {e}");
                return;
            }
        };

        match frame {
            VoiceFrame::Hello {
                flags,
                client_id,
                username,
            } => self.handle_hello(flags, client_id, username, src_addr).await,
            VoiceFrame::JoinChannel { client_id, channel } => {
                self.handle_join_channel(client_id, channel).await
            }
            VoiceFrame::LeaveChannel { client_id } => self.handle_leave_channel(client_id).await,
            VoiceFrame::EncryptedWrapper { inner_type, .. } if inner_type == TYPE_VOICE_PACKET => {
                self.handle_encrypted_voice(&frame, src_addr).await
            }
            VoiceFrame::SpeakingState {
                speaking,
                client_id,
            } => self.handle_speaking_state(speaking, client_id, src_addr).await,
            VoiceFrame::Keepalive => self.handle_keepalive(src_addr),
            other => {
                warn!(src = %src_addr, "unhandled voice frame: {other:?}");
            }
        }
    }

    /// Register or refresh a client. Idempotent: a repeat HELLO from the
    /// same client id updates the endpoint but preserves channel membership
    /// and jitter-buffer state.
    async fn handle_hello(
        &self,
        _flags: u8,
        client_id: ClientId,
        username: String,
        src_addr: SocketAddr,
    ) {
        match self.clients.get_mut(&client_id) {
            Some(mut entry) => {
                if entry.endpoint != src_addr {
                    self.addr_index.remove(&entry.endpoint);
                    self.addr_index.insert(src_addr, client_id);
                    entry.endpoint = src_addr;
                }
                entry.username = username;
                entry.last_seen = Instant::now();
            }
            None => {
                self.clients.insert(
                    client_id,
                    ClientEntry {
                        endpoint: src_addr,
                        username,
                        channel: None,
                        last_seen: Instant::now(),
                        seq_counter: AtomicU32::new(0),
                        decryption_failures: AtomicU32::new(0),
                    },
                );
                self.addr_index.insert(src_addr, client_id);
            }
        }

        let welcome = VoiceFrame::Welcome {
            flags: 0,
            current_key_id: self.crypto.current_key_id(),
        };
        self.send_to(&welcome.encode(), src_addr).await;
    }

    async fn handle_join_channel(&self, client_id: ClientId, channel: String) {
        let Some(mut entry) = self.clients.get_mut(&client_id) else {
            return;
        };

        if entry.channel.as_deref() == Some(channel.as_str()) {
            return;
        }

        if let Some(old) = entry.channel.take() {
            if let Some(mut members) = self.channels.get_mut(&old) {
                members.remove(&client_id);
            }
        }

        self.channels
            .entry(channel.clone())
            .or_default()
            .insert(client_id);
        entry.channel = Some(channel.clone());
        drop(entry);

        let marker = VoiceFrame::JoinChannel { client_id, channel: channel.clone() }.encode();
        self.broadcast_to_channel(&channel, &marker, Some(client_id)).await;
    }

    async fn handle_leave_channel(&self, client_id: ClientId) {
        let Some(mut entry) = self.clients.get_mut(&client_id) else {
            return;
        };
        let Some(channel) = entry.channel.take() else {
            return;
        };
        drop(entry);

        if let Some(mut members) = self.channels.get_mut(&channel) {
            members.remove(&client_id);
            if members.is_empty() {
                drop(members);
                self.channels.remove(&channel);
                self.fec.reset_channel(&channel);
            }
        }
        self.jitter.reset_client(client_id);

        let marker = VoiceFrame::LeaveChannel { client_id }.encode();
        self.broadcast_to_channel(&channel, &marker, Some(client_id)).await;
    }

    async fn handle_encrypted_voice(&self, frame: &VoiceFrame, src_addr: SocketAddr) {
        let Some(sender_id) = self.resolve_client(src_addr) else {
            trace!(src = %src_addr, "voice packet from unregistered endpoint");
            return;
        };

        let Some(channel) = self.clients.get(&sender_id).and_then(|e| e.channel.clone()) else {
            return;
        };

        let Some(crypto_payload) = frame.encrypted_payload() else {
            return;
        };

        let Some(plaintext) = self.crypto.open(&crypto_payload, &channel) else {
            if let Some(entry) = self.clients.get(&sender_id) {
                entry.decryption_failures.fetch_add(1, Ordering::Relaxed);
            }
            debug!(sender = %format_client_id(&sender_id), "voice frame failed to decrypt");
            return;
        };

        let (seq, ts, payload) = match VoiceFrame::decode(&plaintext) {
            Ok(VoiceFrame::VoicePacket { seq, ts, payload }) => (seq, ts, payload),
            _ => {
                let seq = self
                    .clients
                    .get(&sender_id)
                    .map(|e| e.seq_counter.fetch_add(1, Ordering::Relaxed))
                    .unwrap_or(0);
                (seq, now_millis(), plaintext)
            }
        };

        if let Some(mut entry) = self.clients.get_mut(&sender_id) {
            entry.last_seen = Instant::now();
        }

        if let Some(block) = self.fec.on_forwarded_packet(&channel, seq, &payload) {
            let fec_frame = VoiceFrame::VoiceFec {
                channel: channel.clone(),
                base_seq: block.base_seq,
                parity: block.parity,
            };
            self.broadcast_to_channel(&channel, &fec_frame.encode(), Some(sender_id)).await;
        }

        let Some(members) = self.channels.get(&channel).map(|m| m.clone()) else {
            return;
        };

        let now = Instant::now();
        for receiver_id in members {
            if receiver_id == sender_id {
                continue;
            }
            let released = self
                .jitter
                .on_packet_arrival(receiver_id, sender_id, seq, ts, payload.clone(), now);

            let Some(receiver_endpoint) = self.clients.get(&receiver_id).map(|e| e.endpoint) else {
                continue;
            };

            for r in released {
                let inner = VoiceFrame::VoicePacket {
                    seq: r.sequence,
                    ts: r.sender_ts,
                    payload: r.payload,
                }
                .encode();
                let sealed = self.crypto.seal(&inner, &channel, r.sequence);
                if let Some(wrapped) = VoiceFrame::wrap_sealed(TYPE_VOICE_PACKET, &sealed) {
                    self.send_to(&wrapped.encode(), receiver_endpoint).await;
                }
            }
        }
    }

    async fn handle_speaking_state(&self, speaking: bool, client_id: ClientId, src_addr: SocketAddr) {
        let Some(resolved) = self.resolve_client(src_addr) else {
            return;
        };
        if resolved != client_id {
            warn!(src = %src_addr, "SPEAKING_STATE client id does not match source endpoint");
            return;
        }
        let Some(channel) = self.clients.get(&client_id).and_then(|e| e.channel.clone()) else {
            return;
        };
        let marker = VoiceFrame::SpeakingState { speaking, client_id }.encode();
        self.broadcast_to_channel(&channel, &marker, Some(client_id)).await;
    }

    fn handle_keepalive(&self, src_addr: SocketAddr) {
        if let Some(client_id) = self.resolve_client(src_addr) {
            if let Some(mut entry) = self.clients.get_mut(&client_id) {
                entry.last_seen = Instant::now();
            }
        }
    }

    /// `address:port → client id`, populated on HELLO and repaired here via
    /// a scanning fallback if the index ever misses a registered client.
    fn resolve_client(&self, src_addr: SocketAddr) -> Option<ClientId> {
        if let Some(id) = self.addr_index.get(&src_addr) {
            return Some(*id);
        }
        for entry in self.clients.iter() {
            if entry.value().endpoint == src_addr {
                let id = *entry.key();
                self.addr_index.insert(src_addr, id);
                return Some(id);
            }
        }
        None
    }

    async fn broadcast_to_channel(&self, channel: &str, payload: &[u8], exclude: Option<ClientId>) {
        let Some(members) = self.channels.get(channel).map(|m| m.clone()) else {
            return;
        };
        for member in members {
            if Some(member) == exclude {
                continue;
            }
            if let Some(endpoint) = self.clients.get(&member).map(|e| e.endpoint) {
                self.send_to(payload, endpoint).await;
            }
        }
    }

    async fn send_to(&self, payload: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(payload, addr).await {
            debug!(%addr, "UDP send failed: {e}");
        }
    }

    async fn reap_stale_clients(&self) {
        let stale: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|e| e.last_seen.elapsed() > CLIENT_IDLE_TIMEOUT)
            .map(|e| *e.key())
            .collect();

        for client_id in stale {
            if let Some((_, entry)) = self.clients.remove(&client_id) {
                self.addr_index.remove(&entry.endpoint);
                if let Some(channel) = entry.channel {
                    if let Some(mut members) = self.channels.get_mut(&channel) {
                        members.remove(&client_id);
                        if members.is_empty() {
                            drop(members);
                            self.channels.remove(&channel);
                            self.fec.reset_channel(&channel);
                        }
                    }
                }
                self.jitter.reset_client(client_id);
                debug!(client = %format_client_id(&client_id), "evicted stale UDP client");
            }
        }
    }

    async fn key_rotation_sweep(&self) {
        if self.crypto.maybe_rotate() {
            let new_key_id = self.crypto.current_key_id();
            let joined: Vec<(ClientId, SocketAddr)> = self
                .clients
                .iter()
                .filter(|e| e.channel.is_some())
                .map(|e| (*e.key(), e.value().endpoint))
                .collect();
            let frame = VoiceFrame::KeySync { new_key_id }.encode();
            for (_, endpoint) in joined {
                self.send_to(&frame, endpoint).await;
            }
        }
    }
}

fn now_millis() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32
}
