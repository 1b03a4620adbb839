//! CryptoCore — per-channel voice key derivation, AEAD seal/open, and key rotation.
//!
//! The master secret never leaves this module. Everything derived from it
//! (channel keys, client keys) is recomputed on demand via HMAC-SHA256 rather
//! than cached, so there is no derived-key state to roll back on rotation —
//! `open` simply re-derives whatever key id the packet claims.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use tokio::time::Instant;
use zeroize::Zeroizing;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Size of the sealed-frame wrapper before any ciphertext: key_id(4) + nonce(12) + tag(16).
pub const FRAME_OVERHEAD: usize = 4 + 12 + 16;

/// How long a key id remains the active signing key before a sweep rotates it.
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Turns a 32-byte master secret into per-channel/per-client traffic keys and
/// seals/opens voice frames with AES-256-GCM.
pub struct CryptoCore {
    master: Zeroizing<[u8; 32]>,
    current_key_id: AtomicU32,
    last_rotation: Mutex<Instant>,
}

impl CryptoCore {
    pub fn new(master: [u8; 32]) -> Self {
        Self {
            master: Zeroizing::new(master),
            current_key_id: AtomicU32::new(0),
            last_rotation: Mutex::new(Instant::now()),
        }
    }

    /// Generate a fresh random master secret (used when `VOICE_MASTER_KEY` is unset in dev).
    pub fn generate_master() -> Result<[u8; 32], CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes).map_err(|_| CryptoError::RngFailure)?;
        Ok(bytes)
    }

    pub fn current_key_id(&self) -> u32 {
        self.current_key_id.load(Ordering::Acquire)
    }

    fn hmac(&self, label: &[u8]) -> [u8; 32] {
        let mut mac =
            HmacSha256::new_from_slice(self.master.as_slice()).expect("HMAC accepts any key length");
        mac.update(label);
        let out = mac.finalize().into_bytes();
        let mut key = [0u8; 32];
        key.copy_from_slice(&out[..32]);
        key
    }

    /// HMAC-SHA256(master, "vibespeak-voice-" || channel_id || "-" || key_id).
    pub fn derive_channel_key(&self, channel_id: &str, key_id: u32) -> [u8; 32] {
        let label = format!("vibespeak-voice-{channel_id}-{key_id}");
        self.hmac(label.as_bytes())
    }

    /// HMAC-SHA256(master, "client-" || hex(client_id)).
    pub fn derive_client_key(&self, client_id: &[u8; 16]) -> [u8; 32] {
        let mut label = String::with_capacity(7 + 32);
        label.push_str("client-");
        for b in client_id {
            label.push_str(&format!("{b:02x}"));
        }
        self.hmac(label.as_bytes())
    }

    fn aead_key(key_bytes: &[u8; 32]) -> LessSafeKey {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes).expect("32-byte key is always valid");
        LessSafeKey::new(unbound)
    }

    /// Nonce = 8 zero bytes || big-endian u32(sequence).
    fn nonce_bytes(sequence_number: u32) -> [u8; 12] {
        let mut bytes = [0u8; 12];
        bytes[8..12].copy_from_slice(&sequence_number.to_be_bytes());
        bytes
    }

    /// Seal a voice frame with the currently active channel key.
    ///
    /// Wire layout: `key_id:u32 BE ‖ nonce:12 ‖ tag:16 ‖ ciphertext`.
    pub fn seal(&self, plaintext: &[u8], channel_id: &str, sequence_number: u32) -> Vec<u8> {
        let key_id = self.current_key_id();
        let key_bytes = self.derive_channel_key(channel_id, key_id);
        let aead_key = Self::aead_key(&key_bytes);
        let nonce_bytes = Self::nonce_bytes(sequence_number);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        aead_key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .expect("sealing with a freshly built key cannot fail");

        let tag_at = in_out.len() - 16;
        let (ciphertext, tag) = in_out.split_at(tag_at);

        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + ciphertext.len());
        frame.extend_from_slice(&key_id.to_be_bytes());
        frame.extend_from_slice(&nonce_bytes);
        frame.extend_from_slice(tag);
        frame.extend_from_slice(ciphertext);
        frame
    }

    /// Open a sealed voice frame. Returns `None` (never an exception) on any
    /// malformed input or authentication failure so the relay can count
    /// decryption failures without aborting the packet loop.
    pub fn open(&self, packet: &[u8], channel_id: &str) -> Option<Vec<u8>> {
        if packet.len() < FRAME_OVERHEAD {
            return None;
        }

        let key_id = u32::from_be_bytes(packet[0..4].try_into().ok()?);
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes.copy_from_slice(&packet[4..16]);
        let tag = &packet[16..32];
        let ciphertext = &packet[32..];

        let key_bytes = self.derive_channel_key(channel_id, key_id);
        let aead_key = Self::aead_key(&key_bytes);
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = Vec::with_capacity(ciphertext.len() + tag.len());
        in_out.extend_from_slice(ciphertext);
        in_out.extend_from_slice(tag);

        aead_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .ok()?;
        in_out.truncate(in_out.len() - 16);
        Some(in_out)
    }

    /// Unconditionally advance to a new key id and reset the rotation clock.
    pub fn rotate(&self) -> u32 {
        let new_id = self.current_key_id.fetch_add(1, Ordering::AcqRel) + 1;
        *self.last_rotation.lock().unwrap() = Instant::now();
        new_id
    }

    /// Rotate if the current key is older than `ROTATION_INTERVAL`. Returns
    /// whether a rotation happened.
    pub fn maybe_rotate(&self) -> bool {
        let age = self.last_rotation.lock().unwrap().elapsed();
        if age > ROTATION_INTERVAL {
            self.rotate();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> CryptoCore {
        CryptoCore::new([7u8; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let c = core();
        let sealed = c.seal(b"opus frame", "general", 42);
        let opened = c.open(&sealed, "general").unwrap();
        assert_eq!(opened, b"opus frame");
    }

    #[test]
    fn tampered_frame_fails_open() {
        let c = core();
        let mut sealed = c.seal(b"opus frame", "general", 1);
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(c.open(&sealed, "general").is_none());
    }

    #[test]
    fn wrong_channel_fails_open() {
        let c = core();
        let sealed = c.seal(b"opus frame", "general", 1);
        assert!(c.open(&sealed, "lounge").is_none());
    }

    #[test]
    fn short_packet_fails_open() {
        let c = core();
        assert!(c.open(&[0u8; 10], "general").is_none());
    }

    #[test]
    fn derive_channel_key_is_deterministic() {
        let c = core();
        assert_eq!(
            c.derive_channel_key("general", 0),
            c.derive_channel_key("general", 0)
        );
        assert_ne!(
            c.derive_channel_key("general", 0),
            c.derive_channel_key("general", 1)
        );
        assert_ne!(
            c.derive_channel_key("general", 0),
            c.derive_channel_key("lounge", 0)
        );
    }

    #[test]
    fn derive_client_key_is_deterministic() {
        let c = core();
        let id = [0xAAu8; 16];
        assert_eq!(c.derive_client_key(&id), c.derive_client_key(&id));
    }

    #[test]
    fn rotate_increments_key_id() {
        let c = core();
        assert_eq!(c.current_key_id(), 0);
        assert_eq!(c.rotate(), 1);
        assert_eq!(c.rotate(), 2);
        assert_eq!(c.current_key_id(), 2);
    }

    #[test]
    fn seal_always_uses_current_key_id() {
        let c = core();
        c.rotate();
        c.rotate();
        let sealed = c.seal(b"hi", "general", 1);
        let key_id = u32::from_be_bytes(sealed[0..4].try_into().unwrap());
        assert_eq!(key_id, 2);
    }

    #[test]
    fn open_uses_key_id_embedded_in_packet() {
        let c = core();
        let sealed_before = c.seal(b"hi", "general", 1);
        c.rotate();
        // A frame sealed under the old key must still open after rotation.
        assert_eq!(c.open(&sealed_before, "general").unwrap(), b"hi");
    }

    #[tokio::test(start_paused = true)]
    async fn maybe_rotate_is_noop_before_interval() {
        let c = core();
        assert!(!c.maybe_rotate());
        assert_eq!(c.current_key_id(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn maybe_rotate_fires_after_interval() {
        let c = core();
        tokio::time::advance(Duration::from_secs(25 * 3600)).await;
        assert!(c.maybe_rotate());
        assert_eq!(c.current_key_id(), 1);
        assert!(!c.maybe_rotate());
    }
}
