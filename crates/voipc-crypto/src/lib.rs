//! CryptoCore — voice channel key derivation and AEAD framing.
//!
//! The relay decrypts and re-encrypts media on every hop (no end-to-end
//! encryption between clients), so this crate's only job is turning a single
//! master secret into per-channel traffic keys and sealing/opening frames.

pub mod core;
pub mod error;

pub use crate::core::{CryptoCore, FRAME_OVERHEAD, ROTATION_INTERVAL};
pub use error::CryptoError;
