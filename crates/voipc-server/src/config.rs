//! Process configuration: environment seeds defaults, an optional TOML file
//! overrides those, and CLI flags override both — the same precedence the
//! teacher's `main.rs` applied to its TLS/port settings, generalized to the
//! voice/signaling core's own secrets and ports.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use voipc_crypto::CryptoCore;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    host: Option<String>,
    voice_port: Option<u16>,
    ws_port: Option<u16>,
    allowed_origins: Option<Vec<String>>,
}

/// Fully resolved configuration the binary runs with.
pub struct ServerConfig {
    /// IP address to bind both the UDP and WebSocket listeners on.
    pub host: String,
    /// UDP port for voice traffic (`VOICE_PORT`).
    pub voice_port: u16,
    /// TCP port for the WebSocket signaling plane (`WS_PORT`, falls back to `PORT`).
    pub ws_port: u16,
    /// `Origin` header allowlist; empty means no CORS check is enforced.
    pub allowed_origins: Vec<String>,
    /// 32-byte voice master secret (`VOICE_MASTER_KEY`, 64 hex chars).
    pub voice_master_key: [u8; 32],
    /// Active JWT signing secret (`JWT_SECRET`).
    pub jwt_secret: Vec<u8>,
    /// Previously-active JWT secret honored for in-flight tokens during rotation bootstrap.
    pub jwt_secret_previous: Option<Vec<u8>>,
    /// `true` when `NODE_ENV=production`; toggles the strict-secrets checks.
    pub production: bool,
}

/// CLI overrides, generalizing the teacher's `--host`/`--tcp-port`/`--udp-port` flags.
#[derive(clap::Parser)]
#[command(name = "voipc-server", about = "vibespeak realtime core")]
pub struct Args {
    /// Path to a configuration file (TOML), overrides environment defaults.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Bind address, overrides config and environment.
    #[arg(long)]
    pub host: Option<String>,

    /// UDP voice port, overrides config and environment.
    #[arg(long)]
    pub voice_port: Option<u16>,

    /// WebSocket signaling port, overrides config and environment.
    #[arg(long)]
    pub ws_port: Option<u16>,
}

impl ServerConfig {
    /// Build the fully-resolved configuration: environment seeds defaults, an
    /// optional TOML file at `args.config` overrides those, then `args`
    /// itself overrides both. Fails fatally (per spec) if `NODE_ENV=production`
    /// and `JWT_SECRET` is missing.
    pub fn load(args: &Args) -> Result<Self> {
        let production = std::env::var("NODE_ENV").as_deref() == Ok("production");

        let mut host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let mut voice_port = env_port("VOICE_PORT").unwrap_or(7777);
        let mut ws_port = env_port("WS_PORT")
            .or_else(|| env_port("PORT"))
            .unwrap_or(8080);
        let mut allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if let Some(path) = &args.config {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {path}"))?;
            let file: FileConfig =
                toml::from_str(&content).with_context(|| format!("invalid config file: {path}"))?;
            if let Some(v) = file.host {
                host = v;
            }
            if let Some(v) = file.voice_port {
                voice_port = v;
            }
            if let Some(v) = file.ws_port {
                ws_port = v;
            }
            if let Some(v) = file.allowed_origins {
                allowed_origins = v;
            }
        }

        if let Some(v) = &args.host {
            host = v.clone();
        }
        if let Some(v) = args.voice_port {
            voice_port = v;
        }
        if let Some(v) = args.ws_port {
            ws_port = v;
        }

        let voice_master_key = match std::env::var("VOICE_MASTER_KEY") {
            Ok(hex) => parse_master_key(&hex)?,
            Err(_) if production => {
                bail!("VOICE_MASTER_KEY is required when NODE_ENV=production")
            }
            Err(_) => {
                warn!("VOICE_MASTER_KEY not set; generating an ephemeral key for this process");
                CryptoCore::generate_master().context("failed to generate a master key")?
            }
        };

        let jwt_secret = match std::env::var("JWT_SECRET") {
            Ok(secret) if secret.len() >= 32 => secret.into_bytes(),
            Ok(_) => bail!("JWT_SECRET must be at least 32 characters"),
            Err(_) if production => bail!("JWT_SECRET is required when NODE_ENV=production"),
            Err(_) => {
                warn!("JWT_SECRET not set; generating an ephemeral signing secret for this process");
                random_dev_secret()
            }
        };
        let jwt_secret_previous = std::env::var("JWT_SECRET_PREVIOUS")
            .ok()
            .map(|s| s.into_bytes());

        Ok(Self {
            host,
            voice_port,
            ws_port,
            allowed_origins,
            voice_master_key,
            jwt_secret,
            jwt_secret_previous,
            production,
        })
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_master_key(hex: &str) -> Result<[u8; 32]> {
    if hex.len() != 64 {
        bail!("VOICE_MASTER_KEY must be exactly 64 hex characters, got {}", hex.len());
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in bytes.iter_mut().enumerate() {
        let byte_str = &hex[i * 2..i * 2 + 2];
        *chunk = u8::from_str_radix(byte_str, 16)
            .with_context(|| format!("VOICE_MASTER_KEY is not valid hex at byte {i}"))?;
    }
    Ok(bytes)
}

fn random_dev_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut buf = vec![0u8; 48];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_master_key_rejects_wrong_length() {
        assert!(parse_master_key("abcd").is_err());
    }

    #[test]
    fn parse_master_key_accepts_64_hex_chars() {
        let hex = "a".repeat(64);
        let key = parse_master_key(&hex).unwrap();
        assert_eq!(key, [0xaa; 32]);
    }

    #[test]
    fn parse_master_key_rejects_non_hex() {
        let bad = "z".repeat(64);
        assert!(parse_master_key(&bad).is_err());
    }
}
