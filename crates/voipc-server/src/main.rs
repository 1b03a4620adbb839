use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{error, info};

mod config;
mod fec;
mod floor;
mod hub;
mod jitter;
mod relay;
mod token;
mod ws;

use config::{Args, ServerConfig};
use floor::FloorController;
use hub::SignalingHub;
use relay::VoiceRelay;
use token::TokenService;
use voipc_crypto::CryptoCore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voipc_server=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args)?;

    info!(
        host = %config.host,
        voice_port = config.voice_port,
        ws_port = config.ws_port,
        production = config.production,
        "vibespeak core starting"
    );

    let crypto = Arc::new(CryptoCore::new(config.voice_master_key));
    let tokens = Arc::new(TokenService::new(
        config.jwt_secret.clone(),
        config.jwt_secret_previous.clone(),
    ));
    let floor = Arc::new(FloorController::new());
    let hub = Arc::new(SignalingHub::new());
    let allowed_origins = Arc::new(config.allowed_origins.clone());

    // Bind the UDP voice socket with enlarged buffers to absorb loss bursts,
    // then hand it to tokio — same pre-bind-then-convert sequence the
    // teacher used for its video relay socket.
    let udp_socket = {
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create UDP socket")?;
        let _ = sock.set_recv_buffer_size(2 * 1024 * 1024);
        let _ = sock.set_send_buffer_size(2 * 1024 * 1024);
        let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.voice_port)
            .parse()
            .with_context(|| format!("invalid UDP address {}:{}", config.host, config.voice_port))?;
        sock.bind(&addr.into())
            .with_context(|| format!("failed to bind UDP on {}:{}", config.host, config.voice_port))?;
        sock.set_nonblocking(true)
            .context("failed to set UDP socket non-blocking")?;
        let std_sock: std::net::UdpSocket = sock.into();
        Arc::new(
            UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?,
        )
    };
    info!(port = config.voice_port, "UDP voice socket bound");

    let relay = VoiceRelay::new(udp_socket, crypto);
    tokio::spawn(relay.run());

    let ws_listener = TcpListener::bind(format!("{}:{}", config.host, config.ws_port))
        .await
        .with_context(|| format!("failed to bind WS on {}:{}", config.host, config.ws_port))?;
    info!(port = config.ws_port, "WebSocket signaling listener bound");

    info!("vibespeak core ready, accepting connections");

    loop {
        let (stream, addr) = match ws_listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!("TCP accept error: {e}");
                continue;
            }
        };

        let hub = hub.clone();
        let tokens = tokens.clone();
        let floor = floor.clone();
        let allowed_origins = allowed_origins.clone();

        tokio::spawn(async move {
            ws::accept_connection(stream, addr, hub, tokens, floor, allowed_origins).await;
        });
    }
}
