//! Example: a bot that answers `!ping` with `pong`
//!
//! Events arrive over the sharded gateway; the reply goes out through the
//! rate-limited REST client.
//!
//! Run with: cargo run --example ping_pong -- <bot token>

use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ws_gateway::{
    CloseReason, CreateMessage, DispatchEvent, GatewayCommand, GatewayConfig, GatewayHandler,
    Intents, PresenceUpdate, RestClient, RestConfig, ShardManager, Status, Token,
};

struct PingPongBot {
    rest: RestClient,
}

impl GatewayHandler for PingPongBot {
    async fn on_connect(&self, _connected: bool) {
        info!("All shards connected");
    }

    async fn on_disconnect(&self, reason: CloseReason, closed: bool) {
        info!("All shards disconnected: {} (closed={})", reason, closed);
    }

    async fn on_event(&self, shard_id: u32, event: DispatchEvent) {
        match event {
            DispatchEvent::Ready(ready) => {
                info!(
                    "[SHARD-{}] Ready as {} in {} guilds",
                    shard_id,
                    ready.user.username,
                    ready.guilds.len()
                );
            }
            DispatchEvent::MessageCreate(message) if message.content == "!ping" => {
                let reply = CreateMessage::new("pong");
                if let Err(e) = self.rest.create_message(message.channel_id, &reply).await {
                    error!("[SHARD-{}] Failed to reply: {}", shard_id, e);
                }
            }
            _ => {}
        }
    }

    async fn should_attempt_resuming(&self, _reason: CloseReason, _closed: bool) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ws_gateway=debug")),
        )
        .init();

    let secret = match std::env::args().nth(1) {
        Some(secret) => secret,
        None => {
            eprintln!("Usage: ping_pong <bot token>");
            std::process::exit(1);
        }
    };
    let token = Token::bot(&secret);

    let rest = RestClient::new(token.clone(), RestConfig::default())?;
    let gateway = rest.get_gateway_bot().await?;
    info!(
        "Gateway {} recommends {} shards ({} identifies left)",
        gateway.url, gateway.shards, gateway.session_start_limit.remaining
    );

    let config = GatewayConfig::builder(token)
        .gateway_url(gateway.url)
        .intents(Intents::unprivileged() | Intents::MESSAGE_CONTENT)
        .shard_count(gateway.shards.max(1))
        .build()?;

    let manager = ShardManager::new(config, PingPongBot { rest });
    manager.connect().await?;
    info!("Manager started with {} shards", manager.shard_count());

    // Give shard 0 time to identify before changing its presence
    tokio::time::sleep(Duration::from_secs(10)).await;
    let presence = PresenceUpdate {
        since: None,
        activities: Vec::new(),
        status: Status::Online,
        afk: false,
    };
    if let Err(e) = manager
        .send_command(0, GatewayCommand::PresenceUpdate(presence))
        .await
    {
        error!("Failed to update presence: {}", e);
    }

    tokio::signal::ctrl_c().await?;

    let snapshot = manager.metrics().snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Resumes: {}", snapshot.resumes_total);
    info!("  Dispatches: {}", snapshot.dispatches_total);
    info!("  REST requests: {}", snapshot.rest_requests_total);

    manager.disconnect().await;
    info!("Manager stopped");

    Ok(())
}
