//! OCPP bridge node - CLI for the OCPP 1.6 bridge
//!
//! Every flag can also be given through the environment.
//!
//! # Usage
//!
//! ```bash
//! # Minimal: backend API plus defaults (:10800 devices, :10801 commands, local Redis)
//! BASE_URL=http://backend:8000 ocpp-bridge-node
//!
//! # Explicit addresses
//! ocpp-bridge-node --base-url http://backend:8000 \
//!     --addr :9000 --command-addr 127.0.0.1:9001 --redis-addr redis:6379
//! ```

use std::time::Duration;

use clap::Parser;
use ocpp_bridge::config::{parse_listen_addr, DEFAULT_COMMAND_ADDR, DEFAULT_LISTEN_ADDR, DEFAULT_REDIS_URL};
use ocpp_bridge::{Bridge, BridgeConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 1.6 central system bridging charge points to a backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend HTTP API root
    #[arg(long, env = "BASE_URL")]
    base_url: String,

    /// Charge point WebSocket listen address (`:port` for all interfaces)
    #[arg(long, env = "ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    addr: String,

    /// Command API listen address
    #[arg(long, env = "COMMAND_ADDR", default_value = DEFAULT_COMMAND_ADDR)]
    command_addr: String,

    /// Redis url or host:port
    #[arg(long, env = "REDIS_ADDR", default_value = DEFAULT_REDIS_URL)]
    redis_addr: String,

    /// Redis list receiving events
    #[arg(long, env = "EVENTS_KEY", default_value = "events")]
    events_key: String,

    /// Redis list holding queued commands
    #[arg(long, env = "COMMANDS_KEY", default_value = "commands")]
    commands_key: String,

    /// Seconds to wait for a charge point reply
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// Seconds to wait for Redis to accept one event
    #[arg(long, env = "PUBLISH_TIMEOUT_SECS", default_value = "2")]
    publish_timeout_secs: u64,

    /// Heartbeat interval handed to charge points, in seconds
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "60")]
    heartbeat_interval: i32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = BridgeConfig::new(&args.base_url)
        .with_listen_addr(parse_listen_addr(&args.addr)?)
        .with_command_addr(parse_listen_addr(&args.command_addr)?)
        .with_redis(&args.redis_addr)
        .with_keys(&args.events_key, &args.commands_key)
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_publish_timeout(Duration::from_secs(args.publish_timeout_secs))
        .with_heartbeat_interval(args.heartbeat_interval);
    config.validate()?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OCPP Bridge - OCPP 1.6 Central System           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Devices:  {:<50} ║", config.listen_addr);
    println!("║  Commands: {:<50} ║", config.command_addr);
    println!("║  Backend:  {:<50} ║", truncate(&config.base_url, 50));
    println!("║  Redis:    {:<50} ║", truncate(&config.redis_url, 50));
    println!("║  Lists:    {:<50} ║", truncate(&format!("{} / {}", config.events_key, config.commands_key), 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    info!("Starting OCPP bridge...");

    let bridge = Bridge::connect(config).await?;
    bridge.run().await?;

    Ok(())
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
