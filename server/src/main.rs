use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::events::{AuthenticateReceived, EventBus};
use server::map::LoggingMapService;
use server::{ConnectionHandler, ServerError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Parses command-line arguments, hosts the server and runs until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// JSON config file; flags below override its values
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// Server IP address or host name to bind to
        #[clap(short = 'H', long)]
        host: Option<String>,
        /// Server port to listen on
        #[clap(short, long)]
        port: Option<u16>,
        /// Server name shown in logs
        #[clap(short, long)]
        name: Option<String>,
        /// Map loaded once the server is up
        #[clap(short, long)]
        map: Option<String>,
        /// Maximum number of concurrent players (capped at 255)
        #[clap(long)]
        max_players: Option<u32>,
        /// Seconds between heartbeat pings
        #[clap(long)]
        ping_interval: Option<u64>,
        /// Seconds a ping may stay unanswered before the peer is dropped
        #[clap(long)]
        client_timeout: Option<u64>,
        /// Trust the transport's heartbeat instead of pinging peers
        #[clap(long)]
        passive_heartbeat: bool,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.listen.host = host;
    }
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    if let Some(name) = args.name {
        config.listen.name = name;
    }
    if let Some(map) = args.map {
        config.listen.map = map;
    }
    if let Some(max_players) = args.max_players {
        config.listen.max_players = max_players;
    }
    if let Some(seconds) = args.ping_interval {
        config.liveness.ping_interval = Duration::from_secs(seconds);
    }
    if let Some(seconds) = args.client_timeout {
        config.liveness.client_timeout = Duration::from_secs(seconds);
    }
    if args.passive_heartbeat {
        config.liveness.custom_heartbeat = false;
    }

    let bus = Arc::new(EventBus::new());
    let handler = ConnectionHandler::new(config.liveness, Arc::clone(&bus), Arc::new(LoggingMapService::new()));

    // Ticket verification lives with the platform integration; name peers by account
    {
        let handler = handler.clone();
        bus.subscribe(move |_: &str, event: &AuthenticateReceived| match event.request.account_id() {
            Ok(account_id) => {
                info!("Peer {} authenticated as {}", event.peer, account_id);
                handler.set_peer_name(event.peer, account_id.to_string());
            }
            Err(e) => info!("Peer {} sent an unreadable Authenticate: {}", event.peer, e),
        });
    }

    match handler.host(config.listen).await {
        Ok(addr) => info!("Listening on {}", addr),
        Err(e @ ServerError::Bind { .. }) => {
            error!("{}", e);
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down gracefully...");
    handler.stop().await;

    Ok(())
}
