use clap::Parser;
use log::info;
use server::ai::StrategyKind;
use server::config::ServerConfig;
use server::network::Server;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short = 'p', long, default_value = "8080")]
    port: u16,

    /// World tick interval in milliseconds
    #[arg(short = 't', long, default_value = "100")]
    tick_ms: u64,

    /// Directory holding level<N>.txt files
    #[arg(short = 'l', long, default_value = "levels")]
    levels: PathBuf,

    /// Seed for enemy randomness
    #[arg(long)]
    seed: Option<u64>,

    /// Maximum concurrent players
    #[arg(short = 'm', long, default_value = "3")]
    max_players: usize,

    /// Give every enemy one strategy: random, chase, ambush, patrol or boss
    #[arg(long, value_parser = parse_strategy)]
    enemy_strategy: Option<StrategyKind>,
}

fn parse_strategy(name: &str) -> Result<StrategyKind, String> {
    StrategyKind::from_name(name).ok_or_else(|| format!("unknown enemy strategy '{}'", name))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = ServerConfig {
        host: args.host,
        port: args.port,
        max_players: args.max_players,
        tick_interval: Duration::from_millis(args.tick_ms.max(1)),
        ..ServerConfig::default()
    };
    config.world.levels_dir = args.levels;
    config.world.seed = args.seed;
    config.world.enemy_strategy = args.enemy_strategy;

    info!("Starting server...");
    info!("Levels directory: {}", config.world.levels_dir.display());
    info!(
        "Tick: {:?}, max players: {}",
        config.tick_interval, config.max_players
    );

    let mut server = Server::new(config);
    let addr = server.start().await?;
    info!("Accepting players on {}", addr);

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    server.stop().await?;

    Ok(())
}
