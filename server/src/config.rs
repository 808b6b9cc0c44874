use crate::ai::StrategyKind;
use shared::protocol::DEFAULT_RESYNC_LIMIT;
use shared::MAX_PLAYERS;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime knobs for the server.
///
/// `Default` gives the production values; tests shrink the timers.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
    pub max_players: usize,
    pub tick_interval: Duration,
    /// How often idle connections are reaped and heartbeats sent.
    pub maintenance_interval: Duration,
    pub idle_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Frames a connection may have queued before it counts as stalled.
    pub outbound_queue: usize,
    pub world: WorldConfig,
    pub resync_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_players: MAX_PLAYERS,
            tick_interval: Duration::from_millis(100),
            maintenance_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(60),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            outbound_queue: 64,
            world: WorldConfig::default(),
            resync_limit: DEFAULT_RESYNC_LIMIT,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Settings owned by the world simulation.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub levels_dir: PathBuf,
    pub first_level: u32,
    pub restart_delay: Duration,
    pub transition_delay: Duration,
    /// Fixed seed for enemy randomness; `None` seeds from entropy.
    pub seed: Option<u64>,
    /// Forces one strategy on every enemy instead of the kind and tier table.
    pub enemy_strategy: Option<StrategyKind>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            levels_dir: PathBuf::from("levels"),
            first_level: 1,
            restart_delay: Duration::from_secs(3),
            transition_delay: Duration::from_secs(2),
            seed: None,
            enemy_strategy: None,
        }
    }
}
