//! # Dungeon Server Library
//!
//! Authoritative server for a cooperative grid dungeon. Up to three players
//! connect over TCP, walk a tile map, collect diamonds, avoid enemies and
//! traps, and advance through levels together. Clients only send intents;
//! the server owns every position, life and counter and broadcasts the
//! resulting world snapshot on each tick.
//!
//! ## Module Organization
//!
//! ### Server Core (`network`)
//! Binds the listener, admits or rejects connections, drives the world tick
//! and the maintenance cycle (idle kicks and heartbeats), and fans
//! broadcasts out to every connection.
//!
//! ### Connections (`connection`, `client_manager`)
//! One task per socket decodes frames with the shared codec and turns them
//! into world operations. The client manager keeps the registry: ids,
//! activity timestamps, write halves and kick signals.
//!
//! ### World (`game`, `ai`, `level`, `scheduler`)
//! The world owns the grid, players, enemies, patrols and traps, and runs
//! the level state machine. Enemy behaviour lives in `ai`; levels are read
//! from text files by `level`, with a generated fallback. Delayed restarts
//! and level transitions are entries in a `scheduler::DelayedQueue` that the
//! tick drains.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig::default());
//!     let addr = server.start().await?;
//!     println!("listening on {}", addr);
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod ai;
pub mod client_manager;
pub mod config;
mod connection;
pub mod error;
pub mod game;
pub mod level;
pub mod network;
pub mod scheduler;
