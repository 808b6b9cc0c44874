//! Scripted client for poking a running server by hand.
//!
//! Connects, joins, wanders in random directions while printing every
//! frame the server sends, then disconnects.

use clap::Parser;
use rand::seq::SliceRandom;
use shared::protocol::{write_frame, ClientPacket, FrameReader, ServerPacket};
use shared::Direction;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep};

#[derive(Parser, Debug)]
#[command(author, version, about = "Wandering test client", long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Player name
    #[arg(short = 'n', long, default_value = "tester")]
    name: String,

    /// warrior, rogue or archaeologist
    #[arg(short = 'c', long, default_value = "warrior")]
    character: String,

    /// Number of moves before disconnecting
    #[arg(short = 'm', long, default_value = "20")]
    moves: usize,

    /// Delay between moves in milliseconds
    #[arg(short = 'd', long, default_value = "250")]
    delay_ms: u64,
}

fn describe(packet: &ServerPacket) -> String {
    match packet {
        ServerPacket::GameState(snapshot) => format!(
            "GAME_STATE tick={} level={} players={} diamonds={}/{}",
            snapshot.tick,
            snapshot.level,
            snapshot.players.len(),
            snapshot.diamonds_collected,
            snapshot.diamonds_total
        ),
        other => format!("{:?}", other),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let stream = TcpStream::connect(&args.server).await?;
    println!("Connected to {}", args.server);
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(read_half);

    let player_id = match frames.read_frame().await? {
        Some(frame) => match ServerPacket::from_frame(&frame)? {
            ServerPacket::Welcome { player_id } => player_id,
            other => {
                println!("Server refused us: {}", describe(&other));
                return Ok(());
            }
        },
        None => {
            println!("Server closed the connection");
            return Ok(());
        }
    };
    println!("Assigned player id {}", player_id);

    let join = ClientPacket::Connect {
        name: args.name.clone(),
        character: args.character.clone(),
    };
    write_frame(&mut write_half, &join.to_frame()).await?;

    let printer = tokio::spawn(async move {
        loop {
            match frames.read_frame().await {
                Ok(Some(frame)) => match ServerPacket::from_frame(&frame) {
                    Ok(packet) => println!("<- {}", describe(&packet)),
                    Err(e) => println!("<- undecodable {:?}: {}", frame.kind, e),
                },
                Ok(None) => {
                    println!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    println!("Read error: {}", e);
                    break;
                }
            }
        }
    });

    let mut rng = rand::thread_rng();
    let mut ticker = interval(Duration::from_millis(args.delay_ms));
    for _ in 0..args.moves {
        ticker.tick().await;
        let direction = *Direction::ALL.choose(&mut rng).unwrap_or(&Direction::Right);
        println!("-> move {:?}", direction);
        let packet = ClientPacket::Move {
            player_id,
            direction,
        };
        write_frame(&mut write_half, &packet.to_frame()).await?;
    }

    let attack = ClientPacket::Action {
        player_id,
        text: "attack".to_string(),
    };
    write_frame(&mut write_half, &attack.to_frame()).await?;
    write_frame(&mut write_half, &ClientPacket::Disconnect.to_frame()).await?;
    println!("Disconnected");

    sleep(Duration::from_millis(200)).await;
    printer.abort();
    Ok(())
}
