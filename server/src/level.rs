//! Text level loader.
//!
//! One line per grid row. Legend:
//!
//! | char            | meaning                                        |
//! |-----------------|------------------------------------------------|
//! | `#`             | wall                                           |
//! | `@`             | player start (floor)                           |
//! | `$`             | diamond                                        |
//! | `D`             | door                                           |
//! | `T`             | trap tile                                      |
//! | `C`             | chest                                          |
//! | `B`             | button                                         |
//! | `E` `G` `F`     | skeleton, ghost, bat on floor                  |
//! | `H` `V`         | horizontal / vertical patrol enemy on floor    |
//! | `>` `<` `^` `v` | wall-mounted arrow trap, pressure triggered    |
//! | `~`             | wall-mounted fire trap facing down, on a timer |
//!
//! Anything else is floor. Missing files fall back to a generated level.

use crate::error::{Result, ServerError};
use log::{debug, info, warn};
use shared::{
    Axis, Direction, Enemy, EnemyKind, PatrolEnemy, Position, Tile, TileGrid, Trap,
    TrapActivation, TrapKind,
};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const FALLBACK_WIDTH: usize = 20;
pub const FALLBACK_HEIGHT: usize = 15;

/// A parsed level, ready to be installed into the world.
#[derive(Debug, Clone)]
pub struct Level {
    pub number: u32,
    pub grid: TileGrid,
    pub enemies: Vec<Enemy>,
    pub patrol_enemies: Vec<PatrolEnemy>,
    pub traps: Vec<Trap>,
    pub start_positions: Vec<Position>,
    pub diamond_count: u32,
}

impl Level {
    /// A level is playable when at least one cell can be stood on.
    pub fn is_playable(&self) -> bool {
        self.grid.positions().any(|pos| self.grid.is_walkable(pos))
    }
}

pub fn level_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("level{}.txt", number))
}

/// Loads `level<N>.txt` from `dir`. A missing file, or one with nowhere to
/// stand, yields the generated fallback instead.
pub fn load_level(dir: &Path, number: u32) -> Result<Level> {
    let path = level_path(dir, number);
    match fs::read_to_string(&path) {
        Ok(text) => {
            let level = parse_level(number, &text);
            if !level.is_playable() {
                warn!(
                    "Level file {} has no walkable cell, generating fallback",
                    path.display()
                );
                return Ok(fallback_level(number));
            }
            info!("Loaded level {} from {}", number, path.display());
            Ok(level)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No file for level {}, generating fallback", number);
            Ok(fallback_level(number))
        }
        Err(source) => Err(ServerError::Level {
            level: number,
            path,
            source,
        }),
    }
}

pub fn parse_level(number: u32, text: &str) -> Level {
    let lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();
    let height = lines.len();
    let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);

    let mut grid = TileGrid::new(width, height, Tile::Floor);
    let mut enemies = Vec::new();
    let mut patrol_enemies = Vec::new();
    let mut traps = Vec::new();
    let mut start_positions = Vec::new();
    let mut diamond_count = 0;

    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            let pos = Position::new(x as i32, y as i32);
            let tile = match ch {
                '#' => Tile::Wall,
                '@' => {
                    start_positions.push(pos);
                    Tile::Floor
                }
                '$' => {
                    diamond_count += 1;
                    Tile::Diamond
                }
                'D' => Tile::Door,
                'T' => Tile::Trap,
                'C' => Tile::Chest,
                'B' => Tile::Button,
                'E' | 'G' | 'F' => {
                    let kind = match ch {
                        'E' => EnemyKind::Skeleton,
                        'G' => EnemyKind::Ghost,
                        _ => EnemyKind::Bat,
                    };
                    enemies.push(Enemy::new(enemies.len() as u32 + 1, kind, pos));
                    Tile::Floor
                }
                'H' | 'V' => {
                    let axis = if ch == 'H' {
                        Axis::Horizontal
                    } else {
                        Axis::Vertical
                    };
                    patrol_enemies.push(PatrolEnemy::new(
                        patrol_enemies.len() as u32 + 1,
                        pos,
                        axis,
                    ));
                    Tile::Floor
                }
                '>' | '<' | '^' | 'v' | '~' => {
                    let (activation, kind, facing) = match ch {
                        '>' => (TrapActivation::Pressure, TrapKind::Arrow, Direction::Right),
                        '<' => (TrapActivation::Pressure, TrapKind::Arrow, Direction::Left),
                        '^' => (TrapActivation::Pressure, TrapKind::Arrow, Direction::Up),
                        'v' => (TrapActivation::Pressure, TrapKind::Arrow, Direction::Down),
                        _ => (TrapActivation::Timer, TrapKind::Fire, Direction::Down),
                    };
                    traps.push(Trap::new(traps.len() as u32 + 1, pos, activation, kind, facing));
                    Tile::Wall
                }
                _ => Tile::Floor,
            };
            grid.set(pos, tile);
        }
    }

    Level {
        number,
        grid,
        enemies,
        patrol_enemies,
        traps,
        start_positions,
        diamond_count,
    }
}

/// Bordered room with a diamond lattice, two doors and two enemies.
pub fn fallback_level(number: u32) -> Level {
    let mut grid = TileGrid::bordered(FALLBACK_WIDTH, FALLBACK_HEIGHT);
    let right = FALLBACK_WIDTH as i32 - 2;
    let bottom = FALLBACK_HEIGHT as i32 - 2;

    let doors = [Position::new(right, 1), Position::new(right, bottom)];
    let start_positions = vec![Position::new(1, 1), Position::new(2, 1), Position::new(1, 2)];
    let enemies = vec![
        Enemy::new(1, EnemyKind::Skeleton, Position::new(10, 7)),
        Enemy::new(2, EnemyKind::Bat, Position::new(4, 11)),
    ];

    let mut diamond_count = 0;
    for y in 1..=bottom {
        for x in 1..=right {
            let pos = Position::new(x, y);
            let reserved = doors.contains(&pos)
                || start_positions.contains(&pos)
                || enemies.iter().any(|e| e.position == pos);
            if x % 4 == 2 && y % 4 == 2 && !reserved {
                grid.set(pos, Tile::Diamond);
                diamond_count += 1;
            }
        }
    }
    for door in doors {
        grid.set(door, Tile::Door);
    }

    Level {
        number,
        grid,
        enemies,
        patrol_enemies: Vec::new(),
        traps: Vec::new(),
        start_positions,
        diamond_count,
    }
}
