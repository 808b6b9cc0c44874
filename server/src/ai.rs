//! Enemy behavior strategies.
//!
//! Each enemy carries a [`Behavior`] holding whatever per-variant state it
//! needs. [`act`] is the single entry point the world calls once per tick for
//! every active enemy: it may move the enemy and returns the ids of players
//! that were hit this tick.
//!
//! Which strategy an enemy gets is decided by [`default_strategy`] from the
//! enemy kind and the level tier, unless the world overrides it.

use rand::Rng;
use shared::{cooldown_ready, Direction, Enemy, EnemyKind, Position, TileGrid};
use std::time::{Duration, Instant};

pub const ATTACK_COOLDOWN: Duration = Duration::from_secs(1);
pub const MIN_MOVE_INTERVAL: Duration = Duration::from_millis(150);
pub const AMBUSH_WANDER_CHANCE: f64 = 0.1;
pub const PATROL_SIDE: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Random,
    Chase,
    Ambush,
    Patrol,
    Boss,
}

impl StrategyKind {
    pub fn from_name(name: &str) -> Option<StrategyKind> {
        match name.trim().to_ascii_lowercase().as_str() {
            "random" => Some(StrategyKind::Random),
            "chase" => Some(StrategyKind::Chase),
            "ambush" => Some(StrategyKind::Ambush),
            "patrol" => Some(StrategyKind::Patrol),
            "boss" => Some(StrategyKind::Boss),
            _ => None,
        }
    }
}

/// Level tier: 1 for levels 1-2, 2 for 3-4, 3 beyond.
pub fn tier(level: u32) -> u32 {
    match level {
        0..=2 => 1,
        3..=4 => 2,
        _ => 3,
    }
}

/// Default strategy table; harder tiers get more aggressive variants.
pub fn default_strategy(kind: EnemyKind, level: u32) -> StrategyKind {
    use StrategyKind::*;
    match (kind, tier(level)) {
        (EnemyKind::Bat, 1) => Random,
        (EnemyKind::Bat, _) => Chase,
        (EnemyKind::Skeleton, 1) => Patrol,
        (EnemyKind::Skeleton, 2) => Chase,
        (EnemyKind::Skeleton, _) => Boss,
        (EnemyKind::Ghost, 1 | 2) => Ambush,
        (EnemyKind::Ghost, _) => Chase,
        (EnemyKind::Trap, _) => Ambush,
    }
}

/// Step cadence for an enemy kind, shrinking as levels go up.
pub fn move_interval(kind: EnemyKind, level: u32) -> Duration {
    let scaled = kind.base_move_interval() * 10 / (9 + level.max(1));
    scaled.max(MIN_MOVE_INTERVAL)
}

pub fn chase_radius(level: u32) -> i32 {
    5 + level as i32
}

pub fn ambush_range(level: u32) -> i32 {
    1 + (level / 3) as i32
}

pub fn boss_radius(level: u32) -> i32 {
    8 + level as i32
}

pub const BOSS_REACH: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    Random,
    Chase,
    Ambush {
        revealed: bool,
    },
    Patrol {
        waypoints: [Position; 4],
        target: usize,
        forward: bool,
    },
    Boss,
}

impl Behavior {
    pub fn new(kind: StrategyKind, spawn: Position) -> Behavior {
        match kind {
            StrategyKind::Random => Behavior::Random,
            StrategyKind::Chase => Behavior::Chase,
            StrategyKind::Ambush => Behavior::Ambush { revealed: false },
            StrategyKind::Patrol => Behavior::Patrol {
                waypoints: [
                    spawn,
                    spawn.offset(PATROL_SIDE, 0),
                    spawn.offset(PATROL_SIDE, PATROL_SIDE),
                    spawn.offset(0, PATROL_SIDE),
                ],
                target: 0,
                forward: true,
            },
            StrategyKind::Boss => Behavior::Boss,
        }
    }

    pub fn for_enemy(enemy: &Enemy, level: u32) -> Behavior {
        Behavior::new(default_strategy(enemy.kind, level), enemy.spawn)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Behavior::Random => StrategyKind::Random,
            Behavior::Chase => StrategyKind::Chase,
            Behavior::Ambush { .. } => StrategyKind::Ambush,
            Behavior::Patrol { .. } => StrategyKind::Patrol,
            Behavior::Boss => StrategyKind::Boss,
        }
    }
}

/// What an enemy can see of a living player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub id: u32,
    pub position: Position,
    pub lives: u8,
}

pub struct Context<'a, R> {
    pub grid: &'a TileGrid,
    /// Living players only.
    pub players: &'a [Target],
    pub level: u32,
    pub now: Instant,
    pub rng: &'a mut R,
}

/// Runs one tick of `behavior` for `enemy`. Returns ids of players hit.
pub fn act<R: Rng>(enemy: &mut Enemy, behavior: &mut Behavior, ctx: &mut Context<'_, R>) -> Vec<u32> {
    if !enemy.active {
        return Vec::new();
    }
    let move_due = cooldown_ready(enemy.last_move, ctx.now, move_interval(enemy.kind, ctx.level));

    match behavior {
        Behavior::Random => {
            if move_due {
                enemy.last_move = Some(ctx.now);
                random_step(enemy, ctx.grid, ctx.rng);
            }
            Vec::new()
        }
        Behavior::Chase => {
            let radius = chase_radius(ctx.level);
            let target = ctx
                .players
                .iter()
                .filter(|p| p.position.manhattan(enemy.position) <= radius)
                .min_by_key(|p| (p.position.manhattan(enemy.position), p.id))
                .copied();
            pursue(enemy, target, 1, move_due, ctx)
        }
        Behavior::Boss => {
            let radius = boss_radius(ctx.level);
            let target = ctx
                .players
                .iter()
                .filter(|p| p.position.manhattan(enemy.position) <= radius)
                .min_by_key(|p| (p.lives, p.id))
                .copied();
            pursue(enemy, target, BOSS_REACH, move_due, ctx)
        }
        Behavior::Ambush { revealed } => {
            let range = ambush_range(ctx.level);
            let in_range: Vec<u32> = ctx
                .players
                .iter()
                .filter(|p| p.position.manhattan(enemy.position) <= range)
                .map(|p| p.id)
                .collect();
            let hits = try_attack(enemy, ctx.now, in_range);
            if !hits.is_empty() {
                *revealed = true;
            } else if *revealed && move_due {
                enemy.last_move = Some(ctx.now);
                if ctx.rng.gen_bool(AMBUSH_WANDER_CHANCE) {
                    random_step(enemy, ctx.grid, ctx.rng);
                }
            }
            hits
        }
        Behavior::Patrol {
            waypoints,
            target,
            forward,
        } => {
            if move_due {
                enemy.last_move = Some(ctx.now);
                if enemy.position == waypoints[*target] {
                    advance_waypoint(target, forward);
                }
                if !step_toward(enemy, waypoints[*target], ctx.grid) {
                    advance_waypoint(target, forward);
                }
            }
            Vec::new()
        }
    }
}

fn pursue<R: Rng>(
    enemy: &mut Enemy,
    target: Option<Target>,
    reach: i32,
    move_due: bool,
    ctx: &mut Context<'_, R>,
) -> Vec<u32> {
    match target {
        Some(t) if t.position.chebyshev(enemy.position) <= reach => {
            try_attack(enemy, ctx.now, vec![t.id])
        }
        Some(t) => {
            if move_due {
                enemy.last_move = Some(ctx.now);
                step_toward(enemy, t.position, ctx.grid);
            }
            Vec::new()
        }
        None => {
            if move_due {
                enemy.last_move = Some(ctx.now);
                random_step(enemy, ctx.grid, ctx.rng);
            }
            Vec::new()
        }
    }
}

fn try_attack(enemy: &mut Enemy, now: Instant, victims: Vec<u32>) -> Vec<u32> {
    if victims.is_empty() || !cooldown_ready(enemy.last_attack, now, ATTACK_COOLDOWN) {
        return Vec::new();
    }
    enemy.last_attack = Some(now);
    victims
}

fn random_step<R: Rng>(enemy: &mut Enemy, grid: &TileGrid, rng: &mut R) {
    let direction = Direction::ALL[rng.gen_range(0..Direction::ALL.len())];
    enemy.direction = direction;
    let next = enemy.position.step(direction);
    if grid.is_walkable(next) {
        enemy.position = next;
    }
}

/// Moves one cell toward `goal`, trying the axis with the larger delta
/// first. Returns false if no step was possible.
fn step_toward(enemy: &mut Enemy, goal: Position, grid: &TileGrid) -> bool {
    let dx = goal.x - enemy.position.x;
    let dy = goal.y - enemy.position.y;
    let horizontal = (dx != 0).then(|| if dx > 0 { Direction::Right } else { Direction::Left });
    let vertical = (dy != 0).then(|| if dy > 0 { Direction::Down } else { Direction::Up });

    let order = if dx.abs() >= dy.abs() {
        [horizontal, vertical]
    } else {
        [vertical, horizontal]
    };

    for direction in order.into_iter().flatten() {
        let next = enemy.position.step(direction);
        if grid.is_walkable(next) {
            enemy.position = next;
            enemy.direction = direction;
            return true;
        }
    }
    false
}

fn advance_waypoint(target: &mut usize, forward: &mut bool) {
    if *forward {
        if *target == 3 {
            *forward = false;
            *target = 2;
        } else {
            *target += 1;
        }
    } else if *target == 0 {
        *forward = true;
        *target = 1;
    } else {
        *target -= 1;
    }
}
