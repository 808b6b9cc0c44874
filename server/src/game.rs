//! Authoritative world simulation.
//!
//! [`World`] owns the tile grid, players, enemies, patrol enemies, traps and
//! the level-completion state machine. It is not internally synchronized:
//! the server keeps it behind a single mutex so every logical operation
//! (a move, an action, a tick) sees and leaves a consistent state.
//!
//! Anything that should be announced to players is queued as a [`Notice`]
//! and drained by the caller with [`World::take_notices`] once the lock is
//! released. Delayed work (level restart, level transition) sits in a
//! [`DelayedQueue`] that [`World::tick`] drains, so it never runs outside
//! the tick and is dropped whenever a new level is installed.

use crate::ai::{self, Behavior, StrategyKind, Target};
use crate::config::WorldConfig;
use crate::error::Result;
use crate::level::{self, Level};
use crate::scheduler::DelayedQueue;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{
    cooldown_ready, CharacterType, Direction, Enemy, PatrolEnemy, Player, Position, Tile,
    TileGrid, Trap, TrapActivation, TrapKind, WorldSnapshot,
};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

pub const TRAP_DAMAGE_COOLDOWN: Duration = Duration::from_secs(1);
pub const TRAP_ACTIVE_DURATION: Duration = Duration::from_millis(1500);
pub const TIMER_TRAP_PERIOD: Duration = Duration::from_secs(3);
pub const PATROL_STEP_INTERVAL: Duration = Duration::from_millis(400);
pub const DEFAULT_SPAWN: Position = Position::new(1, 1);
const SPAWN_SEARCH_RADIUS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Chat,
    LevelUpdate,
}

/// A server announcement produced by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelPhase {
    Normal,
    /// Completion conditions were met; the next level is scheduled.
    Awaiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorldTask {
    Restart,
    NextLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    Blocked,
    Throttled,
    Dead,
    UnknownPlayer,
}

#[derive(Debug, Clone)]
pub struct EnemyAgent {
    pub enemy: Enemy,
    pub behavior: Behavior,
}

pub struct World {
    config: WorldConfig,
    current: Level,
    grid: TileGrid,
    players: BTreeMap<u32, Player>,
    enemies: Vec<EnemyAgent>,
    patrol_enemies: Vec<PatrolEnemy>,
    traps: Vec<Trap>,
    diamonds_total: u32,
    diamonds_collected: u32,
    collected_cells: HashSet<Position>,
    phase: LevelPhase,
    restart_pending: bool,
    tasks: DelayedQueue<WorldTask>,
    notices: Vec<Notice>,
    rng: StdRng,
    tick: u64,
    last_patrol_step: Option<Instant>,
}

impl World {
    /// Creates a world on the configured first level.
    pub fn new(config: WorldConfig) -> Result<World> {
        let level = level::load_level(&config.levels_dir, config.first_level)?;
        Ok(World::from_level(config, level))
    }

    pub fn from_level(config: WorldConfig, level: Level) -> World {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut world = World {
            config,
            grid: level.grid.clone(),
            current: level,
            players: BTreeMap::new(),
            enemies: Vec::new(),
            patrol_enemies: Vec::new(),
            traps: Vec::new(),
            diamonds_total: 0,
            diamonds_collected: 0,
            collected_cells: HashSet::new(),
            phase: LevelPhase::Normal,
            restart_pending: false,
            tasks: DelayedQueue::new(),
            notices: Vec::new(),
            rng,
            tick: 0,
            last_patrol_step: None,
        };
        world.install(world.current.clone());
        world
    }

    pub fn level(&self) -> u32 {
        self.current.number
    }

    pub fn grid(&self) -> &TileGrid {
        &self.grid
    }

    pub fn phase(&self) -> LevelPhase {
        self.phase
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_pending
    }

    pub fn diamonds(&self) -> (u32, u32) {
        (self.diamonds_collected, self.diamonds_total)
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn player(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn enemies(&self) -> impl Iterator<Item = &EnemyAgent> {
        self.enemies.iter()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notice(&mut self, kind: NoticeKind, text: impl Into<String>) {
        let text = text.into();
        debug!("Notice: {}", text);
        self.notices.push(Notice { kind, text });
    }

    /// Loads level `number` through the level loader and installs it.
    pub fn load_level(&mut self, number: u32) -> Result<()> {
        let level = level::load_level(&self.config.levels_dir, number)?;
        self.install(level);
        Ok(())
    }

    /// Replaces all level state wholesale and resets every player.
    fn install(&mut self, level: Level) {
        info!(
            "Installing level {} ({}x{}, {} diamonds, {} enemies)",
            level.number,
            level.grid.width(),
            level.grid.height(),
            level.diamond_count,
            level.enemies.len()
        );

        self.grid = level.grid.clone();
        self.enemies = level
            .enemies
            .iter()
            .map(|enemy| EnemyAgent {
                behavior: match self.config.enemy_strategy {
                    Some(kind) => Behavior::new(kind, enemy.spawn),
                    None => Behavior::for_enemy(enemy, level.number),
                },
                enemy: enemy.clone(),
            })
            .collect();
        self.patrol_enemies = level.patrol_enemies.clone();
        self.traps = level.traps.clone();
        self.diamonds_total = level.diamond_count;
        self.diamonds_collected = 0;
        self.collected_cells.clear();
        self.phase = LevelPhase::Normal;
        self.restart_pending = false;
        self.tasks.clear();
        self.last_patrol_step = None;
        self.current = level;

        let ids: Vec<u32> = self.players.keys().copied().collect();
        let mut occupied = HashSet::new();
        for (index, id) in ids.into_iter().enumerate() {
            let spawn = self.find_spawn(index, &occupied);
            occupied.insert(spawn);
            if let Some(player) = self.players.get_mut(&id) {
                player.reset_for_level(spawn);
            }
        }
    }

    /// Picks a spawn cell: the preferred start tile, any other start tile,
    /// a ring search around the start tiles, a full scan, then a default.
    fn find_spawn(&self, preferred: usize, occupied: &HashSet<Position>) -> Position {
        let free = |pos: Position| self.grid.is_walkable(pos) && !occupied.contains(&pos);
        let starts = &self.current.start_positions;

        if !starts.is_empty() {
            let rotated = starts.iter().cycle().skip(preferred % starts.len()).take(starts.len());
            for pos in rotated {
                if free(*pos) {
                    return *pos;
                }
            }
        }

        for radius in 1..=SPAWN_SEARCH_RADIUS {
            for start in starts {
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        if dx.abs().max(dy.abs()) != radius {
                            continue;
                        }
                        let pos = start.offset(dx, dy);
                        if free(pos) {
                            return pos;
                        }
                    }
                }
            }
        }

        if let Some(pos) = self.grid.positions().find(|p| free(*p)) {
            return pos;
        }

        warn!("No free spawn cell on level {}, stacking players", self.current.number);
        starts
            .iter()
            .copied()
            .chain(self.grid.positions())
            .find(|p| self.grid.is_walkable(*p))
            .unwrap_or(DEFAULT_SPAWN)
    }

    /// Registers a player, or updates name and archetype on a repeated CONNECT.
    pub fn add_player(&mut self, id: u32, name: &str, character: CharacterType) -> Position {
        if let Some(player) = self.players.get_mut(&id) {
            player.name = name.to_string();
            player.character = character;
            return player.position;
        }

        let occupied: HashSet<Position> = self.players.values().map(|p| p.position).collect();
        let spawn = self.find_spawn(self.players.len(), &occupied);
        self.players
            .insert(id, Player::new(id, name, character, spawn));
        info!("Player {} ({}) spawned at {:?}", id, name, spawn);
        self.notice(
            NoticeKind::Chat,
            format!("{} the {} joined the dungeon", name, character.name()),
        );
        spawn
    }

    pub fn remove_player(&mut self, id: u32, now: Instant) -> Option<Player> {
        let player = self.players.remove(&id)?;
        info!("Removed player {}", id);
        self.notice(NoticeKind::Chat, format!("{} left the dungeon", player.name));
        self.evaluate_completion(now);
        Some(player)
    }

    /// Resolves one move request, including tile effects and collisions.
    pub fn move_player(&mut self, id: u32, direction: Direction, now: Instant) -> MoveOutcome {
        let Some(player) = self.players.get_mut(&id) else {
            return MoveOutcome::UnknownPlayer;
        };
        if !player.is_alive() {
            return MoveOutcome::Dead;
        }
        if !player.can_move(now) {
            return MoveOutcome::Throttled;
        }
        let target = player.position.step(direction);
        if !self.grid.is_walkable(target) {
            return MoveOutcome::Blocked;
        }

        player.position = target;
        player.direction = direction;
        player.last_move = Some(now);

        self.resolve_tile(id, target, now);
        self.enemy_contacts(id, now);
        self.trap_contacts(id, now);
        MoveOutcome::Moved
    }

    fn resolve_tile(&mut self, id: u32, pos: Position, now: Instant) {
        let name = match self.players.get(&id) {
            Some(player) => player.name.clone(),
            None => return,
        };
        match self.grid.get(pos) {
            Some(Tile::Diamond) => self.collect_diamond(id, pos, now),
            Some(Tile::Trap) => {
                self.grid.set(pos, Tile::Floor);
                self.damage_player(id, 1, "a hidden trap", now);
            }
            Some(Tile::Chest) => {
                self.grid.set(pos, Tile::Floor);
                self.notice(
                    NoticeKind::Chat,
                    format!("{} pried open a chest... only dust inside", name),
                );
            }
            Some(Tile::Door) => {
                self.notice(NoticeKind::Chat, format!("{} reached the door", name));
                self.evaluate_completion(now);
            }
            _ => {}
        }
    }

    fn collect_diamond(&mut self, id: u32, pos: Position, now: Instant) {
        if !self.collected_cells.insert(pos) {
            return;
        }
        self.grid.set(pos, Tile::Floor);
        self.diamonds_collected += 1;

        let name = match self.players.get_mut(&id) {
            Some(player) => {
                player.diamonds += player.character.diamond_yield();
                player.name.clone()
            }
            None => return,
        };
        self.notice(
            NoticeKind::LevelUpdate,
            format!(
                "{} found a diamond! {}/{}",
                name, self.diamonds_collected, self.diamonds_total
            ),
        );

        if self.diamonds_collected >= self.diamonds_total {
            self.notice(
                NoticeKind::LevelUpdate,
                "All diamonds collected! Everyone to the door!",
            );
            self.evaluate_completion(now);
        }
    }

    /// Takes lives from a player and starts the restart countdown on death.
    fn damage_player(&mut self, id: u32, amount: u8, cause: &str, now: Instant) {
        let Some(player) = self.players.get_mut(&id) else {
            return;
        };
        if !player.is_alive() {
            return;
        }
        player.lives = player.lives.saturating_sub(amount);
        let (name, lives) = (player.name.clone(), player.lives);

        self.notice(
            NoticeKind::Chat,
            format!("{} was hit by {} ({} lives left)", name, cause, lives),
        );
        if lives == 0 {
            info!("Player {} died on level {}", id, self.current.number);
            self.notice(
                NoticeKind::LevelUpdate,
                format!(
                    "{} has fallen! Restarting level in {} seconds",
                    name,
                    self.config.restart_delay.as_secs()
                ),
            );
            self.schedule_restart(now);
        }
    }

    fn schedule_restart(&mut self, now: Instant) {
        if self.restart_pending {
            return;
        }
        self.restart_pending = true;
        self.tasks
            .schedule(now + self.config.restart_delay, WorldTask::Restart);
    }

    /// Normal -> Awaiting when every diamond is in, someone is alive, every
    /// living player stands on a door and no restart is pending.
    fn evaluate_completion(&mut self, now: Instant) {
        if self.phase == LevelPhase::Awaiting || self.restart_pending {
            return;
        }
        if self.diamonds_collected < self.diamonds_total {
            return;
        }

        let mut alive = self.players.values().filter(|p| p.is_alive()).peekable();
        if alive.peek().is_none() {
            return;
        }
        if !alive.all(|p| self.grid.get(p.position) == Some(Tile::Door)) {
            return;
        }

        self.phase = LevelPhase::Awaiting;
        info!("Level {} complete", self.current.number);
        self.notice(
            NoticeKind::LevelUpdate,
            format!(
                "Level {} complete! Next level in {} seconds...",
                self.current.number,
                self.config.transition_delay.as_secs()
            ),
        );
        self.tasks
            .schedule(now + self.config.transition_delay, WorldTask::NextLevel);
    }

    fn enemy_contacts(&mut self, id: u32, now: Instant) {
        let pos = match self.players.get(&id) {
            Some(player) if player.is_alive() => player.position,
            _ => return,
        };

        let mut hits: Vec<(u8, &'static str)> = Vec::new();
        for agent in self.enemies.iter_mut() {
            let enemy = &mut agent.enemy;
            if enemy.active
                && enemy.position == pos
                && cooldown_ready(enemy.last_attack, now, ai::ATTACK_COOLDOWN)
            {
                enemy.last_attack = Some(now);
                hits.push((enemy.kind.damage(), "an enemy"));
            }
        }
        for patrol in self.patrol_enemies.iter_mut() {
            if patrol.position == pos && cooldown_ready(patrol.last_attack, now, ai::ATTACK_COOLDOWN) {
                patrol.last_attack = Some(now);
                hits.push((1, "a patrolling guard"));
            }
        }

        for (amount, cause) in hits {
            self.damage_player(id, amount, cause, now);
        }
    }

    /// Arms pressure traps under the player and applies damage from armed ones.
    fn trap_contacts(&mut self, id: u32, now: Instant) {
        let pos = match self.players.get(&id) {
            Some(player) if player.is_alive() => player.position,
            _ => return,
        };

        let mut hits = Vec::new();
        for trap in self.traps.iter_mut() {
            if !trap.threatens(pos, &self.grid) {
                continue;
            }
            if trap.activation == TrapActivation::Pressure && !trap.active {
                trap.arm(now);
            }
            if trap.active && cooldown_ready(trap.last_damage, now, TRAP_DAMAGE_COOLDOWN) {
                trap.last_damage = Some(now);
                hits.push(trap_cause(trap.kind));
            }
        }

        for cause in hits {
            self.damage_player(id, 1, cause, now);
        }
    }

    /// Deals one point of damage to every active enemy next to the player.
    /// Returns how many enemies were hit.
    pub fn attack(&mut self, id: u32) -> usize {
        let (pos, name) = match self.players.get(&id) {
            Some(player) if player.is_alive() => (player.position, player.name.clone()),
            _ => return 0,
        };

        let mut hit = 0;
        let mut defeated = Vec::new();
        for agent in self.enemies.iter_mut() {
            if agent.enemy.active && agent.enemy.position.chebyshev(pos) <= 1 {
                hit += 1;
                if agent.enemy.take_hit(1) {
                    defeated.push(agent.enemy.kind);
                }
            }
        }
        for kind in defeated {
            self.notice(NoticeKind::Chat, format!("{} defeated a {:?}", name, kind));
        }
        hit
    }

    /// Applies an ACTION verb. Unknown verbs have no effect.
    pub fn perform_action(&mut self, id: u32, action: &str) -> usize {
        match action.trim().to_ascii_lowercase().as_str() {
            "attack" => self.attack(id),
            _ => 0,
        }
    }

    /// Replaces the strategy of one enemy until the next level load.
    pub fn set_enemy_behavior(&mut self, enemy_id: u32, kind: StrategyKind) -> bool {
        match self.enemies.iter_mut().find(|a| a.enemy.id == enemy_id) {
            Some(agent) => {
                agent.behavior = Behavior::new(kind, agent.enemy.spawn);
                true
            }
            None => false,
        }
    }

    /// Advances the simulation by one step.
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        self.run_due_tasks(now)?;
        self.update_enemies(now);
        self.update_patrols(now);

        let alive: Vec<u32> = self
            .players
            .values()
            .filter(|p| p.is_alive())
            .map(|p| p.id)
            .collect();
        for id in alive {
            self.enemy_contacts(id, now);
        }

        self.update_traps(now);
        self.tick += 1;
        Ok(())
    }

    fn run_due_tasks(&mut self, now: Instant) -> Result<()> {
        while let Some(task) = self.tasks.pop_due(now) {
            match task {
                WorldTask::Restart => {
                    info!("Restarting level {}", self.current.number);
                    self.install(self.current.clone());
                    self.notice(
                        NoticeKind::LevelUpdate,
                        format!("Level {} restarted", self.current.number),
                    );
                }
                WorldTask::NextLevel => {
                    let next = self.current.number + 1;
                    if let Err(e) = self.load_level(next) {
                        self.phase = LevelPhase::Normal;
                        return Err(e);
                    }
                    self.notice(
                        NoticeKind::LevelUpdate,
                        format!("Welcome to level {}!", next),
                    );
                }
            }
        }
        Ok(())
    }

    fn update_enemies(&mut self, now: Instant) {
        let targets: Vec<Target> = self
            .players
            .values()
            .filter(|p| p.is_alive())
            .map(|p| Target {
                id: p.id,
                position: p.position,
                lives: p.lives,
            })
            .collect();
        let level = self.current.number;

        let mut hits = Vec::new();
        for agent in self.enemies.iter_mut() {
            let mut ctx = ai::Context {
                grid: &self.grid,
                players: &targets,
                level,
                now,
                rng: &mut self.rng,
            };
            for id in ai::act(&mut agent.enemy, &mut agent.behavior, &mut ctx) {
                hits.push((id, agent.enemy.kind.damage()));
            }
        }

        for (id, amount) in hits {
            self.damage_player(id, amount, "an enemy", now);
        }
    }

    fn update_patrols(&mut self, now: Instant) {
        if !cooldown_ready(self.last_patrol_step, now, PATROL_STEP_INTERVAL) {
            return;
        }
        self.last_patrol_step = Some(now);
        for patrol in self.patrol_enemies.iter_mut() {
            patrol.advance(&self.grid);
            patrol.last_move = Some(now);
        }
    }

    fn update_traps(&mut self, now: Instant) {
        let alive: Vec<(u32, Position)> = self
            .players
            .values()
            .filter(|p| p.is_alive())
            .map(|p| (p.id, p.position))
            .collect();

        let mut hits = Vec::new();
        for trap in self.traps.iter_mut() {
            if trap.active
                && cooldown_ready(trap.activated_at, now, TRAP_ACTIVE_DURATION)
            {
                trap.disarm(now);
            }

            let cells = trap.target_cells(&self.grid);
            let victims: Vec<u32> = alive
                .iter()
                .filter(|(_, pos)| cells.contains(pos))
                .map(|(id, _)| *id)
                .collect();

            if !trap.active {
                let arm = match trap.activation {
                    TrapActivation::Pressure => !victims.is_empty(),
                    TrapActivation::Timer => {
                        cooldown_ready(trap.activated_at, now, TIMER_TRAP_PERIOD)
                    }
                };
                if arm {
                    trap.arm(now);
                }
            }

            if trap.active
                && !victims.is_empty()
                && cooldown_ready(trap.last_damage, now, TRAP_DAMAGE_COOLDOWN)
            {
                trap.last_damage = Some(now);
                let cause = trap_cause(trap.kind);
                hits.extend(victims.into_iter().map(|id| (id, cause)));
            }
        }

        for (id, cause) in hits {
            self.damage_player(id, 1, cause, now);
        }
    }

    /// Immutable copy of the whole world for broadcasting.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            tick: self.tick,
            level: self.current.number,
            grid: self.grid.clone(),
            players: self.players.values().cloned().collect(),
            enemies: self.enemies.iter().map(|a| a.enemy.clone()).collect(),
            patrol_enemies: self.patrol_enemies.clone(),
            traps: self.traps.clone(),
            diamonds_collected: self.diamonds_collected,
            diamonds_total: self.diamonds_total,
            level_complete: self.phase == LevelPhase::Awaiting,
            restart_pending: self.restart_pending,
        }
    }

    /// `id:name:character` entries joined by commas.
    pub fn roster(&self) -> String {
        self.players
            .values()
            .map(|p| format!("{}:{}:{}", p.id, p.name, p.character.name()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn trap_cause(kind: TrapKind) -> &'static str {
    match kind {
        TrapKind::Arrow => "an arrow trap",
        TrapKind::Fire => "a fire trap",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{EnemyKind, MAX_LIVES};
    use std::path::PathBuf;

    const STEP: Duration = Duration::from_millis(250);

    fn test_config() -> WorldConfig {
        WorldConfig {
            levels_dir: PathBuf::from("/nonexistent/dungeon-levels"),
            seed: Some(11),
            ..WorldConfig::default()
        }
    }

    fn level_with(grid: TileGrid, starts: Vec<Position>) -> Level {
        let diamond_count = grid.count(Tile::Diamond) as u32;
        Level {
            number: 1,
            grid,
            enemies: Vec::new(),
            patrol_enemies: Vec::new(),
            traps: Vec::new(),
            start_positions: starts,
            diamond_count,
        }
    }

    fn walk(world: &mut World, id: u32, direction: Direction, steps: usize, clock: &mut Instant) {
        for _ in 0..steps {
            *clock += STEP;
            assert_eq!(
                world.move_player(id, direction, *clock),
                MoveOutcome::Moved,
                "player {} failed to move {:?}",
                id,
                direction
            );
        }
    }

    fn scenario_world() -> World {
        let mut grid = TileGrid::bordered(20, 20);
        grid.set(Position::new(5, 5), Tile::Diamond);
        grid.set(Position::new(18, 18), Tile::Door);
        World::from_level(test_config(), level_with(grid, vec![Position::new(1, 1)]))
    }

    #[test]
    fn test_diamond_then_door_scenario() {
        let mut world = scenario_world();
        let mut clock = Instant::now();
        assert_eq!(world.add_player(1, "ana", CharacterType::Warrior), Position::new(1, 1));

        walk(&mut world, 1, Direction::Right, 4, &mut clock);
        walk(&mut world, 1, Direction::Down, 4, &mut clock);

        assert_eq!(world.grid().get(Position::new(5, 5)), Some(Tile::Floor));
        assert_eq!(world.player(1).unwrap().diamonds, 1);
        assert_eq!(world.diamonds(), (1, 1));
        assert_eq!(world.phase(), LevelPhase::Normal);

        walk(&mut world, 1, Direction::Right, 13, &mut clock);
        walk(&mut world, 1, Direction::Down, 13, &mut clock);
        assert_eq!(world.player(1).unwrap().position, Position::new(18, 18));
        assert_eq!(world.phase(), LevelPhase::Awaiting);
        assert!(world.snapshot().level_complete);

        world.tick(clock + Duration::from_millis(1900)).unwrap();
        assert_eq!(world.level(), 1);

        world.tick(clock + Duration::from_secs(2)).unwrap();
        assert_eq!(world.level(), 2);
        assert_eq!(world.phase(), LevelPhase::Normal);
        let (collected, total) = world.diamonds();
        assert_eq!(collected, 0);
        assert!(total > 0);
        let player = world.player(1).unwrap();
        assert_eq!(player.diamonds, 0);
        assert_eq!(player.lives, MAX_LIVES);

        let notices = world.take_notices();
        assert!(notices.iter().any(|n| n.text.contains("Welcome to level 2")));
    }

    #[test]
    fn test_awaiting_is_idempotent() {
        let mut world = scenario_world();
        let mut clock = Instant::now();
        world.add_player(1, "ana", CharacterType::Rogue);
        walk(&mut world, 1, Direction::Right, 4, &mut clock);
        walk(&mut world, 1, Direction::Down, 4, &mut clock);
        walk(&mut world, 1, Direction::Right, 13, &mut clock);
        walk(&mut world, 1, Direction::Down, 13, &mut clock);
        assert_eq!(world.pending_tasks(), 1);

        walk(&mut world, 1, Direction::Up, 1, &mut clock);
        walk(&mut world, 1, Direction::Down, 1, &mut clock);
        assert_eq!(world.pending_tasks(), 1);
    }

    #[test]
    fn test_diamond_collected_once() {
        let mut grid = TileGrid::bordered(6, 4);
        grid.set(Position::new(2, 1), Tile::Diamond);
        grid.set(Position::new(4, 2), Tile::Diamond);
        let mut world = World::from_level(
            test_config(),
            level_with(grid, vec![Position::new(1, 1), Position::new(2, 2)]),
        );
        world.add_player(1, "ana", CharacterType::Warrior);
        world.add_player(2, "bo", CharacterType::Archaeologist);
        let mut clock = Instant::now();

        walk(&mut world, 1, Direction::Right, 1, &mut clock);
        walk(&mut world, 2, Direction::Up, 1, &mut clock);
        walk(&mut world, 1, Direction::Right, 1, &mut clock);
        walk(&mut world, 1, Direction::Left, 1, &mut clock);

        assert_eq!(world.diamonds(), (1, 2));
        assert_eq!(world.player(1).unwrap().diamonds, 1);
        assert_eq!(world.player(2).unwrap().diamonds, 0);

        walk(&mut world, 2, Direction::Down, 1, &mut clock);
        walk(&mut world, 2, Direction::Right, 2, &mut clock);
        assert_eq!(world.diamonds(), (2, 2));
        assert_eq!(world.player(2).unwrap().diamonds, 2);
    }

    #[test]
    fn test_move_validation() {
        let grid = TileGrid::bordered(4, 4);
        let mut world = World::from_level(test_config(), level_with(grid, vec![Position::new(1, 1)]));
        world.add_player(1, "ana", CharacterType::Warrior);
        let now = Instant::now();

        assert_eq!(world.move_player(1, Direction::Up, now), MoveOutcome::Blocked);
        assert_eq!(world.move_player(1, Direction::Right, now), MoveOutcome::Moved);
        assert_eq!(
            world.move_player(1, Direction::Down, now + Duration::from_millis(50)),
            MoveOutcome::Throttled
        );
        assert_eq!(world.move_player(9, Direction::Down, now), MoveOutcome::UnknownPlayer);
        assert_eq!(world.player(1).unwrap().position, Position::new(2, 1));
        assert_eq!(world.player(1).unwrap().direction, Direction::Right);
    }

    #[test]
    fn test_transition_requires_every_living_player_on_door() {
        let mut grid = TileGrid::bordered(8, 5);
        grid.set(Position::new(2, 1), Tile::Diamond);
        grid.set(Position::new(4, 1), Tile::Door);
        grid.set(Position::new(4, 2), Tile::Door);
        let mut world = World::from_level(
            test_config(),
            level_with(grid, vec![Position::new(1, 1), Position::new(1, 2)]),
        );
        world.add_player(1, "ana", CharacterType::Warrior);
        world.add_player(2, "bo", CharacterType::Warrior);
        let mut clock = Instant::now();

        walk(&mut world, 1, Direction::Right, 3, &mut clock);
        assert_eq!(world.diamonds(), (1, 1));
        assert_eq!(world.phase(), LevelPhase::Normal);

        walk(&mut world, 2, Direction::Right, 3, &mut clock);
        assert_eq!(world.phase(), LevelPhase::Awaiting);
    }

    #[test]
    fn test_no_transition_with_diamonds_left() {
        let mut grid = TileGrid::bordered(6, 4);
        grid.set(Position::new(3, 2), Tile::Diamond);
        grid.set(Position::new(2, 1), Tile::Door);
        let mut world = World::from_level(test_config(), level_with(grid, vec![Position::new(1, 1)]));
        world.add_player(1, "ana", CharacterType::Warrior);
        let mut clock = Instant::now();

        walk(&mut world, 1, Direction::Right, 1, &mut clock);
        assert_eq!(world.phase(), LevelPhase::Normal);
        assert_eq!(world.pending_tasks(), 0);
    }

    #[test]
    fn test_leaving_player_can_complete_level() {
        let mut grid = TileGrid::bordered(6, 4);
        grid.set(Position::new(2, 1), Tile::Door);
        let mut world = World::from_level(
            test_config(),
            level_with(grid, vec![Position::new(1, 1), Position::new(1, 2)]),
        );
        world.add_player(1, "ana", CharacterType::Warrior);
        world.add_player(2, "bo", CharacterType::Warrior);
        let mut clock = Instant::now();

        walk(&mut world, 1, Direction::Right, 1, &mut clock);
        assert_eq!(world.phase(), LevelPhase::Normal);
        assert!(world.remove_player(2, clock).is_some());
        assert_eq!(world.phase(), LevelPhase::Awaiting);
    }

    #[test]
    fn test_trap_tiles_kill_and_restart_once() {
        let mut grid = TileGrid::bordered(8, 4);
        for x in 2..=4 {
            grid.set(Position::new(x, 1), Tile::Trap);
        }
        let mut world = World::from_level(test_config(), level_with(grid, vec![Position::new(1, 1)]));
        world.add_player(1, "ana", CharacterType::Warrior);
        let mut clock = Instant::now();

        walk(&mut world, 1, Direction::Right, 3, &mut clock);
        let player = world.player(1).unwrap();
        assert_eq!(player.lives, 0);
        assert!(world.restart_pending());
        assert_eq!(world.pending_tasks(), 1);
        assert_eq!(world.grid().get(Position::new(4, 1)), Some(Tile::Floor));

        clock += STEP;
        assert_eq!(world.move_player(1, Direction::Right, clock), MoveOutcome::Dead);

        world.tick(clock + Duration::from_secs(3)).unwrap();
        let player = world.player(1).unwrap();
        assert_eq!(player.lives, MAX_LIVES);
        assert_eq!(player.position, Position::new(1, 1));
        assert!(!world.restart_pending());
        assert_eq!(world.grid().get(Position::new(2, 1)), Some(Tile::Trap));
    }

    #[test]
    fn test_simultaneous_hits_schedule_one_restart() {
        let grid = TileGrid::bordered(6, 6);
        let mut level = level_with(grid, vec![Position::new(2, 2)]);
        level.enemies = vec![
            Enemy::new(1, EnemyKind::Ghost, Position::new(2, 3)),
            Enemy::new(2, EnemyKind::Ghost, Position::new(3, 2)),
            Enemy::new(3, EnemyKind::Ghost, Position::new(2, 1)),
            Enemy::new(4, EnemyKind::Ghost, Position::new(1, 2)),
        ];
        let mut world = World::from_level(test_config(), level);
        world.add_player(1, "ana", CharacterType::Warrior);
        let now = Instant::now();

        world.tick(now).unwrap();
        assert_eq!(world.player(1).unwrap().lives, 0);
        assert_eq!(world.pending_tasks(), 1);

        world.tick(now + Duration::from_millis(1500)).unwrap();
        assert_eq!(world.player(1).unwrap().lives, 0);
        assert_eq!(world.pending_tasks(), 1);
    }

    #[test]
    fn test_trap_damage_cooldown() {
        let grid = TileGrid::bordered(8, 6);
        let mut level = level_with(grid, vec![Position::new(1, 3)]);
        level.traps = vec![Trap::new(
            1,
            Position::new(0, 3),
            TrapActivation::Pressure,
            TrapKind::Arrow,
            Direction::Right,
        )];
        let mut world = World::from_level(test_config(), level);
        world.add_player(1, "ana", CharacterType::Warrior);
        let now = Instant::now();

        world.tick(now).unwrap();
        assert_eq!(world.player(1).unwrap().lives, 2);
        assert!(world.snapshot().traps[0].active);

        world.tick(now + Duration::from_millis(500)).unwrap();
        world.tick(now + Duration::from_millis(999)).unwrap();
        assert_eq!(world.player(1).unwrap().lives, 2);

        world.tick(now + Duration::from_secs(1)).unwrap();
        assert_eq!(world.player(1).unwrap().lives, 1);
    }

    #[test]
    fn test_pressure_trap_disarms_when_clear() {
        let grid = TileGrid::bordered(8, 6);
        let mut level = level_with(grid, vec![Position::new(1, 3)]);
        level.traps = vec![Trap::new(
            1,
            Position::new(0, 3),
            TrapActivation::Pressure,
            TrapKind::Arrow,
            Direction::Right,
        )];
        let mut world = World::from_level(test_config(), level);
        world.add_player(1, "ana", CharacterType::Warrior);
        let now = Instant::now();

        world.tick(now).unwrap();
        let mut clock = now;
        walk(&mut world, 1, Direction::Down, 1, &mut clock);
        world.tick(now + TRAP_ACTIVE_DURATION).unwrap();
        assert!(!world.snapshot().traps[0].active);
        assert_eq!(world.player(1).unwrap().lives, 2);
    }

    #[test]
    fn test_timer_trap_arms_without_players() {
        let grid = TileGrid::bordered(6, 6);
        let mut level = level_with(grid, vec![Position::new(4, 4)]);
        level.traps = vec![Trap::new(
            1,
            Position::new(2, 0),
            TrapActivation::Timer,
            TrapKind::Fire,
            Direction::Down,
        )];
        let mut world = World::from_level(test_config(), level);
        let now = Instant::now();

        world.tick(now).unwrap();
        assert!(world.snapshot().traps[0].active);
        world.tick(now + TRAP_ACTIVE_DURATION).unwrap();
        assert!(!world.snapshot().traps[0].active);
        world.tick(now + TIMER_TRAP_PERIOD).unwrap();
        assert!(world.snapshot().traps[0].active);
    }

    #[test]
    fn test_patrol_contact_damage_is_throttled() {
        let grid = TileGrid::bordered(5, 3);
        let mut level = level_with(grid, vec![Position::new(3, 1)]);
        level.patrol_enemies = vec![PatrolEnemy::new(1, Position::new(2, 1), shared::Axis::Horizontal)];
        let mut world = World::from_level(test_config(), level);
        world.add_player(1, "ana", CharacterType::Warrior);
        let now = Instant::now();

        world.tick(now).unwrap();
        assert_eq!(world.player(1).unwrap().lives, 2);

        // Turns around on the player's cell inside the cooldown window.
        world.tick(now + PATROL_STEP_INTERVAL).unwrap();
        world.tick(now + PATROL_STEP_INTERVAL * 2).unwrap();
        assert_eq!(world.player(1).unwrap().lives, 2);
    }

    #[test]
    fn test_attack_action_defeats_enemy() {
        let grid = TileGrid::bordered(6, 6);
        let mut level = level_with(grid, vec![Position::new(2, 2)]);
        level.enemies = vec![Enemy::new(1, EnemyKind::Bat, Position::new(4, 3))];
        let mut world = World::from_level(test_config(), level);
        world.add_player(1, "ana", CharacterType::Warrior);

        assert_eq!(world.perform_action(1, "attack"), 0);
        let mut clock = Instant::now();
        walk(&mut world, 1, Direction::Right, 1, &mut clock);
        assert_eq!(world.perform_action(1, "ATTACK"), 1);
        assert!(!world.enemies().next().unwrap().enemy.active);
        assert_eq!(world.perform_action(1, "dance"), 0);
    }

    #[test]
    fn test_behavior_override_and_tier_defaults() {
        let grid = TileGrid::bordered(6, 6);
        let mut level = level_with(grid, vec![Position::new(1, 1)]);
        level.enemies = vec![Enemy::new(7, EnemyKind::Skeleton, Position::new(3, 3))];
        let mut world = World::from_level(test_config(), level);

        let agent = world.enemies().next().unwrap();
        assert_eq!(agent.behavior.kind(), StrategyKind::Patrol);
        assert!(world.set_enemy_behavior(7, StrategyKind::Boss));
        assert_eq!(world.enemies().next().unwrap().behavior.kind(), StrategyKind::Boss);
        assert!(!world.set_enemy_behavior(99, StrategyKind::Chase));
    }

    #[test]
    fn test_configured_strategy_applies_to_every_enemy() {
        let grid = TileGrid::bordered(8, 8);
        let mut level = level_with(grid, vec![Position::new(1, 1)]);
        level.enemies = vec![
            Enemy::new(1, EnemyKind::Skeleton, Position::new(3, 3)),
            Enemy::new(2, EnemyKind::Bat, Position::new(5, 5)),
        ];
        let config = WorldConfig {
            enemy_strategy: StrategyKind::from_name("Chase"),
            ..test_config()
        };
        let world = World::from_level(config, level);

        assert!(world
            .enemies()
            .all(|agent| agent.behavior.kind() == StrategyKind::Chase));
    }

    #[test]
    fn test_no_transition_without_living_players() {
        let mut grid = TileGrid::bordered(6, 4);
        grid.set(Position::new(2, 1), Tile::Diamond);
        grid.set(Position::new(4, 2), Tile::Door);
        let mut world = World::from_level(
            test_config(),
            level_with(grid, vec![Position::new(1, 1), Position::new(1, 2)]),
        );
        world.add_player(1, "ana", CharacterType::Warrior);
        world.add_player(2, "bo", CharacterType::Warrior);
        let mut clock = Instant::now();

        walk(&mut world, 1, Direction::Right, 1, &mut clock);
        assert_eq!(world.diamonds(), (1, 1));

        // Dead on the door, without the restart dying normally schedules.
        let fallen = world.players.get_mut(&2).unwrap();
        fallen.lives = 0;
        fallen.position = Position::new(4, 2);

        assert!(world.remove_player(1, clock).is_some());
        assert_eq!(world.phase(), LevelPhase::Normal);
        assert_eq!(world.pending_tasks(), 0);
    }

    #[test]
    fn test_empty_level_file_still_spawns_on_the_grid() {
        let dir = std::env::temp_dir().join(format!("dungeon-empty-level-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(level::level_path(&dir, 1), "").unwrap();

        let config = WorldConfig {
            levels_dir: dir.clone(),
            ..test_config()
        };
        let mut world = World::new(config).unwrap();
        let spawn = world.add_player(1, "ana", CharacterType::Warrior);
        assert!(world.grid().is_walkable(spawn));

        let now = Instant::now();
        let moved = Direction::ALL
            .iter()
            .any(|d| world.move_player(1, *d, now) == MoveOutcome::Moved);
        assert!(moved);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_spawn_fallbacks() {
        let mut grid = TileGrid::bordered(6, 6);
        grid.set(Position::new(2, 2), Tile::Wall);
        let mut world = World::from_level(test_config(), level_with(grid, vec![Position::new(2, 2)]));

        let first = world.add_player(1, "ana", CharacterType::Warrior);
        let second = world.add_player(2, "bo", CharacterType::Warrior);
        assert_ne!(first, second);
        assert!(world.grid().is_walkable(first));
        assert!(world.grid().is_walkable(second));
        assert_eq!(first.chebyshev(Position::new(2, 2)), 1);

        let mut world = World::from_level(
            test_config(),
            level_with(TileGrid::bordered(6, 6), Vec::new()),
        );
        assert_eq!(world.add_player(1, "ana", CharacterType::Warrior), Position::new(1, 1));
    }

    #[test]
    fn test_snapshot_and_roster() {
        let mut world = scenario_world();
        world.add_player(3, "cy", CharacterType::Rogue);
        world.add_player(1, "ana", CharacterType::Warrior);
        let snapshot = world.snapshot();
        assert_eq!(snapshot.players.len(), 2);
        assert_eq!(snapshot.diamonds_total, 1);
        assert_eq!(snapshot.grid.width(), 20);
        assert_eq!(world.roster(), "1:ana:warrior,3:cy:rogue");
    }
}
