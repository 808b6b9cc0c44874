use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub mod protocol;

pub const MAX_LIVES: u8 = 3;
pub const MAX_PLAYERS: usize = 3;

/// Returns true once `cooldown` has passed since `last`, or if `last` was never set.
pub fn cooldown_ready(last: Option<Instant>, now: Instant, cooldown: Duration) -> bool {
    last.map_or(true, |t| now.saturating_duration_since(t) >= cooldown)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn step(self, direction: Direction) -> Position {
        let (dx, dy) = direction.delta();
        Position::new(self.x + dx, self.y + dy)
    }

    pub fn offset(self, dx: i32, dy: i32) -> Position {
        Position::new(self.x + dx, self.y + dy)
    }

    pub fn manhattan(self, other: Position) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }

    pub fn chebyshev(self, other: Position) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

/// Grid direction; y grows downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    /// Wire code used by PLAYER_MOVE.
    pub fn code(self) -> u8 {
        match self {
            Direction::Up => 1,
            Direction::Down => 2,
            Direction::Left => 3,
            Direction::Right => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Direction> {
        match code {
            1 => Some(Direction::Up),
            2 => Some(Direction::Down),
            3 => Some(Direction::Left),
            4 => Some(Direction::Right),
            _ => None,
        }
    }

    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tile {
    Floor,
    Wall,
    Diamond,
    Trap,
    Chest,
    Door,
    Start,
    EnemySpawn,
    Button,
}

impl Tile {
    pub fn is_walkable(self) -> bool {
        !matches!(self, Tile::Wall)
    }
}

/// Row-major tile storage for one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGrid {
    width: usize,
    height: usize,
    tiles: Vec<Tile>,
}

impl TileGrid {
    pub fn new(width: usize, height: usize, fill: Tile) -> Self {
        Self {
            width,
            height,
            tiles: vec![fill; width * height],
        }
    }

    /// Builds a grid whose outer ring is wall and interior is floor.
    pub fn bordered(width: usize, height: usize) -> Self {
        let mut grid = Self::new(width, height, Tile::Floor);
        for pos in grid.positions().collect::<Vec<_>>() {
            let edge = pos.x == 0
                || pos.y == 0
                || pos.x == width as i32 - 1
                || pos.y == height as i32 - 1;
            if edge {
                grid.set(pos, Tile::Wall);
            }
        }
        grid
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as usize) < self.width && (pos.y as usize) < self.height
    }

    fn index(&self, pos: Position) -> Option<usize> {
        self.in_bounds(pos)
            .then(|| pos.y as usize * self.width + pos.x as usize)
    }

    pub fn get(&self, pos: Position) -> Option<Tile> {
        self.index(pos).map(|i| self.tiles[i])
    }

    /// Returns false if `pos` is out of bounds.
    pub fn set(&mut self, pos: Position, tile: Tile) -> bool {
        match self.index(pos) {
            Some(i) => {
                self.tiles[i] = tile;
                true
            }
            None => false,
        }
    }

    pub fn is_walkable(&self, pos: Position) -> bool {
        self.get(pos).map_or(false, Tile::is_walkable)
    }

    /// All cells in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = Position> {
        let width = self.width as i32;
        let height = self.height as i32;
        (0..height).flat_map(move |y| (0..width).map(move |x| Position::new(x, y)))
    }

    pub fn count(&self, tile: Tile) -> usize {
        self.tiles.iter().filter(|t| **t == tile).count()
    }
}

/// Playable archetype chosen on CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacterType {
    Warrior,
    Rogue,
    Archaeologist,
}

impl CharacterType {
    /// Lenient parse; anything unrecognised is a warrior.
    pub fn from_name(name: &str) -> CharacterType {
        match name.trim().to_ascii_lowercase().as_str() {
            "rogue" => CharacterType::Rogue,
            "archaeologist" => CharacterType::Archaeologist,
            _ => CharacterType::Warrior,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CharacterType::Warrior => "warrior",
            CharacterType::Rogue => "rogue",
            CharacterType::Archaeologist => "archaeologist",
        }
    }

    /// Minimum time between two accepted moves.
    pub fn move_cooldown(self) -> Duration {
        match self {
            CharacterType::Warrior => Duration::from_millis(150),
            CharacterType::Rogue => Duration::from_millis(100),
            CharacterType::Archaeologist => Duration::from_millis(200),
        }
    }

    pub fn diamond_yield(self) -> u32 {
        match self {
            CharacterType::Archaeologist => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: u32,
    pub name: String,
    pub character: CharacterType,
    pub position: Position,
    pub direction: Direction,
    pub lives: u8,
    pub diamonds: u32,
    #[serde(skip)]
    pub last_move: Option<Instant>,
}

impl Player {
    pub fn new(id: u32, name: impl Into<String>, character: CharacterType, position: Position) -> Self {
        Self {
            id,
            name: name.into(),
            character,
            position,
            direction: Direction::Down,
            lives: MAX_LIVES,
            diamonds: 0,
            last_move: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.lives > 0
    }

    pub fn can_move(&self, now: Instant) -> bool {
        cooldown_ready(self.last_move, now, self.character.move_cooldown())
    }

    /// Clears per-level progress.
    pub fn reset_for_level(&mut self, position: Position) {
        self.position = position;
        self.direction = Direction::Down;
        self.lives = MAX_LIVES;
        self.diamonds = 0;
        self.last_move = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnemyKind {
    Bat,
    Skeleton,
    Ghost,
    Trap,
}

impl EnemyKind {
    pub fn max_health(self) -> u32 {
        match self {
            EnemyKind::Bat => 1,
            EnemyKind::Skeleton => 3,
            EnemyKind::Ghost => 2,
            EnemyKind::Trap => 5,
        }
    }

    pub fn damage(self) -> u8 {
        1
    }

    /// Time between steps at level 1.
    pub fn base_move_interval(self) -> Duration {
        match self {
            EnemyKind::Bat => Duration::from_millis(400),
            EnemyKind::Skeleton => Duration::from_millis(800),
            EnemyKind::Ghost => Duration::from_millis(600),
            EnemyKind::Trap => Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enemy {
    pub id: u32,
    pub kind: EnemyKind,
    pub position: Position,
    pub spawn: Position,
    pub direction: Direction,
    pub active: bool,
    pub health: u32,
    #[serde(skip)]
    pub last_move: Option<Instant>,
    #[serde(skip)]
    pub last_attack: Option<Instant>,
}

impl Enemy {
    pub fn new(id: u32, kind: EnemyKind, position: Position) -> Self {
        Self {
            id,
            kind,
            position,
            spawn: position,
            direction: Direction::Down,
            active: true,
            health: kind.max_health(),
            last_move: None,
            last_attack: None,
        }
    }

    /// Applies a hit and deactivates the enemy once its health is gone.
    /// Returns true if this hit defeated it.
    pub fn take_hit(&mut self, amount: u32) -> bool {
        if !self.active {
            return false;
        }
        self.health = self.health.saturating_sub(amount);
        if self.health == 0 {
            self.active = false;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolEnemy {
    pub id: u32,
    pub position: Position,
    pub axis: Axis,
    /// +1 or -1 along `axis`.
    pub heading: i32,
    #[serde(skip)]
    pub last_move: Option<Instant>,
    #[serde(skip)]
    pub last_attack: Option<Instant>,
}

impl PatrolEnemy {
    pub fn new(id: u32, position: Position, axis: Axis) -> Self {
        Self {
            id,
            position,
            axis,
            heading: 1,
            last_move: None,
            last_attack: None,
        }
    }

    pub fn next_position(&self) -> Position {
        match self.axis {
            Axis::Horizontal => self.position.offset(self.heading, 0),
            Axis::Vertical => self.position.offset(0, self.heading),
        }
    }

    /// Steps forward, or turns around when the next cell is blocked.
    pub fn advance(&mut self, grid: &TileGrid) {
        let next = self.next_position();
        if grid.is_walkable(next) {
            self.position = next;
        } else {
            self.heading = -self.heading;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrapActivation {
    /// Arms when a player stands in its path.
    Pressure,
    /// Arms on a fixed period.
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrapKind {
    Arrow,
    Fire,
}

impl TrapKind {
    pub fn range(self) -> i32 {
        match self {
            TrapKind::Arrow => 2,
            TrapKind::Fire => 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trap {
    pub id: u32,
    pub origin: Position,
    pub activation: TrapActivation,
    pub kind: TrapKind,
    pub facing: Direction,
    pub active: bool,
    #[serde(skip)]
    pub activated_at: Option<Instant>,
    #[serde(skip)]
    pub deactivated_at: Option<Instant>,
    #[serde(skip)]
    pub last_damage: Option<Instant>,
}

impl Trap {
    pub fn new(
        id: u32,
        origin: Position,
        activation: TrapActivation,
        kind: TrapKind,
        facing: Direction,
    ) -> Self {
        Self {
            id,
            origin,
            activation,
            kind,
            facing,
            active: false,
            activated_at: None,
            deactivated_at: None,
            last_damage: None,
        }
    }

    /// Cells threatened by this trap, walking `range` steps from the origin.
    pub fn target_cells(&self, grid: &TileGrid) -> Vec<Position> {
        let mut cells = Vec::with_capacity(self.kind.range() as usize);
        let mut pos = self.origin;
        for _ in 0..self.kind.range() {
            pos = pos.step(self.facing);
            if grid.in_bounds(pos) {
                cells.push(pos);
            }
        }
        cells
    }

    pub fn threatens(&self, pos: Position, grid: &TileGrid) -> bool {
        self.target_cells(grid).contains(&pos)
    }

    pub fn arm(&mut self, now: Instant) {
        self.active = true;
        self.activated_at = Some(now);
    }

    pub fn disarm(&mut self, now: Instant) {
        self.active = false;
        self.deactivated_at = Some(now);
    }
}

/// Everything a client needs to draw one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub tick: u64,
    pub level: u32,
    pub grid: TileGrid,
    pub players: Vec<Player>,
    pub enemies: Vec<Enemy>,
    pub patrol_enemies: Vec<PatrolEnemy>,
    pub traps: Vec<Trap>,
    pub diamonds_collected: u32,
    pub diamonds_total: u32,
    pub level_complete: bool,
    pub restart_pending: bool,
}

impl WorldSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn player(&self, id: u32) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_codes() {
        for direction in Direction::ALL {
            assert_eq!(Direction::from_code(direction.code()), Some(direction));
        }
        assert_eq!(Direction::from_code(0), None);
        assert_eq!(Direction::from_code(5), None);
    }

    #[test]
    fn test_position_distances() {
        let a = Position::new(1, 1);
        let b = Position::new(4, 3);
        assert_eq!(a.manhattan(b), 5);
        assert_eq!(a.chebyshev(b), 3);
        assert_eq!(a.step(Direction::Left), Position::new(0, 1));
        assert_eq!(a.step(Direction::Up), Position::new(1, 0));
    }

    #[test]
    fn test_tile_walkability() {
        assert!(!Tile::Wall.is_walkable());
        for tile in [
            Tile::Floor,
            Tile::Diamond,
            Tile::Trap,
            Tile::Chest,
            Tile::Door,
            Tile::Start,
            Tile::EnemySpawn,
            Tile::Button,
        ] {
            assert!(tile.is_walkable(), "{:?} should be walkable", tile);
        }
    }

    #[test]
    fn test_bordered_grid() {
        let grid = TileGrid::bordered(5, 4);
        assert_eq!(grid.get(Position::new(0, 0)), Some(Tile::Wall));
        assert_eq!(grid.get(Position::new(4, 3)), Some(Tile::Wall));
        assert_eq!(grid.get(Position::new(2, 2)), Some(Tile::Floor));
        assert_eq!(grid.get(Position::new(5, 0)), None);
        assert!(!grid.is_walkable(Position::new(-1, 2)));
        assert_eq!(grid.count(Tile::Floor), 6);
    }

    #[test]
    fn test_grid_set_out_of_bounds() {
        let mut grid = TileGrid::new(3, 3, Tile::Floor);
        assert!(grid.set(Position::new(1, 1), Tile::Diamond));
        assert!(!grid.set(Position::new(3, 1), Tile::Diamond));
        assert_eq!(grid.count(Tile::Diamond), 1);
    }

    #[test]
    fn test_character_types() {
        assert_eq!(CharacterType::from_name(" Rogue "), CharacterType::Rogue);
        assert_eq!(
            CharacterType::from_name("ARCHAEOLOGIST"),
            CharacterType::Archaeologist
        );
        assert_eq!(CharacterType::from_name("bard"), CharacterType::Warrior);
        assert_eq!(CharacterType::Archaeologist.diamond_yield(), 2);
        assert!(CharacterType::Rogue.move_cooldown() < CharacterType::Warrior.move_cooldown());
    }

    #[test]
    fn test_player_move_cooldown() {
        let now = Instant::now();
        let mut player = Player::new(1, "ana", CharacterType::Warrior, Position::new(1, 1));
        assert!(player.can_move(now));
        player.last_move = Some(now);
        assert!(!player.can_move(now + Duration::from_millis(100)));
        assert!(player.can_move(now + Duration::from_millis(150)));
    }

    #[test]
    fn test_enemy_defeat() {
        let mut enemy = Enemy::new(1, EnemyKind::Ghost, Position::new(2, 2));
        assert!(!enemy.take_hit(1));
        assert!(enemy.take_hit(1));
        assert!(!enemy.active);
        assert!(!enemy.take_hit(1));
        assert_eq!(enemy.health, 0);
    }

    #[test]
    fn test_patrol_reverses_on_wall() {
        let grid = TileGrid::bordered(5, 3);
        let mut patrol = PatrolEnemy::new(1, Position::new(2, 1), Axis::Horizontal);
        patrol.advance(&grid);
        assert_eq!(patrol.position, Position::new(3, 1));
        patrol.advance(&grid);
        assert_eq!(patrol.position, Position::new(3, 1));
        assert_eq!(patrol.heading, -1);
        patrol.advance(&grid);
        assert_eq!(patrol.position, Position::new(2, 1));
    }

    #[test]
    fn test_trap_target_cells() {
        let grid = TileGrid::bordered(6, 6);
        let arrow = Trap::new(
            1,
            Position::new(0, 2),
            TrapActivation::Pressure,
            TrapKind::Arrow,
            Direction::Right,
        );
        assert_eq!(
            arrow.target_cells(&grid),
            vec![Position::new(1, 2), Position::new(2, 2)]
        );

        let fire = Trap::new(
            2,
            Position::new(3, 5),
            TrapActivation::Timer,
            TrapKind::Fire,
            Direction::Down,
        );
        assert!(fire.target_cells(&grid).is_empty());
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = WorldSnapshot {
            tick: 42,
            level: 2,
            grid: TileGrid::bordered(4, 4),
            players: vec![Player::new(7, "bo", CharacterType::Rogue, Position::new(1, 2))],
            enemies: vec![Enemy::new(1, EnemyKind::Bat, Position::new(2, 2))],
            patrol_enemies: vec![],
            traps: vec![],
            diamonds_collected: 1,
            diamonds_total: 3,
            level_complete: false,
            restart_pending: true,
        };

        let bytes = snapshot.to_bytes().unwrap();
        let decoded = WorldSnapshot::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.tick, 42);
        assert_eq!(decoded.grid, snapshot.grid);
        assert_eq!(decoded.player(7).map(|p| p.position), Some(Position::new(1, 2)));
        assert!(decoded.players[0].last_move.is_none());
        assert!(decoded.restart_pending);
    }
}
