//! Board representation for Sokoban puzzles.
//!
//! Boards are parsed from the plain-text level format shared by the corpus
//! files and the solver protocol:
//!
//! ```text
//! #  wall        $  box             @  player
//! .  target      *  box on target   +  player on target
//!    floor (also '-' and '_')
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// A single grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cell {
    Wall,
    Floor,
    Target,
    Box,
    BoxOnTarget,
    Player,
    PlayerOnTarget,
}

impl Cell {
    pub fn from_char(ch: char) -> Option<Cell> {
        match ch {
            '#' => Some(Cell::Wall),
            ' ' | '-' | '_' => Some(Cell::Floor),
            '.' => Some(Cell::Target),
            '$' => Some(Cell::Box),
            '*' => Some(Cell::BoxOnTarget),
            '@' => Some(Cell::Player),
            '+' => Some(Cell::PlayerOnTarget),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        match self {
            Cell::Wall => '#',
            Cell::Floor => ' ',
            Cell::Target => '.',
            Cell::Box => '$',
            Cell::BoxOnTarget => '*',
            Cell::Player => '@',
            Cell::PlayerOnTarget => '+',
        }
    }

    /// Whether the cell carries a target marking, covered or not
    pub fn has_target(self) -> bool {
        matches!(
            self,
            Cell::Target | Cell::BoxOnTarget | Cell::PlayerOnTarget
        )
    }

    pub fn is_box(self) -> bool {
        matches!(self, Cell::Box | Cell::BoxOnTarget)
    }

    pub fn has_player(self) -> bool {
        matches!(self, Cell::Player | Cell::PlayerOnTarget)
    }

    /// Floor or bare target: something may move onto it
    pub fn is_open(self) -> bool {
        matches!(self, Cell::Floor | Cell::Target)
    }

    /// What remains when the occupant leaves
    pub fn vacated(self) -> Cell {
        if self.has_target() {
            Cell::Target
        } else {
            Cell::Floor
        }
    }

    pub fn with_box(self) -> Cell {
        if self.has_target() {
            Cell::BoxOnTarget
        } else {
            Cell::Box
        }
    }

    pub fn with_player(self) -> Cell {
        if self.has_target() {
            Cell::PlayerOnTarget
        } else {
            Cell::Player
        }
    }
}

/// Movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
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

    /// Parse a move token. Lowercase letters are accepted as well since the
    /// replay decides on its own whether a move pushes.
    pub fn from_token(token: char) -> Option<Direction> {
        match token {
            'U' | 'u' => Some(Direction::Up),
            'D' | 'd' => Some(Direction::Down),
            'L' | 'l' => Some(Direction::Left),
            'R' | 'r' => Some(Direction::Right),
            _ => None,
        }
    }

    pub fn to_token(self) -> char {
        match self {
            Direction::Up => 'U',
            Direction::Down => 'D',
            Direction::Left => 'L',
            Direction::Right => 'R',
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
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

/// Position on the grid (`x` is the column, `y` the row)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, direction: Direction) -> Position {
        let (dx, dy) = direction.delta();
        Position::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParseError {
    #[error("board has no player")]
    NoPlayer,

    #[error("board has more than one player: {first} and {second}")]
    MultiplePlayers { first: Position, second: Position },

    #[error("unexpected character {found:?} at line {line}, column {column}")]
    MalformedText {
        line: usize,
        column: usize,
        found: char,
    },
}

/// A parsed board.
///
/// The cell grid is rectangular; rows shorter than the widest row are padded
/// with floor. Exactly one cell holds the player, and `player` always points
/// at it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Board {
    width: usize,
    height: usize,
    cells: Vec<Cell>,
    player: Position,
}

impl Board {
    /// Parse the textual level format. Empty lines are skipped.
    pub fn parse(text: &str) -> Result<Board, ParseError> {
        let lines: Vec<(usize, &str)> = text
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .collect();

        let width = lines
            .iter()
            .map(|(_, line)| line.chars().count())
            .max()
            .unwrap_or(0);
        let height = lines.len();

        let mut cells = Vec::with_capacity(width * height);
        let mut player: Option<Position> = None;

        for (row, (line_no, line)) in lines.iter().enumerate() {
            let mut len = 0;
            for (col, ch) in line.chars().enumerate() {
                let cell = Cell::from_char(ch).ok_or(ParseError::MalformedText {
                    line: line_no + 1,
                    column: col + 1,
                    found: ch,
                })?;

                if cell.has_player() {
                    let here = Position::new(col as i32, row as i32);
                    if let Some(first) = player {
                        return Err(ParseError::MultiplePlayers {
                            first,
                            second: here,
                        });
                    }
                    player = Some(here);
                }

                cells.push(cell);
                len += 1;
            }
            cells.extend(std::iter::repeat(Cell::Floor).take(width - len));
        }

        let player = player.ok_or(ParseError::NoPlayer)?;

        Ok(Board {
            width,
            height,
            cells,
            player,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn player(&self) -> Position {
        self.player
    }

    fn index(&self, pos: Position) -> Option<usize> {
        if pos.x < 0 || pos.y < 0 {
            return None;
        }
        let (x, y) = (pos.x as usize, pos.y as usize);
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(y * self.width + x)
    }

    /// Cell at a position, `None` off the grid
    pub fn get(&self, pos: Position) -> Option<Cell> {
        self.index(pos).map(|i| self.cells[i])
    }

    /// Cell at a position, with everything off the grid treated as wall
    pub fn cell_at(&self, pos: Position) -> Cell {
        self.get(pos).unwrap_or(Cell::Wall)
    }

    /// Retype a cell. Positions off the grid are ignored.
    pub(crate) fn set(&mut self, pos: Position, cell: Cell) {
        if let Some(i) = self.index(pos) {
            self.cells[i] = cell;
        }
    }

    pub(crate) fn set_player(&mut self, pos: Position) {
        self.player = pos;
    }

    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        self.cells.iter().copied()
    }

    pub fn count(&self, cell: Cell) -> usize {
        self.cells.iter().filter(|&&c| c == cell).count()
    }

    /// True iff no bare target is left.
    ///
    /// Scans the whole grid on every call; a player standing on a target
    /// counts as uncovered.
    pub fn is_solved(&self) -> bool {
        !self
            .cells
            .iter()
            .any(|&c| c == Cell::Target || c == Cell::PlayerOnTarget)
    }

    /// Number of non-wall cells reachable from the player
    pub fn reachable_cells(&self) -> usize {
        let mut seen = vec![false; self.cells.len()];
        let mut stack: SmallVec<[Position; 64]> = SmallVec::new();

        if let Some(start) = self.index(self.player) {
            seen[start] = true;
            stack.push(self.player);
        }

        let mut count = 0;
        while let Some(pos) = stack.pop() {
            count += 1;
            for direction in Direction::ALL {
                let next = pos.offset(direction);
                if let Some(i) = self.index(next) {
                    if !seen[i] && self.cells[i] != Cell::Wall {
                        seen[i] = true;
                        stack.push(next);
                    }
                }
            }
        }
        count
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.cells.chunks(self.width.max(1)) {
            let line: String = row.iter().map(|c| c.to_char()).collect();
            writeln!(f, "{}", line.trim_end())?;
        }
        Ok(())
    }
}

/// Well-known metric names filled in by [`BoardMetrics::from_board`]
pub mod metric {
    pub const FREE: &str = "free";
    pub const WALLS: &str = "walls";
    pub const BOXES: &str = "boxes";
    pub const TARGETS: &str = "targets";
    pub const WIDTH: &str = "width";
    pub const HEIGHT: &str = "height";
}

/// Named numeric features of a board, consumed by the aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardMetrics {
    values: BTreeMap<String, f64>,
}

impl BoardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Basic layout metrics of a freshly parsed board
    pub fn from_board(board: &Board) -> Self {
        let mut metrics = Self::new();
        metrics.insert(metric::FREE, board.reachable_cells() as f64);
        metrics.insert(metric::WALLS, board.count(Cell::Wall) as f64);
        metrics.insert(
            metric::BOXES,
            board.cells().filter(|c| c.is_box()).count() as f64,
        );
        metrics.insert(
            metric::TARGETS,
            board.cells().filter(|c| c.has_target()).count() as f64,
        );
        metrics.insert(metric::WIDTH, board.width() as f64);
        metrics.insert(metric::HEIGHT, board.height() as f64);
        metrics
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_board() {
        let board = Board::parse("#####\n#@$.#\n#####\n").unwrap();
        assert_eq!(board.width(), 5);
        assert_eq!(board.height(), 3);
        assert_eq!(board.player(), Position::new(1, 1));
        assert_eq!(board.get(Position::new(2, 1)), Some(Cell::Box));
        assert_eq!(board.get(Position::new(3, 1)), Some(Cell::Target));
        assert!(!board.is_solved());
    }

    #[test]
    fn test_parse_skips_empty_lines_and_pads_rows() {
        let board = Board::parse("\n\n####\n#@\r\n####\n\n").unwrap();
        assert_eq!(board.height(), 3);
        assert_eq!(board.width(), 4);
        assert_eq!(board.get(Position::new(3, 1)), Some(Cell::Floor));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Board::parse("#$.#"), Err(ParseError::NoPlayer));
        assert_eq!(Board::parse(""), Err(ParseError::NoPlayer));
        assert_eq!(
            Board::parse("@ +"),
            Err(ParseError::MultiplePlayers {
                first: Position::new(0, 0),
                second: Position::new(2, 0),
            })
        );
        assert_eq!(
            Board::parse("\n#@#\n#x#"),
            Err(ParseError::MalformedText {
                line: 3,
                column: 2,
                found: 'x',
            })
        );
    }

    #[test]
    fn test_direction_tokens_and_opposites() {
        for direction in Direction::ALL {
            assert_eq!(Direction::from_token(direction.to_token()), Some(direction));
            assert_eq!(direction.opposite().opposite(), direction);
            let (dx, dy) = direction.delta();
            let (ox, oy) = direction.opposite().delta();
            assert_eq!((dx + ox, dy + oy), (0, 0));
        }
        assert_eq!(Direction::from_token('x'), None);
    }

    #[test]
    fn test_off_grid_is_wall() {
        let board = Board::parse("@").unwrap();
        assert_eq!(board.get(Position::new(-1, 0)), None);
        assert_eq!(board.cell_at(Position::new(-1, 0)), Cell::Wall);
        assert_eq!(board.cell_at(Position::new(0, 1)), Cell::Wall);
    }

    #[test]
    fn test_is_solved_requires_every_target_covered() {
        assert!(Board::parse("#@*#").unwrap().is_solved());
        assert!(!Board::parse("#+*#").unwrap().is_solved());
        assert!(!Board::parse("#@*.#").unwrap().is_solved());
    }

    #[test]
    fn test_display_round_trips_layout() {
        let text = "#####\n#@$.#\n#####\n";
        assert_eq!(Board::parse(text).unwrap().to_string(), text);
    }

    #[test]
    fn test_board_metrics() {
        let board = Board::parse("######\n#@$ .#\n######\n   #  \n").unwrap();
        let metrics = BoardMetrics::from_board(&board);
        assert_eq!(metrics.get(metric::FREE), Some(4.0));
        assert_eq!(metrics.get(metric::WALLS), Some(15.0));
        assert_eq!(metrics.get(metric::BOXES), Some(1.0));
        assert_eq!(metrics.get(metric::TARGETS), Some(1.0));
        assert_eq!(metrics.get(metric::WIDTH), Some(6.0));
        assert_eq!(metrics.get(metric::HEIGHT), Some(4.0));
        assert_eq!(metrics.get("tunnels"), None);
    }
}
