//! Row/column grids of low-level labware.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Grid address, zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub column: usize,
    pub row: usize,
}

impl GridPos {
    pub const fn new(column: usize, row: usize) -> Self {
        Self { column, row }
    }

    /// The position `offset` rows further down the same column.
    pub const fn down(self, offset: usize) -> Self {
        Self {
            column: self.column,
            row: self.row + offset,
        }
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.column, self.row)
    }
}

/// Shape and pitch of a grid, mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridLayout {
    pub columns: usize,
    pub rows: usize,
    pub x_spacing: f64,
    pub y_spacing: f64,
}

impl GridLayout {
    pub fn new(columns: usize, rows: usize, x_spacing: f64, y_spacing: f64) -> Self {
        Self {
            columns,
            rows,
            x_spacing,
            y_spacing,
        }
    }

    pub fn len(&self) -> usize {
        self.columns * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pos: GridPos) -> bool {
        pos.column < self.columns && pos.row < self.rows
    }

    /// Offset of a position from the grid origin.
    pub fn offset_of(&self, pos: GridPos) -> (f64, f64) {
        (
            pos.column as f64 * self.x_spacing,
            pos.row as f64 * self.y_spacing,
        )
    }

    /// Positions in column-major order.
    pub fn positions(&self) -> impl Iterator<Item = GridPos> + '_ {
        (0..self.columns).flat_map(move |c| (0..self.rows).map(move |r| GridPos::new(c, r)))
    }
}

/// Items laid out on a [`GridLayout`], stored column-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid<T> {
    #[serde(flatten)]
    layout: GridLayout,
    items: Vec<T>,
}

impl<T> Grid<T> {
    /// Build a grid by calling `make` for every position.
    pub fn from_fn(layout: GridLayout, mut make: impl FnMut(GridPos) -> T) -> Self {
        let items = layout.positions().map(&mut make).collect();
        Self { layout, items }
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    /// Whether the stored items match the declared shape.
    pub fn is_consistent(&self) -> bool {
        self.items.len() == self.layout.len()
    }

    fn index(&self, pos: GridPos) -> Option<usize> {
        self.layout
            .contains(pos)
            .then(|| pos.column * self.layout.rows + pos.row)
    }

    pub fn get(&self, pos: GridPos) -> Option<&T> {
        self.index(pos).and_then(|i| self.items.get(i))
    }

    pub fn get_mut(&mut self, pos: GridPos) -> Option<&mut T> {
        self.index(pos).and_then(move |i| self.items.get_mut(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (GridPos, &T)> + '_ {
        self.layout.positions().zip(self.items.iter())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (GridPos, &mut T)> + '_ {
        let layout = self.layout;
        (0..layout.columns)
            .flat_map(move |c| (0..layout.rows).map(move |r| GridPos::new(c, r)))
            .zip(self.items.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_column_major() {
        let grid = Grid::from_fn(GridLayout::new(3, 2, 9.0, 9.0), |p| (p.column, p.row));
        assert_eq!(grid.get(GridPos::new(2, 1)), Some(&(2, 1)));
        assert_eq!(grid.get(GridPos::new(3, 0)), None);
        assert_eq!(grid.iter().nth(1).map(|(p, _)| p), Some(GridPos::new(0, 1)));
        assert!(grid.is_consistent());
    }

    #[test]
    fn offsets_follow_spacing() {
        let layout = GridLayout::new(12, 8, 9.0, 8.5);
        assert_eq!(layout.offset_of(GridPos::new(2, 4)), (18.0, 34.0));
        assert_eq!(GridPos::new(1, 2).down(3), GridPos::new(1, 5));
    }
}
