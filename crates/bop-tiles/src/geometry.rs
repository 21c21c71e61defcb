use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{TILE_HEIGHT, TILE_WIDTH};

/// Axis-aligned integer rectangle. `right()` and `bottom()` are exclusive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Rectangle covering tile `(col, row)`.
    pub const fn of_tile(col: i32, row: i32) -> Self {
        Self::new(
            col * TILE_WIDTH as i32,
            row * TILE_HEIGHT as i32,
            TILE_WIDTH as i32,
            TILE_HEIGHT as i32,
        )
    }

    /// Rectangle covering tile columns `min_col..=max_col` and rows
    /// `min_row..=max_row`.
    pub fn of_tile_span(min_col: i32, min_row: i32, max_col: i32, max_row: i32) -> Self {
        if max_col < min_col || max_row < min_row {
            return Self::empty();
        }
        Self::new(
            min_col * TILE_WIDTH as i32,
            min_row * TILE_HEIGHT as i32,
            (max_col - min_col + 1) * TILE_WIDTH as i32,
            (max_row - min_row + 1) * TILE_HEIGHT as i32,
        )
    }

    pub const fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    pub const fn right(&self) -> i32 {
        self.x + self.width
    }

    pub const fn bottom(&self) -> i32 {
        self.y + self.height
    }

    pub const fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    pub const fn contains_point(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn contains(&self, other: &Rect) -> bool {
        if other.is_empty() {
            return true;
        }
        !self.is_empty()
            && other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        !self.intersected(other).is_empty()
    }

    pub fn intersected(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x || bottom <= y {
            return Rect::empty();
        }
        Rect::new(x, y, right - x, bottom - y)
    }

    /// Smallest rectangle containing both; empty operands are ignored.
    pub fn united(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }

    pub fn translated(&self, dx: i32, dy: i32) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Inclusive tile span `(min_col, min_row, max_col, max_row)` covered by
    /// the rectangle, or `None` when it is empty.
    pub fn tile_span(&self) -> Option<(i32, i32, i32, i32)> {
        if self.is_empty() {
            return None;
        }
        Some((
            x_to_col(self.x),
            y_to_row(self.y),
            x_to_col(self.right() - 1),
            y_to_row(self.bottom() - 1),
        ))
    }

    /// The rectangle grown outwards to whole tiles.
    pub fn tile_aligned(&self) -> Rect {
        match self.tile_span() {
            Some((c0, r0, c1, r1)) => Rect::of_tile_span(c0, r0, c1, r1),
            None => Rect::empty(),
        }
    }
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rect({}, {} {}x{})", self.x, self.y, self.width, self.height)
    }
}

/// Tile column containing canvas column `x`.
#[inline]
pub fn x_to_col(x: i32) -> i32 {
    x.div_euclid(TILE_WIDTH as i32)
}

/// Tile row containing canvas row `y`.
#[inline]
pub fn y_to_row(y: i32) -> i32 {
    y.div_euclid(TILE_HEIGHT as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_and_union() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 60, 100, 100);
        assert_eq!(a.intersected(&b), Rect::new(50, 60, 50, 40));
        assert_eq!(a.united(&b), Rect::new(0, 0, 150, 160));
        assert!(a.intersected(&Rect::new(100, 0, 10, 10)).is_empty());
        assert_eq!(Rect::empty().united(&b), b);
    }

    #[test]
    fn tile_span_handles_negative_coordinates() {
        let rect = Rect::new(-1, -65, 2, 66);
        assert_eq!(rect.tile_span(), Some((-1, -2, 0, 0)));
        assert_eq!(rect.tile_aligned(), Rect::new(-64, -128, 128, 192));
        assert_eq!(Rect::empty().tile_span(), None);
    }

    #[test]
    fn containment() {
        let outer = Rect::new(0, 0, 64, 64);
        assert!(outer.contains(&Rect::new(10, 10, 54, 54)));
        assert!(!outer.contains(&Rect::new(10, 10, 55, 54)));
        assert!(outer.contains_point(63, 0));
        assert!(!outer.contains_point(64, 0));
    }
}
