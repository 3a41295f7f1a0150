//! Packed grid coordinates and the zone partition built on top of them
//!
//! Every board on the 1000×1000 grid is addressed by a single `u32` key:
//! the high 16 bits hold `y`, the low 16 bits hold `x`. Because `y` sits in
//! the high half, ordering keys numerically is the same as row-major order,
//! which the viewport uses to break distance ties.

use std::fmt;

/// Number of boards along each axis of the grid
pub const GRID_SIZE: u16 = 1000;
/// Side length, in boards, of one subscription zone
pub const ZONE_SIZE: u16 = 50;
/// Number of zones along each axis
pub const ZONES_PER_ROW: u16 = GRID_SIZE / ZONE_SIZE;

/// A board position on the grid, packed into one integer key
///
/// Construction validates both axes, so a `Coordinate` value is always
/// inside `[0, GRID_SIZE)` and never changes once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate(u32);

impl Coordinate {
    /// Packs `(x, y)`; returns `None` when either axis is off the grid
    pub fn new(x: u16, y: u16) -> Option<Self> {
        if x >= GRID_SIZE || y >= GRID_SIZE {
            return None;
        }
        Some(Self((u32::from(y) << 16) | u32::from(x)))
    }

    /// Packs `(x, y)` after pulling each axis back onto the grid
    pub fn clamped(x: u16, y: u16) -> Self {
        let x = x.min(GRID_SIZE - 1);
        let y = y.min(GRID_SIZE - 1);
        Self((u32::from(y) << 16) | u32::from(x))
    }

    /// Rebuilds a coordinate from a raw key, rejecting keys that unpack off-grid
    pub fn from_packed(key: u32) -> Option<Self> {
        Self::new((key & 0xFFFF) as u16, (key >> 16) as u16)
    }

    pub fn packed(self) -> u32 {
        self.0
    }

    pub fn x(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn y(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn unpack(self) -> (u16, u16) {
        (self.x(), self.y())
    }

    /// The `"x,y"` string used to key boards in region responses
    pub fn key(self) -> String {
        format!("{},{}", self.x(), self.y())
    }

    /// Inverse of [`Coordinate::key`]
    pub fn parse_key(key: &str) -> Option<Self> {
        let (x, y) = key.split_once(',')?;
        Self::new(x.trim().parse().ok()?, y.trim().parse().ok()?)
    }

    /// Zone this coordinate belongs to
    pub fn zone(self) -> ZoneId {
        ZoneId::containing(self)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x(), self.y())
    }
}

/// Identifier of a `ZONE_SIZE`×`ZONE_SIZE` block of the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId(pub u16);

impl ZoneId {
    pub fn containing(coord: Coordinate) -> Self {
        let zx = coord.x() / ZONE_SIZE;
        let zy = coord.y() / ZONE_SIZE;
        Self(zy * ZONES_PER_ROW + zx)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone#{}", self.0)
    }
}

/// An axis-aligned rectangle of boards, possibly extending past the grid edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl GridRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle of `half_width`/`half_height` around a center, saturating at zero
    pub fn around(center: Coordinate, half_width: u32, half_height: u32) -> Self {
        let x = u32::from(center.x()).saturating_sub(half_width);
        let y = u32::from(center.y()).saturating_sub(half_height);
        let x_end = u32::from(center.x()) + half_width + 1;
        let y_end = u32::from(center.y()) + half_height + 1;
        Self::new(x, y, x_end - x, y_end - y)
    }

    /// The part of this rectangle that lies on the grid
    pub fn clipped(self) -> Self {
        let limit = u32::from(GRID_SIZE);
        let x = self.x.min(limit);
        let y = self.y.min(limit);
        let x_end = self.x.saturating_add(self.width).min(limit);
        let y_end = self.y.saturating_add(self.height).min(limit);
        Self::new(x, y, x_end - x, y_end - y)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// On-grid coordinates in row-major order
    pub fn coordinates(self) -> impl Iterator<Item = Coordinate> {
        let rect = self.clipped();
        (rect.y..rect.y + rect.height).flat_map(move |y| {
            (rect.x..rect.x + rect.width)
                .filter_map(move |x| Coordinate::new(x as u16, y as u16))
        })
    }

    /// Every zone overlapping the on-grid part of the rectangle
    pub fn zones(self) -> Vec<ZoneId> {
        let rect = self.clipped();
        if rect.is_empty() {
            return Vec::new();
        }
        let zone = u32::from(ZONE_SIZE);
        let (zx0, zx1) = (rect.x / zone, (rect.x + rect.width - 1) / zone);
        let (zy0, zy1) = (rect.y / zone, (rect.y + rect.height - 1) / zone);

        let mut zones = Vec::new();
        for zy in zy0..=zy1 {
            for zx in zx0..=zx1 {
                zones.push(ZoneId((zy * u32::from(ZONES_PER_ROW) + zx) as u16));
            }
        }
        zones
    }
}
