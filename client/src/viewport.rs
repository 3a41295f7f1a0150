//! Camera tracking and the prioritized list of boards around it

use shared::{Coordinate, GRID_SIZE};

const MAX_AXIS: f32 = (GRID_SIZE - 1) as f32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportConfig {
    /// Chebyshev radius of the always-materialized window
    pub active_radius: u16,
    /// Outer radius of the pre-hydrated ring; at least `active_radius`
    pub buffer_radius: u16,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            active_radius: 2,
            buffer_radius: 4,
        }
    }
}

impl ViewportConfig {
    /// Boards in the full active window
    pub fn active_window(&self) -> usize {
        let side = 2 * usize::from(self.active_radius) + 1;
        side * side
    }

    /// Boards in the buffer ring alone
    pub fn buffer_ring(&self) -> usize {
        let side = 2 * usize::from(self.buffer_radius.max(self.active_radius)) + 1;
        side * side - self.active_window()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Active,
    Buffer,
}

/// One candidate board, in priority order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleBoard {
    pub coord: Coordinate,
    pub tier: Tier,
    /// Euclidean distance from the camera
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct Viewport {
    config: ViewportConfig,
    camera_x: f32,
    camera_y: f32,
    cell: Coordinate,
}

fn clamp_axis(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, MAX_AXIS)
}

fn floor_cell(x: f32, y: f32) -> Coordinate {
    Coordinate::clamped(x.floor() as u16, y.floor() as u16)
}

impl Viewport {
    pub fn new(config: ViewportConfig, x: f32, y: f32) -> Self {
        let config = ViewportConfig {
            buffer_radius: config.buffer_radius.max(config.active_radius),
            ..config
        };
        let (camera_x, camera_y) = (clamp_axis(x), clamp_axis(y));
        Self {
            config,
            camera_x,
            camera_y,
            cell: floor_cell(camera_x, camera_y),
        }
    }

    pub fn config(&self) -> ViewportConfig {
        self.config
    }

    pub fn camera(&self) -> (f32, f32) {
        (self.camera_x, self.camera_y)
    }

    /// The board the camera sits on
    pub fn cell(&self) -> Coordinate {
        self.cell
    }

    /// Moves the camera; returns true when the floored cell changed
    pub fn set_camera(&mut self, x: f32, y: f32) -> bool {
        self.camera_x = clamp_axis(x);
        self.camera_y = clamp_axis(y);
        let cell = floor_cell(self.camera_x, self.camera_y);
        let changed = cell != self.cell;
        self.cell = cell;
        changed
    }

    pub fn pan(&mut self, dx: f32, dy: f32) -> bool {
        self.set_camera(self.camera_x + dx, self.camera_y + dy)
    }

    /// Tier of `coord` relative to the current cell, if it is in view at all
    pub fn tier_of(&self, coord: Coordinate) -> Option<Tier> {
        let dx = coord.x().abs_diff(self.cell.x());
        let dy = coord.y().abs_diff(self.cell.y());
        let ring = dx.max(dy);
        if ring <= self.config.active_radius {
            Some(Tier::Active)
        } else if ring <= self.config.buffer_radius {
            Some(Tier::Buffer)
        } else {
            None
        }
    }

    /// Every on-grid board within the buffer radius, highest priority first
    ///
    /// Active-window entries come before buffer-ring entries. Within each
    /// tier entries are ordered by distance from the camera, with row-major
    /// coordinate order breaking ties.
    pub fn visible_boards(&self) -> Vec<VisibleBoard> {
        let radius = self.config.buffer_radius;
        let (cx, cy) = self.cell.unpack();
        let x0 = cx.saturating_sub(radius);
        let y0 = cy.saturating_sub(radius);
        let x1 = cx.saturating_add(radius).min(GRID_SIZE - 1);
        let y1 = cy.saturating_add(radius).min(GRID_SIZE - 1);

        let mut boards = Vec::with_capacity(usize::from(x1 - x0 + 1) * usize::from(y1 - y0 + 1));
        for y in y0..=y1 {
            for x in x0..=x1 {
                let Some(coord) = Coordinate::new(x, y) else {
                    continue;
                };
                let Some(tier) = self.tier_of(coord) else {
                    continue;
                };
                let ddx = f32::from(x) - self.camera_x;
                let ddy = f32::from(y) - self.camera_y;
                boards.push(VisibleBoard {
                    coord,
                    tier,
                    distance: (ddx * ddx + ddy * ddy).sqrt(),
                });
            }
        }

        boards.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then(a.distance.total_cmp(&b.distance))
                .then(a.coord.cmp(&b.coord))
        });
        boards
    }
}
