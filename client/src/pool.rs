//! Board pool: a fixed budget of reusable board slots split into an active
//! tier, a buffer tier and a free list
//!
//! Slots are never dropped once allocated. Rebinding a slot to another
//! coordinate bumps its generation, which is how late network replies are
//! recognised as stale. Every unbind writes the slot's board back into the
//! [`StateCache`] first.

use crate::cache::{CacheError, StateCache};
use crate::viewport::{Tier, VisibleBoard};
use log::{debug, warn};
use shared::{BoardState, Coordinate};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Slots allocated up front
    pub prealloc: usize,
    pub max_active: usize,
    pub max_buffer: usize,
    /// Hard ceiling on allocated slots
    pub max_total: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prealloc: 16,
            max_active: 25,
            max_buffer: 56,
            max_total: 96,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_active == 0 {
            return Err(PoolError::InvalidConfig("max_active must be at least 1".into()));
        }
        if self.max_total < self.max_active + self.max_buffer {
            return Err(PoolError::InvalidConfig(format!(
                "max_total {} is below max_active + max_buffer ({})",
                self.max_total,
                self.max_active + self.max_buffer
            )));
        }
        if self.prealloc > self.max_total {
            return Err(PoolError::InvalidConfig(format!(
                "prealloc {} exceeds max_total {}",
                self.prealloc, self.max_total
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("all {max_total} slots are bound")]
    Exhausted { max_total: usize },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotTier {
    Available,
    Active,
    Buffer,
}

#[derive(Debug, Clone)]
pub struct PoolSlot {
    pub id: SlotId,
    pub coord: Option<Coordinate>,
    pub tier: SlotTier,
    /// Logical time of the last acquire that touched this slot
    pub last_used: u64,
    /// Bumped on every bind and unbind
    pub generation: u64,
    /// `None` until hydrated from the cache or the hub
    pub board: Option<BoardState>,
}

impl PoolSlot {
    fn new(id: SlotId) -> Self {
        Self {
            id,
            coord: None,
            tier: SlotTier::Available,
            last_used: 0,
            generation: 0,
            board: None,
        }
    }
}

/// Identifies the slot a fetch was issued for
///
/// A reply is applied only if the slot still carries the same generation and
/// coordinate when it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket {
    pub slot: SlotId,
    pub generation: u64,
    pub coord: Coordinate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Already bound with content
    Hit(SlotId),
    /// Freshly bound and filled from the state cache
    Hydrated(SlotId),
    /// Bound but empty; the board must be requested from the hub
    Pending(FetchTicket),
}

impl Acquired {
    pub fn slot(&self) -> SlotId {
        match self {
            Acquired::Hit(slot) | Acquired::Hydrated(slot) => *slot,
            Acquired::Pending(ticket) => ticket.slot,
        }
    }

    pub fn ticket(&self) -> Option<FetchTicket> {
        match self {
            Acquired::Pending(ticket) => Some(*ticket),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct BoardPool {
    config: PoolConfig,
    slots: Vec<PoolSlot>,
    active: HashMap<Coordinate, SlotId>,
    buffer: HashMap<Coordinate, SlotId>,
    available: Vec<SlotId>,
    clock: u64,
}

impl BoardPool {
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let slots: Vec<PoolSlot> = (0..config.prealloc).map(PoolSlot::new).collect();
        // Reversed so the lowest ids are handed out first
        let available = (0..config.prealloc).rev().collect();

        Ok(Self {
            config,
            slots,
            active: HashMap::with_capacity(config.max_active),
            buffer: HashMap::with_capacity(config.max_buffer),
            available,
            clock: 0,
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Binds `coord` into the active tier
    pub fn acquire_active(
        &mut self,
        coord: Coordinate,
        cache: &mut StateCache,
    ) -> Result<Acquired, PoolError> {
        let now = self.tick();

        if let Some(&slot) = self.active.get(&coord) {
            self.slots[slot].last_used = now;
            return Ok(self.existing(slot));
        }

        if self.buffer.contains_key(&coord) {
            if self.active.len() >= self.config.max_active {
                self.evict_lru(SlotTier::Active, cache)?;
            }
            if let Some(slot) = self.buffer.remove(&coord) {
                self.active.insert(coord, slot);
                let entry = &mut self.slots[slot];
                entry.tier = SlotTier::Active;
                entry.last_used = now;
                debug!("Promoted {} to active", coord);
                return Ok(self.existing(slot));
            }
        }

        if self.active.len() >= self.config.max_active {
            self.evict_lru(SlotTier::Active, cache)?;
        }
        let slot = self.take_free()?;
        self.active.insert(coord, slot);
        self.bind(slot, coord, SlotTier::Active, now);
        Ok(self.hydrate(slot, cache))
    }

    /// Binds `coord` into the buffer tier, unless it is already active
    pub fn acquire_buffer(
        &mut self,
        coord: Coordinate,
        cache: &mut StateCache,
    ) -> Result<Acquired, PoolError> {
        let now = self.tick();

        if let Some(&slot) = self.active.get(&coord) {
            return Ok(self.existing(slot));
        }
        if let Some(&slot) = self.buffer.get(&coord) {
            self.slots[slot].last_used = now;
            return Ok(self.existing(slot));
        }

        if self.config.max_buffer == 0 {
            return Err(PoolError::Exhausted {
                max_total: self.config.max_total,
            });
        }
        if self.buffer.len() >= self.config.max_buffer {
            self.evict_lru(SlotTier::Buffer, cache)?;
        }
        let slot = self.take_free()?;
        self.buffer.insert(coord, slot);
        self.bind(slot, coord, SlotTier::Buffer, now);
        Ok(self.hydrate(slot, cache))
    }

    /// Moves an active board into the buffer tier without rebuilding it
    pub fn demote(&mut self, coord: Coordinate, cache: &mut StateCache) -> Result<bool, PoolError> {
        if !self.active.contains_key(&coord) {
            return Ok(false);
        }
        if self.config.max_buffer == 0 {
            return self.release(coord, cache);
        }
        if self.buffer.len() >= self.config.max_buffer {
            self.evict_lru(SlotTier::Buffer, cache)?;
        }
        let Some(slot) = self.active.remove(&coord) else {
            return Ok(false);
        };
        self.buffer.insert(coord, slot);
        self.slots[slot].tier = SlotTier::Buffer;
        Ok(true)
    }

    /// Writes the board back to the cache and returns its slot to the free list
    pub fn release(&mut self, coord: Coordinate, cache: &mut StateCache) -> Result<bool, PoolError> {
        let Some(slot) = self.slot_for(coord) else {
            return Ok(false);
        };

        // Persist before anything is unbound so a failed write loses nothing
        if let Some(board) = &self.slots[slot].board {
            cache.store(coord, board)?;
        }

        self.active.remove(&coord);
        self.buffer.remove(&coord);
        let entry = &mut self.slots[slot];
        entry.coord = None;
        entry.tier = SlotTier::Available;
        entry.board = None;
        entry.generation += 1;
        self.available.push(slot);
        Ok(true)
    }

    /// Applies a fetched board if its slot was not rebound in the meantime
    ///
    /// The state is cached either way. Returns whether the slot was updated.
    pub fn apply_remote(
        &mut self,
        ticket: FetchTicket,
        state: BoardState,
        cache: &mut StateCache,
    ) -> Result<bool, PoolError> {
        cache.store(ticket.coord, &state)?;

        let Some(slot) = self.slots.get_mut(ticket.slot) else {
            return Ok(false);
        };
        if slot.generation != ticket.generation || slot.coord != Some(ticket.coord) {
            debug!(
                "Discarding stale reply for {} (slot {} now holds {:?})",
                ticket.coord, ticket.slot, slot.coord
            );
            return Ok(false);
        }
        slot.board = Some(state);
        Ok(true)
    }

    /// Applies a pushed board state to whichever slot currently holds `coord`
    pub fn apply_update(
        &mut self,
        coord: Coordinate,
        state: BoardState,
        cache: &mut StateCache,
    ) -> Result<bool, PoolError> {
        cache.store(coord, &state)?;
        match self.slot_for(coord) {
            Some(slot) => {
                self.slots[slot].board = Some(state);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rebinds the pool to match a prioritized visible list
    ///
    /// Unwanted buffer slots are released, active slots that fell into the
    /// buffer ring swap tiers with buffered boards that moved into the active
    /// window, and the rest of the old active set is released.
    /// Candidates are then acquired in priority order, up to each tier's
    /// capacity. Returns the fetches needed for boards the cache did not have.
    pub fn reconcile(
        &mut self,
        visible: &[VisibleBoard],
        cache: &mut StateCache,
    ) -> Result<Vec<FetchTicket>, PoolError> {
        let mut wanted_active = Vec::with_capacity(self.config.max_active);
        let mut wanted_buffer = Vec::with_capacity(self.config.max_buffer);
        for board in visible {
            match board.tier {
                Tier::Active if wanted_active.len() < self.config.max_active => {
                    wanted_active.push(board.coord)
                }
                Tier::Buffer if wanted_buffer.len() < self.config.max_buffer => {
                    wanted_buffer.push(board.coord)
                }
                _ => {}
            }
        }
        let active_set: HashSet<Coordinate> = wanted_active.iter().copied().collect();
        let buffer_set: HashSet<Coordinate> = wanted_buffer.iter().copied().collect();

        let stale_buffer: Vec<Coordinate> = self
            .buffer
            .keys()
            .filter(|coord| !active_set.contains(coord) && !buffer_set.contains(coord))
            .copied()
            .collect();
        for coord in stale_buffer {
            self.release(coord, cache)?;
        }

        let stale_active: Vec<Coordinate> = self
            .active
            .keys()
            .filter(|coord| !active_set.contains(coord))
            .copied()
            .collect();
        let mut demoted = Vec::new();
        for coord in stale_active {
            if buffer_set.contains(&coord) {
                demoted.push(coord);
            } else {
                self.release(coord, cache)?;
            }
        }

        // Swap tiers in place. Afterwards each tier holds only wanted boards,
        // so neither can overflow and nothing still wanted is evicted.
        let promoted: Vec<Coordinate> = self
            .buffer
            .keys()
            .filter(|coord| active_set.contains(coord))
            .copied()
            .collect();
        for coord in promoted {
            self.retier(coord, SlotTier::Active);
        }
        for coord in demoted {
            self.retier(coord, SlotTier::Buffer);
        }

        let mut tickets = Vec::new();
        for coord in wanted_active {
            if let Some(ticket) = self.acquire_active(coord, cache)?.ticket() {
                tickets.push(ticket);
            }
        }
        for coord in wanted_buffer {
            if let Some(ticket) = self.acquire_buffer(coord, cache)?.ticket() {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }

    fn retier(&mut self, coord: Coordinate, tier: SlotTier) {
        let slot = match tier {
            SlotTier::Active => self.buffer.remove(&coord),
            SlotTier::Buffer => self.active.remove(&coord),
            SlotTier::Available => None,
        };
        let Some(slot) = slot else {
            return;
        };
        match tier {
            SlotTier::Active => self.active.insert(coord, slot),
            _ => self.buffer.insert(coord, slot),
        };
        self.slots[slot].tier = tier;
    }

    fn existing(&self, slot: SlotId) -> Acquired {
        let entry = &self.slots[slot];
        match (entry.board.is_some(), entry.coord) {
            (false, Some(coord)) => Acquired::Pending(FetchTicket {
                slot,
                generation: entry.generation,
                coord,
            }),
            _ => Acquired::Hit(slot),
        }
    }

    fn bind(&mut self, slot: SlotId, coord: Coordinate, tier: SlotTier, now: u64) {
        let entry = &mut self.slots[slot];
        entry.coord = Some(coord);
        entry.tier = tier;
        entry.last_used = now;
        entry.board = None;
        entry.generation += 1;
    }

    fn hydrate(&mut self, slot: SlotId, cache: &mut StateCache) -> Acquired {
        let entry = &mut self.slots[slot];
        let Some(coord) = entry.coord else {
            return Acquired::Hit(slot);
        };

        match cache.load(coord) {
            Ok(Some(state)) => {
                entry.board = Some(state);
                Acquired::Hydrated(slot)
            }
            Ok(None) => Acquired::Pending(FetchTicket {
                slot,
                generation: entry.generation,
                coord,
            }),
            Err(e) => {
                warn!("Refetching {}: {}", coord, e);
                Acquired::Pending(FetchTicket {
                    slot,
                    generation: entry.generation,
                    coord,
                })
            }
        }
    }

    fn take_free(&mut self) -> Result<SlotId, PoolError> {
        if let Some(slot) = self.available.pop() {
            return Ok(slot);
        }
        if self.slots.len() < self.config.max_total {
            let slot = self.slots.len();
            self.slots.push(PoolSlot::new(slot));
            return Ok(slot);
        }
        Err(PoolError::Exhausted {
            max_total: self.config.max_total,
        })
    }

    fn evict_lru(&mut self, tier: SlotTier, cache: &mut StateCache) -> Result<(), PoolError> {
        let map = match tier {
            SlotTier::Active => &self.active,
            SlotTier::Buffer => &self.buffer,
            SlotTier::Available => return Ok(()),
        };
        let oldest = map
            .iter()
            .min_by_key(|(_, slot)| self.slots[**slot].last_used)
            .map(|(coord, _)| *coord);

        if let Some(coord) = oldest {
            debug!("Evicting {:?} board {}", tier, coord);
            self.release(coord, cache)?;
        }
        Ok(())
    }

    fn slot_for(&self, coord: Coordinate) -> Option<SlotId> {
        self.active
            .get(&coord)
            .or_else(|| self.buffer.get(&coord))
            .copied()
    }

    pub fn tier_of(&self, coord: Coordinate) -> Option<SlotTier> {
        if self.active.contains_key(&coord) {
            Some(SlotTier::Active)
        } else if self.buffer.contains_key(&coord) {
            Some(SlotTier::Buffer)
        } else {
            None
        }
    }

    pub fn board(&self, coord: Coordinate) -> Option<&BoardState> {
        self.slot_for(coord)
            .and_then(|slot| self.slots[slot].board.as_ref())
    }

    pub fn slot(&self, id: SlotId) -> Option<&PoolSlot> {
        self.slots.get(id)
    }

    pub fn active_coords(&self) -> impl Iterator<Item = Coordinate> + '_ {
        self.active.keys().copied()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn available_len(&self) -> usize {
        self.available.len()
    }

    pub fn allocated(&self) -> usize {
        self.slots.len()
    }

    /// Checks the tier bounds, disjointness and slot bookkeeping
    pub fn invariants_hold(&self) -> bool {
        let bounded = self.active.len() <= self.config.max_active
            && self.buffer.len() <= self.config.max_buffer
            && self.slots.len() <= self.config.max_total;
        let disjoint = self.active.keys().all(|coord| !self.buffer.contains_key(coord));
        let accounted =
            self.active.len() + self.buffer.len() + self.available.len() == self.slots.len();
        let consistent = self
            .active
            .iter()
            .map(|(coord, slot)| (coord, slot, SlotTier::Active))
            .chain(self.buffer.iter().map(|(c, s)| (c, s, SlotTier::Buffer)))
            .all(|(coord, slot, tier)| {
                let entry = &self.slots[*slot];
                entry.coord == Some(*coord) && entry.tier == tier
            });
        bounded && disjoint && accounted && consistent
    }
}
