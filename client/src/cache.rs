//! Viewer-side state cache
//!
//! Two ledgers with separate capacities:
//! - serialized board snapshots, evicted least-recently-accessed first
//! - activity levels, evicted oldest-updated first and also expired after an
//!   idle window regardless of capacity
//!
//! Eviction from one ledger never touches the other. Lookups and inserts are
//! hash-map operations; eviction scans the ledger, which is linear in its
//! current size and fine at a few thousand entries.

use log::{debug, warn};
use shared::{BoardState, Coordinate};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub state_capacity: usize,
    pub activity_capacity: usize,
    /// Activity entries idle this long are dropped
    pub activity_decay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            state_capacity: 2000,
            activity_capacity: 2000,
            activity_decay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to encode board {coord}: {source}")]
    Encode {
        coord: Coordinate,
        source: bincode::Error,
    },
    #[error("failed to decode cached board {coord}: {source}")]
    Decode {
        coord: Coordinate,
        source: bincode::Error,
    },
}

#[derive(Debug)]
struct CachedState {
    bytes: Vec<u8>,
    /// Logical access time
    last_access: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActivityEntry {
    level: u8,
    updated: Instant,
}

#[derive(Debug)]
pub struct StateCache {
    config: CacheConfig,
    states: HashMap<Coordinate, CachedState>,
    activity: HashMap<Coordinate, ActivityEntry>,
    clock: u64,
    evictions: u64,
}

impl StateCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
            activity: HashMap::new(),
            clock: 0,
            evictions: 0,
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Serializes and stores a snapshot, evicting the stalest entry if full
    pub fn store(&mut self, coord: Coordinate, state: &BoardState) -> Result<(), CacheError> {
        let bytes = bincode::serialize(state).map_err(|source| CacheError::Encode { coord, source })?;
        let last_access = self.tick();

        if !self.states.contains_key(&coord) {
            while self.states.len() >= self.config.state_capacity.max(1) {
                self.evict_state();
            }
        }
        self.states.insert(coord, CachedState { bytes, last_access });
        Ok(())
    }

    /// Decodes a cached snapshot and marks it recently used
    ///
    /// An entry that fails to decode is dropped before the error is returned.
    pub fn load(&mut self, coord: Coordinate) -> Result<Option<BoardState>, CacheError> {
        let now = self.tick();
        let Some(entry) = self.states.get_mut(&coord) else {
            return Ok(None);
        };
        entry.last_access = now;

        match bincode::deserialize(&entry.bytes) {
            Ok(state) => Ok(Some(state)),
            Err(source) => {
                warn!("Dropping unreadable snapshot for {}", coord);
                self.states.remove(&coord);
                Err(CacheError::Decode { coord, source })
            }
        }
    }

    pub fn contains(&self, coord: Coordinate) -> bool {
        self.states.contains_key(&coord)
    }

    pub fn remove(&mut self, coord: Coordinate) -> bool {
        self.states.remove(&coord).is_some()
    }

    fn evict_state(&mut self) {
        let oldest = self
            .states
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(coord, _)| *coord);
        if let Some(coord) = oldest {
            self.states.remove(&coord);
            self.evictions += 1;
            debug!("Evicted cached board {}", coord);
        }
    }

    /// Records the latest activity level for a board
    pub fn record_activity(&mut self, coord: Coordinate, level: u8, now: Instant) {
        if !self.activity.contains_key(&coord) {
            while self.activity.len() >= self.config.activity_capacity.max(1) {
                let oldest = self
                    .activity
                    .iter()
                    .min_by_key(|(_, entry)| entry.updated)
                    .map(|(coord, _)| *coord);
                match oldest {
                    Some(coord) => {
                        self.activity.remove(&coord);
                    }
                    None => break,
                }
            }
        }
        self.activity.insert(coord, ActivityEntry { level, updated: now });
    }

    /// Activity level, or `None` when unknown or decayed
    pub fn activity(&self, coord: Coordinate, now: Instant) -> Option<u8> {
        let entry = self.activity.get(&coord)?;
        if now.saturating_duration_since(entry.updated) > self.config.activity_decay {
            return None;
        }
        Some(entry.level)
    }

    /// Drops decayed activity entries; returns how many were removed
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let decay = self.config.activity_decay;
        let before = self.activity.len();
        self.activity
            .retain(|_, entry| now.saturating_duration_since(entry.updated) <= decay);
        before - self.activity.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn activity_len(&self) -> usize {
        self.activity.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.states.values().map(|entry| entry.bytes.len()).sum()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Player, Point};

    fn coord(x: u16, y: u16) -> Coordinate {
        Coordinate::new(x, y).unwrap()
    }

    fn played(moves: u16) -> BoardState {
        let mut state = BoardState::new(19, 0);
        for n in 0..moves {
            let player = state.current_player;
            state.place(n, Point { x: n as u8, y: 0 }, player, &[], u64::from(n));
        }
        state
    }

    fn small(states: usize, activity: usize) -> StateCache {
        StateCache::new(CacheConfig {
            state_capacity: states,
            activity_capacity: activity,
            activity_decay: Duration::from_secs(30),
        })
    }

    #[test]
    fn test_store_and_load() {
        let mut cache = small(4, 4);
        let state = played(3);
        cache.store(coord(1, 1), &state).unwrap();

        assert_eq!(cache.load(coord(1, 1)).unwrap(), Some(state));
        assert_eq!(cache.load(coord(2, 2)).unwrap(), None);
        assert!(cache.bytes_used() > 0);
    }

    #[test]
    fn test_least_recently_accessed_is_evicted() {
        let mut cache = small(2, 4);
        cache.store(coord(0, 0), &played(1)).unwrap();
        cache.store(coord(1, 0), &played(2)).unwrap();

        // Touch (0,0) so (1,0) becomes the stalest
        cache.load(coord(0, 0)).unwrap();
        cache.store(coord(2, 0), &played(3)).unwrap();

        assert!(cache.contains(coord(0, 0)));
        assert!(!cache.contains(coord(1, 0)));
        assert!(cache.contains(coord(2, 0)));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut cache = small(2, 4);
        cache.store(coord(0, 0), &played(1)).unwrap();
        cache.store(coord(1, 0), &played(1)).unwrap();
        cache.store(coord(1, 0), &played(4)).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.load(coord(1, 0)).unwrap().unwrap().move_count, 4);
    }

    #[test]
    fn test_ledgers_are_independent() {
        let mut cache = small(1, 3);
        let now = Instant::now();

        cache.record_activity(coord(0, 0), 5, now);
        cache.store(coord(0, 0), &played(1)).unwrap();
        cache.store(coord(9, 9), &played(1)).unwrap();

        // State ledger evicted (0,0); its activity survives
        assert!(!cache.contains(coord(0, 0)));
        assert_eq!(cache.activity(coord(0, 0), now), Some(5));

        for x in 1..4 {
            cache.record_activity(coord(x, 0), 1, now + Duration::from_millis(u64::from(x)));
        }
        // Activity ledger evicted (0,0); the state ledger is untouched
        assert_eq!(cache.activity(coord(0, 0), now), None);
        assert_eq!(cache.activity_len(), 3);
        assert!(cache.contains(coord(9, 9)));
    }

    #[test]
    fn test_activity_decays() {
        let mut cache = small(4, 4);
        let start = Instant::now();
        cache.record_activity(coord(1, 1), 9, start);
        cache.record_activity(coord(2, 2), 3, start + Duration::from_secs(20));

        let later = start + Duration::from_secs(31);
        assert_eq!(cache.activity(coord(1, 1), later), None);
        assert_eq!(cache.activity(coord(2, 2), later), Some(3));

        assert_eq!(cache.sweep_expired(later), 1);
        assert_eq!(cache.activity_len(), 1);
    }

    #[test]
    fn test_corrupt_entry_is_dropped() {
        let mut cache = small(4, 4);
        cache.states.insert(
            coord(3, 3),
            CachedState {
                bytes: vec![0xFF],
                last_access: 0,
            },
        );

        assert!(matches!(cache.load(coord(3, 3)), Err(CacheError::Decode { .. })));
        assert!(!cache.contains(coord(3, 3)));
    }

    #[test]
    fn test_snapshot_keeps_stone_colours() {
        // Enum fields survive the binary encoding
        let mut cache = small(2, 2);
        let state = played(2);
        cache.store(coord(4, 4), &state).unwrap();
        let restored = cache.load(coord(4, 4)).unwrap().unwrap();
        assert_eq!(restored.stones[1].color, Player::White);
    }
}
