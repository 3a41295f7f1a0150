//! Reverse index from zone to subscribed connections
//!
//! Each connection also remembers its own zone set, so a disconnect can
//! drop exactly the entries it owns without scanning all 400 zones.

use crate::client_manager::ConnectionId;
use shared::ZoneId;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub struct ZoneIndex {
    zones: HashMap<ZoneId, HashSet<ConnectionId>>,
    subscriptions: usize,
}

impl ZoneIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the subscription is new
    pub fn subscribe(&mut self, zone: ZoneId, conn: ConnectionId) -> bool {
        let added = self.zones.entry(zone).or_default().insert(conn);
        if added {
            self.subscriptions += 1;
        }
        added
    }

    /// Returns true if the connection was subscribed
    pub fn unsubscribe(&mut self, zone: ZoneId, conn: ConnectionId) -> bool {
        let Some(members) = self.zones.get_mut(&zone) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            self.zones.remove(&zone);
        }
        if removed {
            self.subscriptions -= 1;
        }
        removed
    }

    /// Drops every subscription `conn` holds in `zones`
    pub fn remove_connection<'a>(
        &mut self,
        conn: ConnectionId,
        zones: impl IntoIterator<Item = &'a ZoneId>,
    ) {
        for zone in zones {
            self.unsubscribe(*zone, conn);
        }
    }

    /// Subscribers of `zone`, sorted for stable fan-out order
    pub fn subscribers(&self, zone: ZoneId) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .zones
            .get(&zone)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
    }

    /// Number of zones with at least one subscriber
    pub fn occupied_zones(&self) -> usize {
        self.zones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_and_lookup() {
        let mut index = ZoneIndex::new();
        assert!(index.subscribe(ZoneId(3), ConnectionId(2)));
        assert!(index.subscribe(ZoneId(3), ConnectionId(1)));
        assert!(!index.subscribe(ZoneId(3), ConnectionId(1)));

        assert_eq!(
            index.subscribers(ZoneId(3)),
            vec![ConnectionId(1), ConnectionId(2)]
        );
        assert_eq!(index.subscription_count(), 2);
        assert!(index.subscribers(ZoneId(4)).is_empty());
    }

    #[test]
    fn test_unsubscribe_prunes_empty_zones() {
        let mut index = ZoneIndex::new();
        index.subscribe(ZoneId(0), ConnectionId(1));

        assert!(index.unsubscribe(ZoneId(0), ConnectionId(1)));
        assert!(!index.unsubscribe(ZoneId(0), ConnectionId(1)));
        assert_eq!(index.occupied_zones(), 0);
        assert_eq!(index.subscription_count(), 0);
    }

    #[test]
    fn test_remove_connection_leaves_others() {
        let mut index = ZoneIndex::new();
        let mine: HashSet<ZoneId> = [ZoneId(1), ZoneId(2)].into_iter().collect();
        for zone in &mine {
            index.subscribe(*zone, ConnectionId(1));
        }
        index.subscribe(ZoneId(2), ConnectionId(2));

        index.remove_connection(ConnectionId(1), &mine);

        assert!(index.subscribers(ZoneId(1)).is_empty());
        assert_eq!(index.subscribers(ZoneId(2)), vec![ConnectionId(2)]);
        assert_eq!(index.subscription_count(), 1);
    }
}
