//! Per-universe source tracking: one [`SourceTable`] per activated
//! universe, mapping each sender's CID to the state needed to arbitrate
//! priority contention and expire stale senders.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::cid::Cid;
use crate::packet::DataPacket;

/// How long a source may go silent, or stay below the table's current
/// highest priority, before it is demoted or dropped.
pub const SOURCE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Tracked state for a single sender CID on one universe.
#[derive(Debug, Clone)]
struct SourceEntry {
    last_seen: Instant,
    last_time_at_highest_priority: Instant,
    highest_priority: u8,
}

/// The set of sources currently sending on one universe, and the
/// arbitration logic E1.31 requires among them.
#[derive(Debug, Default)]
pub struct SourceTable {
    sources: HashMap<Cid, SourceEntry>,
}

impl SourceTable {
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Update the table for an arriving `packet`, observed at `now`.
    pub fn update(&mut self, packet: &DataPacket, now: Instant) {
        let cid = packet.cid();
        let priority = packet.priority();

        if let Some(entry) = self.sources.get_mut(&cid) {
            entry.last_seen = now;
            if priority >= entry.highest_priority {
                entry.highest_priority = priority;
                entry.last_time_at_highest_priority = now;
            } else if now.duration_since(entry.last_time_at_highest_priority) > SOURCE_TIMEOUT {
                entry.highest_priority = priority;
                entry.last_time_at_highest_priority = now;
            }
        } else {
            self.sources.insert(
                cid,
                SourceEntry {
                    last_seen: now,
                    last_time_at_highest_priority: now,
                    highest_priority: priority,
                },
            );
        }

        self.sources
            .retain(|_, entry| now.duration_since(entry.last_seen) <= SOURCE_TIMEOUT);
    }

    /// The CIDs currently tied at the table's highest tracked priority.
    /// More than one entry here is the E1.31 multi-source contention
    /// case the pipeline must surface as an error.
    pub fn allowed_sources(&self) -> HashSet<Cid> {
        let Some(highest) = self.sources.values().map(|e| e.highest_priority).max() else {
            return HashSet::new();
        };
        self.sources
            .iter()
            .filter(|(_, entry)| entry.highest_priority == highest)
            .map(|(cid, _)| *cid)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn packet_from(cid: [u8; 16], priority: u8) -> DataPacket {
        let mut p = DataPacket::empty();
        p.set_cid(Cid::new(cid));
        p.set_priority(priority).unwrap();
        p
    }

    #[test]
    fn allowed_sources_picks_every_tie_at_the_max() {
        let mut table = SourceTable::new();
        let now = Instant::now();
        table.update(&packet_from([1; 16], 100), now);
        table.update(&packet_from([2; 16], 100), now);
        table.update(&packet_from([3; 16], 70), now);
        table.update(&packet_from([4; 16], 50), now);

        let allowed = table.allowed_sources();
        assert_eq!(allowed.len(), 2);
        assert!(allowed.contains(&Cid::new([1; 16])));
        assert!(allowed.contains(&Cid::new([2; 16])));
    }

    #[test]
    fn stale_entries_are_removed() {
        let mut table = SourceTable::new();
        let t0 = Instant::now();
        table.update(&packet_from([1; 16], 100), t0);
        let t1 = t0 + Duration::from_millis(3000);
        table.update(&packet_from([2; 16], 100), t1);

        // updating with [2] at t1 should expire the stale [1] entry
        let allowed = table.allowed_sources();
        assert_eq!(allowed.len(), 1);
        assert!(allowed.contains(&Cid::new([2; 16])));
    }

    #[test]
    fn lower_priority_source_is_not_promoted_until_highest_expires() {
        let mut table = SourceTable::new();
        let t0 = Instant::now();
        table.update(&packet_from([1; 16], 150), t0);

        // same source drops its own priority before the timeout: no demotion yet
        let t1 = t0 + Duration::from_millis(1000);
        table.update(&packet_from([1; 16], 100), t1);
        assert_eq!(table.allowed_sources().len(), 1);
        assert!(table
            .sources
            .get(&Cid::new([1; 16]))
            .map(|e| e.highest_priority)
            .unwrap()
            >= 150);

        // after the timeout with no packet at 150, the priority decays
        let t2 = t0 + Duration::from_millis(3600);
        table.update(&packet_from([1; 16], 100), t2);
        assert_eq!(
            table.sources.get(&Cid::new([1; 16])).unwrap().highest_priority,
            100
        );
    }
}
