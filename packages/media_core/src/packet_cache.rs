//! Ring of recently forwarded packet metadata, one per client track.
//!
//! Entries are keyed by the upstream sequence number and remember the drop
//! counter in force when the packet was emitted, so a late retransmission can
//! be renumbered with the same shift its neighbours got instead of the drops
//! that happened since.

use std::collections::VecDeque;

use parking_lot::RwLock;

pub const DEFAULT_CACHE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedPacket {
    pub sequence: u16,
    pub timestamp: u32,
    pub drop_counter: u16,
}

/// Single writer (the track's packet loop), many readers.
pub struct PacketCache {
    size: usize,
    packets: RwLock<VecDeque<CachedPacket>>,
}

impl PacketCache {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            packets: RwLock::new(VecDeque::with_capacity(size)),
        }
    }

    pub fn push(&self, sequence: u16, timestamp: u32, drop_counter: u16) {
        let mut packets = self.packets.write();
        packets.push_back(CachedPacket {
            sequence,
            timestamp,
            drop_counter,
        });
        if packets.len() > self.size {
            packets.pop_front();
        }
    }

    /// Exact-match lookup, newest first. Insertion order is ascending, so the
    /// scan stops as soon as it walks past an older, smaller sequence.
    pub fn lookup(&self, sequence: u16) -> Option<CachedPacket> {
        let packets = self.packets.read();
        for packet in packets.iter().rev() {
            if packet.sequence == sequence {
                return Some(*packet);
            } else if packet.sequence < sequence {
                break;
            }
        }
        None
    }

    /// Newest entry at or before the given sequence. Used to recover the drop
    /// counter that applied around a late packet's original position.
    pub fn lookup_at_or_before(&self, sequence: u16) -> Option<CachedPacket> {
        let packets = self.packets.read();
        packets.iter().rev().find(|packet| packet.sequence <= sequence).copied()
    }

    pub fn len(&self) -> usize {
        self.packets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_bounded() {
        let cache = PacketCache::new(4);
        for seq in 0..10u16 {
            cache.push(seq, seq as u32 * 90, 0);
        }
        assert_eq!(cache.len(), 4);
        // oldest entries were evicted
        assert_eq!(cache.lookup(5), None);
        assert!(cache.lookup(6).is_some());
        assert!(cache.lookup(9).is_some());
    }

    #[test]
    fn lookup_finds_exact_entry() {
        let cache = PacketCache::new(16);
        cache.push(100, 1000, 0);
        cache.push(101, 1000, 0);
        cache.push(102, 2000, 1);

        assert_eq!(
            cache.lookup(101),
            Some(CachedPacket {
                sequence: 101,
                timestamp: 1000,
                drop_counter: 0
            })
        );
        assert_eq!(cache.lookup(99), None);
        assert_eq!(cache.lookup(103), None);
    }

    #[test]
    fn lookup_skips_gaps() {
        let cache = PacketCache::new(16);
        cache.push(100, 1000, 0);
        // 101 was dropped, never cached
        cache.push(102, 2000, 1);

        assert_eq!(cache.lookup(101), None);
    }

    #[test]
    fn at_or_before_returns_the_nearest_older_entry() {
        let cache = PacketCache::new(16);
        cache.push(100, 1000, 0);
        cache.push(102, 2000, 0);
        cache.push(104, 3000, 1);
        cache.push(106, 4000, 2);

        // exact hit
        assert_eq!(cache.lookup_at_or_before(104).map(|p| p.drop_counter), Some(1));
        // 103 is absent, nearest older entry is 102
        assert_eq!(cache.lookup_at_or_before(103).map(|p| p.sequence), Some(102));
        assert_eq!(cache.lookup_at_or_before(103).map(|p| p.drop_counter), Some(0));
        // older than everything cached
        assert_eq!(cache.lookup_at_or_before(99), None);
        // newer than everything returns the newest
        assert_eq!(cache.lookup_at_or_before(200).map(|p| p.sequence), Some(106));
    }

    #[test]
    fn recent_lookups_survive_a_rollover() {
        let cache = PacketCache::new(16);
        for seq in [65533u16, 65534, 65535, 0, 1, 2] {
            cache.push(seq, 0, 0);
        }
        // entries on the new side of the wrap stay reachable
        assert!(cache.lookup(1).is_some());
        assert_eq!(cache.lookup_at_or_before(1).map(|p| p.sequence), Some(1));
        assert_eq!(cache.lookup(3), None);
    }

    #[test]
    fn empty_cache_misses() {
        let cache = PacketCache::new(8);
        assert!(cache.is_empty());
        assert_eq!(cache.lookup(0), None);
        assert_eq!(cache.lookup_at_or_before(0), None);
    }
}
