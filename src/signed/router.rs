//! XOR-distance routing table.
//!
//! One bucket per bit of the id width, indexed by the prefix length of
//! (id XOR self). Buckets are bounded at [`BUCKET_SIZE`] entries and keep
//! most-recently-touched ids at the front. Each bucket sits behind its own
//! read/write lock, so updates to different buckets proceed in parallel;
//! `find_closest` takes one bucket lock at a time, never nesting them.

use std::collections::VecDeque;
use std::sync::RwLock;

use super::id::NodeId;

/// Bucket capacity. When a bucket is full new ids are dropped; existing
/// entries are never evicted.
pub const BUCKET_SIZE: usize = 64;

pub struct RoutingTable {
    self_id: NodeId,
    buckets: Vec<RwLock<VecDeque<NodeId>>>,
}

impl RoutingTable {
    /// Build an empty table around the local id.
    pub fn new(self_id: NodeId) -> Self {
        let bits = self_id.address.len() * 8;
        Self {
            self_id,
            buckets: (0..bits).map(|_| RwLock::new(VecDeque::new())).collect(),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Touch an id: move it to the front of its bucket, inserting it if the
    /// bucket has room. Self is never stored.
    pub fn update(&self, id: NodeId) {
        if id.address.len() != self.self_id.address.len() {
            return;
        }
        if id.address == self.self_id.address {
            return;
        }

        let index = self.self_id.bucket_index(&id);
        let mut bucket = self.buckets[index].write().expect("bucket lock");

        if let Some(position) = bucket.iter().position(|entry| *entry == id) {
            let entry = bucket.remove(position).expect("position just found");
            bucket.push_front(entry);
        } else if bucket.len() < BUCKET_SIZE {
            bucket.push_front(id);
        }
    }

    /// Delete an id. Returns whether it was present.
    pub fn remove(&self, id: &NodeId) -> bool {
        let index = self.self_id.bucket_index(id);
        let mut bucket = self.buckets[index].write().expect("bucket lock");
        match bucket.iter().position(|entry| entry == id) {
            Some(position) => {
                bucket.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let index = self.self_id.bucket_index(id);
        let bucket = self.buckets[index].read().expect("bucket lock");
        bucket.iter().any(|entry| entry == id)
    }

    /// The `count` ids closest to `target` by XOR distance, ascending.
    ///
    /// Collects the target's bucket, then expands outward to adjacent
    /// buckets until enough entries are gathered or the table is exhausted.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<NodeId> {
        if target.address.len() != self.self_id.address.len() {
            return Vec::new();
        }

        let center = self.self_id.bucket_index(target);
        let bits = self.buckets.len();

        let mut found: Vec<NodeId> = self.buckets[center]
            .read()
            .expect("bucket lock")
            .iter()
            .cloned()
            .collect();

        let mut radius = 1;
        while found.len() < count && (center >= radius || center + radius < bits) {
            if center >= radius {
                let bucket = self.buckets[center - radius].read().expect("bucket lock");
                found.extend(bucket.iter().cloned());
            }
            if center + radius < bits {
                let bucket = self.buckets[center + radius].read().expect("bucket lock");
                found.extend(bucket.iter().cloned());
            }
            radius += 1;
        }

        found.sort_by(|a, b| a.distance(target).cmp(&b.distance(target)));
        found.truncate(count);
        found
    }

    /// Snapshot of every stored id, deduplicated by address, excluding self.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut seen = std::collections::HashSet::new();
        seen.insert(self.self_id.address_hex());

        let mut peers = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read().expect("bucket lock");
            for entry in bucket.iter() {
                if seen.insert(entry.address_hex()) {
                    peers.push(entry.clone());
                }
            }
        }
        peers
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const ID_LEN: usize = 20;

    fn origin() -> NodeId {
        NodeId::new(vec![0u8; ID_LEN], "127.0.0.1:6000")
    }

    /// An id whose address is zero except for the given last byte.
    fn low_id(last: u8) -> NodeId {
        let mut address = vec![0u8; ID_LEN];
        address[ID_LEN - 1] = last;
        NodeId::new(address, format!("127.0.0.1:{}", 7000 + last as u16))
    }

    /// An id landing in bucket 0 of the origin (high bit set).
    fn high_id(tag: u8) -> NodeId {
        let mut address = vec![0u8; ID_LEN];
        address[0] = 0x80;
        address[1] = tag;
        NodeId::new(address, format!("127.0.0.1:{}", 8000 + tag as u16))
    }

    #[test]
    fn self_is_never_stored() {
        let table = RoutingTable::new(origin());
        table.update(origin());
        assert!(table.peers().is_empty());
        assert!(!table.contains(&origin()));
    }

    #[test]
    fn length_mismatch_ignored() {
        let table = RoutingTable::new(origin());
        table.update(NodeId::new(vec![1u8; 4], "127.0.0.1:1"));
        assert!(table.peers().is_empty());
    }

    #[test]
    fn each_id_lands_in_its_prefix_bucket() {
        let table = RoutingTable::new(origin());
        let id = low_id(0x01);
        table.update(id.clone());

        let index = origin().bucket_index(&id);
        assert_eq!(index, ID_LEN * 8 - 1);
        assert_eq!(table.buckets[index].read().unwrap().len(), 1);
        assert!(table.contains(&id));
    }

    #[test]
    fn update_moves_existing_to_front() {
        let table = RoutingTable::new(origin());
        let first = high_id(1);
        let second = high_id(2);
        table.update(first.clone());
        table.update(second.clone());
        // second is now at the front; touching first moves it back up.
        table.update(first.clone());

        let bucket = table.buckets[0].read().unwrap();
        assert_eq!(bucket.front(), Some(&first));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn full_bucket_keeps_the_old() {
        let table = RoutingTable::new(origin());
        for tag in 0..BUCKET_SIZE as u8 {
            table.update(high_id(tag));
        }
        assert_eq!(table.buckets[0].read().unwrap().len(), BUCKET_SIZE);

        // The newcomer is dropped, nothing is evicted.
        table.update(high_id(200));
        assert_eq!(table.buckets[0].read().unwrap().len(), BUCKET_SIZE);
        assert!(!table.contains(&high_id(200)));
        assert!(table.contains(&high_id(0)));

        // Touching an existing entry still works when full.
        table.update(high_id(0));
        assert_eq!(table.buckets[0].read().unwrap().front(), Some(&high_id(0)));
    }

    #[test]
    fn remove_reports_presence() {
        let table = RoutingTable::new(origin());
        let id = low_id(5);
        table.update(id.clone());
        assert!(table.remove(&id));
        assert!(!table.remove(&id));
        assert!(!table.contains(&id));
    }

    #[test]
    fn closest_are_sorted_by_distance() {
        // With self at zero, distance to a zero target is the address value
        // itself: 0x01 is closer than 0x02.
        let table = RoutingTable::new(origin());
        table.update(low_id(0x01));
        table.update(low_id(0x02));
        table.update(low_id(0x03));

        let closest = table.find_closest(&origin(), 2);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0], low_id(0x01));
        assert_eq!(closest[1], low_id(0x02));
    }

    #[test]
    fn closest_expands_beyond_the_target_bucket() {
        let table = RoutingTable::new(origin());
        table.update(low_id(0x01)); // bucket 159
        table.update(high_id(1)); // bucket 0

        let closest = table.find_closest(&origin(), 10);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0], low_id(0x01));
    }

    #[test]
    fn closest_is_capped_at_known_ids() {
        let table = RoutingTable::new(origin());
        table.update(low_id(1));
        assert_eq!(table.find_closest(&origin(), 64).len(), 1);
        assert!(table.find_closest(&low_id(9), 0).is_empty());
    }

    #[test]
    fn peers_deduplicates_by_address() {
        let table = RoutingTable::new(origin());
        table.update(low_id(1));
        table.update(low_id(2));
        table.update(low_id(1));
        assert_eq!(table.peers().len(), 2);
    }

    #[test]
    fn concurrent_updates_are_safe() {
        let table = Arc::new(RoutingTable::new(origin()));
        let mut handles = Vec::new();
        for worker in 0u8..4 {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                for tag in 0..32u8 {
                    table.update(high_id(tag));
                    table.update(low_id(worker * 32 + tag));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.buckets[0].read().unwrap().len(), 32);
        for bucket in &table.buckets {
            assert!(bucket.read().unwrap().len() <= BUCKET_SIZE);
        }
    }
}
