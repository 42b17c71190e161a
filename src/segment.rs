use std::collections::HashMap;

/// One collective allocation within a team's window.
pub(crate) struct SegmentEntry {
    /// Per-member displacement into that member's window, in bytes.
    pub(crate) disps: Vec<u64>,
    /// Per-member base address in the calling unit's own address
    /// space, present for members that share memory with the caller.
    pub(crate) shmem_bases: Vec<Option<usize>>,
    pub(crate) nelem: usize,
    pub(crate) elem_size: usize,
}

/// Registry of the live segments of one team, keyed by segment id.
///
/// Replicated with identical contents on every member; mutated only
/// inside the allocation collectives.
pub(crate) struct SegmentTable {
    entries: HashMap<i16, SegmentEntry>,
}

impl SegmentTable {
    pub(crate) fn new() -> SegmentTable {
        SegmentTable {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, segid: i16, entry: SegmentEntry) -> bool {
        if self.entries.contains_key(&segid) {
            return false;
        }
        self.entries.insert(segid, entry);
        true
    }

    pub(crate) fn remove(&mut self, segid: i16) -> Option<SegmentEntry> {
        self.entries.remove(&segid)
    }

    pub(crate) fn disp(&self, segid: i16, rank: u16) -> Option<u64> {
        self.entries
            .get(&segid)
            .and_then(|e| e.disps.get(rank as usize).copied())
    }

    pub(crate) fn shmem_base(&self, segid: i16, rank: u16) -> Option<usize> {
        self.entries
            .get(&segid)
            .and_then(|e| e.shmem_bases.get(rank as usize).copied())
            .flatten()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(disps: Vec<u64>) -> SegmentEntry {
        let n = disps.len();
        SegmentEntry {
            disps,
            shmem_bases: vec![None; n],
            nelem: 10,
            elem_size: 4,
        }
    }

    #[test]
    fn insert_lookup_remove() {
        let mut table = SegmentTable::new();
        assert!(table.insert(1, entry(vec![0, 64, 128])));
        assert!(!table.insert(1, entry(vec![0])));
        assert_eq!(Some(64), table.disp(1, 1));
        assert_eq!(None, table.disp(1, 3));
        assert_eq!(None, table.disp(2, 0));
        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn shmem_base_only_for_colocated() {
        let mut table = SegmentTable::new();
        let mut e = entry(vec![0, 0]);
        e.shmem_bases = vec![Some(0xdead0), None];
        table.insert(3, e);
        assert_eq!(Some(0xdead0), table.shmem_base(3, 0));
        assert_eq!(None, table.shmem_base(3, 1));
    }
}
