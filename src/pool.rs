use indexmap::IndexSet;
use std::collections::BTreeMap;

/// Best-fit allocator over one window's byte range.
///
/// Free space is tracked twice: by size (smallest block that fits is
/// taken first) and by address (so freed neighbors coalesce). The
/// runtime is single-threaded per unit, so exhaustion is reported to
/// the caller instead of blocking for space.
pub(crate) struct PoolAlloc {
    free_sizes: BTreeMap<usize, IndexSet<usize>>,
    free_addrs: BTreeMap<usize, usize>,
    allocated: BTreeMap<usize, usize>,
}

impl PoolAlloc {
    pub(crate) fn new(start: usize, size: usize) -> PoolAlloc {
        let mut free_sizes = BTreeMap::new();
        let mut addrs = IndexSet::new();
        addrs.insert(start);
        free_sizes.insert(size, addrs);
        let mut free_addrs = BTreeMap::new();
        free_addrs.insert(start, size);
        PoolAlloc {
            free_sizes,
            free_addrs,
            allocated: BTreeMap::new(),
        }
    }

    pub(crate) fn try_malloc(&mut self, size: usize) -> Option<usize> {
        let size = size.max(1);
        // smallest free block greater than or equal to size
        let (&block_size, addrs) = self.free_sizes.range_mut(size..).next()?;
        let addr = addrs.pop()?;
        if addrs.is_empty() {
            self.free_sizes.remove(&block_size);
        }
        self.free_addrs.remove(&addr);
        if block_size != size {
            let remaining = block_size - size;
            let new_addr = addr + size;
            self.free_sizes
                .entry(remaining)
                .or_insert_with(IndexSet::new)
                .insert(new_addr);
            self.free_addrs.insert(new_addr, remaining);
        }
        self.allocated.insert(addr, size);
        Some(addr)
    }

    pub(crate) fn free(&mut self, addr: usize) -> bool {
        let Some(size) = self.allocated.remove(&addr) else {
            return false;
        };
        let mut merged_addr = addr;
        let mut merged_size = size;
        let mut absorb: Vec<(usize, usize)> = Vec::new();
        if let Some((&faddr, &fsize)) = self.free_addrs.range(..addr).next_back() {
            if faddr + fsize == addr {
                merged_addr = faddr;
                merged_size += fsize;
                absorb.push((faddr, fsize));
            }
        }
        if let Some((&faddr, &fsize)) = self.free_addrs.range(addr..).next() {
            if merged_addr + merged_size == faddr {
                merged_size += fsize;
                absorb.push((faddr, fsize));
            }
        }
        for (faddr, fsize) in absorb {
            self.free_addrs.remove(&faddr);
            if let Some(addrs) = self.free_sizes.get_mut(&fsize) {
                addrs.shift_remove(&faddr);
                if addrs.is_empty() {
                    self.free_sizes.remove(&fsize);
                }
            }
        }
        self.free_addrs.insert(merged_addr, merged_size);
        self.free_sizes
            .entry(merged_size)
            .or_insert_with(IndexSet::new)
            .insert(merged_addr);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_free_reuse() {
        let mut alloc = PoolAlloc::new(0, 1000);
        assert_eq!(Some(0), alloc.try_malloc(50));
        assert_eq!(Some(50), alloc.try_malloc(10));
        assert_eq!(Some(60), alloc.try_malloc(600));
        assert_eq!(Some(660), alloc.try_malloc(10));
        assert!(alloc.free(0));
        assert_eq!(Some(0), alloc.try_malloc(30));
        assert!(alloc.free(50));
        assert_eq!(Some(30), alloc.try_malloc(10));
        assert_eq!(Some(40), alloc.try_malloc(10));
    }

    #[test]
    fn coalesces_neighbors() {
        let mut alloc = PoolAlloc::new(0, 100);
        let a = alloc.try_malloc(40).unwrap();
        let b = alloc.try_malloc(40).unwrap();
        assert_eq!(None, alloc.try_malloc(40));
        assert!(alloc.free(a));
        assert!(alloc.free(b));
        // both blocks merged back with the tail
        assert_eq!(Some(0), alloc.try_malloc(100));
    }

    #[test]
    fn exhaustion_reports_none() {
        let mut alloc = PoolAlloc::new(0, 10);
        assert_eq!(Some(0), alloc.try_malloc(10));
        assert_eq!(None, alloc.try_malloc(1));
    }

    #[test]
    fn double_free_rejected() {
        let mut alloc = PoolAlloc::new(0, 10);
        let a = alloc.try_malloc(4).unwrap();
        assert!(alloc.free(a));
        assert!(!alloc.free(a));
        assert!(!alloc.free(999));
    }
}
