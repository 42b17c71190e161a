use crate::pool::PoolAlloc;
use crate::segment::SegmentTable;
use crate::transport::{CommId, SharedRank, WindowId};

/// The team spanning every unit of the job.
pub const TEAM_ALL: u16 = 0;

/// Marks the absence of a team; no operation accepts it.
pub const TEAM_UNDEFINED: u16 = u16::MAX;

/// Per-team bookkeeping: the ordered member list, this unit's rank,
/// the team's window and process group, the segment table, and the
/// co-location map filled in at creation. Teams form a forest rooted
/// at the all-units team.
pub(crate) struct TeamData {
    pub(crate) team_id: u16,
    /// Global unit ids constituting the team, in team-rank order.
    pub(crate) members: Vec<u16>,
    pub(crate) my_rank: u16,
    pub(crate) comm: CommId,
    pub(crate) window: WindowId,
    pub(crate) segments: SegmentTable,
    /// Per team rank: co-located local rank, or remote.
    pub(crate) sharedmem_tab: Vec<SharedRank>,
    pub(crate) pool: PoolAlloc,
    pub(crate) parent: Option<u16>,
    next_seg: i16,
    free_segs: Vec<i16>,
}

impl TeamData {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        team_id: u16,
        members: Vec<u16>,
        my_rank: u16,
        comm: CommId,
        window: WindowId,
        sharedmem_tab: Vec<SharedRank>,
        pool: PoolAlloc,
        parent: Option<u16>,
    ) -> TeamData {
        TeamData {
            team_id,
            members,
            my_rank,
            comm,
            window,
            segments: SegmentTable::new(),
            sharedmem_tab,
            pool,
            parent,
            next_seg: 1,
            free_segs: Vec::new(),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.members.len()
    }

    pub(crate) fn global_unit(&self, rank: u16) -> Option<u16> {
        self.members.get(rank as usize).copied()
    }

    /// Next free segment id; ids of destroyed segments are reused.
    pub(crate) fn alloc_segment_id(&mut self) -> Option<i16> {
        if let Some(id) = self.free_segs.pop() {
            return Some(id);
        }
        if self.next_seg == i16::MAX {
            return None;
        }
        let id = self.next_seg;
        self.next_seg += 1;
        Some(id)
    }

    pub(crate) fn release_segment_id(&mut self, id: i16) {
        self.free_segs.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CommId, WindowId};

    fn team() -> TeamData {
        TeamData::new(
            1,
            vec![0, 2, 4],
            1,
            CommId(1),
            WindowId(1),
            vec![SharedRank::Local(0), SharedRank::Local(1), SharedRank::Remote],
            PoolAlloc::new(0, 1024),
            Some(TEAM_ALL),
        )
    }

    #[test]
    fn rank_to_global_unit() {
        let t = team();
        assert_eq!(3, t.size());
        assert_eq!(Some(4), t.global_unit(2));
        assert_eq!(None, t.global_unit(3));
    }

    #[test]
    fn segment_ids_start_at_one_and_reuse() {
        let mut t = team();
        assert_eq!(Some(1), t.alloc_segment_id());
        assert_eq!(Some(2), t.alloc_segment_id());
        t.release_segment_id(1);
        assert_eq!(Some(1), t.alloc_segment_id());
        assert_eq!(Some(3), t.alloc_segment_id());
    }
}
