/// A global pointer: one address in the partitioned global address
/// space.
///
/// The pointer names a unit (by its team-relative rank), the team, a
/// segment within that team, and a byte offset into the segment.
/// Segment id 0 names the per-unit local allocation pool; positive
/// segment ids name collective allocations tracked in the team's
/// segment table. Pointer arithmetic only ever adjusts `offset`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GlobalPtr {
    pub unit_id: u16,
    pub team_id: u16,
    pub segment_id: i16,
    pub flags: u16,
    pub offset: u64,
}

impl GlobalPtr {
    /// The null pointer: every field zero.
    pub const fn null() -> GlobalPtr {
        GlobalPtr {
            unit_id: 0,
            team_id: 0,
            segment_id: 0,
            flags: 0,
            offset: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        *self == GlobalPtr::null()
    }

    /// Advance the pointer by a (possibly negative) byte count.
    pub fn incr_addr(&mut self, bytes: i64) {
        self.offset = (self.offset as i64 + bytes) as u64;
    }

    /// Redirect the pointer at another member of the same team.
    pub fn set_unit(&mut self, unit_id: u16) {
        self.unit_id = unit_id;
    }

    /// Little-endian wire encoding, fields in declaration order.
    ///
    /// Encoded pointers are only meaningful within the runtime
    /// instance that produced them; team and segment ids are not
    /// stable across runs.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..2].copy_from_slice(&self.unit_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.team_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.segment_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> GlobalPtr {
        GlobalPtr {
            unit_id: u16::from_le_bytes(bytes[0..2].try_into().unwrap()),
            team_id: u16::from_le_bytes(bytes[2..4].try_into().unwrap()),
            segment_id: i16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            flags: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
            offset: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_all_zero() {
        let g = GlobalPtr::null();
        assert!(g.is_null());
        assert_eq!([0u8; 16], g.to_le_bytes());

        let mut g = GlobalPtr::null();
        g.flags = 1;
        assert!(!g.is_null());
    }

    #[test]
    fn incr_addr_touches_offset_only() {
        let mut g = GlobalPtr {
            unit_id: 3,
            team_id: 1,
            segment_id: 2,
            flags: 0,
            offset: 100,
        };
        g.incr_addr(28);
        assert_eq!(128, g.offset);
        g.incr_addr(-128);
        assert_eq!(0, g.offset);
        assert_eq!(3, g.unit_id);
        assert_eq!(2, g.segment_id);
    }

    #[test]
    fn wire_round_trip() {
        let g = GlobalPtr {
            unit_id: 0x0102,
            team_id: 0x0304,
            segment_id: -2,
            flags: 0x0506,
            offset: 0x0708090a0b0c0d0e,
        };
        let bytes = g.to_le_bytes();
        assert_eq!(0x02, bytes[0]);
        assert_eq!(0x01, bytes[1]);
        assert_eq!(g, GlobalPtr::from_le_bytes(bytes));
    }

    #[test]
    fn pointer_is_sixteen_bytes() {
        assert_eq!(16, std::mem::size_of::<GlobalPtr>());
    }
}
