use crate::datatype::{DataType, TypeRegistry};
use crate::env_var::config;
use crate::error::{RuntimeError, RuntimeResult};
use crate::gptr::GlobalPtr;
use crate::locality::build::{build_tree, UnitRecord};
use crate::locality::{DomainInfo, DomainTree, Scope};
use crate::pool::PoolAlloc;
use crate::segment::SegmentEntry;
use crate::team::{TeamData, TEAM_ALL, TEAM_UNDEFINED};
use crate::transport::{
    CommId, DtypeId, Transport, TransportColl, TransportComm, TransportError, TransportRdma,
    WindowId, COMM_WORLD,
};

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, warn};

pub(crate) fn transport_inval(e: TransportError) -> RuntimeError {
    error!("transport call failed: {}", e);
    RuntimeError::InvalidArgument
}

pub(crate) struct RuntimeState {
    pub(crate) teams: HashMap<u16, TeamData>,
    pub(crate) domains: HashMap<u16, DomainTree>,
    pub(crate) local_pool: PoolAlloc,
    next_team: u16,
}

/// One unit's endpoint of the runtime: the transport, the per-type
/// transfer plans, the team registry with its segment tables and
/// locality trees, and the unit's local allocation pool.
///
/// Every operation runs to completion on the caller's thread. The
/// registries are only mutated by the team and allocation
/// collectives; callers driving one `Runtime` from several threads
/// must provide their own coordination.
pub struct Runtime {
    pub(crate) transport: Transport,
    pub(crate) types: TypeRegistry,
    my_unit: u16,
    num_units: usize,
    pub(crate) local_window: WindowId,
    /// Per global unit id: that unit's local-pool window base in our
    /// address space, present for co-located units.
    pub(crate) local_shmem_bases: Vec<Option<usize>>,
    pub(crate) state: RwLock<RuntimeState>,
}

impl Runtime {
    /// Bring the runtime up on this unit: resolve the per-type chunk
    /// plans, create the local allocation window, and construct the
    /// all-units team with its locality tree. Collective across the
    /// whole job.
    pub fn init(transport: Transport) -> RuntimeResult<Runtime> {
        let types = TypeRegistry::init(&transport)?;
        let my_unit = transport.my_rank() as u16;
        let num_units = transport.num_ranks();
        debug!("init: unit {} of {}", my_unit, num_units);

        let local_window = transport
            .win_allocate(COMM_WORLD, config().local_pool_size)
            .map_err(transport_inval)?;
        let local_shmem_bases = (0..num_units)
            .map(|r| transport.shmem_base(local_window, r))
            .collect();

        let runtime = Runtime {
            transport,
            types,
            my_unit,
            num_units,
            local_window,
            local_shmem_bases,
            state: RwLock::new(RuntimeState {
                teams: HashMap::new(),
                domains: HashMap::new(),
                local_pool: PoolAlloc::new(0, config().local_pool_size),
                next_team: 1,
            }),
        };

        let members: Vec<u16> = (0..num_units as u16).collect();
        let (team, tree) = runtime.build_team(TEAM_ALL, members, COMM_WORLD, None)?;
        {
            let mut state = runtime.state.write();
            state.teams.insert(TEAM_ALL, team);
            state.domains.insert(TEAM_ALL, tree);
        }
        debug!("init > unit {} ready", my_unit);
        Ok(runtime)
    }

    /// Tear the runtime down: releases every live team, the windows
    /// and the chunk types. Collective across the whole job.
    pub fn finalize(self) -> RuntimeResult<()> {
        debug!("finalize: unit {}", self.my_unit);
        self.transport.barrier(COMM_WORLD).map_err(transport_inval)?;

        let mut team_ids: Vec<u16> = {
            let state = self.state.read();
            state
                .teams
                .keys()
                .copied()
                .filter(|&t| t != TEAM_ALL)
                .collect()
        };
        team_ids.sort_unstable();
        for team_id in team_ids {
            self.release_team(team_id)?;
        }

        let all_window = {
            let mut state = self.state.write();
            state.domains.remove(&TEAM_ALL);
            let team = state.teams.remove(&TEAM_ALL).ok_or(RuntimeError::Other)?;
            team.window
        };
        self.transport.win_free(all_window).map_err(transport_inval)?;
        self.transport
            .win_free(self.local_window)
            .map_err(transport_inval)?;
        self.types.finalize(&self.transport)?;
        debug!("finalize > done");
        Ok(())
    }

    pub fn my_unit(&self) -> u16 {
        self.my_unit
    }

    pub fn num_units(&self) -> usize {
        self.num_units
    }

    pub fn team_size(&self, team_id: u16) -> RuntimeResult<usize> {
        self.with_team(team_id, |team| Ok(team.size()))
    }

    pub fn team_my_rank(&self, team_id: u16) -> RuntimeResult<u16> {
        self.with_team(team_id, |team| Ok(team.my_rank))
    }

    pub fn team_members(&self, team_id: u16) -> RuntimeResult<Vec<u16>> {
        self.with_team(team_id, |team| Ok(team.members.clone()))
    }

    /// The parent a team was created from; `None` for the all-units
    /// team.
    pub fn team_parent(&self, team_id: u16) -> RuntimeResult<Option<u16>> {
        self.with_team(team_id, |team| Ok(team.parent))
    }

    pub(crate) fn with_team<R>(
        &self,
        team_id: u16,
        f: impl FnOnce(&TeamData) -> RuntimeResult<R>,
    ) -> RuntimeResult<R> {
        if team_id == TEAM_UNDEFINED {
            error!("operation on the undefined team");
            return Err(RuntimeError::InvalidArgument);
        }
        let state = self.state.read();
        match state.teams.get(&team_id) {
            Some(team) => f(team),
            None => {
                error!("unknown team {}", team_id);
                Err(RuntimeError::InvalidArgument)
            }
        }
    }

    fn build_team(
        &self,
        team_id: u16,
        members: Vec<u16>,
        comm: CommId,
        parent: Option<u16>,
    ) -> RuntimeResult<(TeamData, DomainTree)> {
        let window = self
            .transport
            .win_allocate(comm, config().team_window_size)
            .map_err(transport_inval)?;
        let my_rank = self
            .transport
            .comm_rank(comm)
            .ok_or(RuntimeError::InvalidArgument)? as u16;
        let sharedmem_tab = self.transport.shared_group(comm);

        // exchange locality records across the team
        let record = UnitRecord::from_hwinfo(&self.transport.hwinfo());
        let mine = record.to_bytes();
        let mut all = vec![0u8; UnitRecord::WIRE_SIZE * members.len()];
        self.transport
            .allgather(
                comm,
                DtypeId::base(DataType::Byte),
                UnitRecord::WIRE_SIZE,
                &mine,
                &mut all,
            )
            .map_err(transport_inval)?;
        let records: Vec<UnitRecord> = all
            .chunks(UnitRecord::WIRE_SIZE)
            .map(UnitRecord::from_bytes)
            .collect();
        let tree = build_tree(team_id, &members, &records);

        let team = TeamData::new(
            team_id,
            members,
            my_rank,
            comm,
            window,
            sharedmem_tab,
            PoolAlloc::new(0, config().team_window_size),
            parent,
        );
        Ok((team, tree))
    }

    /// Create a team from a subset of a parent team's units.
    ///
    /// `members` are global unit ids in team-rank order. Returns the
    /// new team id on members and `None` on non-members, which return
    /// immediately. Collective among the members.
    pub fn team_create(&self, parent_team: u16, members: &[u16]) -> RuntimeResult<Option<u16>> {
        {
            let state = self.state.read();
            let parent = state.teams.get(&parent_team).ok_or_else(|| {
                error!("team_create ! unknown parent team {}", parent_team);
                RuntimeError::InvalidArgument
            })?;
            if members.is_empty() {
                error!("team_create ! empty member set");
                return Err(RuntimeError::InvalidArgument);
            }
            let mut seen = HashSet::new();
            for m in members {
                if !parent.members.contains(m) || !seen.insert(*m) {
                    error!("team_create ! invalid member {}", m);
                    return Err(RuntimeError::InvalidArgument);
                }
            }
            if state.teams.len() >= config().max_team_domains {
                error!(
                    "team_create ! more than {} concurrent teams",
                    config().max_team_domains
                );
                return Err(RuntimeError::InvalidArgument);
            }
        }
        if !members.contains(&self.my_unit) {
            debug!("team_create: unit {} not a member", self.my_unit);
            return Ok(None);
        }

        let world_ranks: Vec<usize> = members.iter().map(|&m| m as usize).collect();
        let comm = self
            .transport
            .comm_create(&world_ranks)
            .map_err(transport_inval)?;

        // agree on the id: members may have created different numbers
        // of teams before this one
        let candidate = self.state.read().next_team;
        let mut agreed = [0u8; 2];
        self.transport
            .allreduce(
                comm,
                DtypeId::base(DataType::U16),
                1,
                crate::datatype::ReduceOp::Max,
                &candidate.to_le_bytes(),
                &mut agreed,
            )
            .map_err(transport_inval)?;
        let team_id = u16::from_le_bytes(agreed);
        if team_id == TEAM_UNDEFINED {
            error!("team_create ! team ids exhausted");
            return Err(RuntimeError::InvalidArgument);
        }

        let (team, tree) = self.build_team(team_id, members.to_vec(), comm, Some(parent_team))?;
        let mut state = self.state.write();
        state.next_team = team_id + 1;
        state.teams.insert(team_id, team);
        state.domains.insert(team_id, tree);
        debug!("team_create > team {} ({} units)", team_id, members.len());
        Ok(Some(team_id))
    }

    fn release_team(&self, team_id: u16) -> RuntimeResult<()> {
        let (comm, window, live_segments) = self.with_team(team_id, |team| {
            Ok((team.comm, team.window, !team.segments.is_empty()))
        })?;
        if live_segments {
            warn!("destroying team {} with live segments", team_id);
        }
        self.transport.barrier(comm).map_err(transport_inval)?;
        self.transport.win_free(window).map_err(transport_inval)?;
        self.transport.comm_free(comm).map_err(transport_inval)?;
        let mut state = self.state.write();
        state.teams.remove(&team_id);
        state.domains.remove(&team_id);
        Ok(())
    }

    /// Dissolve a team created by [`Runtime::team_create`].
    /// Collective among the team's members.
    pub fn team_destroy(&self, team_id: u16) -> RuntimeResult<()> {
        if team_id == TEAM_ALL || team_id == TEAM_UNDEFINED {
            error!("team_destroy ! team {} cannot be destroyed", team_id);
            return Err(RuntimeError::InvalidArgument);
        }
        self.release_team(team_id)?;
        debug!("team_destroy > team {}", team_id);
        Ok(())
    }

    /// Collectively allocate `nelem` elements on every member of the
    /// team. Returns a pointer at offset 0 of the segment on team
    /// rank 0; redirect with [`GlobalPtr::set_unit`].
    pub fn team_memalloc(
        &self,
        team_id: u16,
        nelem: usize,
        dtype: DataType,
    ) -> RuntimeResult<GlobalPtr> {
        let elem_size = self.types.size(dtype);
        let nbytes = nelem
            .checked_mul(elem_size)
            .ok_or(RuntimeError::InvalidArgument)?;

        let (comm, window, team_size) =
            self.with_team(team_id, |team| Ok((team.comm, team.window, team.size())))?;

        let offset = {
            let mut state = self.state.write();
            let team = state
                .teams
                .get_mut(&team_id)
                .ok_or(RuntimeError::InvalidArgument)?;
            team.pool.try_malloc(nbytes).ok_or_else(|| {
                error!("team_memalloc ! window pool exhausted ({} bytes)", nbytes);
                RuntimeError::InvalidArgument
            })?
        };

        let mine = (offset as u64).to_le_bytes();
        let mut all = vec![0u8; 8 * team_size];
        self.transport
            .allgather(comm, DtypeId::base(DataType::U64), 1, &mine, &mut all)
            .map_err(transport_inval)?;
        let disps: Vec<u64> = all
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let mut state = self.state.write();
        let team = state
            .teams
            .get_mut(&team_id)
            .ok_or(RuntimeError::InvalidArgument)?;
        let shmem_bases: Vec<Option<usize>> = (0..team_size)
            .map(|rank| {
                if team.sharedmem_tab[rank].is_local() {
                    self.transport
                        .shmem_base(window, rank)
                        .map(|base| base + disps[rank] as usize)
                } else {
                    None
                }
            })
            .collect();
        let segid = team.alloc_segment_id().ok_or_else(|| {
            error!("team_memalloc ! segment ids exhausted");
            RuntimeError::InvalidArgument
        })?;
        team.segments.insert(
            segid,
            SegmentEntry {
                disps,
                shmem_bases,
                nelem,
                elem_size,
            },
        );
        debug!(
            "team_memalloc > team {} segment {} ({} elements)",
            team.team_id, segid, nelem
        );
        Ok(GlobalPtr {
            unit_id: 0,
            team_id,
            segment_id: segid,
            flags: 0,
            offset: 0,
        })
    }

    /// Collectively release a segment allocated with
    /// [`Runtime::team_memalloc`]. The segment id may be reused; the
    /// caller must not hold pointers into the segment afterwards.
    pub fn team_memfree(&self, gptr: GlobalPtr) -> RuntimeResult<()> {
        if gptr.segment_id <= 0 {
            error!("team_memfree ! not a collective segment");
            return Err(RuntimeError::InvalidArgument);
        }
        let comm = self.with_team(gptr.team_id, |team| Ok(team.comm))?;
        self.transport.barrier(comm).map_err(transport_inval)?;

        let mut state = self.state.write();
        let team = state
            .teams
            .get_mut(&gptr.team_id)
            .ok_or(RuntimeError::InvalidArgument)?;
        let my_rank = team.my_rank;
        let entry = team.segments.remove(gptr.segment_id).ok_or_else(|| {
            error!("team_memfree ! unbound segment {}", gptr.segment_id);
            RuntimeError::InvalidArgument
        })?;
        team.pool.free(entry.disps[my_rank as usize] as usize);
        team.release_segment_id(gptr.segment_id);
        debug!(
            "team_memfree > segment {} ({} elements of {} bytes)",
            gptr.segment_id, entry.nelem, entry.elem_size
        );
        Ok(())
    }

    /// Allocate from this unit's local pool. The returned pointer
    /// carries segment id 0 and is addressed at this unit within the
    /// all-units team.
    pub fn memalloc_local(&self, nelem: usize, dtype: DataType) -> RuntimeResult<GlobalPtr> {
        let nbytes = nelem
            .checked_mul(self.types.size(dtype))
            .ok_or(RuntimeError::InvalidArgument)?;
        let mut state = self.state.write();
        let offset = state.local_pool.try_malloc(nbytes).ok_or_else(|| {
            error!("memalloc_local ! pool exhausted ({} bytes)", nbytes);
            RuntimeError::InvalidArgument
        })?;
        Ok(GlobalPtr {
            unit_id: self.my_unit,
            team_id: TEAM_ALL,
            segment_id: 0,
            flags: 0,
            offset: offset as u64,
        })
    }

    /// Release a local allocation on this unit.
    pub fn memfree_local(&self, gptr: GlobalPtr) -> RuntimeResult<()> {
        if gptr.segment_id != 0 || gptr.unit_id != self.my_unit {
            error!("memfree_local ! pointer does not name a local allocation here");
            return Err(RuntimeError::InvalidArgument);
        }
        let mut state = self.state.write();
        if !state.local_pool.free(gptr.offset as usize) {
            error!(
                "memfree_local ! unknown allocation at offset {}",
                gptr.offset
            );
            return Err(RuntimeError::InvalidArgument);
        }
        Ok(())
    }

    fn with_domains<R>(
        &self,
        team_id: u16,
        f: impl FnOnce(&mut DomainTree) -> RuntimeResult<R>,
    ) -> RuntimeResult<R> {
        let mut state = self.state.write();
        match state.domains.get_mut(&team_id) {
            Some(tree) => f(tree),
            None => {
                error!("no locality tree for team {}", team_id);
                Err(RuntimeError::InvalidArgument)
            }
        }
    }

    /// Snapshot of the team's global locality domain.
    pub fn team_domain(&self, team_id: u16) -> RuntimeResult<DomainInfo> {
        self.with_domains(team_id, |tree| Ok(tree.root()))
    }

    /// Snapshot of one domain of the team's locality tree.
    pub fn domain_at(&self, team_id: u16, tag: &str) -> RuntimeResult<DomainInfo> {
        self.with_domains(team_id, |tree| tree.domain_at(tag))
    }

    /// Tags of the team's domains at the given scope, in pre-order.
    pub fn scope_domains(&self, team_id: u16, scope: Scope) -> RuntimeResult<Vec<String>> {
        self.with_domains(team_id, |tree| tree.scope_domains(scope))
    }

    /// Partition the team's domains at `scope` into balanced groups
    /// of tags, without changing the tree.
    pub fn domain_split(
        &self,
        team_id: u16,
        scope: Scope,
        num_parts: usize,
    ) -> RuntimeResult<Vec<Vec<String>>> {
        self.with_domains(team_id, |tree| tree.split(scope, num_parts))
    }

    /// Apply grouping transforms to the team's locality tree.
    pub fn domain_group(&self, team_id: u16, specs: &[Vec<String>]) -> RuntimeResult<()> {
        self.with_domains(team_id, |tree| tree.group(specs))
    }

    /// Group immediate children of one domain of the team's tree.
    pub fn domain_group_subdomains(
        &self,
        team_id: u16,
        parent_tag: &str,
        subset: &[String],
    ) -> RuntimeResult<()> {
        self.with_domains(team_id, |tree| tree.group_subdomains(parent_tag, subset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use serial_test::serial;

    fn local_runtime() -> Runtime {
        Runtime::init(Transport::Local(LocalTransport::new())).unwrap()
    }

    #[test]
    #[serial]
    fn init_builds_the_all_team() {
        let rt = local_runtime();
        assert_eq!(0, rt.my_unit());
        assert_eq!(1, rt.num_units());
        assert_eq!(1, rt.team_size(TEAM_ALL).unwrap());
        assert_eq!(0, rt.team_my_rank(TEAM_ALL).unwrap());
        assert_eq!(vec![0], rt.team_members(TEAM_ALL).unwrap());
        assert_eq!(
            Err(RuntimeError::InvalidArgument),
            rt.team_size(TEAM_UNDEFINED)
        );
        rt.finalize().unwrap();
    }

    #[test]
    #[serial]
    fn local_allocation_round_trip() {
        let rt = local_runtime();
        let g = rt.memalloc_local(16, DataType::U32).unwrap();
        assert_eq!(0, g.segment_id);
        assert_eq!(TEAM_ALL, g.team_id);
        rt.memfree_local(g).unwrap();
        assert_eq!(Err(RuntimeError::InvalidArgument), rt.memfree_local(g));
        rt.finalize().unwrap();
    }

    #[test]
    #[serial]
    fn collective_allocation_binds_a_segment() {
        let rt = local_runtime();
        let g = rt.team_memalloc(TEAM_ALL, 100, DataType::U64).unwrap();
        assert!(g.segment_id > 0);
        assert_eq!(0, g.offset);
        let h = rt.team_memalloc(TEAM_ALL, 10, DataType::U8).unwrap();
        assert_ne!(g.segment_id, h.segment_id);
        rt.team_memfree(g).unwrap();
        rt.team_memfree(h).unwrap();
        rt.finalize().unwrap();
    }

    #[test]
    #[serial]
    fn locality_tree_exists_for_the_all_team() {
        let rt = local_runtime();
        let root = rt.team_domain(TEAM_ALL).unwrap();
        assert_eq!(Scope::Global, root.scope);
        assert_eq!(1, root.num_units);
        assert_eq!(1, root.num_nodes);
        assert_eq!(1, rt.scope_domains(TEAM_ALL, Scope::Core).unwrap().len());
        rt.finalize().unwrap();
    }
}
