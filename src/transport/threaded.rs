use crate::datatype::{reduce_in_place, ReduceOp};
use crate::env_var::config;
use crate::transport::{
    CommId, DtypeId, DtypeTable, HwInfo, Request, SharedRank, Transport, TransportColl,
    TransportComm, TransportError, TransportP2p, TransportRdma, TransportResult, TransportTypes,
    WindowId,
};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

struct Msg {
    src: usize,
    tag: i32,
    bytes: Vec<u8>,
}

/// Rendezvous slot shared by the members of one communicator. Every
/// collective is expressed as a full exchange: each member deposits a
/// byte contribution, the last arrival publishes the complete round,
/// and every member derives its own result locally.
struct CollSlot {
    inner: Mutex<CollInner>,
    cv: Condvar,
}

struct CollInner {
    gen: u64,
    arrived: usize,
    contrib: Vec<Option<Vec<u8>>>,
    last: Option<(u64, Arc<Vec<Vec<u8>>>)>,
}

impl CollSlot {
    fn new(size: usize) -> CollSlot {
        CollSlot {
            inner: Mutex::new(CollInner {
                gen: 0,
                arrived: 0,
                contrib: vec![None; size],
                last: None,
            }),
            cv: Condvar::new(),
        }
    }

    fn exchange(&self, my_rank: usize, size: usize, bytes: Vec<u8>) -> Arc<Vec<Vec<u8>>> {
        let timeout = Duration::from_secs_f64(config().deadlock_timeout);
        let mut inner = self.inner.lock();
        let gen = inner.gen;
        inner.contrib[my_rank] = Some(bytes);
        inner.arrived += 1;
        if inner.arrived == size {
            let round: Vec<Vec<u8>> = inner
                .contrib
                .iter_mut()
                .map(|c| c.take().unwrap_or_default())
                .collect();
            let round = Arc::new(round);
            inner.last = Some((gen, round.clone()));
            inner.arrived = 0;
            inner.gen += 1;
            self.cv.notify_all();
            round
        } else {
            let mut warned = false;
            while inner.gen == gen {
                if self.cv.wait_for(&mut inner, timeout).timed_out() && !warned {
                    warn!(
                        "potential deadlock: a collective has waited {:.0}s, \
                         every member of the group must enter the call",
                        config().deadlock_timeout
                    );
                    warned = true;
                }
            }
            let (g, round) = inner.last.as_ref().expect("completed round published");
            debug_assert_eq!(*g, gen);
            round.clone()
        }
    }
}

struct MailSlot {
    tx: Sender<Msg>,
    rx: Receiver<Msg>,
}

struct CommData {
    members: Vec<usize>,
    coll: CollSlot,
    mail: Vec<MailSlot>,
}

impl CommData {
    fn new(members: Vec<usize>) -> CommData {
        let n = members.len();
        let mail = (0..n)
            .map(|_| {
                let (tx, rx) = unbounded();
                MailSlot { tx, rx }
            })
            .collect();
        CommData {
            coll: CollSlot::new(n),
            members,
            mail,
        }
    }

    fn rank_of(&self, world_rank: usize) -> Option<usize> {
        self.members.iter().position(|&m| m == world_rank)
    }
}

struct WinData {
    comm: u32,
    bases: Vec<usize>,
    lens: Vec<usize>,
    bufs: Mutex<Vec<Option<Box<[u8]>>>>,
    // serializes accumulate, fetch_and_op and compare_and_swap
    update: Mutex<()>,
}

struct CommRound {
    id: u32,
    joined: Vec<usize>,
}

struct FabricCounters {
    next_win: u32,
    win_ids: HashMap<(u32, u64), u32>,
    comm_rounds: HashMap<Vec<usize>, Vec<CommRound>>,
}

struct FabricState {
    hosts: Vec<String>,
    colocation: bool,
    max_contig: usize,
    comms: RwLock<Vec<Arc<CommData>>>,
    windows: RwLock<HashMap<u32, Arc<WinData>>>,
    counters: Mutex<FabricCounters>,
}

/// Configures a [`ThreadedFabric`].
pub struct ThreadedFabricBuilder {
    num_units: usize,
    hosts: Option<Vec<String>>,
    colocation: bool,
    max_contig: usize,
}

impl ThreadedFabricBuilder {
    pub fn new(num_units: usize) -> ThreadedFabricBuilder {
        ThreadedFabricBuilder {
            num_units,
            hosts: None,
            colocation: true,
            max_contig: i32::MAX as usize,
        }
    }

    /// Assign a host name per unit; units with equal host names report
    /// each other as co-located. Default: all units on one host.
    pub fn with_hosts(mut self, hosts: Vec<String>) -> ThreadedFabricBuilder {
        self.hosts = Some(hosts);
        self
    }

    /// Report every peer as remote regardless of host placement, so
    /// transfers take the one-sided path even inside one process.
    pub fn without_colocation(mut self) -> ThreadedFabricBuilder {
        self.colocation = false;
        self
    }

    /// Lower the per-call element limit (the chunking quantum).
    pub fn with_max_contig_elements(mut self, max_contig: usize) -> ThreadedFabricBuilder {
        self.max_contig = max_contig;
        self
    }

    pub fn build(self) -> ThreadedFabric {
        let hosts = self
            .hosts
            .unwrap_or_else(|| vec!["node0".to_owned(); self.num_units]);
        assert_eq!(
            hosts.len(),
            self.num_units,
            "one host name required per unit"
        );
        let world = Arc::new(CommData::new((0..self.num_units).collect()));
        ThreadedFabric {
            state: Arc::new(FabricState {
                hosts,
                colocation: self.colocation,
                max_contig: self.max_contig,
                comms: RwLock::new(vec![world]),
                windows: RwLock::new(HashMap::new()),
                counters: Mutex::new(FabricCounters {
                    next_win: 0,
                    win_ids: HashMap::new(),
                    comm_rounds: HashMap::new(),
                }),
            }),
        }
    }
}

/// A job of several units running as threads of one process, used to
/// emulate a distributed environment. Hand each unit thread its own
/// transport via [`ThreadedFabric::transport`].
pub struct ThreadedFabric {
    state: Arc<FabricState>,
}

impl ThreadedFabric {
    pub fn num_units(&self) -> usize {
        self.state.hosts.len()
    }

    pub fn transport(&self, rank: usize) -> Transport {
        assert!(rank < self.num_units(), "rank out of range");
        Transport::Threaded(ThreadedTransport {
            state: self.state.clone(),
            rank,
            dtypes: DtypeTable::new(),
            stash: Mutex::new(HashMap::new()),
            win_seq: Mutex::new(HashMap::new()),
            req_count: AtomicU64::new(0),
        })
    }
}

/// One unit's endpoint of a [`ThreadedFabric`].
pub struct ThreadedTransport {
    state: Arc<FabricState>,
    rank: usize,
    dtypes: DtypeTable,
    stash: Mutex<HashMap<u32, Vec<Msg>>>,
    win_seq: Mutex<HashMap<u32, u64>>,
    req_count: AtomicU64,
}

impl ThreadedTransport {
    fn comm_data(&self, comm: CommId) -> TransportResult<Arc<CommData>> {
        self.state
            .comms
            .read()
            .get(comm.0 as usize)
            .cloned()
            .ok_or_else(|| TransportError::new("unknown communicator"))
    }

    fn my_comm_rank(&self, cd: &CommData) -> TransportResult<usize> {
        cd.rank_of(self.rank)
            .ok_or_else(|| TransportError::new("caller is not a member of the communicator"))
    }

    fn win_data(&self, win: WindowId) -> TransportResult<Arc<WinData>> {
        self.state
            .windows
            .read()
            .get(&win.0)
            .cloned()
            .ok_or_else(|| TransportError::new("unknown window"))
    }

    fn target_addr(
        &self,
        wd: &WinData,
        rank: usize,
        disp: usize,
        len: usize,
    ) -> TransportResult<usize> {
        if rank >= wd.bases.len() {
            return Err(TransportError::new("target rank out of range"));
        }
        if disp + len > wd.lens[rank] {
            return Err(TransportError::new("window access out of range"));
        }
        Ok(wd.bases[rank] + disp)
    }

    fn byte_len(&self, dtype: DtypeId, count: usize) -> usize {
        self.dtypes.size(dtype) * count
    }

    fn next_request(&self) -> Request {
        Request(self.req_count.fetch_add(1, Ordering::Relaxed))
    }
}

impl TransportComm for ThreadedTransport {
    fn my_rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.state.hosts.len()
    }

    fn comm_create(&self, members: &[usize]) -> TransportResult<CommId> {
        if members.is_empty() || !members.contains(&self.rank) {
            return Err(TransportError::new(
                "caller must be a member of the new communicator",
            ));
        }
        if members.iter().any(|&m| m >= self.num_ranks()) {
            return Err(TransportError::new("member rank out of range"));
        }
        let key = members.to_vec();
        let mut counters = self.state.counters.lock();

        // join the first creation round this unit has not joined yet
        let mut joined = None;
        if let Some(rounds) = counters.comm_rounds.get_mut(&key) {
            for round in rounds.iter_mut() {
                if !round.joined.contains(&self.rank) {
                    round.joined.push(self.rank);
                    joined = Some((round.id, round.joined.len() == members.len()));
                    break;
                }
            }
        }
        if let Some((id, complete)) = joined {
            if complete {
                let rounds = counters.comm_rounds.get_mut(&key).expect("round exists");
                rounds.retain(|r| r.id != id);
                if rounds.is_empty() {
                    counters.comm_rounds.remove(&key);
                }
            }
            return Ok(CommId(id));
        }

        let id = {
            let mut comms = self.state.comms.write();
            let id = comms.len() as u32;
            comms.push(Arc::new(CommData::new(members.to_vec())));
            id
        };
        if members.len() > 1 {
            counters.comm_rounds.entry(key).or_default().push(CommRound {
                id,
                joined: vec![self.rank],
            });
        }
        Ok(CommId(id))
    }

    fn comm_free(&self, comm: CommId) -> TransportResult<()> {
        // group slots are reclaimed when the fabric is dropped
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        cd.coll.exchange(my_crank, cd.members.len(), Vec::new());
        Ok(())
    }

    fn comm_size(&self, comm: CommId) -> usize {
        self.comm_data(comm).map(|cd| cd.members.len()).unwrap_or(0)
    }

    fn comm_rank(&self, comm: CommId) -> Option<usize> {
        self.comm_data(comm).ok().and_then(|cd| cd.rank_of(self.rank))
    }

    fn shared_group(&self, comm: CommId) -> Vec<SharedRank> {
        let cd = match self.comm_data(comm) {
            Ok(cd) => cd,
            Err(_) => return Vec::new(),
        };
        let my_host = &self.state.hosts[self.rank];
        let mut local_idx = 0u16;
        cd.members
            .iter()
            .map(|&m| {
                if self.state.colocation && &self.state.hosts[m] == my_host {
                    let r = SharedRank::Local(local_idx);
                    local_idx += 1;
                    r
                } else {
                    SharedRank::Remote
                }
            })
            .collect()
    }

    fn hwinfo(&self) -> HwInfo {
        let host = self.state.hosts[self.rank].clone();
        let cohosted = self
            .state
            .hosts
            .iter()
            .filter(|h| **h == host)
            .count() as u16;
        HwInfo {
            host,
            num_modules: 1,
            num_numa: 1,
            num_cores: cohosted.max(1),
        }
    }

    fn max_contig_elements(&self) -> usize {
        self.state.max_contig
    }
}

impl TransportRdma for ThreadedTransport {
    fn win_allocate(&self, comm: CommId, size: usize) -> TransportResult<WindowId> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let buf = vec![0u8; size].into_boxed_slice();
        let addr = buf.as_ptr() as usize;

        // the k-th allocation on a communicator is the same window on
        // every member, which pins down a job-wide id
        let seq = {
            let mut seqs = self.win_seq.lock();
            let entry = seqs.entry(comm.0).or_insert(0);
            let seq = *entry;
            *entry += 1;
            seq
        };
        let id = {
            let mut counters = self.state.counters.lock();
            match counters.win_ids.get(&(comm.0, seq)) {
                Some(id) => *id,
                None => {
                    let id = counters.next_win;
                    counters.next_win += 1;
                    counters.win_ids.insert((comm.0, seq), id);
                    id
                }
            }
        };

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&(addr as u64).to_le_bytes());
        payload.extend_from_slice(&(size as u64).to_le_bytes());
        let round = cd.coll.exchange(my_crank, cd.members.len(), payload);

        {
            let mut windows = self.state.windows.write();
            windows.entry(id).or_insert_with(|| {
                let bases = round
                    .iter()
                    .map(|b| u64::from_le_bytes(b[0..8].try_into().unwrap()) as usize)
                    .collect();
                let lens = round
                    .iter()
                    .map(|b| u64::from_le_bytes(b[8..16].try_into().unwrap()) as usize)
                    .collect();
                Arc::new(WinData {
                    comm: comm.0,
                    bases,
                    lens,
                    bufs: Mutex::new((0..cd.members.len()).map(|_| None).collect()),
                    update: Mutex::new(()),
                })
            });
        }
        let wd = self.win_data(WindowId(id))?;
        wd.bufs.lock()[my_crank] = Some(buf);
        Ok(WindowId(id))
    }

    fn win_free(&self, win: WindowId) -> TransportResult<()> {
        let wd = self.win_data(win)?;
        let cd = self.comm_data(CommId(wd.comm))?;
        let my_crank = self.my_comm_rank(&cd)?;
        cd.coll.exchange(my_crank, cd.members.len(), Vec::new());
        let drained = {
            let mut bufs = wd.bufs.lock();
            bufs[my_crank] = None;
            bufs.iter().all(|b| b.is_none())
        };
        if drained {
            self.state.windows.write().remove(&win.0);
        }
        Ok(())
    }

    fn win_base(&self, win: WindowId) -> usize {
        let wd = match self.win_data(win) {
            Ok(wd) => wd,
            Err(_) => return 0,
        };
        let cd = match self.comm_data(CommId(wd.comm)) {
            Ok(cd) => cd,
            Err(_) => return 0,
        };
        match cd.rank_of(self.rank) {
            Some(crank) => wd.bases[crank],
            None => 0,
        }
    }

    fn shmem_base(&self, win: WindowId, rank: usize) -> Option<usize> {
        let wd = self.win_data(win).ok()?;
        let cd = self.comm_data(CommId(wd.comm)).ok()?;
        let world = *cd.members.get(rank)?;
        if self.state.colocation && self.state.hosts[world] == self.state.hosts[self.rank] {
            Some(wd.bases[rank])
        } else {
            None
        }
    }

    fn get(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        dest: &mut [u8],
    ) -> TransportResult<()> {
        let len = self.byte_len(dtype, count);
        let wd = self.win_data(win)?;
        let src = self.target_addr(&wd, rank, disp, len)?;
        unsafe {
            std::ptr::copy(src as *const u8, dest.as_mut_ptr(), len);
        }
        Ok(())
    }

    fn put(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        src: &[u8],
    ) -> TransportResult<()> {
        let len = self.byte_len(dtype, count);
        let wd = self.win_data(win)?;
        let dst = self.target_addr(&wd, rank, disp, len)?;
        unsafe {
            std::ptr::copy(src.as_ptr(), dst as *mut u8, len);
        }
        Ok(())
    }

    fn rget(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        dest: &mut [u8],
    ) -> TransportResult<Request> {
        self.get(win, rank, disp, dtype, count, dest)?;
        Ok(self.next_request())
    }

    fn rput(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        src: &[u8],
    ) -> TransportResult<Request> {
        self.put(win, rank, disp, dtype, count, src)?;
        Ok(self.next_request())
    }

    fn accumulate(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        op: ReduceOp,
        src: &[u8],
    ) -> TransportResult<()> {
        let (base, multiplicity) = self.dtypes.resolve(dtype)?;
        let len = base.size() * multiplicity * count;
        let wd = self.win_data(win)?;
        let dst = self.target_addr(&wd, rank, disp, len)?;
        let _guard = wd.update.lock();
        let target = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
        reduce_in_place(op, base, target, src)
            .map_err(|_| TransportError::new("unsupported accumulate operator"))
    }

    fn fetch_and_op(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        op: ReduceOp,
        value: &[u8],
        result: &mut [u8],
    ) -> TransportResult<()> {
        let (base, _) = self.dtypes.resolve(dtype)?;
        let len = base.size();
        let wd = self.win_data(win)?;
        let dst = self.target_addr(&wd, rank, disp, len)?;
        let _guard = wd.update.lock();
        let target = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
        result.copy_from_slice(target);
        reduce_in_place(op, base, target, value)
            .map_err(|_| TransportError::new("unsupported fetch operator"))
    }

    fn compare_and_swap(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        value: &[u8],
        compare: &[u8],
        result: &mut [u8],
    ) -> TransportResult<()> {
        let (base, _) = self.dtypes.resolve(dtype)?;
        let len = base.size();
        let wd = self.win_data(win)?;
        let dst = self.target_addr(&wd, rank, disp, len)?;
        let _guard = wd.update.lock();
        let target = unsafe { std::slice::from_raw_parts_mut(dst as *mut u8, len) };
        result.copy_from_slice(target);
        if target == compare {
            target.copy_from_slice(value);
        }
        Ok(())
    }

    fn flush(&self, _win: WindowId, _rank: usize) -> TransportResult<()> {
        Ok(())
    }

    fn flush_local(&self, _win: WindowId, _rank: usize) -> TransportResult<()> {
        Ok(())
    }

    fn flush_all(&self, _win: WindowId) -> TransportResult<()> {
        Ok(())
    }

    fn flush_local_all(&self, _win: WindowId) -> TransportResult<()> {
        Ok(())
    }

    fn win_sync(&self, _win: WindowId) -> TransportResult<()> {
        Ok(())
    }

    fn waitall(&self, _reqs: &[Request]) -> TransportResult<()> {
        Ok(())
    }

    fn testall(&self, _reqs: &[Request]) -> TransportResult<bool> {
        Ok(true)
    }

    fn iprobe(&self, comm: CommId) -> TransportResult<bool> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        if self
            .stash
            .lock()
            .get(&comm.0)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
        {
            return Ok(true);
        }
        Ok(!cd.mail[my_crank].rx.is_empty())
    }
}

impl TransportColl for ThreadedTransport {
    fn barrier(&self, comm: CommId) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        cd.coll.exchange(my_crank, cd.members.len(), Vec::new());
        Ok(())
    }

    fn bcast(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        buf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let len = self.byte_len(dtype, count);
        let contribution = if my_crank == root {
            buf[..len].to_vec()
        } else {
            Vec::new()
        };
        let round = cd.coll.exchange(my_crank, cd.members.len(), contribution);
        if my_crank != root {
            buf[..len].copy_from_slice(&round[root][..len]);
        }
        Ok(())
    }

    fn scatter(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let len = self.byte_len(dtype, count);
        let contribution = if my_crank == root {
            sendbuf[..len * cd.members.len()].to_vec()
        } else {
            Vec::new()
        };
        let round = cd.coll.exchange(my_crank, cd.members.len(), contribution);
        recvbuf[..len].copy_from_slice(&round[root][my_crank * len..(my_crank + 1) * len]);
        Ok(())
    }

    fn gather(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let len = self.byte_len(dtype, count);
        let round = cd
            .coll
            .exchange(my_crank, cd.members.len(), sendbuf[..len].to_vec());
        if my_crank == root {
            for (r, part) in round.iter().enumerate() {
                recvbuf[r * len..(r + 1) * len].copy_from_slice(&part[..len]);
            }
        }
        Ok(())
    }

    fn allgather(
        &self,
        comm: CommId,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let len = self.byte_len(dtype, count);
        let round = cd
            .coll
            .exchange(my_crank, cd.members.len(), sendbuf[..len].to_vec());
        for (r, part) in round.iter().enumerate() {
            recvbuf[r * len..(r + 1) * len].copy_from_slice(&part[..len]);
        }
        Ok(())
    }

    fn allgatherv(
        &self,
        comm: CommId,
        dtype: DtypeId,
        sendcount: usize,
        sendbuf: &[u8],
        recvcounts: &[usize],
        recvdispls: &[usize],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let esize = self.dtypes.size(dtype);
        let round = cd.coll.exchange(
            my_crank,
            cd.members.len(),
            sendbuf[..sendcount * esize].to_vec(),
        );
        for (r, part) in round.iter().enumerate() {
            let len = recvcounts[r] * esize;
            if part.len() != len {
                return Err(TransportError::new("allgatherv count mismatch"));
            }
            let off = recvdispls[r] * esize;
            recvbuf[off..off + len].copy_from_slice(part);
        }
        Ok(())
    }

    fn allreduce(
        &self,
        comm: CommId,
        dtype: DtypeId,
        count: usize,
        op: ReduceOp,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let (base, multiplicity) = self.dtypes.resolve(dtype)?;
        let len = base.size() * multiplicity * count;
        let round = cd
            .coll
            .exchange(my_crank, cd.members.len(), sendbuf[..len].to_vec());
        recvbuf[..len].copy_from_slice(&round[0][..len]);
        for part in round.iter().skip(1) {
            reduce_in_place(op, base, &mut recvbuf[..len], part)
                .map_err(|_| TransportError::new("unsupported reduction operator"))?;
        }
        Ok(())
    }

    fn reduce(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        op: ReduceOp,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let (base, multiplicity) = self.dtypes.resolve(dtype)?;
        let len = base.size() * multiplicity * count;
        let round = cd
            .coll
            .exchange(my_crank, cd.members.len(), sendbuf[..len].to_vec());
        if my_crank == root {
            recvbuf[..len].copy_from_slice(&round[0][..len]);
            for part in round.iter().skip(1) {
                reduce_in_place(op, base, &mut recvbuf[..len], part)
                    .map_err(|_| TransportError::new("unsupported reduction operator"))?;
            }
        }
        Ok(())
    }
}

impl TransportP2p for ThreadedTransport {
    fn send(
        &self,
        comm: CommId,
        dest: usize,
        tag: i32,
        dtype: DtypeId,
        count: usize,
        buf: &[u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let slot = cd
            .mail
            .get(dest)
            .ok_or_else(|| TransportError::new("destination rank out of range"))?;
        let len = self.byte_len(dtype, count);
        slot.tx
            .send(Msg {
                src: my_crank,
                tag,
                bytes: buf[..len].to_vec(),
            })
            .map_err(|_| TransportError::new("mailbox closed"))
    }

    fn recv(
        &self,
        comm: CommId,
        src: usize,
        tag: i32,
        dtype: DtypeId,
        count: usize,
        buf: &mut [u8],
    ) -> TransportResult<()> {
        let cd = self.comm_data(comm)?;
        let my_crank = self.my_comm_rank(&cd)?;
        let len = self.byte_len(dtype, count);

        let mut stash = self.stash.lock();
        let queued = stash.entry(comm.0).or_default();
        if let Some(pos) = queued.iter().position(|m| m.src == src && m.tag == tag) {
            let msg = queued.remove(pos);
            buf[..len].copy_from_slice(&msg.bytes[..len]);
            return Ok(());
        }
        drop(stash);

        let timeout = Duration::from_secs_f64(config().deadlock_timeout);
        let rx = &cd.mail[my_crank].rx;
        let mut warned = false;
        loop {
            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    if msg.src == src && msg.tag == tag {
                        buf[..len].copy_from_slice(&msg.bytes[..len]);
                        return Ok(());
                    }
                    self.stash.lock().entry(comm.0).or_default().push(msg);
                }
                Err(_) => {
                    if !warned {
                        warn!(
                            "potential deadlock: receive from rank {} tag {} has waited {:.0}s",
                            src,
                            tag,
                            config().deadlock_timeout
                        );
                        warned = true;
                    }
                }
            }
        }
    }

    fn sendrecv(
        &self,
        comm: CommId,
        dest: usize,
        send_tag: i32,
        send_dtype: DtypeId,
        send_count: usize,
        sendbuf: &[u8],
        src: usize,
        recv_tag: i32,
        recv_dtype: DtypeId,
        recv_count: usize,
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        self.send(comm, dest, send_tag, send_dtype, send_count, sendbuf)?;
        self.recv(comm, src, recv_tag, recv_dtype, recv_count, recvbuf)
    }
}

impl TransportTypes for ThreadedTransport {
    fn type_contiguous(&self, count: usize, base: DtypeId) -> TransportResult<DtypeId> {
        self.dtypes.contiguous(count, base)
    }

    fn type_commit(&self, _dtype: DtypeId) -> TransportResult<()> {
        Ok(())
    }

    fn type_size(&self, dtype: DtypeId) -> usize {
        self.dtypes.size(dtype)
    }

    fn type_free(&self, _dtype: DtypeId) -> TransportResult<()> {
        Ok(())
    }
}
