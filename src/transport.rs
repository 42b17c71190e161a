use crate::datatype::{DataType, ReduceOp, DATATYPE_COUNT};

use enum_dispatch::enum_dispatch;
use parking_lot::Mutex;

pub(crate) mod local;
pub(crate) mod threaded;

pub use local::LocalTransport;
pub use threaded::{ThreadedFabric, ThreadedFabricBuilder, ThreadedTransport};

/// A failure reported by the underlying transport. The runtime maps
/// these onto its own error codes at the call site.
#[derive(Debug, Clone)]
pub struct TransportError {
    msg: &'static str,
}

impl TransportError {
    pub(crate) fn new(msg: &'static str) -> TransportError {
        TransportError { msg }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "transport error: {}", self.msg)
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = Result<T, TransportError>;

/// Handle of a process group (sub-communicator) within a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommId(pub(crate) u32);

/// The communicator spanning every unit of the job.
pub const COMM_WORLD: CommId = CommId(0);

/// Handle of a remotely accessible memory window. Displacements into
/// a window are byte offsets from the owning rank's window base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub(crate) u32);

/// Transport-native datatype handle. The first [`DATATYPE_COUNT`] ids
/// are the predefined base types; higher ids are committed aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DtypeId(pub(crate) u32);

impl DtypeId {
    pub(crate) const INVALID: DtypeId = DtypeId(u32::MAX);

    pub(crate) fn base(dt: DataType) -> DtypeId {
        DtypeId(dt.index() as u32)
    }
}

/// Identifier of one in-flight non-blocking transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request(pub(crate) u64);

/// Hardware summary a unit reports about itself, exchanged between
/// team members to build the locality hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct HwInfo {
    pub host: String,
    pub num_modules: u16,
    pub num_numa: u16,
    pub num_cores: u16,
}

/// Co-location of one peer as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedRank {
    /// The peer shares memory with the calling unit; the payload is
    /// its rank within the local shared-memory group.
    Local(u16),
    Remote,
}

impl SharedRank {
    pub fn is_local(&self) -> bool {
        matches!(self, SharedRank::Local(_))
    }
}

/// Process-group management and job-wide facts.
#[enum_dispatch]
pub trait TransportComm {
    fn my_rank(&self) -> usize;
    fn num_ranks(&self) -> usize;
    /// Collective among `members` (world ranks, ordered). Returns the
    /// handle of the new group; every member observes the same handle.
    fn comm_create(&self, members: &[usize]) -> TransportResult<CommId>;
    fn comm_free(&self, comm: CommId) -> TransportResult<()>;
    fn comm_size(&self, comm: CommId) -> usize;
    fn comm_rank(&self, comm: CommId) -> Option<usize>;
    /// For each rank of `comm`: whether it shares memory with the
    /// calling unit, and its rank within the shared group if so.
    fn shared_group(&self, comm: CommId) -> Vec<SharedRank>;
    fn hwinfo(&self) -> HwInfo;
    /// Maximum element count a single call may carry.
    fn max_contig_elements(&self) -> usize;
}

/// One-sided operations on windows.
///
/// Buffers are raw byte storage of exactly `count` elements of
/// `dtype`. Completion semantics follow the usual one-sided model:
/// `put` is complete locally when the call returns only if the
/// backend copies eagerly; remote visibility always requires a flush.
#[enum_dispatch]
pub trait TransportRdma {
    /// Collective over the window's communicator; every member
    /// contributes `size` bytes of its own memory.
    fn win_allocate(&self, comm: CommId, size: usize) -> TransportResult<WindowId>;
    fn win_free(&self, win: WindowId) -> TransportResult<()>;
    /// Base address of the calling unit's own window memory.
    fn win_base(&self, win: WindowId) -> usize;
    /// Address of `rank`'s window memory in the calling unit's address
    /// space, when the two share memory.
    fn shmem_base(&self, win: WindowId, rank: usize) -> Option<usize>;

    fn get(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        dest: &mut [u8],
    ) -> TransportResult<()>;
    fn put(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        src: &[u8],
    ) -> TransportResult<()>;
    fn rget(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        dest: &mut [u8],
    ) -> TransportResult<Request>;
    fn rput(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        src: &[u8],
    ) -> TransportResult<Request>;
    fn accumulate(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        count: usize,
        op: ReduceOp,
        src: &[u8],
    ) -> TransportResult<()>;
    fn fetch_and_op(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        op: ReduceOp,
        value: &[u8],
        result: &mut [u8],
    ) -> TransportResult<()>;
    fn compare_and_swap(
        &self,
        win: WindowId,
        rank: usize,
        disp: usize,
        dtype: DtypeId,
        value: &[u8],
        compare: &[u8],
        result: &mut [u8],
    ) -> TransportResult<()>;

    fn flush(&self, win: WindowId, rank: usize) -> TransportResult<()>;
    fn flush_local(&self, win: WindowId, rank: usize) -> TransportResult<()>;
    fn flush_all(&self, win: WindowId) -> TransportResult<()>;
    fn flush_local_all(&self, win: WindowId) -> TransportResult<()>;
    fn win_sync(&self, win: WindowId) -> TransportResult<()>;

    fn waitall(&self, reqs: &[Request]) -> TransportResult<()>;
    fn testall(&self, reqs: &[Request]) -> TransportResult<bool>;
    /// Non-blocking progress poke; reports whether a two-sided message
    /// is pending for the caller.
    fn iprobe(&self, comm: CommId) -> TransportResult<bool>;
}

/// Team-scoped collectives. Root-only buffers are passed empty on the
/// other ranks.
#[enum_dispatch]
pub trait TransportColl {
    fn barrier(&self, comm: CommId) -> TransportResult<()>;
    fn bcast(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        buf: &mut [u8],
    ) -> TransportResult<()>;
    fn scatter(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()>;
    fn gather(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()>;
    fn allgather(
        &self,
        comm: CommId,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()>;
    fn allgatherv(
        &self,
        comm: CommId,
        dtype: DtypeId,
        sendcount: usize,
        sendbuf: &[u8],
        recvcounts: &[usize],
        recvdispls: &[usize],
        recvbuf: &mut [u8],
    ) -> TransportResult<()>;
    fn allreduce(
        &self,
        comm: CommId,
        dtype: DtypeId,
        count: usize,
        op: ReduceOp,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()>;
    fn reduce(
        &self,
        comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        op: ReduceOp,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()>;
}

/// Blocking two-sided operations.
#[enum_dispatch]
pub trait TransportP2p {
    fn send(
        &self,
        comm: CommId,
        dest: usize,
        tag: i32,
        dtype: DtypeId,
        count: usize,
        buf: &[u8],
    ) -> TransportResult<()>;
    fn recv(
        &self,
        comm: CommId,
        src: usize,
        tag: i32,
        dtype: DtypeId,
        count: usize,
        buf: &mut [u8],
    ) -> TransportResult<()>;
    #[allow(clippy::too_many_arguments)]
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
    ) -> TransportResult<()>;
}

/// Datatype construction, mirroring contiguous-aggregate commit and
/// release.
#[enum_dispatch]
pub trait TransportTypes {
    fn type_contiguous(&self, count: usize, base: DtypeId) -> TransportResult<DtypeId>;
    fn type_commit(&self, dtype: DtypeId) -> TransportResult<()>;
    fn type_size(&self, dtype: DtypeId) -> usize;
    fn type_free(&self, dtype: DtypeId) -> TransportResult<()>;
}

/// The available transport backends.
#[enum_dispatch(
    TransportComm,
    TransportRdma,
    TransportColl,
    TransportP2p,
    TransportTypes
)]
pub enum Transport {
    /// Single unit in the calling process; every transfer is a local
    /// copy. Intended for single-process development.
    Local(LocalTransport),
    /// Multiple units as threads of one process, for emulating a
    /// distributed environment.
    Threaded(ThreadedTransport),
}

/// Datatype bookkeeping shared by the in-process backends: predefined
/// base types plus derived contiguous aggregates.
pub(crate) struct DtypeTable {
    derived: Mutex<Vec<(DataType, usize)>>,
}

impl DtypeTable {
    pub(crate) fn new() -> DtypeTable {
        DtypeTable {
            derived: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn contiguous(&self, count: usize, base: DtypeId) -> TransportResult<DtypeId> {
        let (base_dt, base_count) = self.resolve(base)?;
        let mut derived = self.derived.lock();
        derived.push((base_dt, base_count * count));
        Ok(DtypeId((DATATYPE_COUNT + derived.len() - 1) as u32))
    }

    /// Base element type and element multiplicity of a handle.
    pub(crate) fn resolve(&self, dtype: DtypeId) -> TransportResult<(DataType, usize)> {
        let idx = dtype.0 as usize;
        if idx < DATATYPE_COUNT {
            Ok((DataType::all()[idx], 1))
        } else {
            self.derived
                .lock()
                .get(idx - DATATYPE_COUNT)
                .copied()
                .ok_or_else(|| TransportError::new("unknown datatype handle"))
        }
    }

    pub(crate) fn size(&self, dtype: DtypeId) -> usize {
        match self.resolve(dtype) {
            Ok((dt, count)) => dt.size() * count,
            Err(_) => 0,
        }
    }
}
