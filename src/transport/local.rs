use crate::datatype::{reduce_in_place, ReduceOp};
use crate::transport::{
    CommId, DtypeId, DtypeTable, HwInfo, Request, SharedRank, TransportColl, TransportComm,
    TransportError, TransportP2p, TransportRdma, TransportResult, TransportTypes, WindowId,
};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct Msg {
    src: usize,
    tag: i32,
    bytes: Vec<u8>,
}

/// The single-unit backend: the whole job is one process, every
/// transfer degenerates to a local copy and every collective to an
/// identity operation. Two-sided messages loop back through a
/// self-mailbox.
pub struct LocalTransport {
    dtypes: DtypeTable,
    comms: Mutex<Vec<Vec<usize>>>,
    windows: Mutex<HashMap<u32, Box<[u8]>>>,
    next_win: Mutex<u32>,
    mailbox: Mutex<Vec<Msg>>,
    req_count: AtomicU64,
    max_contig: usize,
}

impl LocalTransport {
    pub fn new() -> LocalTransport {
        LocalTransport {
            dtypes: DtypeTable::new(),
            comms: Mutex::new(vec![vec![0]]),
            windows: Mutex::new(HashMap::new()),
            next_win: Mutex::new(0),
            mailbox: Mutex::new(Vec::new()),
            req_count: AtomicU64::new(0),
            max_contig: i32::MAX as usize,
        }
    }

    fn check_rank(&self, rank: usize) -> TransportResult<()> {
        if rank != 0 {
            return Err(TransportError::new("rank out of range for local backend"));
        }
        Ok(())
    }

    fn byte_len(&self, dtype: DtypeId, count: usize) -> usize {
        self.dtypes.size(dtype) * count
    }

    fn window_span(&self, win: WindowId, disp: usize, len: usize) -> TransportResult<usize> {
        let windows = self.windows.lock();
        let buf = windows
            .get(&win.0)
            .ok_or_else(|| TransportError::new("unknown window"))?;
        if disp + len > buf.len() {
            return Err(TransportError::new("window access out of range"));
        }
        Ok(buf.as_ptr() as usize + disp)
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        LocalTransport::new()
    }
}

impl TransportComm for LocalTransport {
    fn my_rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn comm_create(&self, members: &[usize]) -> TransportResult<CommId> {
        if members != [0] {
            return Err(TransportError::new("invalid member set for local backend"));
        }
        let mut comms = self.comms.lock();
        comms.push(members.to_vec());
        Ok(CommId((comms.len() - 1) as u32))
    }

    fn comm_free(&self, comm: CommId) -> TransportResult<()> {
        if (comm.0 as usize) < self.comms.lock().len() {
            Ok(())
        } else {
            Err(TransportError::new("unknown communicator"))
        }
    }

    fn comm_size(&self, _comm: CommId) -> usize {
        1
    }

    fn comm_rank(&self, _comm: CommId) -> Option<usize> {
        Some(0)
    }

    fn shared_group(&self, _comm: CommId) -> Vec<SharedRank> {
        vec![SharedRank::Local(0)]
    }

    fn hwinfo(&self) -> HwInfo {
        HwInfo {
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
            num_modules: 1,
            num_numa: 1,
            num_cores: std::thread::available_parallelism()
                .map(|n| n.get() as u16)
                .unwrap_or(1),
        }
    }

    fn max_contig_elements(&self) -> usize {
        self.max_contig
    }
}

impl TransportRdma for LocalTransport {
    fn win_allocate(&self, _comm: CommId, size: usize) -> TransportResult<WindowId> {
        let mut next = self.next_win.lock();
        let id = *next;
        *next += 1;
        self.windows
            .lock()
            .insert(id, vec![0u8; size].into_boxed_slice());
        Ok(WindowId(id))
    }

    fn win_free(&self, win: WindowId) -> TransportResult<()> {
        self.windows
            .lock()
            .remove(&win.0)
            .map(|_| ())
            .ok_or_else(|| TransportError::new("unknown window"))
    }

    fn win_base(&self, win: WindowId) -> usize {
        self.windows
            .lock()
            .get(&win.0)
            .map(|buf| buf.as_ptr() as usize)
            .unwrap_or(0)
    }

    fn shmem_base(&self, win: WindowId, rank: usize) -> Option<usize> {
        if rank == 0 {
            Some(self.win_base(win))
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
        self.check_rank(rank)?;
        let len = self.byte_len(dtype, count);
        let src = self.window_span(win, disp, len)?;
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
        self.check_rank(rank)?;
        let len = self.byte_len(dtype, count);
        let dst = self.window_span(win, disp, len)?;
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
        Ok(Request(self.req_count.fetch_add(1, Ordering::Relaxed)))
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
        Ok(Request(self.req_count.fetch_add(1, Ordering::Relaxed)))
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
        self.check_rank(rank)?;
        let (base, multiplicity) = self.dtypes.resolve(dtype)?;
        let len = base.size() * multiplicity * count;
        // lock held across the whole update, this is the backend's
        // atomicity unit
        let windows = self.windows.lock();
        let buf = windows
            .get(&win.0)
            .ok_or_else(|| TransportError::new("unknown window"))?;
        if disp + len > buf.len() {
            return Err(TransportError::new("window access out of range"));
        }
        let target = unsafe {
            std::slice::from_raw_parts_mut(buf.as_ptr().add(disp) as *mut u8, len)
        };
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
        self.check_rank(rank)?;
        let (base, _) = self.dtypes.resolve(dtype)?;
        let len = base.size();
        let windows = self.windows.lock();
        let buf = windows
            .get(&win.0)
            .ok_or_else(|| TransportError::new("unknown window"))?;
        if disp + len > buf.len() {
            return Err(TransportError::new("window access out of range"));
        }
        let target = unsafe {
            std::slice::from_raw_parts_mut(buf.as_ptr().add(disp) as *mut u8, len)
        };
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
        self.check_rank(rank)?;
        let (base, _) = self.dtypes.resolve(dtype)?;
        let len = base.size();
        let windows = self.windows.lock();
        let buf = windows
            .get(&win.0)
            .ok_or_else(|| TransportError::new("unknown window"))?;
        if disp + len > buf.len() {
            return Err(TransportError::new("window access out of range"));
        }
        let target = unsafe {
            std::slice::from_raw_parts_mut(buf.as_ptr().add(disp) as *mut u8, len)
        };
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

    fn iprobe(&self, _comm: CommId) -> TransportResult<bool> {
        Ok(!self.mailbox.lock().is_empty())
    }
}

impl TransportColl for LocalTransport {
    fn barrier(&self, _comm: CommId) -> TransportResult<()> {
        Ok(())
    }

    fn bcast(
        &self,
        _comm: CommId,
        root: usize,
        _dtype: DtypeId,
        _count: usize,
        _buf: &mut [u8],
    ) -> TransportResult<()> {
        self.check_rank(root)
    }

    fn scatter(
        &self,
        _comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        self.check_rank(root)?;
        let len = self.byte_len(dtype, count);
        recvbuf[..len].copy_from_slice(&sendbuf[..len]);
        Ok(())
    }

    fn gather(
        &self,
        _comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        self.check_rank(root)?;
        let len = self.byte_len(dtype, count);
        recvbuf[..len].copy_from_slice(&sendbuf[..len]);
        Ok(())
    }

    fn allgather(
        &self,
        _comm: CommId,
        dtype: DtypeId,
        count: usize,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let len = self.byte_len(dtype, count);
        recvbuf[..len].copy_from_slice(&sendbuf[..len]);
        Ok(())
    }

    fn allgatherv(
        &self,
        _comm: CommId,
        dtype: DtypeId,
        sendcount: usize,
        sendbuf: &[u8],
        recvcounts: &[usize],
        recvdispls: &[usize],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        if recvcounts.len() != 1 || recvcounts[0] != sendcount {
            return Err(TransportError::new("allgatherv count mismatch"));
        }
        let esize = self.dtypes.size(dtype);
        let len = sendcount * esize;
        let off = recvdispls[0] * esize;
        recvbuf[off..off + len].copy_from_slice(&sendbuf[..len]);
        Ok(())
    }

    fn allreduce(
        &self,
        _comm: CommId,
        dtype: DtypeId,
        count: usize,
        _op: ReduceOp,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        let len = self.byte_len(dtype, count);
        recvbuf[..len].copy_from_slice(&sendbuf[..len]);
        Ok(())
    }

    fn reduce(
        &self,
        _comm: CommId,
        root: usize,
        dtype: DtypeId,
        count: usize,
        _op: ReduceOp,
        sendbuf: &[u8],
        recvbuf: &mut [u8],
    ) -> TransportResult<()> {
        self.check_rank(root)?;
        let len = self.byte_len(dtype, count);
        recvbuf[..len].copy_from_slice(&sendbuf[..len]);
        Ok(())
    }
}

impl TransportP2p for LocalTransport {
    fn send(
        &self,
        _comm: CommId,
        dest: usize,
        tag: i32,
        dtype: DtypeId,
        count: usize,
        buf: &[u8],
    ) -> TransportResult<()> {
        self.check_rank(dest)?;
        let len = self.byte_len(dtype, count);
        self.mailbox.lock().push(Msg {
            src: 0,
            tag,
            bytes: buf[..len].to_vec(),
        });
        Ok(())
    }

    fn recv(
        &self,
        _comm: CommId,
        src: usize,
        tag: i32,
        dtype: DtypeId,
        count: usize,
        buf: &mut [u8],
    ) -> TransportResult<()> {
        self.check_rank(src)?;
        let len = self.byte_len(dtype, count);
        let mut mailbox = self.mailbox.lock();
        // a matching message must already be queued, a single unit
        // cannot block on itself
        let pos = mailbox
            .iter()
            .position(|m| m.src == src && m.tag == tag)
            .ok_or_else(|| TransportError::new("self receive without a queued message"))?;
        let msg = mailbox.remove(pos);
        buf[..len].copy_from_slice(&msg.bytes[..len]);
        Ok(())
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

impl TransportTypes for LocalTransport {
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
