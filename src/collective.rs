use crate::datatype::{Element, ReduceOp};
use crate::error::{RuntimeError, RuntimeResult};
use crate::runtime::{transport_inval, Runtime};
use crate::team::TEAM_ALL;
use crate::transport::{CommId, TransportColl, TransportP2p};

use tracing::{debug, error, trace};

/// Tag reserved for the subset rendezvous, distinct from any tag the
/// runtime passes through for user messages.
const SYNC_UNITS_TAG: i32 = 10016;

fn as_bytes<T>(slice: &[T]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(slice.as_ptr() as *const u8, std::mem::size_of_val(slice))
    }
}

fn as_bytes_mut<T>(slice: &mut [T]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(
            slice.as_mut_ptr() as *mut u8,
            std::mem::size_of_val(slice),
        )
    }
}

impl Runtime {
    fn team_comm(&self, team_id: u16) -> RuntimeResult<(CommId, usize, u16)> {
        self.with_team(team_id, |team| Ok((team.comm, team.size(), team.my_rank)))
    }

    fn check_root(&self, root: u16, size: usize) -> RuntimeResult<()> {
        if root as usize >= size {
            error!("collective ! root {} out of range 0 <= root < {}", root, size);
            return Err(RuntimeError::InvalidArgument);
        }
        Ok(())
    }

    /// Block until every member of the team reached the barrier.
    pub fn barrier(&self, team_id: u16) -> RuntimeResult<()> {
        trace!("barrier() team:{}", team_id);
        let (comm, _, _) = self.team_comm(team_id)?;
        self.transport.barrier(comm).map_err(transport_inval)
    }

    /// Broadcast `buf` from the team rank `root` to every member.
    pub fn broadcast<T: Element>(
        &self,
        buf: &mut [T],
        root: u16,
        team_id: u16,
    ) -> RuntimeResult<()> {
        trace!(
            "broadcast() root:{} team:{} nelem:{}",
            root,
            team_id,
            buf.len()
        );
        let (comm, size, _) = self.team_comm(team_id)?;
        self.check_root(root, size)?;

        let esize = self.types.size(T::DTYPE);
        let nelem = buf.len();
        let chunk = self.types.max_contig_elements();
        let nchunks = nelem / chunk;
        let remainder = nelem % chunk;
        let bytes = as_bytes_mut(buf);
        let mut off = 0;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            self.transport
                .bcast(
                    comm,
                    root as usize,
                    self.types.chunk(T::DTYPE),
                    nchunks,
                    &mut bytes[off..off + len],
                )
                .map_err(transport_inval)?;
            off += len;
        }
        if remainder > 0 {
            let len = remainder * esize;
            self.transport
                .bcast(
                    comm,
                    root as usize,
                    self.types.base(T::DTYPE),
                    remainder,
                    &mut bytes[off..off + len],
                )
                .map_err(transport_inval)?;
        }
        Ok(())
    }

    /// Distribute `recv.len()` elements to each member from the
    /// root's send buffer, in team-rank order. `send` is only read on
    /// the root.
    pub fn scatter<T: Element>(
        &self,
        send: Option<&[T]>,
        recv: &mut [T],
        root: u16,
        team_id: u16,
    ) -> RuntimeResult<()> {
        let (comm, size, my_rank) = self.team_comm(team_id)?;
        self.check_root(root, size)?;

        let esize = self.types.size(T::DTYPE);
        let nelem = recv.len();
        let send_bytes = match send {
            Some(s) if my_rank == root => {
                if s.len() < nelem * size {
                    error!("scatter ! send buffer smaller than nelem * team size");
                    return Err(RuntimeError::InvalidArgument);
                }
                as_bytes(s)
            }
            None if my_rank == root => {
                error!("scatter ! missing send buffer on root");
                return Err(RuntimeError::InvalidArgument);
            }
            _ => &[],
        };

        let chunk = self.types.max_contig_elements();
        let nchunks = nelem / chunk;
        let remainder = nelem % chunk;
        let recv_bytes = as_bytes_mut(recv);
        let mut send_off = 0;
        let mut recv_off = 0;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            let send_part = if my_rank == root {
                &send_bytes[send_off..send_off + len * size]
            } else {
                &[]
            };
            self.transport
                .scatter(
                    comm,
                    root as usize,
                    self.types.chunk(T::DTYPE),
                    nchunks,
                    send_part,
                    &mut recv_bytes[recv_off..recv_off + len],
                )
                .map_err(transport_inval)?;
            send_off += len * size;
            recv_off += len;
        }
        if remainder > 0 {
            let len = remainder * esize;
            let send_part = if my_rank == root {
                &send_bytes[send_off..send_off + len * size]
            } else {
                &[]
            };
            self.transport
                .scatter(
                    comm,
                    root as usize,
                    self.types.base(T::DTYPE),
                    remainder,
                    send_part,
                    &mut recv_bytes[recv_off..recv_off + len],
                )
                .map_err(transport_inval)?;
        }
        Ok(())
    }

    /// Collect `send.len()` elements from every member into the
    /// root's receive buffer, in team-rank order. `recv` is only
    /// written on the root.
    pub fn gather<T: Element>(
        &self,
        send: &[T],
        recv: Option<&mut [T]>,
        root: u16,
        team_id: u16,
    ) -> RuntimeResult<()> {
        trace!("gather() team:{} nelem:{}", team_id, send.len());
        let (comm, size, my_rank) = self.team_comm(team_id)?;
        self.check_root(root, size)?;

        let esize = self.types.size(T::DTYPE);
        let nelem = send.len();
        let recv_bytes: &mut [u8] = match recv {
            Some(r) if my_rank == root => {
                if r.len() < nelem * size {
                    error!("gather ! receive buffer smaller than nelem * team size");
                    return Err(RuntimeError::InvalidArgument);
                }
                as_bytes_mut(r)
            }
            None if my_rank == root => {
                error!("gather ! missing receive buffer on root");
                return Err(RuntimeError::InvalidArgument);
            }
            _ => &mut [],
        };

        let chunk = self.types.max_contig_elements();
        let nchunks = nelem / chunk;
        let remainder = nelem % chunk;
        let send_bytes = as_bytes(send);
        let mut send_off = 0;
        let mut recv_off = 0;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            let recv_part: &mut [u8] = if my_rank == root {
                &mut recv_bytes[recv_off..recv_off + len * size]
            } else {
                &mut []
            };
            self.transport
                .gather(
                    comm,
                    root as usize,
                    self.types.chunk(T::DTYPE),
                    nchunks,
                    &send_bytes[send_off..send_off + len],
                    recv_part,
                )
                .map_err(transport_inval)?;
            send_off += len;
            recv_off += len * size;
        }
        if remainder > 0 {
            let len = remainder * esize;
            let recv_part: &mut [u8] = if my_rank == root {
                &mut recv_bytes[recv_off..recv_off + len * size]
            } else {
                &mut []
            };
            self.transport
                .gather(
                    comm,
                    root as usize,
                    self.types.base(T::DTYPE),
                    remainder,
                    &send_bytes[send_off..send_off + len],
                    recv_part,
                )
                .map_err(transport_inval)?;
        }
        Ok(())
    }

    /// Every member receives every member's `send` contribution, in
    /// team-rank order. `recv` holds `send.len()` elements per
    /// member.
    pub fn allgather<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        team_id: u16,
    ) -> RuntimeResult<()> {
        trace!("allgather() team:{} nelem:{}", team_id, send.len());
        let (comm, size, _) = self.team_comm(team_id)?;

        let esize = self.types.size(T::DTYPE);
        let nelem = send.len();
        if recv.len() < nelem * size {
            error!("allgather ! receive buffer smaller than nelem * team size");
            return Err(RuntimeError::InvalidArgument);
        }

        let chunk = self.types.max_contig_elements();
        let nchunks = nelem / chunk;
        let remainder = nelem % chunk;
        let send_bytes = as_bytes(send);
        let recv_bytes = as_bytes_mut(recv);
        let mut send_off = 0;
        let mut recv_off = 0;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            self.transport
                .allgather(
                    comm,
                    self.types.chunk(T::DTYPE),
                    nchunks,
                    &send_bytes[send_off..send_off + len],
                    &mut recv_bytes[recv_off..recv_off + len * size],
                )
                .map_err(transport_inval)?;
            send_off += len;
            recv_off += len * size;
        }
        if remainder > 0 {
            let len = remainder * esize;
            self.transport
                .allgather(
                    comm,
                    self.types.base(T::DTYPE),
                    remainder,
                    &send_bytes[send_off..send_off + len],
                    &mut recv_bytes[recv_off..recv_off + len * size],
                )
                .map_err(transport_inval)?;
        }
        Ok(())
    }

    /// Variable-count allgather: member `r` contributes `send.len()`
    /// elements placed at `recvdispls[r]` in every member's receive
    /// buffer. Counts and displacements are bounded by the per-call
    /// element limit; this collective is not chunked.
    pub fn allgatherv<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        recvcounts: &[usize],
        recvdispls: &[usize],
        team_id: u16,
    ) -> RuntimeResult<()> {
        trace!("allgatherv() team:{} nsendelem:{}", team_id, send.len());
        let (comm, size, _) = self.team_comm(team_id)?;

        let chunk = self.types.max_contig_elements();
        if send.len() > chunk {
            error!("allgatherv ! failed: nsendelem ({}) over limit", send.len());
            return Err(RuntimeError::InvalidArgument);
        }
        if recvcounts.len() != size || recvdispls.len() != size {
            error!("allgatherv ! counts and displacements must cover the team");
            return Err(RuntimeError::InvalidArgument);
        }
        for r in 0..size {
            if recvcounts[r] > chunk || recvdispls[r] > chunk {
                error!(
                    "allgatherv ! failed: nrecvcounts[{}] ({}) or recvdispls[{}] ({}) over limit",
                    r, recvcounts[r], r, recvdispls[r]
                );
                return Err(RuntimeError::InvalidArgument);
            }
            if recvdispls[r] + recvcounts[r] > recv.len() {
                error!("allgatherv ! receive buffer too small for rank {}", r);
                return Err(RuntimeError::InvalidArgument);
            }
        }

        self.transport
            .allgatherv(
                comm,
                self.types.base(T::DTYPE),
                send.len(),
                as_bytes(send),
                recvcounts,
                recvdispls,
                as_bytes_mut(recv),
            )
            .map_err(transport_inval)
    }

    /// Element-wise reduction of every member's `send` into every
    /// member's `recv`. Not chunked: reduction operators over chunks
    /// do not compose, so `nelem` is bounded by the per-call limit.
    pub fn allreduce<T: Element>(
        &self,
        send: &[T],
        recv: &mut [T],
        op: ReduceOp,
        team_id: u16,
    ) -> RuntimeResult<()> {
        if send.len() > self.types.max_contig_elements() {
            error!("allreduce ! failed: nelem ({}) over limit", send.len());
            return Err(RuntimeError::InvalidArgument);
        }
        if recv.len() < send.len() {
            error!("allreduce ! receive buffer smaller than nelem");
            return Err(RuntimeError::InvalidArgument);
        }
        let (comm, _, _) = self.team_comm(team_id)?;
        self.transport
            .allreduce(
                comm,
                self.types.base(T::DTYPE),
                send.len(),
                op,
                as_bytes(send),
                as_bytes_mut(recv),
            )
            .map_err(transport_inval)
    }

    /// Element-wise reduction into the root's `recv` only. Not
    /// chunked, like [`Runtime::allreduce`].
    pub fn reduce<T: Element>(
        &self,
        send: &[T],
        recv: Option<&mut [T]>,
        op: ReduceOp,
        root: u16,
        team_id: u16,
    ) -> RuntimeResult<()> {
        if send.len() > self.types.max_contig_elements() {
            error!("reduce ! failed: nelem ({}) over limit", send.len());
            return Err(RuntimeError::InvalidArgument);
        }
        let (comm, size, my_rank) = self.team_comm(team_id)?;
        self.check_root(root, size)?;
        let recv_bytes: &mut [u8] = match recv {
            Some(r) if my_rank == root => {
                if r.len() < send.len() {
                    error!("reduce ! receive buffer smaller than nelem");
                    return Err(RuntimeError::InvalidArgument);
                }
                as_bytes_mut(r)
            }
            None if my_rank == root => {
                error!("reduce ! missing receive buffer on root");
                return Err(RuntimeError::InvalidArgument);
            }
            _ => &mut [],
        };
        self.transport
            .reduce(
                comm,
                root as usize,
                self.types.base(T::DTYPE),
                send.len(),
                op,
                as_bytes(send),
                recv_bytes,
            )
            .map_err(transport_inval)
    }

    /// Blocking send to a unit of the all-units team. Tags are opaque
    /// and passed through to the transport.
    pub fn send<T: Element>(&self, buf: &[T], tag: i32, unit: u16) -> RuntimeResult<()> {
        if buf.len() > self.types.max_contig_elements() {
            error!("send ! failed: nelem ({}) over limit", buf.len());
            return Err(RuntimeError::InvalidArgument);
        }
        let (comm, size, _) = self.team_comm(TEAM_ALL)?;
        if unit as usize >= size {
            error!("send ! failed: unitid out of range 0 <= {} < {}", unit, size);
            return Err(RuntimeError::InvalidArgument);
        }
        self.transport
            .send(
                comm,
                unit as usize,
                tag,
                self.types.base(T::DTYPE),
                buf.len(),
                as_bytes(buf),
            )
            .map_err(transport_inval)
    }

    /// Blocking receive from a unit of the all-units team.
    pub fn recv<T: Element>(&self, buf: &mut [T], tag: i32, unit: u16) -> RuntimeResult<()> {
        if buf.len() > self.types.max_contig_elements() {
            error!("recv ! failed: nelem ({}) over limit", buf.len());
            return Err(RuntimeError::InvalidArgument);
        }
        let (comm, size, _) = self.team_comm(TEAM_ALL)?;
        if unit as usize >= size {
            error!("recv ! failed: unitid out of range 0 <= {} < {}", unit, size);
            return Err(RuntimeError::InvalidArgument);
        }
        self.transport
            .recv(
                comm,
                unit as usize,
                tag,
                self.types.base(T::DTYPE),
                buf.len(),
                as_bytes_mut(buf),
            )
            .map_err(transport_inval)
    }

    /// Combined blocking send and receive on the all-units team.
    pub fn sendrecv<T: Element>(
        &self,
        sendbuf: &[T],
        send_tag: i32,
        dest: u16,
        recvbuf: &mut [T],
        recv_tag: i32,
        src: u16,
    ) -> RuntimeResult<()> {
        let chunk = self.types.max_contig_elements();
        if sendbuf.len() > chunk || recvbuf.len() > chunk {
            error!(
                "sendrecv ! failed: nelem ({}, {}) over limit",
                sendbuf.len(),
                recvbuf.len()
            );
            return Err(RuntimeError::InvalidArgument);
        }
        let (comm, size, _) = self.team_comm(TEAM_ALL)?;
        if dest as usize >= size || src as usize >= size {
            error!("sendrecv ! failed: unitid out of range");
            return Err(RuntimeError::InvalidArgument);
        }
        self.transport
            .sendrecv(
                comm,
                dest as usize,
                send_tag,
                self.types.base(T::DTYPE),
                sendbuf.len(),
                as_bytes(sendbuf),
                src as usize,
                recv_tag,
                self.types.base(T::DTYPE),
                recvbuf.len(),
                as_bytes_mut(recvbuf),
            )
            .map_err(transport_inval)
    }

    /// Two-phase rendezvous over a subset of the all-units team.
    ///
    /// Units outside the subset return immediately. The smallest
    /// participating unit acts as root: it first receives one byte
    /// from every other participant, then answers each of them. On
    /// return every participant knows every other one reached the
    /// call; no flush of prior one-sided operations is implied.
    pub fn sync_units(&self, units: &[u16]) -> RuntimeResult<()> {
        let me = self.my_unit();
        if !units.contains(&me) {
            return Ok(());
        }
        let num = self.num_units();
        for &u in units {
            if u as usize >= num {
                error!("sync_units ! failed: unitid out of range 0 <= {} < {}", u, num);
                return Err(RuntimeError::InvalidArgument);
            }
        }
        let root = *units.iter().min().expect("subset contains the caller");
        debug!("sync_units() root:{} participants:{}", root, units.len());

        let mut buffer = [0u8; 1];
        if me == root {
            for &u in units {
                if u != root {
                    self.recv::<u8>(&mut buffer, SYNC_UNITS_TAG, u)?;
                }
            }
            for &u in units {
                if u != root {
                    self.send::<u8>(&buffer, SYNC_UNITS_TAG, u)?;
                }
            }
        } else {
            self.send::<u8>(&buffer, SYNC_UNITS_TAG, root)?;
            self.recv::<u8>(&mut buffer, SYNC_UNITS_TAG, root)?;
        }
        debug!("sync_units > finished");
        Ok(())
    }
}
