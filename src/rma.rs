use crate::datatype::{DataType, Element, ReduceOp};
use crate::env_var::config;
use crate::error::{RuntimeError, RuntimeResult};
use crate::gptr::GlobalPtr;
use crate::handle::OpHandle;
use crate::runtime::{transport_inval, Runtime};
use crate::transport::{TransportRdma, WindowId};

use tracing::{debug, error, trace};

/// Where a global pointer lands after team, segment and fast-path
/// resolution.
pub(crate) struct RmaTarget {
    pub(crate) window: WindowId,
    /// Transport rank of the target within the window's group.
    pub(crate) rank: usize,
    /// Byte displacement of the addressed location within the
    /// target's window.
    pub(crate) disp: u64,
    /// Address of the location in the calling unit's own address
    /// space when the target shares memory with it.
    pub(crate) shmem_addr: Option<usize>,
    /// Address of the location when the target is the calling unit
    /// itself.
    pub(crate) self_addr: Option<usize>,
}

impl Runtime {
    /// Resolve a global pointer against the team registry: validates
    /// the team and unit, adds the segment displacement, and works
    /// out the direct-copy opportunities.
    pub(crate) fn resolve_rma(
        &self,
        gptr: GlobalPtr,
        allow_shared: bool,
    ) -> RuntimeResult<RmaTarget> {
        let shared_enabled = allow_shared && config().shared_windows_enabled();
        self.with_team(gptr.team_id, |team| {
            let rank = gptr.unit_id as usize;
            if rank >= team.size() {
                error!(
                    "rma ! failed: unitid out of range 0 <= {} < {}",
                    rank,
                    team.size()
                );
                return Err(RuntimeError::InvalidArgument);
            }
            let seg_id = gptr.segment_id;
            if seg_id != 0 {
                let disp = team.segments.disp(seg_id, gptr.unit_id).ok_or_else(|| {
                    error!("rma ! unbound segment {} in team {}", seg_id, gptr.team_id);
                    RuntimeError::InvalidArgument
                })?;
                let shmem_addr = if shared_enabled
                    && seg_id >= 0
                    && team.sharedmem_tab[rank].is_local()
                {
                    team.segments
                        .shmem_base(seg_id, gptr.unit_id)
                        .map(|base| base + gptr.offset as usize)
                } else {
                    None
                };
                let self_addr = if gptr.unit_id == team.my_rank {
                    Some(
                        self.transport.win_base(team.window)
                            + disp as usize
                            + gptr.offset as usize,
                    )
                } else {
                    None
                };
                Ok(RmaTarget {
                    window: team.window,
                    rank,
                    disp: disp + gptr.offset,
                    shmem_addr,
                    self_addr,
                })
            } else {
                // the local allocation pool lives in the job-wide
                // window, addressed by global unit id
                let global = team
                    .global_unit(gptr.unit_id)
                    .ok_or(RuntimeError::InvalidArgument)?;
                let shmem_addr = if shared_enabled {
                    self.local_shmem_bases[global as usize].map(|base| base + gptr.offset as usize)
                } else {
                    None
                };
                let self_addr = if global == self.my_unit() {
                    Some(self.transport.win_base(self.local_window) + gptr.offset as usize)
                } else {
                    None
                };
                Ok(RmaTarget {
                    window: self.local_window,
                    rank: global as usize,
                    disp: gptr.offset,
                    shmem_addr,
                    self_addr,
                })
            }
        })
    }

    fn chunk_plan(&self, nelem: usize) -> (usize, usize) {
        let chunk = self.types.max_contig_elements();
        (nelem / chunk, nelem % chunk)
    }

    /// Blocking read of `dest.len()` elements at `gptr` into `dest`.
    ///
    /// On return the buffer holds the remote memory as observed at
    /// some instant between call entry and return.
    pub fn get<T: Element>(&self, dest: &mut [T], gptr: GlobalPtr) -> RuntimeResult<()> {
        self.get_bytes(dest.as_mut_ptr() as *mut u8, dest.len(), T::DTYPE, gptr)
    }

    pub(crate) fn get_bytes(
        &self,
        dest: *mut u8,
        nelem: usize,
        dtype: DataType,
        gptr: GlobalPtr,
    ) -> RuntimeResult<()> {
        let esize = self.types.size(dtype);
        let target = self.resolve_rma(gptr, true)?;
        debug!(
            "get() uid:{} o:{} s:{} t:{} nelem:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id, nelem
        );

        if let Some(addr) = target.shmem_addr {
            trace!("get: direct copy of {} bytes", nelem * esize);
            unsafe { std::ptr::copy(addr as *const u8, dest, nelem * esize) };
            return Ok(());
        }
        if let Some(addr) = target.self_addr {
            trace!("get: memcpy nelem:{} from own window", nelem);
            unsafe { std::ptr::copy(addr as *const u8, dest, nelem * esize) };
            return Ok(());
        }

        let chunk = self.types.max_contig_elements();
        let (nchunks, remainder) = self.chunk_plan(nelem);
        let mut reqs = Vec::with_capacity(2);
        let mut disp = target.disp as usize;
        let mut out = dest;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            trace!("get: read (dest {:p}, {} chunks)", out, nchunks);
            let slice = unsafe { std::slice::from_raw_parts_mut(out, len) };
            reqs.push(
                self.transport
                    .rget(
                        target.window,
                        target.rank,
                        disp,
                        self.types.chunk(dtype),
                        nchunks,
                        slice,
                    )
                    .map_err(transport_inval)?,
            );
            disp += len;
            out = unsafe { out.add(len) };
        }
        if remainder > 0 {
            let len = remainder * esize;
            trace!("get: read (dest {:p}, size {})", out, remainder);
            let slice = unsafe { std::slice::from_raw_parts_mut(out, len) };
            reqs.push(
                self.transport
                    .rget(
                        target.window,
                        target.rank,
                        disp,
                        self.types.base(dtype),
                        remainder,
                        slice,
                    )
                    .map_err(transport_inval)?,
            );
        }
        self.transport.waitall(&reqs).map_err(transport_inval)?;
        debug!("get > finished");
        Ok(())
    }

    /// Write `src` to `gptr`, non-blocking at the transport: the
    /// source buffer may be reused on return, but remote visibility
    /// requires a later flush of the target.
    pub fn put<T: Element>(&self, gptr: GlobalPtr, src: &[T]) -> RuntimeResult<()> {
        self.put_bytes(gptr, src.as_ptr() as *const u8, src.len(), T::DTYPE, false)
    }

    /// Write `src` to `gptr` and force remote completion before
    /// returning.
    pub fn put_blocking<T: Element>(&self, gptr: GlobalPtr, src: &[T]) -> RuntimeResult<()> {
        self.put_bytes(gptr, src.as_ptr() as *const u8, src.len(), T::DTYPE, true)
    }

    pub(crate) fn put_bytes(
        &self,
        gptr: GlobalPtr,
        src: *const u8,
        nelem: usize,
        dtype: DataType,
        flush: bool,
    ) -> RuntimeResult<()> {
        let esize = self.types.size(dtype);
        let target = self.resolve_rma(gptr, true)?;
        debug!(
            "put() uid:{} o:{} s:{} t:{} nelem:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id, nelem
        );

        if let Some(addr) = target.shmem_addr {
            trace!("put: direct copy of {} bytes", nelem * esize);
            unsafe { std::ptr::copy(src, addr as *mut u8, nelem * esize) };
            return Ok(());
        }
        if let Some(addr) = target.self_addr {
            trace!("put: memcpy nelem:{} into own window", nelem);
            unsafe { std::ptr::copy(src, addr as *mut u8, nelem * esize) };
            return Ok(());
        }

        let chunk = self.types.max_contig_elements();
        let (nchunks, remainder) = self.chunk_plan(nelem);
        let mut disp = target.disp as usize;
        let mut inp = src;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            trace!("put: write (src {:p}, {} chunks)", inp, nchunks);
            let slice = unsafe { std::slice::from_raw_parts(inp, len) };
            self.transport
                .put(
                    target.window,
                    target.rank,
                    disp,
                    self.types.chunk(dtype),
                    nchunks,
                    slice,
                )
                .map_err(transport_inval)?;
            disp += len;
            inp = unsafe { inp.add(len) };
        }
        if remainder > 0 {
            let len = remainder * esize;
            trace!("put: write (src {:p}, size {})", inp, remainder);
            let slice = unsafe { std::slice::from_raw_parts(inp, len) };
            self.transport
                .put(
                    target.window,
                    target.rank,
                    disp,
                    self.types.base(dtype),
                    remainder,
                    slice,
                )
                .map_err(transport_inval)?;
        }
        if flush {
            self.transport
                .flush(target.window, target.rank)
                .map_err(transport_inval)?;
        }
        debug!("put > finished");
        Ok(())
    }

    /// Element-wise reduction of `values` into the memory at `gptr`.
    ///
    /// Always goes through the transport so concurrent accumulates
    /// stay element-wise atomic; there is no direct-copy path.
    pub fn accumulate<T: Element>(
        &self,
        gptr: GlobalPtr,
        values: &[T],
        op: ReduceOp,
    ) -> RuntimeResult<()> {
        let dtype = T::DTYPE;
        let esize = self.types.size(dtype);
        let nelem = values.len();
        let target = self.resolve_rma(gptr, false)?;
        debug!(
            "accumulate() nelem:{} dtype:{:?} op:{:?} unit:{}",
            nelem, dtype, op, gptr.unit_id
        );

        let chunk = self.types.max_contig_elements();
        let (nchunks, remainder) = self.chunk_plan(nelem);
        let mut disp = target.disp as usize;
        let mut inp = values.as_ptr() as *const u8;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            let slice = unsafe { std::slice::from_raw_parts(inp, len) };
            self.transport
                .accumulate(
                    target.window,
                    target.rank,
                    disp,
                    self.types.chunk(dtype),
                    nchunks,
                    op,
                    slice,
                )
                .map_err(transport_inval)?;
            disp += len;
            inp = unsafe { inp.add(len) };
        }
        if remainder > 0 {
            let len = remainder * esize;
            let slice = unsafe { std::slice::from_raw_parts(inp, len) };
            self.transport
                .accumulate(
                    target.window,
                    target.rank,
                    disp,
                    self.types.base(dtype),
                    remainder,
                    op,
                    slice,
                )
                .map_err(transport_inval)?;
        }
        debug!("accumulate > finished");
        Ok(())
    }

    /// Atomically apply `op` to the single element at `gptr` and
    /// return the value it held before.
    pub fn fetch_and_op<T: Element>(
        &self,
        gptr: GlobalPtr,
        value: &T,
        op: ReduceOp,
    ) -> RuntimeResult<T> {
        let dtype = T::DTYPE;
        let esize = self.types.size(dtype);
        let target = self.resolve_rma(gptr, false)?;
        debug!(
            "fetch_and_op() dtype:{:?} op:{:?} unit:{} offset:{} segid:{}",
            dtype, op, gptr.unit_id, gptr.offset, gptr.segment_id
        );
        let value_bytes =
            unsafe { std::slice::from_raw_parts(value as *const T as *const u8, esize) };
        let mut result = [0u8; 8];
        self.transport
            .fetch_and_op(
                target.window,
                target.rank,
                target.disp as usize,
                self.types.base(dtype),
                op,
                value_bytes,
                &mut result[..esize],
            )
            .map_err(transport_inval)?;
        debug!("fetch_and_op > finished");
        Ok(unsafe { (result.as_ptr() as *const T).read_unaligned() })
    }

    /// Atomic compare-and-swap of the single element at `gptr`:
    /// writes `new` iff the element equals `expected`, and returns
    /// the pre-swap value either way. Integral element types only.
    pub fn compare_and_swap<T: Element>(
        &self,
        gptr: GlobalPtr,
        new: &T,
        expected: &T,
    ) -> RuntimeResult<T> {
        let dtype = T::DTYPE;
        if !dtype.is_integral() {
            error!("compare_and_swap ! failed: only valid on integral types");
            return Err(RuntimeError::InvalidArgument);
        }
        let esize = self.types.size(dtype);
        let target = self.resolve_rma(gptr, false)?;
        trace!(
            "compare_and_swap() dtype:{:?} unit:{} offset:{}",
            dtype,
            gptr.unit_id,
            gptr.offset
        );
        let new_bytes = unsafe { std::slice::from_raw_parts(new as *const T as *const u8, esize) };
        let expected_bytes =
            unsafe { std::slice::from_raw_parts(expected as *const T as *const u8, esize) };
        let mut result = [0u8; 8];
        self.transport
            .compare_and_swap(
                target.window,
                target.rank,
                target.disp as usize,
                self.types.base(dtype),
                new_bytes,
                expected_bytes,
                &mut result[..esize],
            )
            .map_err(transport_inval)?;
        debug!("compare_and_swap > finished");
        Ok(unsafe { (result.as_ptr() as *const T).read_unaligned() })
    }

    /// Non-blocking read. Sub-requests are tracked by the returned
    /// handle instead of being awaited; `None` means the transfer
    /// already completed through the direct-copy path.
    ///
    /// # Safety
    ///
    /// `dest` must stay valid and untouched until the handle has been
    /// waited or tested to completion.
    pub unsafe fn get_handle<T: Element>(
        &self,
        dest: &mut [T],
        gptr: GlobalPtr,
    ) -> RuntimeResult<Option<OpHandle>> {
        let dtype = T::DTYPE;
        let esize = self.types.size(dtype);
        let nelem = dest.len();
        let target = self.resolve_rma(gptr, true)?;
        debug!(
            "get_handle() uid:{} o:{} s:{} t:{} nelem:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id, nelem
        );

        if let Some(addr) = target.shmem_addr {
            std::ptr::copy(addr as *const u8, dest.as_mut_ptr() as *mut u8, nelem * esize);
            return Ok(None);
        }

        let chunk = self.types.max_contig_elements();
        let (nchunks, remainder) = self.chunk_plan(nelem);
        let mut handle = OpHandle::new(target.rank, target.window, false);
        let mut disp = target.disp as usize;
        let mut out = dest.as_mut_ptr() as *mut u8;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            let slice = std::slice::from_raw_parts_mut(out, len);
            handle.reqs.push(
                self.transport
                    .rget(
                        target.window,
                        target.rank,
                        disp,
                        self.types.chunk(dtype),
                        nchunks,
                        slice,
                    )
                    .map_err(transport_inval)?,
            );
            disp += len;
            out = out.add(len);
        }
        if remainder > 0 {
            let len = remainder * esize;
            let slice = std::slice::from_raw_parts_mut(out, len);
            handle.reqs.push(
                self.transport
                    .rget(
                        target.window,
                        target.rank,
                        disp,
                        self.types.base(dtype),
                        remainder,
                        slice,
                    )
                    .map_err(transport_inval)?,
            );
        }
        debug!("get_handle > handle {:?}", handle);
        Ok(Some(handle))
    }

    /// Non-blocking write. The handle owes a flush of the target for
    /// remote completion; `None` means the transfer already completed
    /// through the direct-copy path.
    ///
    /// # Safety
    ///
    /// `src` must stay valid and unmodified until the handle has been
    /// waited to completion.
    pub unsafe fn put_handle<T: Element>(
        &self,
        gptr: GlobalPtr,
        src: &[T],
    ) -> RuntimeResult<Option<OpHandle>> {
        let dtype = T::DTYPE;
        let esize = self.types.size(dtype);
        let nelem = src.len();
        let target = self.resolve_rma(gptr, true)?;
        debug!(
            "put_handle() uid:{} o:{} s:{} t:{} nelem:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id, nelem
        );

        if let Some(addr) = target.shmem_addr {
            std::ptr::copy(src.as_ptr() as *const u8, addr as *mut u8, nelem * esize);
            return Ok(None);
        }

        let chunk = self.types.max_contig_elements();
        let (nchunks, remainder) = self.chunk_plan(nelem);
        let mut handle = OpHandle::new(target.rank, target.window, true);
        let mut disp = target.disp as usize;
        let mut inp = src.as_ptr() as *const u8;
        if nchunks > 0 {
            let len = nchunks * chunk * esize;
            let slice = std::slice::from_raw_parts(inp, len);
            handle.reqs.push(
                self.transport
                    .rput(
                        target.window,
                        target.rank,
                        disp,
                        self.types.chunk(dtype),
                        nchunks,
                        slice,
                    )
                    .map_err(transport_inval)?,
            );
            disp += len;
            inp = inp.add(len);
        }
        if remainder > 0 {
            let len = remainder * esize;
            let slice = std::slice::from_raw_parts(inp, len);
            handle.reqs.push(
                self.transport
                    .rput(
                        target.window,
                        target.rank,
                        disp,
                        self.types.base(dtype),
                        remainder,
                        slice,
                    )
                    .map_err(transport_inval)?,
            );
        }
        debug!("put_handle > handle {:?}", handle);
        Ok(Some(handle))
    }
}
