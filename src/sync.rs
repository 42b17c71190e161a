use crate::error::{RuntimeError, RuntimeResult};
use crate::gptr::GlobalPtr;
use crate::handle::OpHandle;
use crate::runtime::{transport_inval, Runtime};
use crate::transport::{CommId, Request, TransportRdma, WindowId};

use tracing::{debug, error};

impl Runtime {
    // window, target transport rank and progress communicator a
    // pointer's flushes act on
    fn flush_target(&self, gptr: GlobalPtr) -> RuntimeResult<(WindowId, usize, CommId)> {
        self.with_team(gptr.team_id, |team| {
            let rank = gptr.unit_id as usize;
            if rank >= team.size() {
                error!(
                    "flush ! failed: unitid out of range 0 <= {} < {}",
                    rank,
                    team.size()
                );
                return Err(RuntimeError::InvalidArgument);
            }
            if gptr.segment_id != 0 {
                Ok((team.window, rank, team.comm))
            } else {
                let global = team
                    .global_unit(gptr.unit_id)
                    .ok_or(RuntimeError::InvalidArgument)?;
                Ok((self.local_window, global as usize, crate::transport::COMM_WORLD))
            }
        })
    }

    /// Force remote completion of all writes this unit issued to
    /// `gptr`'s unit on the window behind the pointer.
    pub fn flush(&self, gptr: GlobalPtr) -> RuntimeResult<()> {
        debug!(
            "flush() gptr: unitid:{} offset:{} segid:{} teamid:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id
        );
        let (window, rank, comm) = self.flush_target(gptr)?;
        if self.transport.flush(window, rank).is_err() {
            error!("flush ! transport flush failed");
            return Err(RuntimeError::Other);
        }
        if self.transport.win_sync(window).is_err() {
            error!("flush ! window sync failed");
            return Err(RuntimeError::Other);
        }
        // poke transport progress
        let _ = self.transport.iprobe(comm);
        debug!("flush > finished");
        Ok(())
    }

    /// Force remote completion of this unit's writes to every member
    /// on the window behind the pointer.
    pub fn flush_all(&self, gptr: GlobalPtr) -> RuntimeResult<()> {
        debug!(
            "flush_all() gptr: unitid:{} offset:{} segid:{} teamid:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id
        );
        let (window, comm) = self.with_team(gptr.team_id, |team| {
            if gptr.segment_id != 0 {
                Ok((team.window, team.comm))
            } else {
                Ok((self.local_window, crate::transport::COMM_WORLD))
            }
        })?;
        if self.transport.flush_all(window).is_err() {
            error!("flush_all ! transport flush failed");
            return Err(RuntimeError::Other);
        }
        if self.transport.win_sync(window).is_err() {
            error!("flush_all ! window sync failed");
            return Err(RuntimeError::Other);
        }
        let _ = self.transport.iprobe(comm);
        debug!("flush_all > finished");
        Ok(())
    }

    /// Wait until this unit's transfers to `gptr`'s unit completed
    /// locally: source buffers are reusable, remote visibility is not
    /// implied.
    pub fn flush_local(&self, gptr: GlobalPtr) -> RuntimeResult<()> {
        debug!(
            "flush_local() gptr: unitid:{} offset:{} segid:{} teamid:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id
        );
        let (window, rank, comm) = self.flush_target(gptr)?;
        if self.transport.flush_local(window, rank).is_err() {
            error!("flush_local ! transport flush failed");
            return Err(RuntimeError::Other);
        }
        let _ = self.transport.iprobe(comm);
        debug!("flush_local > finished");
        Ok(())
    }

    /// Local completion of this unit's transfers to every member on
    /// the window behind the pointer.
    pub fn flush_local_all(&self, gptr: GlobalPtr) -> RuntimeResult<()> {
        debug!(
            "flush_local_all() gptr: unitid:{} offset:{} segid:{} teamid:{}",
            gptr.unit_id, gptr.offset, gptr.segment_id, gptr.team_id
        );
        let (window, comm) = self.with_team(gptr.team_id, |team| {
            if gptr.segment_id != 0 {
                Ok((team.window, team.comm))
            } else {
                Ok((self.local_window, crate::transport::COMM_WORLD))
            }
        })?;
        if self.transport.flush_local_all(window).is_err() {
            error!("flush_local_all ! transport flush failed");
            return Err(RuntimeError::Other);
        }
        let _ = self.transport.iprobe(comm);
        debug!("flush_local_all > finished");
        Ok(())
    }

    /// Wait for local and remote completion of the handle's
    /// operation, then release it: the slot is left `None`. A `None`
    /// slot is a completed no-op.
    pub fn wait(&self, handle: &mut Option<OpHandle>) -> RuntimeResult<()> {
        if let Some(h) = handle.as_ref() {
            debug!("wait() handle {:?}", h);
            if !h.reqs.is_empty() {
                self.transport.waitall(&h.reqs).map_err(transport_inval)?;
                if h.needs_flush {
                    self.transport
                        .flush(h.window, h.dest)
                        .map_err(transport_inval)?;
                }
            }
            *handle = None;
        }
        debug!("wait > finished");
        Ok(())
    }

    /// Wait for local completion only, then release the handle. For
    /// writes, remote completion still requires a flush.
    pub fn wait_local(&self, handle: &mut Option<OpHandle>) -> RuntimeResult<()> {
        if let Some(h) = handle.as_ref() {
            debug!("wait_local() handle {:?}", h);
            if !h.reqs.is_empty() {
                self.transport.waitall(&h.reqs).map_err(transport_inval)?;
            }
            *handle = None;
        }
        Ok(())
    }

    /// Wait for local and remote completion of every handle in the
    /// slice; all slots are left `None`.
    pub fn waitall(&self, handles: &mut [Option<OpHandle>]) -> RuntimeResult<()> {
        if handles.is_empty() {
            debug!("waitall > number of handles = 0");
            return Ok(());
        }
        let reqs: Vec<Request> = handles
            .iter()
            .flatten()
            .flat_map(|h| h.reqs.iter().copied())
            .collect();
        debug!(
            "waitall: {} requests from {} handles",
            reqs.len(),
            handles.len()
        );
        if !reqs.is_empty() {
            self.transport.waitall(&reqs).map_err(transport_inval)?;
        }
        for h in handles.iter().flatten() {
            if h.needs_flush {
                self.transport
                    .flush(h.window, h.dest)
                    .map_err(transport_inval)?;
            }
        }
        for slot in handles.iter_mut() {
            *slot = None;
        }
        debug!("waitall > finished");
        Ok(())
    }

    /// Wait for local completion of every handle in the slice.
    pub fn waitall_local(&self, handles: &mut [Option<OpHandle>]) -> RuntimeResult<()> {
        if handles.is_empty() {
            return Ok(());
        }
        let reqs: Vec<Request> = handles
            .iter()
            .flatten()
            .flat_map(|h| h.reqs.iter().copied())
            .collect();
        debug!(
            "waitall_local: {} requests from {} handles",
            reqs.len(),
            handles.len()
        );
        if !reqs.is_empty() {
            self.transport.waitall(&reqs).map_err(transport_inval)?;
        }
        for slot in handles.iter_mut() {
            *slot = None;
        }
        Ok(())
    }

    /// Check local completion without blocking. A finished handle is
    /// released and the slot set to `None`; an unfinished one stays
    /// usable.
    pub fn test_local(&self, handle: &mut Option<OpHandle>) -> RuntimeResult<bool> {
        let Some(h) = handle.as_ref() else {
            return Ok(true);
        };
        if h.reqs.is_empty() {
            *handle = None;
            return Ok(true);
        }
        let finished = self.transport.testall(&h.reqs).map_err(|e| {
            error!("test_local ! transport test failed: {}", e);
            RuntimeError::Other
        })?;
        if finished {
            *handle = None;
        }
        Ok(finished)
    }

    /// Check local completion of a whole set of handles without
    /// blocking; they are released only when all finished together.
    pub fn testall_local(&self, handles: &mut [Option<OpHandle>]) -> RuntimeResult<bool> {
        if handles.is_empty() {
            return Ok(true);
        }
        let reqs: Vec<Request> = handles
            .iter()
            .flatten()
            .flat_map(|h| h.reqs.iter().copied())
            .collect();
        if reqs.is_empty() {
            for slot in handles.iter_mut() {
                *slot = None;
            }
            return Ok(true);
        }
        let finished = self.transport.testall(&reqs).map_err(|e| {
            error!("testall_local ! transport test failed: {}", e);
            RuntimeError::Other
        })?;
        if finished {
            for slot in handles.iter_mut() {
                *slot = None;
            }
        }
        Ok(finished)
    }
}
