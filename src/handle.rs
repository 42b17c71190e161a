use crate::transport::{Request, WindowId};

/// Opaque token for the in-flight sub-requests of one non-blocking
/// operation.
///
/// A transfer decomposes into at most two transport calls, so a
/// handle carries at most two sub-requests; a handle with none is a
/// completed no-op. `needs_flush` marks operations whose local
/// completion does not imply remote completion: puts and accumulates
/// still owe a flush of the destination, while a get is done once it
/// completed locally.
///
/// Handles are owned exclusively by the caller and must be driven to
/// completion through the wait or test calls; an abandoned handle
/// leaks its sub-requests.
pub struct OpHandle {
    pub(crate) dest: usize,
    pub(crate) window: WindowId,
    pub(crate) needs_flush: bool,
    pub(crate) reqs: Vec<Request>,
}

impl OpHandle {
    pub(crate) fn new(dest: usize, window: WindowId, needs_flush: bool) -> OpHandle {
        OpHandle {
            dest,
            window,
            needs_flush,
            reqs: Vec::with_capacity(2),
        }
    }
}

impl std::fmt::Debug for OpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OpHandle {{ dest: {}, win: {:?}, needs_flush: {}, reqs: {} }}",
            self.dest,
            self.window,
            self.needs_flush,
            self.reqs.len()
        )
    }
}
