//! Stratum is a portable one-sided communication substrate for partitioned global address space (PGAS) programs.
//!
//! The runtime exposes a uniform global-pointer abstraction over a message-passing transport:
//! memory allocated collectively by a team of units (processes) is addressed with a [`GlobalPtr`],
//! and blocking or non-blocking one-sided reads, writes and atomics move data between units without
//! involving the target. A segment table per team translates pointers to remote window
//! displacements, transfers are chunked transparently past the transport's per-call element limit,
//! and co-located units short-circuit to direct memory copies. Teams carry a hardware locality
//! tree (node, module, NUMA domain, core) that can be queried, split and regrouped to map work
//! onto the machine.
//!
//! Data moves through one of the transport backends: `Local` for single-process development, or
//! `Threaded` to emulate a multi-unit job inside one process. Distributed backends implement the
//! same transport traits.
//!
//! EXAMPLES
//! --------
//!
//! # Bringing the runtime up on a single unit
//! ```
//! use stratum::{LocalTransport, Runtime, Transport};
//!
//! let runtime = Runtime::init(Transport::Local(LocalTransport::new())).unwrap();
//! assert_eq!(1, runtime.num_units());
//! runtime.finalize().unwrap();
//! ```
//!
//! # One-sided round trip through a collective segment
//! ```
//! use stratum::{DataType, LocalTransport, Runtime, Transport, TEAM_ALL};
//!
//! let runtime = Runtime::init(Transport::Local(LocalTransport::new())).unwrap();
//!
//! // every team member contributes 8 u64 elements
//! let gptr = runtime.team_memalloc(TEAM_ALL, 8, DataType::U64).unwrap();
//!
//! let values: Vec<u64> = (0..8).collect();
//! runtime.put_blocking(gptr, &values).unwrap();
//!
//! let mut readback = vec![0u64; 8];
//! runtime.get(&mut readback, gptr).unwrap();
//! assert_eq!(values, readback);
//!
//! runtime.team_memfree(gptr).unwrap();
//! runtime.finalize().unwrap();
//! ```
//!
//! # Emulating a distributed job with threads
//! ```no_run
//! use stratum::{Runtime, ThreadedFabricBuilder};
//!
//! let fabric = std::sync::Arc::new(ThreadedFabricBuilder::new(4).build());
//! let workers: Vec<_> = (0..4)
//!     .map(|rank| {
//!         let fabric = fabric.clone();
//!         std::thread::spawn(move || {
//!             let runtime = Runtime::init(fabric.transport(rank)).unwrap();
//!             runtime.barrier(stratum::TEAM_ALL).unwrap();
//!             runtime.finalize().unwrap();
//!         })
//!     })
//!     .collect();
//! for w in workers {
//!     w.join().unwrap();
//! }
//! ```

mod collective;
mod datatype;
mod env_var;
mod error;
mod gptr;
mod handle;
mod locality;
mod pool;
mod rma;
mod runtime;
mod segment;
mod sync;
mod team;
pub mod transport;

pub use datatype::{DataType, Element, ReduceOp};
pub use env_var::{config, Config, Switch};
pub use error::{RuntimeError, RuntimeResult};
pub use gptr::GlobalPtr;
pub use handle::OpHandle;
pub use locality::{DomainInfo, DomainTree, Scope};
pub use runtime::Runtime;
pub use team::{TEAM_ALL, TEAM_UNDEFINED};
pub use transport::{
    LocalTransport, ThreadedFabric, ThreadedFabricBuilder, Transport, TransportError,
};
