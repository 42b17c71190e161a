/// Errors surfaced by runtime operations.
///
/// Every fallible operation returns one of these; the runtime never
/// retries and never swallows a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeError {
    /// An argument did not validate: out-of-range unit, unknown team,
    /// an element count where chunking is disallowed, an atomic on a
    /// non-integral type, or an unbound segment.
    InvalidArgument,
    /// A locality tag walked off the end of the tree, or a tag subset
    /// did not name children of the given domain.
    NotFound,
    /// A transport-level synchronization failure.
    Other,
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RuntimeError::InvalidArgument => write!(f, "invalid argument"),
            RuntimeError::NotFound => write!(f, "not found"),
            RuntimeError::Other => write!(f, "transport failure"),
        }
    }
}

impl std::error::Error for RuntimeError {}
