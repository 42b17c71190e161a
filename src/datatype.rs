use crate::error::{RuntimeError, RuntimeResult};
use crate::transport::{DtypeId, Transport, TransportComm, TransportTypes};

use tracing::error;

/// The closed set of element types transfers are typed with.
///
/// Remote windows are addressed in units of these base types; every
/// transfer names one of them. User-defined structures are not
/// marshalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    Byte,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

pub(crate) const DATATYPE_COUNT: usize = 11;

impl DataType {
    pub fn size(&self) -> usize {
        match self {
            DataType::Byte | DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Atomic compare-and-swap is only defined for these.
    pub fn is_integral(&self) -> bool {
        !matches!(self, DataType::F32 | DataType::F64)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }

    pub(crate) fn all() -> [DataType; DATATYPE_COUNT] {
        [
            DataType::Byte,
            DataType::U8,
            DataType::I8,
            DataType::U16,
            DataType::I16,
            DataType::U32,
            DataType::I32,
            DataType::U64,
            DataType::I64,
            DataType::F32,
            DataType::F64,
        ]
    }
}

/// Maps a Rust element type onto its runtime data type tag.
///
/// Implemented for the fixed-width integers and floats only; all
/// dispatch below this veneer is over [`DataType`].
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($t:ty => $dt:expr),* $(,)?) => {
        $(impl Element for $t {
            const DTYPE: DataType = $dt;
        })*
    };
}

impl_element!(
    u8 => DataType::U8,
    i8 => DataType::I8,
    u16 => DataType::U16,
    i16 => DataType::I16,
    u32 => DataType::U32,
    i32 => DataType::I32,
    u64 => DataType::U64,
    i64 => DataType::I64,
    f32 => DataType::F32,
    f64 => DataType::F64,
);

/// Element-wise operators accepted by accumulate, fetch_and_op and the
/// reduction collectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
    Prod,
    Band,
    Bor,
    Bxor,
    Land,
    Lor,
    Lxor,
    Replace,
    NoOp,
}

// The per-element loops go through unaligned reads and writes: window
// memory is byte addressed and offsets are byte counts, so a target
// slice carries no alignment guarantee for multi-byte types.
fn reduce_loop<T: Copy, F: Fn(T, T) -> T>(target: &mut [u8], operand: &[u8], f: F) {
    let elem = std::mem::size_of::<T>();
    let n = operand.len() / elem;
    for i in 0..n {
        unsafe {
            let t = target.as_mut_ptr().add(i * elem) as *mut T;
            let o = operand.as_ptr().add(i * elem) as *const T;
            t.write_unaligned(f(t.read_unaligned(), o.read_unaligned()));
        }
    }
}

macro_rules! integral_reduce {
    ($t:ty, $op:expr, $target:expr, $operand:expr) => {{
        match $op {
            ReduceOp::Min => reduce_loop::<$t, _>($target, $operand, |a, b| a.min(b)),
            ReduceOp::Max => reduce_loop::<$t, _>($target, $operand, |a, b| a.max(b)),
            ReduceOp::Sum => reduce_loop::<$t, _>($target, $operand, |a, b| a.wrapping_add(b)),
            ReduceOp::Prod => reduce_loop::<$t, _>($target, $operand, |a, b| a.wrapping_mul(b)),
            ReduceOp::Band => reduce_loop::<$t, _>($target, $operand, |a, b| a & b),
            ReduceOp::Bor => reduce_loop::<$t, _>($target, $operand, |a, b| a | b),
            ReduceOp::Bxor => reduce_loop::<$t, _>($target, $operand, |a, b| a ^ b),
            ReduceOp::Land => {
                reduce_loop::<$t, _>($target, $operand, |a, b| (a != 0 && b != 0) as $t)
            }
            ReduceOp::Lor => {
                reduce_loop::<$t, _>($target, $operand, |a, b| (a != 0 || b != 0) as $t)
            }
            ReduceOp::Lxor => {
                reduce_loop::<$t, _>($target, $operand, |a, b| ((a != 0) != (b != 0)) as $t)
            }
            ReduceOp::Replace => reduce_loop::<$t, _>($target, $operand, |_, b| b),
            ReduceOp::NoOp => {}
        }
        Ok(())
    }};
}

macro_rules! float_reduce {
    ($t:ty, $op:expr, $target:expr, $operand:expr) => {{
        match $op {
            ReduceOp::Min => reduce_loop::<$t, _>($target, $operand, |a, b| a.min(b)),
            ReduceOp::Max => reduce_loop::<$t, _>($target, $operand, |a, b| a.max(b)),
            ReduceOp::Sum => reduce_loop::<$t, _>($target, $operand, |a, b| a + b),
            ReduceOp::Prod => reduce_loop::<$t, _>($target, $operand, |a, b| a * b),
            ReduceOp::Replace => reduce_loop::<$t, _>($target, $operand, |_, b| b),
            ReduceOp::NoOp => {}
            _ => {
                error!("reduce ! bitwise/logical operator on floating point type");
                return Err(RuntimeError::InvalidArgument);
            }
        }
        Ok(())
    }};
}

/// `target[i] = target[i] op operand[i]` over raw element storage.
pub(crate) fn reduce_in_place(
    op: ReduceOp,
    dtype: DataType,
    target: &mut [u8],
    operand: &[u8],
) -> RuntimeResult<()> {
    match dtype {
        DataType::Byte | DataType::U8 => integral_reduce!(u8, op, target, operand),
        DataType::I8 => integral_reduce!(i8, op, target, operand),
        DataType::U16 => integral_reduce!(u16, op, target, operand),
        DataType::I16 => integral_reduce!(i16, op, target, operand),
        DataType::U32 => integral_reduce!(u32, op, target, operand),
        DataType::I32 => integral_reduce!(i32, op, target, operand),
        DataType::U64 => integral_reduce!(u64, op, target, operand),
        DataType::I64 => integral_reduce!(i64, op, target, operand),
        DataType::F32 => float_reduce!(f32, op, target, operand),
        DataType::F64 => float_reduce!(f64, op, target, operand),
    }
}

/// Per-type transport handles, resolved once at startup.
///
/// For every base type this holds the transport's native handle and a
/// committed contiguous aggregate of exactly the transport's maximum
/// per-call element count. Any transfer length then decomposes into at
/// most one chunk-typed call plus one base-typed remainder call.
pub(crate) struct TypeRegistry {
    base: [DtypeId; DATATYPE_COUNT],
    chunk: [DtypeId; DATATYPE_COUNT],
    sizes: [usize; DATATYPE_COUNT],
    max_contig: usize,
}

impl TypeRegistry {
    pub(crate) fn init(transport: &Transport) -> RuntimeResult<TypeRegistry> {
        let max_contig = transport.max_contig_elements();
        let mut base = [DtypeId::INVALID; DATATYPE_COUNT];
        let mut chunk = [DtypeId::INVALID; DATATYPE_COUNT];
        let mut sizes = [0usize; DATATYPE_COUNT];
        for dt in DataType::all() {
            let b = DtypeId::base(dt);
            let c = transport.type_contiguous(max_contig, b).map_err(|e| {
                error!("failed to create chunk type of data type {:?}: {}", dt, e);
                RuntimeError::InvalidArgument
            })?;
            transport.type_commit(c).map_err(|e| {
                error!("failed to commit chunk type of data type {:?}: {}", dt, e);
                RuntimeError::InvalidArgument
            })?;
            base[dt.index()] = b;
            chunk[dt.index()] = c;
            sizes[dt.index()] = transport.type_size(b);
        }
        Ok(TypeRegistry {
            base,
            chunk,
            sizes,
            max_contig,
        })
    }

    pub(crate) fn finalize(&self, transport: &Transport) -> RuntimeResult<()> {
        for dt in DataType::all() {
            if transport.type_free(self.chunk[dt.index()]).is_err() {
                error!("failed to free chunk type of data type {:?}", dt);
                return Err(RuntimeError::InvalidArgument);
            }
        }
        Ok(())
    }

    pub(crate) fn base(&self, dt: DataType) -> DtypeId {
        self.base[dt.index()]
    }

    pub(crate) fn chunk(&self, dt: DataType) -> DtypeId {
        self.chunk[dt.index()]
    }

    pub(crate) fn size(&self, dt: DataType) -> usize {
        self.sizes[dt.index()]
    }

    /// The transport's per-call element limit, the chunking quantum.
    pub(crate) fn max_contig_elements(&self) -> usize {
        self.max_contig
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(1, DataType::Byte.size());
        assert_eq!(2, DataType::I16.size());
        assert_eq!(4, DataType::F32.size());
        assert_eq!(8, DataType::U64.size());
        assert_eq!(8, DataType::F64.size());
    }

    #[test]
    fn integral_gate() {
        assert!(DataType::U64.is_integral());
        assert!(DataType::Byte.is_integral());
        assert!(!DataType::F32.is_integral());
        assert!(!DataType::F64.is_integral());
    }

    #[test]
    fn reduce_sum_u32() {
        let mut target = 5u32.to_ne_bytes().to_vec();
        let operand = 7u32.to_ne_bytes().to_vec();
        reduce_in_place(ReduceOp::Sum, DataType::U32, &mut target, &operand).unwrap();
        assert_eq!(12u32, u32::from_ne_bytes(target.try_into().unwrap()));
    }

    #[test]
    fn reduce_min_multi() {
        let mut target: Vec<u8> = [3i64, -2, 9]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let operand: Vec<u8> = [1i64, 5, -9]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        reduce_in_place(ReduceOp::Min, DataType::I64, &mut target, &operand).unwrap();
        let out: Vec<i64> = target
            .chunks(8)
            .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vec![1, -2, -9], out);
    }

    #[test]
    fn reduce_replace() {
        let mut target = 5u32.to_ne_bytes().to_vec();
        let operand = 7u32.to_ne_bytes().to_vec();
        reduce_in_place(ReduceOp::Replace, DataType::U32, &mut target, &operand).unwrap();
        assert_eq!(7u32, u32::from_ne_bytes(target.try_into().unwrap()));
    }

    #[test]
    fn reduce_logical_on_float_rejected() {
        let mut target = 1.0f64.to_ne_bytes().to_vec();
        let operand = 2.0f64.to_ne_bytes().to_vec();
        assert_eq!(
            Err(RuntimeError::InvalidArgument),
            reduce_in_place(ReduceOp::Band, DataType::F64, &mut target, &operand)
        );
    }
}
