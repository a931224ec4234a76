//! Typed numeric buffers exchanged with the communication substrate.
//!
//! The runtime never interprets raw bytes. A [`Buffer`] is a typed element
//! vector plus a [`Shape`]; element-wise arithmetic goes through the
//! [`Element`] trait so reductions stay generic over the numeric kind.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::CommError;

/// Buffers handed to the runtime by callers. The dispatch thread writes
/// results through the lock; callers read them after the handle completes.
pub type SharedBuffer = Arc<RwLock<Buffer>>;

/// Wrap a buffer for submission.
pub fn shared(buffer: Buffer) -> SharedBuffer {
    Arc::new(RwLock::new(buffer))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    U8,
    I8,
    U16,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "uint8",
            DataType::I8 => "int8",
            DataType::U16 => "uint16",
            DataType::I16 => "int16",
            DataType::I32 => "int32",
            DataType::I64 => "int64",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
        };
        f.write_str(name)
    }
}

// ── Shape ─────────────────────────────────────────────────────

/// Dimensions of a buffer. An empty dim list is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }

    /// Leading dimension; scalars count as one row.
    pub fn first_dim(&self) -> usize {
        self.0.first().copied().unwrap_or(1)
    }

    /// Same trailing dims with the leading dim replaced by `rows`.
    ///
    /// Scalars become a vector of `rows` elements.
    pub fn with_first_dim(&self, rows: usize) -> Shape {
        let mut dims = if self.0.is_empty() { vec![1] } else { self.0.clone() };
        dims[0] = rows;
        Shape(dims)
    }

    /// Trailing dims after the leading one.
    pub fn row_dims(&self) -> &[usize] {
        &self.0[self.0.len().min(1)..]
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

// ── Element ───────────────────────────────────────────────────

/// Numeric kind a buffer can hold.
///
/// Integer arithmetic wraps; weighted arithmetic is done in `f64` and
/// converted back with `as` semantics.
pub trait Element: Copy + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    const DTYPE: DataType;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn add(self, other: Self) -> Self;
    /// Divide by a count. Integers truncate toward zero; a zero count
    /// leaves the value unchanged.
    fn div_count(self, n: usize) -> Self;

    fn wrap(values: Vec<Self>) -> BufferData;
    fn view(data: &BufferData) -> Option<&[Self]>;
    fn view_mut(data: &mut BufferData) -> Option<&mut [Self]>;
}

macro_rules! int_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DataType = DataType::$variant;

            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn div_count(self, n: usize) -> Self {
                if n == 0 {
                    return self;
                }
                // The quotient never exceeds `self` in magnitude, so it fits.
                (self as i128 / n as i128) as $t
            }
            fn wrap(values: Vec<Self>) -> BufferData {
                BufferData::$variant(values)
            }
            fn view(data: &BufferData) -> Option<&[Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn view_mut(data: &mut BufferData) -> Option<&mut [Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

macro_rules! float_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DataType = DataType::$variant;

            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn add(self, other: Self) -> Self {
                self + other
            }
            fn div_count(self, n: usize) -> Self {
                if n == 0 { self } else { self / n as $t }
            }
            fn wrap(values: Vec<Self>) -> BufferData {
                BufferData::$variant(values)
            }
            fn view(data: &BufferData) -> Option<&[Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }
            fn view_mut(data: &mut BufferData) -> Option<&mut [Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

int_element!(u8, U8);
int_element!(i8, I8);
int_element!(u16, U16);
int_element!(i16, I16);
int_element!(i32, I32);
int_element!(i64, I64);
float_element!(f32, F32);
float_element!(f64, F64);

// ── BufferData ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BufferData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Run `$body` with `$v` bound to the typed vector inside `$data`.
#[macro_export]
macro_rules! with_buffer_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            $crate::buffer::BufferData::U8($v) => $body,
            $crate::buffer::BufferData::I8($v) => $body,
            $crate::buffer::BufferData::U16($v) => $body,
            $crate::buffer::BufferData::I16($v) => $body,
            $crate::buffer::BufferData::I32($v) => $body,
            $crate::buffer::BufferData::I64($v) => $body,
            $crate::buffer::BufferData::F32($v) => $body,
            $crate::buffer::BufferData::F64($v) => $body,
        }
    };
}

impl BufferData {
    pub fn dtype(&self) -> DataType {
        match self {
            BufferData::U8(_) => DataType::U8,
            BufferData::I8(_) => DataType::I8,
            BufferData::U16(_) => DataType::U16,
            BufferData::I16(_) => DataType::I16,
            BufferData::I32(_) => DataType::I32,
            BufferData::I64(_) => DataType::I64,
            BufferData::F32(_) => DataType::F32,
            BufferData::F64(_) => DataType::F64,
        }
    }

    pub fn len(&self) -> usize {
        with_buffer_data!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::U8 => BufferData::U8(vec![0; len]),
            DataType::I8 => BufferData::I8(vec![0; len]),
            DataType::U16 => BufferData::U16(vec![0; len]),
            DataType::I16 => BufferData::I16(vec![0; len]),
            DataType::I32 => BufferData::I32(vec![0; len]),
            DataType::I64 => BufferData::I64(vec![0; len]),
            DataType::F32 => BufferData::F32(vec![0.0; len]),
            DataType::F64 => BufferData::F64(vec![0.0; len]),
        }
    }
}

// ── Buffer ────────────────────────────────────────────────────

/// A typed, shaped block of elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    data: BufferData,
    shape: Shape,
}

impl Buffer {
    /// Build a buffer, checking that `shape` covers exactly the data.
    pub fn new(data: BufferData, shape: Shape) -> Result<Self, CommError> {
        if data.len() != shape.num_elements() {
            return Err(CommError::InvalidArgument(format!(
                "shape {} needs {} elements, got {}",
                shape,
                shape.num_elements(),
                data.len()
            )));
        }
        Ok(Self { data, shape })
    }

    pub fn from_vec<T: Element>(values: Vec<T>, shape: Shape) -> Result<Self, CommError> {
        Self::new(T::wrap(values), shape)
    }

    /// One-dimensional buffer holding `values`.
    pub fn vector<T: Element>(values: Vec<T>) -> Self {
        let shape = Shape::new(vec![values.len()]);
        Self { data: T::wrap(values), shape }
    }

    pub fn zeros(dtype: DataType, shape: Shape) -> Self {
        Self {
            data: BufferData::zeros(dtype, shape.num_elements()),
            shape,
        }
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(&self.data)
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        T::view_mut(&mut self.data)
    }

    /// Typed view, failing with `InvalidArgument` on a dtype mismatch.
    pub fn typed<T: Element>(&self) -> Result<&[T], CommError> {
        let dtype = self.dtype();
        self.as_slice::<T>().ok_or_else(|| dtype_mismatch(T::DTYPE, dtype))
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_buffer_data!(&self.data, v => v.iter().map(|x| Element::to_f64(*x)).collect())
    }

    /// Replace contents (data, dtype and shape) with a copy of `other`.
    pub fn copy_from(&mut self, other: &Buffer) {
        self.data = other.data.clone();
        self.shape = other.shape.clone();
    }

    /// Multiply every element by `factor`, going through `f64`.
    pub fn scale(&mut self, factor: f64) {
        with_buffer_data!(&mut self.data, v => {
            for x in v.iter_mut() {
                *x = Element::from_f64(Element::to_f64(*x) * factor);
            }
        })
    }

    /// Divide every element by `divisor`. Integer buffers truncate toward
    /// zero instead of going through `f64`.
    pub fn div_scalar(&mut self, divisor: usize) {
        with_buffer_data!(&mut self.data, v => {
            for x in v.iter_mut() {
                *x = Element::div_count(*x, divisor);
            }
        })
    }

    /// Element-wise `self += other`. Shapes must hold the same element count.
    pub fn add_assign(&mut self, other: &Buffer) -> Result<(), CommError> {
        if self.len() != other.len() {
            return Err(CommError::InvalidArgument(format!(
                "cannot add {} elements to {}",
                other.len(),
                self.len()
            )));
        }
        let theirs = other.dtype();
        macro_rules! add_typed {
            ($mine:expr, $t:ty) => {{
                let src = other.as_slice::<$t>().ok_or_else(|| dtype_mismatch(<$t as Element>::DTYPE, theirs))?;
                for (d, s) in $mine.iter_mut().zip(src) {
                    *d = Element::add(*d, *s);
                }
            }};
        }
        match &mut self.data {
            BufferData::U8(v) => add_typed!(v, u8),
            BufferData::I8(v) => add_typed!(v, i8),
            BufferData::U16(v) => add_typed!(v, u16),
            BufferData::I16(v) => add_typed!(v, i16),
            BufferData::I32(v) => add_typed!(v, i32),
            BufferData::I64(v) => add_typed!(v, i64),
            BufferData::F32(v) => add_typed!(v, f32),
            BufferData::F64(v) => add_typed!(v, f64),
        }
        Ok(())
    }

    /// Concatenate along the leading dimension.
    ///
    /// Every part must share dtype and trailing dims.
    pub fn concat(parts: &[&Buffer]) -> Result<Buffer, CommError> {
        let first = parts
            .first()
            .ok_or_else(|| CommError::InvalidArgument("nothing to concatenate".to_string()))?;
        let dtype = first.dtype();
        let row_dims = first.shape.row_dims().to_vec();
        let mut rows = 0;
        for part in parts {
            if part.dtype() != dtype {
                return Err(dtype_mismatch(dtype, part.dtype()));
            }
            if part.shape.row_dims() != row_dims.as_slice() {
                return Err(CommError::InvalidArgument(format!(
                    "cannot concatenate {} with {}",
                    first.shape, part.shape
                )));
            }
            rows += part.shape.first_dim();
        }

        let mut data = BufferData::zeros(dtype, 0);
        for part in parts {
            append(&mut data, &part.data);
        }
        let shape = first.shape.with_first_dim(rows);
        Buffer::new(data, shape)
    }
}

fn append(dst: &mut BufferData, src: &BufferData) {
    match (dst, src) {
        (BufferData::U8(d), BufferData::U8(s)) => d.extend_from_slice(s),
        (BufferData::I8(d), BufferData::I8(s)) => d.extend_from_slice(s),
        (BufferData::U16(d), BufferData::U16(s)) => d.extend_from_slice(s),
        (BufferData::I16(d), BufferData::I16(s)) => d.extend_from_slice(s),
        (BufferData::I32(d), BufferData::I32(s)) => d.extend_from_slice(s),
        (BufferData::I64(d), BufferData::I64(s)) => d.extend_from_slice(s),
        (BufferData::F32(d), BufferData::F32(s)) => d.extend_from_slice(s),
        (BufferData::F64(d), BufferData::F64(s)) => d.extend_from_slice(s),
        // callers check dtypes first
        _ => {}
    }
}

fn dtype_mismatch(expected: DataType, got: DataType) -> CommError {
    CommError::InvalidArgument(format!("expected {expected} buffer, got {got}"))
}

// ── Output allocation ─────────────────────────────────────────

/// Produces output buffers whose size is only known once a gather completes.
///
/// Allocation is synchronous.
pub trait OutputAllocator: Send + Sync {
    fn allocate(&self, dtype: DataType, shape: Shape) -> Result<Buffer, CommError>;
}

/// Zero-filled heap allocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapAllocator;

impl OutputAllocator for HeapAllocator {
    fn allocate(&self, dtype: DataType, shape: Shape) -> Result<Buffer, CommError> {
        Ok(Buffer::zeros(dtype, shape))
    }
}
