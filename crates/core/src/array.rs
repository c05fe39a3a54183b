//! Lazy n-dimensional arrays over block payloads
//!
//! An [`NdArray`] is a typed view (`datatype`, `byteorder`, `shape`, `offset`,
//! `strides`) over a shared [`Buffer`]. Buffers bound to a block read nothing
//! until an element or byte range is requested; several views may share one
//! buffer, and on write they share one block.

use crate::block::BlockReader;
use crate::compression::Compression;
use crate::error::{Error, Result};
use crate::node::Node;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool8,
}

impl DType {
    pub const ALL: [DType; 11] = [
        DType::Int8,
        DType::Int16,
        DType::Int32,
        DType::Int64,
        DType::UInt8,
        DType::UInt16,
        DType::UInt32,
        DType::UInt64,
        DType::Float32,
        DType::Float64,
        DType::Bool8,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DType::Int8 => "int8",
            DType::Int16 => "int16",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::UInt8 => "uint8",
            DType::UInt16 => "uint16",
            DType::UInt32 => "uint32",
            DType::UInt64 => "uint64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Bool8 => "bool8",
        }
    }

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            DType::Int8 | DType::UInt8 | DType::Bool8 => 1,
            DType::Int16 | DType::UInt16 => 2,
            DType::Int32 | DType::UInt32 | DType::Float32 => 4,
            DType::Int64 | DType::UInt64 | DType::Float64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        DType::ALL
            .iter()
            .find(|d| d.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown datatype '{}'", s))
    }
}

/// Byte order of multi-byte elements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    pub fn name(&self) -> &'static str {
        match self {
            ByteOrder::Little => "little",
            ByteOrder::Big => "big",
        }
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "little" => Ok(ByteOrder::Little),
            "big" => Ok(ByteOrder::Big),
            other => Err(format!("unknown byteorder '{}'", other)),
        }
    }
}

/// How an array's bytes are laid out within its buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayDesc {
    pub dtype: DType,
    pub byteorder: ByteOrder,
    pub shape: Vec<usize>,
    /// Byte offset of the first element
    pub offset: usize,
    /// Byte stride per dimension
    pub strides: Vec<usize>,
}

impl ArrayDesc {
    /// C-contiguous layout starting at offset 0
    pub fn contiguous(dtype: DType, shape: &[usize]) -> Self {
        Self {
            dtype,
            byteorder: ByteOrder::Little,
            shape: shape.to_vec(),
            offset: 0,
            strides: Self::c_strides(shape, dtype.size()),
        }
    }

    pub fn c_strides(shape: &[usize], item: usize) -> Vec<usize> {
        let mut strides = vec![0; shape.len()];
        let mut acc = item;
        for (i, dim) in shape.iter().enumerate().rev() {
            strides[i] = acc;
            acc = acc.saturating_mul(*dim);
        }
        strides
    }

    /// Check that every size derived from the descriptor fits in `usize`
    ///
    /// Descriptors read from a file must pass this before any other method
    /// is used on them.
    pub fn check_bounds(&self) -> std::result::Result<(), String> {
        if self.strides.len() != self.shape.len() {
            return Err(format!("{} strides for {} dimensions", self.strides.len(), self.shape.len()));
        }
        let overflow = || {
            format!(
                "shape {:?} with strides {:?} at offset {} overflows the address space",
                self.shape, self.strides, self.offset
            )
        };
        let len = self
            .shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
            .ok_or_else(overflow)?;
        len.checked_mul(self.dtype.size()).ok_or_else(overflow)?;
        if len == 0 {
            return Ok(());
        }
        let last = self
            .shape
            .iter()
            .zip(&self.strides)
            .try_fold(0usize, |acc, (dim, stride)| (dim - 1).checked_mul(*stride).and_then(|s| acc.checked_add(s)))
            .ok_or_else(overflow)?;
        self.offset
            .checked_add(last)
            .and_then(|end| end.checked_add(self.dtype.size()))
            .ok_or_else(overflow)?;
        Ok(())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes occupied by the elements themselves
    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype.size()
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides == Self::c_strides(&self.shape, self.dtype.size())
    }

    /// One past the last byte the view touches
    pub fn extent(&self) -> usize {
        if self.is_empty() {
            return self.offset;
        }
        let last: usize = self
            .shape
            .iter()
            .zip(&self.strides)
            .map(|(dim, stride)| (dim - 1) * stride)
            .sum();
        self.offset + last + self.dtype.size()
    }

    /// Byte position of an element
    pub fn element_offset(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(self.bad_index(index, format!("expected {} indices", self.shape.len())));
        }
        let mut pos = self.offset;
        for ((i, dim), stride) in index.iter().zip(&self.shape).zip(&self.strides) {
            if i >= dim {
                return Err(self.bad_index(index, format!("index {} out of bounds for dimension of {}", i, dim)));
            }
            pos += i * stride;
        }
        Ok(pos)
    }

    fn bad_index(&self, index: &[usize], reason: String) -> Error {
        Error::InvalidPath {
            path: format!("{:?}", index),
            reason: format!("{} (shape {:?})", reason, self.shape),
        }
    }

    /// Byte positions of every element in row-major logical order
    fn positions(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len());
        if self.is_empty() {
            return out;
        }
        let mut index = vec![0usize; self.shape.len()];
        loop {
            let pos = self.offset
                + index
                    .iter()
                    .zip(&self.strides)
                    .map(|(i, s)| i * s)
                    .sum::<usize>();
            out.push(pos);
            let mut dim = self.shape.len();
            loop {
                if dim == 0 {
                    return out;
                }
                dim -= 1;
                index[dim] += 1;
                if index[dim] < self.shape[dim] {
                    break;
                }
                index[dim] = 0;
            }
        }
    }
}

/// Mutation policy for an array buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayAccess {
    /// Element writes fail with `ReadOnlyViolation`
    ReadOnly,
    /// Writes detach the buffer into memory; the file is untouched
    CopyOnWrite,
    /// Writes go to the mapped file when the block allows it
    InPlace,
}

enum Storage {
    Memory(Vec<u8>),
    Block { reader: Arc<BlockReader>, index: usize },
}

/// Raw bytes backing one or more arrays
pub struct Buffer {
    storage: RwLock<Storage>,
    access: ArrayAccess,
    compression: Mutex<Option<Compression>>,
}

impl Buffer {
    pub fn from_vec(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            storage: RwLock::new(Storage::Memory(data)),
            access: ArrayAccess::InPlace,
            compression: Mutex::new(None),
        })
    }

    /// Buffer bound lazily to a block of an opened file
    pub fn from_block(reader: Arc<BlockReader>, index: usize, access: ArrayAccess) -> Arc<Self> {
        Arc::new(Self {
            storage: RwLock::new(Storage::Block { reader, index }),
            access,
            compression: Mutex::new(None),
        })
    }

    pub fn access(&self) -> ArrayAccess {
        self.access
    }

    /// Length in bytes; for block buffers this reads the block header only
    pub fn len(&self) -> Result<usize> {
        match &*self.storage.read() {
            Storage::Memory(data) => Ok(data.len()),
            Storage::Block { reader, index } => Ok(reader.header(*index)?.data_len as usize),
        }
    }

    /// Uncompressed bytes of `range`
    pub fn read(&self, range: std::ops::Range<usize>) -> Result<Bytes> {
        match &*self.storage.read() {
            Storage::Memory(data) => {
                if range.end > data.len() || range.start > range.end {
                    return Err(Error::InvalidPath {
                        path: format!("{:?}", range),
                        reason: format!("outside buffer of {} bytes", data.len()),
                    });
                }
                Ok(Bytes::copy_from_slice(&data[range]))
            }
            Storage::Block { reader, index } => reader.read(*index, range),
        }
    }

    /// All uncompressed bytes
    pub fn bytes(&self) -> Result<Bytes> {
        match &*self.storage.read() {
            Storage::Memory(data) => Ok(Bytes::copy_from_slice(data)),
            Storage::Block { reader, index } => reader.read_all(*index),
        }
    }

    /// Overwrite bytes at `offset`, honoring the access policy
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        if self.access == ArrayAccess::ReadOnly {
            return Err(Error::read_only(format!("array buffer at byte {}", offset)));
        }
        let mut storage = self.storage.write();
        if let Storage::Block { reader, index } = &*storage {
            if self.access == ArrayAccess::InPlace && reader.write_in_place(*index, offset, data)? {
                return Ok(());
            }
            let detached = reader.read_all(*index)?.to_vec();
            tracing::trace!(block = *index, "detached array buffer for copy-on-write");
            *storage = Storage::Memory(detached);
        }
        match &mut *storage {
            Storage::Memory(bytes) => {
                let end = offset + data.len();
                if end > bytes.len() {
                    return Err(Error::InvalidPath {
                        path: format!("{}..{}", offset, end),
                        reason: format!("outside buffer of {} bytes", bytes.len()),
                    });
                }
                bytes[offset..end].copy_from_slice(data);
                Ok(())
            }
            Storage::Block { .. } => unreachable!("block storage detached above"),
        }
    }

    /// The block this buffer still reads from, if any
    pub fn source(&self) -> Option<(Arc<BlockReader>, usize)> {
        match &*self.storage.read() {
            Storage::Block { reader, index } => Some((Arc::clone(reader), *index)),
            Storage::Memory(_) => None,
        }
    }

    /// Point the buffer at a freshly written block
    pub fn rebind(&self, reader: Arc<BlockReader>, index: usize) {
        *self.storage.write() = Storage::Block { reader, index };
    }

    /// Compression to use when this buffer is written
    ///
    /// An explicit choice wins; otherwise the compression of the block it was
    /// read from; otherwise `fallback`.
    pub fn compression_or(&self, fallback: &Compression) -> Result<Compression> {
        if let Some(explicit) = self.compression.lock().clone() {
            return Ok(explicit);
        }
        match self.source() {
            Some((reader, index)) => reader.compression(index),
            None => Ok(fallback.clone()),
        }
    }

    /// Explicitly chosen compression, if any
    pub fn explicit_compression(&self) -> Option<Compression> {
        self.compression.lock().clone()
    }

    pub fn set_compression(&self, compression: Compression) {
        *self.compression.lock() = Some(compression);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.storage.read() {
            Storage::Memory(data) => write!(f, "Buffer(memory, {} bytes)", data.len()),
            Storage::Block { index, .. } => write!(f, "Buffer(block {})", index),
        }
    }
}

struct ArrayInner {
    desc: ArrayDesc,
    buffer: Arc<Buffer>,
}

/// A typed, lazily materialized array view
#[derive(Clone)]
pub struct NdArray(Arc<ArrayInner>);

impl NdArray {
    /// View `buffer` through `desc`
    pub fn new(desc: ArrayDesc, buffer: Arc<Buffer>) -> Self {
        Self(Arc::new(ArrayInner { desc, buffer }))
    }

    /// Contiguous float64 array
    pub fn from_f64(shape: &[usize], values: &[f64]) -> Result<Self> {
        Self::from_values(DType::Float64, shape, values.iter().map(|v| Node::Float(*v)))
    }

    /// Contiguous int64 array
    pub fn from_i64(shape: &[usize], values: &[i64]) -> Result<Self> {
        Self::from_values(DType::Int64, shape, values.iter().map(|v| Node::Int(*v)))
    }

    /// Contiguous array of any dtype from scalar nodes
    pub fn from_values(dtype: DType, shape: &[usize], values: impl IntoIterator<Item = Node>) -> Result<Self> {
        let desc = ArrayDesc::contiguous(dtype, shape);
        let mut data = Vec::with_capacity(desc.nbytes());
        let mut count = 0;
        for value in values {
            encode_element(dtype, desc.byteorder, &value, &mut data)
                .map_err(|reason| unrepresentable(format!("array element {}", count), reason))?;
            count += 1;
        }
        if count != desc.len() {
            return Err(Error::InvalidPath {
                path: format!("{:?}", shape),
                reason: format!("shape needs {} elements, got {}", desc.len(), count),
            });
        }
        Ok(Self::new(desc, Buffer::from_vec(data)))
    }

    /// Another view over the same buffer
    pub fn view(&self, desc: ArrayDesc) -> Self {
        Self::new(desc, Arc::clone(&self.0.buffer))
    }

    pub fn desc(&self) -> &ArrayDesc {
        &self.0.desc
    }

    pub fn dtype(&self) -> DType {
        self.0.desc.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.desc.shape
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.0.buffer
    }

    /// Identity of this view
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Identity of the underlying buffer, shared between views
    pub fn buffer_id(&self) -> usize {
        Arc::as_ptr(&self.0.buffer) as *const () as usize
    }

    /// Read one element
    pub fn get(&self, index: &[usize]) -> Result<Node> {
        let desc = &self.0.desc;
        let pos = desc.element_offset(index)?;
        let raw = self.0.buffer.read(pos..pos + desc.dtype.size())?;
        Ok(decode_element(desc.dtype, desc.byteorder, &raw))
    }

    /// Write one element
    pub fn set(&self, index: &[usize], value: impl Into<Node>) -> Result<()> {
        let desc = &self.0.desc;
        let pos = desc.element_offset(index)?;
        let mut raw = Vec::with_capacity(desc.dtype.size());
        encode_element(desc.dtype, desc.byteorder, &value.into(), &mut raw)
            .map_err(|reason| unrepresentable(format!("array element {:?}", index), reason))?;
        self.0
            .buffer
            .write(pos, &raw)
            .map_err(|e| match e {
                Error::ReadOnlyViolation { .. } => Error::read_only(format!("array element {:?}", index)),
                other => other,
            })
    }

    /// All elements in row-major order
    pub fn elements(&self) -> Result<Vec<Node>> {
        let desc = &self.0.desc;
        if desc.is_empty() {
            return Ok(Vec::new());
        }
        let start = desc.offset;
        let raw = self.0.buffer.read(start..desc.extent())?;
        let size = desc.dtype.size();
        Ok(desc
            .positions()
            .into_iter()
            .map(|pos| decode_element(desc.dtype, desc.byteorder, &raw[pos - start..pos - start + size]))
            .collect())
    }

    /// Elements widened to f64
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self
            .elements()?
            .iter()
            .map(|n| match n {
                Node::Bool(b) => f64::from(u8::from(*b)),
                other => other.as_f64().unwrap_or(f64::NAN),
            })
            .collect())
    }

    /// Elements as raw bytes in row-major order
    pub fn contiguous_bytes(&self) -> Result<Bytes> {
        let desc = &self.0.desc;
        if desc.is_contiguous() {
            return self.0.buffer.read(desc.offset..desc.offset + desc.nbytes());
        }
        let start = desc.offset;
        let raw = self.0.buffer.read(start..desc.extent())?;
        let size = desc.dtype.size();
        let mut out = Vec::with_capacity(desc.nbytes());
        for pos in desc.positions() {
            out.extend_from_slice(&raw[pos - start..pos - start + size]);
        }
        Ok(Bytes::from(out))
    }

    /// Elements as nested sequences following the shape
    pub fn to_nested(&self) -> Result<Node> {
        let elements = self.elements()?;
        let shape = &self.0.desc.shape;
        if shape.is_empty() {
            return Ok(elements.into_iter().next().unwrap_or(Node::Null));
        }
        Ok(nest(&elements, shape))
    }

    /// Build a contiguous in-memory array from nested sequences
    pub fn from_nested(node: &Node, dtype: DType, byteorder: ByteOrder, shape: &[usize]) -> Result<Self> {
        let mut flat = Vec::new();
        flatten(node, &mut flat);
        let mut desc = ArrayDesc::contiguous(dtype, shape);
        desc.byteorder = byteorder;
        if flat.len() != desc.len() {
            return Err(Error::InvalidPath {
                path: format!("{:?}", shape),
                reason: format!("inline data has {} elements, shape needs {}", flat.len(), desc.len()),
            });
        }
        let mut data = Vec::with_capacity(desc.nbytes());
        for (i, value) in flat.iter().enumerate() {
            encode_element(dtype, byteorder, value, &mut data)
                .map_err(|reason| unrepresentable(format!("array element {}", i), reason))?;
        }
        Ok(Self::new(desc, Buffer::from_vec(data)))
    }
}

fn nest(elements: &[Node], shape: &[usize]) -> Node {
    if shape.len() == 1 {
        return Node::seq(elements.iter().cloned());
    }
    let chunk: usize = shape[1..].iter().product();
    let rows = (0..shape[0]).map(|i| {
        if chunk == 0 {
            nest(&[], &shape[1..])
        } else {
            nest(&elements[i * chunk..(i + 1) * chunk], &shape[1..])
        }
    });
    Node::seq(rows.collect::<Vec<_>>())
}

fn flatten(node: &Node, out: &mut Vec<Node>) {
    match node {
        Node::Sequence(items) => {
            for item in items.read().iter() {
                flatten(item, out);
            }
        }
        other => out.push(other.clone()),
    }
}

macro_rules! ordered_bytes {
    ($value:expr, $order:expr) => {
        match $order {
            ByteOrder::Little => $value.to_le_bytes().to_vec(),
            ByteOrder::Big => $value.to_be_bytes().to_vec(),
        }
    };
}

macro_rules! from_ordered {
    ($ty:ty, $raw:expr, $order:expr) => {{
        let mut buf = [0u8; std::mem::size_of::<$ty>()];
        buf.copy_from_slice(&$raw[..std::mem::size_of::<$ty>()]);
        match $order {
            ByteOrder::Little => <$ty>::from_le_bytes(buf),
            ByteOrder::Big => <$ty>::from_be_bytes(buf),
        }
    }};
}

fn decode_element(dtype: DType, order: ByteOrder, raw: &[u8]) -> Node {
    match dtype {
        DType::Int8 => Node::Int(raw[0] as i8 as i64),
        DType::UInt8 => Node::Int(raw[0] as i64),
        DType::Bool8 => Node::Bool(raw[0] != 0),
        DType::Int16 => Node::Int(from_ordered!(i16, raw, order) as i64),
        DType::UInt16 => Node::Int(from_ordered!(u16, raw, order) as i64),
        DType::Int32 => Node::Int(from_ordered!(i32, raw, order) as i64),
        DType::UInt32 => Node::Int(from_ordered!(u32, raw, order) as i64),
        DType::Int64 => Node::Int(from_ordered!(i64, raw, order)),
        DType::UInt64 => {
            let value = from_ordered!(u64, raw, order);
            i64::try_from(value).map(Node::Int).unwrap_or(Node::Float(value as f64))
        }
        DType::Float32 => Node::Float(from_ordered!(f32, raw, order) as f64),
        DType::Float64 => Node::Float(from_ordered!(f64, raw, order)),
    }
}

fn encode_element(dtype: DType, order: ByteOrder, value: &Node, out: &mut Vec<u8>) -> std::result::Result<(), String> {
    let bytes = match dtype {
        DType::Bool8 => match value {
            Node::Bool(b) => vec![u8::from(*b)],
            Node::Int(i @ (0 | 1)) => vec![*i as u8],
            other => return Err(format!("{} is not a bool8 value", describe_value(other))),
        },
        DType::Int8 => vec![narrow::<i8>(value, dtype)? as u8],
        DType::UInt8 => vec![narrow::<u8>(value, dtype)?],
        DType::Int16 => ordered_bytes!(narrow::<i16>(value, dtype)?, order),
        DType::UInt16 => ordered_bytes!(narrow::<u16>(value, dtype)?, order),
        DType::Int32 => ordered_bytes!(narrow::<i32>(value, dtype)?, order),
        DType::UInt32 => ordered_bytes!(narrow::<u32>(value, dtype)?, order),
        DType::Int64 => ordered_bytes!(narrow::<i64>(value, dtype)?, order),
        DType::UInt64 => ordered_bytes!(narrow::<u64>(value, dtype)?, order),
        DType::Float32 => {
            let wide = float_value(value)?;
            let narrow = wide as f32;
            if wide.is_finite() && !narrow.is_finite() {
                return Err(format!("{} is out of range for float32", wide));
            }
            ordered_bytes!(narrow, order)
        }
        DType::Float64 => ordered_bytes!(float_value(value)?, order),
    };
    out.extend_from_slice(&bytes);
    Ok(())
}

/// Exact integer conversion; floats must be finite and integral
fn narrow<T: TryFrom<i128>>(value: &Node, dtype: DType) -> std::result::Result<T, String> {
    let wide: i128 = match value {
        Node::Int(i) => i128::from(*i),
        Node::Bool(b) => i128::from(*b),
        Node::Float(f) if f.is_finite() && f.fract() == 0.0 => *f as i128,
        Node::Float(f) => return Err(format!("{} is not an integer", f)),
        other => return Err(format!("{} is not a numeric value", describe_value(other))),
    };
    T::try_from(wide).map_err(|_| format!("{} is out of range for {}", wide, dtype.name()))
}

fn float_value(value: &Node) -> std::result::Result<f64, String> {
    match value {
        Node::Float(f) => Ok(*f),
        Node::Int(i) => Ok(*i as f64),
        Node::Bool(b) => Ok(f64::from(u8::from(*b))),
        other => Err(format!("{} is not a numeric value", describe_value(other))),
    }
}

fn describe_value(value: &Node) -> String {
    match value {
        Node::Int(i) => i.to_string(),
        Node::Float(f) => f.to_string(),
        other => other.kind().to_string(),
    }
}

fn unrepresentable(location: String, reason: String) -> Error {
    Error::UnserializableType { path: location, reason }
}

impl PartialEq for NdArray {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let (a, b) = (self.desc(), other.desc());
        if a.dtype != b.dtype || a.shape != b.shape {
            return false;
        }
        match (self.elements(), other.elements()) {
            (Ok(x), Ok(y)) => x == y,
            _ => false,
        }
    }
}

impl fmt::Debug for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NdArray")
            .field("dtype", &self.0.desc.dtype)
            .field("shape", &self.0.desc.shape)
            .field("buffer", &self.0.buffer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_strides() {
        assert_eq!(ArrayDesc::c_strides(&[2, 3, 4], 8), vec![96, 32, 8]);
        assert!(ArrayDesc::contiguous(DType::Int16, &[5]).is_contiguous());
    }

    #[test]
    fn test_get_set_roundtrip() -> Result<()> {
        let array = NdArray::from_f64(&[2, 2], &[1.0, 2.0, 3.0, 4.0])?;
        assert_eq!(array.get(&[1, 0])?, Node::Float(3.0));
        array.set(&[0, 0], 999.0)?;
        assert_eq!(array.get(&[0, 0])?, Node::Float(999.0));
        assert!(array.get(&[2, 0]).is_err());
        Ok(())
    }

    #[test]
    fn test_views_share_buffer() -> Result<()> {
        let base = NdArray::from_i64(&[6], &[0, 1, 2, 3, 4, 5])?;
        let evens = base.view(ArrayDesc {
            dtype: DType::Int64,
            byteorder: ByteOrder::Little,
            shape: vec![3],
            offset: 0,
            strides: vec![16],
        });
        assert_eq!(evens.buffer_id(), base.buffer_id());
        assert_ne!(evens.id(), base.id());
        assert_eq!(evens.elements()?, vec![Node::Int(0), Node::Int(2), Node::Int(4)]);
        base.set(&[2], 42)?;
        assert_eq!(evens.get(&[1])?, Node::Int(42));
        Ok(())
    }

    #[test]
    fn test_big_endian_elements() -> Result<()> {
        let mut desc = ArrayDesc::contiguous(DType::UInt16, &[2]);
        desc.byteorder = ByteOrder::Big;
        let array = NdArray::new(desc, Buffer::from_vec(vec![0x01, 0x02, 0x00, 0xff]));
        assert_eq!(array.elements()?, vec![Node::Int(0x0102), Node::Int(0x00ff)]);
        Ok(())
    }

    #[test]
    fn test_nested_roundtrip() -> Result<()> {
        let array = NdArray::from_i64(&[2, 3], &[1, 2, 3, 4, 5, 6])?;
        let nested = array.to_nested()?;
        assert_eq!(nested, Node::seq([Node::seq([1, 2, 3]), Node::seq([4, 5, 6])]));
        let back = NdArray::from_nested(&nested, DType::Int64, ByteOrder::Little, &[2, 3])?;
        assert_eq!(back, array);
        Ok(())
    }

    #[test]
    fn test_out_of_range_elements_rejected() -> Result<()> {
        let bytes = NdArray::from_values(DType::Int8, &[2], [Node::Int(0), Node::Int(-128)])?;
        let err = bytes.set(&[0], 999).unwrap_err();
        match err {
            Error::UnserializableType { path, reason } => {
                assert_eq!(path, "array element [0]");
                assert!(reason.contains("out of range for int8"));
            }
            other => panic!("expected an unserializable value, got {:?}", other),
        }
        assert_eq!(bytes.get(&[0])?, Node::Int(0));

        let counts = NdArray::from_values(DType::UInt32, &[1], [Node::Int(7)])?;
        assert!(counts.set(&[0], -1).is_err());
        assert!(counts.set(&[0], 2.5).is_err());
        assert!(counts.set(&[0], f64::NAN).is_err());
        counts.set(&[0], 3.0)?;
        assert_eq!(counts.get(&[0])?, Node::Int(3));

        let flags = NdArray::from_values(DType::Bool8, &[1], [Node::Bool(false)])?;
        assert!(flags.set(&[0], 2).is_err());
        assert!(NdArray::from_values(DType::Float32, &[1], [Node::Float(1e300)]).is_err());
        Ok(())
    }

    #[test]
    fn test_large_uint64_widens_to_float() -> Result<()> {
        let array = NdArray::new(ArrayDesc::contiguous(DType::UInt64, &[1]), Buffer::from_vec(vec![0xff; 8]));
        assert_eq!(array.get(&[0])?, Node::Float(u64::MAX as f64));
        Ok(())
    }

    #[test]
    fn test_check_bounds_catches_overflow() {
        let huge = ArrayDesc {
            dtype: DType::Int8,
            byteorder: ByteOrder::Little,
            shape: vec![1 << 32, 1 << 32, 16],
            offset: 0,
            strides: vec![1, 1, 1],
        };
        assert!(huge.check_bounds().unwrap_err().contains("overflows"));

        let far = ArrayDesc {
            offset: usize::MAX - 4,
            ..ArrayDesc::contiguous(DType::Float64, &[2])
        };
        assert!(far.check_bounds().is_err());
        assert!(ArrayDesc::contiguous(DType::Float64, &[3, 4]).check_bounds().is_ok());
        assert!(ArrayDesc::contiguous(DType::Float64, &[0, 1 << 62]).check_bounds().is_ok());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(NdArray::from_f64(&[3], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_read_only_buffer() {
        let buffer = Arc::new(Buffer {
            storage: RwLock::new(Storage::Memory(vec![0; 8])),
            access: ArrayAccess::ReadOnly,
            compression: Mutex::new(None),
        });
        let array = NdArray::new(ArrayDesc::contiguous(DType::Float64, &[1]), buffer);
        let err = array.set(&[0], 1.0).unwrap_err();
        assert!(matches!(err, Error::ReadOnlyViolation { .. }));
    }

    #[test]
    fn test_strided_contiguous_bytes() -> Result<()> {
        let base = NdArray::from_values(DType::UInt8, &[4], (0..4).map(Node::Int))?;
        let odds = base.view(ArrayDesc {
            dtype: DType::UInt8,
            byteorder: ByteOrder::Little,
            shape: vec![2],
            offset: 1,
            strides: vec![2],
        });
        assert_eq!(odds.contiguous_bytes()?.as_ref(), &[1, 3]);
        Ok(())
    }
}
