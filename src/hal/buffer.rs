use std::sync::{Arc, Mutex, RwLock, Weak};

use bytemuck::Pod;
use derive_more::Display;
use half::f16;
use serde::{Deserialize, Serialize};

use super::HalError;

/// Memory placement bits for an allocation.
///
/// The heap allocator only serves host memory, but the bits still matter:
/// mapping requires host visibility and a device may refuse dispatch against
/// memory it cannot see.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryType(u32);

impl MemoryType {
    pub const NONE: Self = Self(0);
    pub const HOST_VISIBLE: Self = Self(1 << 0);
    pub const HOST_COHERENT: Self = Self(1 << 1);
    pub const HOST_CACHED: Self = Self(1 << 2);
    pub const HOST_LOCAL: Self = Self(Self::HOST_VISIBLE.0 | Self::HOST_COHERENT.0);
    pub const DEVICE_VISIBLE: Self = Self(1 << 4);
    pub const DEVICE_LOCAL: Self = Self(Self::DEVICE_VISIBLE.0 | (1 << 5));

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for MemoryType {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Usage bits declared at allocation time. Operations check these before
/// touching buffer contents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const NONE: Self = Self(0);
    pub const TRANSFER: Self = Self(1 << 0);
    pub const MAPPING: Self = Self(1 << 1);
    pub const DISPATCH: Self = Self(1 << 2);
    pub const CONSTANT: Self = Self(1 << 3);
    pub const ALL: Self = Self(Self::TRANSFER.0 | Self::MAPPING.0 | Self::DISPATCH.0 | Self::CONSTANT.0);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Element types a [`BufferView`] can carry over a buffer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ElementType {
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl ElementType {
    pub const fn byte_size(self) -> usize {
        match self {
            ElementType::I8 => 1,
            ElementType::I16 => 2,
            ElementType::I32 => 4,
            ElementType::I64 => 8,
            ElementType::F16 => 2,
            ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    /// Stable wire encoding used by the VM import surface.
    pub const fn to_code(self) -> i32 {
        match self {
            ElementType::I8 => 0,
            ElementType::I16 => 1,
            ElementType::I32 => 2,
            ElementType::I64 => 3,
            ElementType::F16 => 4,
            ElementType::F32 => 5,
            ElementType::F64 => 6,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, HalError> {
        match code {
            0 => Ok(ElementType::I8),
            1 => Ok(ElementType::I16),
            2 => Ok(ElementType::I32),
            3 => Ok(ElementType::I64),
            4 => Ok(ElementType::F16),
            5 => Ok(ElementType::F32),
            6 => Ok(ElementType::F64),
            _ => Err(HalError::InvalidArgument(format!(
                "unknown element type code {code}"
            ))),
        }
    }
}

/// Maps host scalar types onto [`ElementType`] for typed buffer access.
pub trait Element: Pod {
    const ELEMENT_TYPE: ElementType;
}

macro_rules! impl_element {
    ($ty:ty, $et:expr) => {
        impl Element for $ty {
            const ELEMENT_TYPE: ElementType = $et;
        }
    };
}

impl_element!(i8, ElementType::I8);
impl_element!(i16, ElementType::I16);
impl_element!(i32, ElementType::I32);
impl_element!(i64, ElementType::I64);
impl_element!(f16, ElementType::F16);
impl_element!(f32, ElementType::F32);
impl_element!(f64, ElementType::F64);

/// A byte-addressable device resource with a fixed capacity.
///
/// Contents are behind an [`RwLock`]; the HAL write/copy/fill paths are the
/// only mutation paths, so readers across worker threads never observe a
/// torn range within one operation.
#[derive(Debug)]
pub struct Buffer {
    memory_type: MemoryType,
    usage: BufferUsage,
    data: RwLock<Box<[u8]>>,
}

impl Buffer {
    pub fn new(memory_type: MemoryType, usage: BufferUsage, capacity: usize) -> Self {
        let data = RwLock::new(vec![0u8; capacity].into_boxed_slice());
        Self {
            memory_type,
            usage,
            data,
        }
    }

    #[inline]
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.read().expect("failed to lock").len()
    }

    fn check_usage(&self, usage: BufferUsage) -> Result<(), HalError> {
        match self.usage.contains(usage) {
            true => Ok(()),
            false => Err(HalError::UnsupportedUsage(format!(
                "buffer usage {:#x} lacks {:#x}",
                self.usage.bits(),
                usage.bits()
            ))),
        }
    }

    fn check_range(&self, offset: usize, length: usize) -> Result<(), HalError> {
        let capacity = self.capacity();
        match offset.checked_add(length) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(HalError::OutOfRange {
                offset,
                length,
                capacity,
            }),
        }
    }

    /// Creates a plain byte view over `[offset, offset + length)`.
    pub fn subspan(
        self: &Arc<Self>,
        offset: usize,
        length: usize,
    ) -> Result<BufferView, HalError> {
        self.check_range(offset, length)?;
        Ok(BufferView {
            buffer: self.clone(),
            offset,
            length,
            shape: vec![length],
            element_type: ElementType::I8,
        })
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), HalError> {
        self.check_usage(BufferUsage::MAPPING)?;
        self.check_range(offset, dst.len())?;
        let data = self.data.read().expect("failed to lock");
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
        Ok(())
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<(), HalError> {
        self.check_usage(BufferUsage::MAPPING)?;
        self.check_range(offset, src.len())?;
        let mut data = self.data.write().expect("failed to lock");
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copies `length` bytes from `source` into `self`. Reads the source range
    /// up front so copying a buffer into itself cannot deadlock on the locks.
    pub fn copy_from(
        &self,
        source: &Buffer,
        source_offset: usize,
        target_offset: usize,
        length: usize,
    ) -> Result<(), HalError> {
        source.check_usage(BufferUsage::TRANSFER)?;
        self.check_usage(BufferUsage::TRANSFER)?;
        source.check_range(source_offset, length)?;
        self.check_range(target_offset, length)?;

        let staged = {
            let data = source.data.read().expect("failed to lock");
            data[source_offset..source_offset + length].to_vec()
        };
        let mut data = self.data.write().expect("failed to lock");
        data[target_offset..target_offset + length].copy_from_slice(&staged);
        Ok(())
    }

    /// Fills `[offset, offset + length)` with a repeating 1, 2, or 4 byte
    /// pattern. `length` must be a multiple of the pattern size.
    pub fn fill(&self, offset: usize, length: usize, pattern: &[u8]) -> Result<(), HalError> {
        self.check_usage(BufferUsage::TRANSFER)?;
        self.check_range(offset, length)?;
        if !matches!(pattern.len(), 1 | 2 | 4) || length % pattern.len() != 0 {
            return Err(HalError::InvalidArgument(format!(
                "fill pattern of {} bytes does not tile length {length}",
                pattern.len()
            )));
        }
        let mut data = self.data.write().expect("failed to lock");
        for chunk in data[offset..offset + length].chunks_mut(pattern.len()) {
            chunk.copy_from_slice(pattern);
        }
        Ok(())
    }

    /// Loads a little-endian value of 1, 2, or 4 bytes, zero-extended to i32.
    pub fn load_i32(&self, offset: usize, length: usize) -> Result<i32, HalError> {
        self.check_usage(BufferUsage::MAPPING)?;
        self.check_range(offset, length)?;
        let data = self.data.read().expect("failed to lock");
        let bytes = &data[offset..offset + length];
        match length {
            1 => Ok(bytes[0] as i32),
            2 => Ok(u16::from_le_bytes([bytes[0], bytes[1]]) as i32),
            4 => Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            _ => Err(HalError::InvalidArgument(format!(
                "load length must be 1, 2, or 4, got {length}"
            ))),
        }
    }

    /// Stores the low 1, 2, or 4 bytes of `value` little-endian.
    pub fn store_i32(&self, value: i32, offset: usize, length: usize) -> Result<(), HalError> {
        self.check_usage(BufferUsage::MAPPING)?;
        self.check_range(offset, length)?;
        let bytes = value.to_le_bytes();
        match length {
            1 | 2 | 4 => self.write_bytes(offset, &bytes[..length]),
            _ => Err(HalError::InvalidArgument(format!(
                "store length must be 1, 2, or 4, got {length}"
            ))),
        }
    }

    /// Writes a typed slice starting at `offset`.
    pub fn write_elements<T: Element>(&self, offset: usize, data: &[T]) -> Result<(), HalError> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Reads `count` typed elements starting at `offset`.
    pub fn read_elements<T: Element>(&self, offset: usize, count: usize) -> Result<Vec<T>, HalError> {
        let mut bytes = vec![0u8; count * size_of::<T>()];
        self.read_bytes(offset, &mut bytes)?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }
}

/// Shape and element metadata over a buffer range. Holds a reference to the
/// backing buffer and never copies bytes.
#[derive(Debug, Clone)]
pub struct BufferView {
    buffer: Arc<Buffer>,
    offset: usize,
    length: usize,
    shape: Vec<usize>,
    element_type: ElementType,
}

impl BufferView {
    /// Creates a shaped view. The byte range implied by `shape` and
    /// `element_type` is validated against the backing buffer here; no later
    /// operation can construct an out-of-range access through the view.
    pub fn new(
        buffer: Arc<Buffer>,
        offset: usize,
        shape: impl Into<Vec<usize>>,
        element_type: ElementType,
    ) -> Result<Self, HalError> {
        let shape = shape.into();
        let count = shape.iter().product::<usize>();
        let length = count
            .checked_mul(element_type.byte_size())
            .ok_or(HalError::OutOfRange {
                offset,
                length: usize::MAX,
                capacity: buffer.capacity(),
            })?;
        buffer.check_range(offset, length)?;
        Ok(Self {
            buffer,
            offset,
            length,
            shape,
            element_type,
        })
    }

    #[inline]
    pub fn buffer(&self) -> Arc<Buffer> {
        self.buffer.clone()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn byte_length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim(&self, index: usize) -> Result<usize, HalError> {
        self.shape
            .get(index)
            .copied()
            .ok_or_else(|| HalError::InvalidArgument(format!("dim {index} out of rank {}", self.rank())))
    }

    #[inline]
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Reads the full view as typed elements. The host type must match the
    /// view's declared element type.
    pub fn read_elements<T: Element>(&self) -> Result<Vec<T>, HalError> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(HalError::InvalidArgument(format!(
                "view of {} read as {}",
                self.element_type,
                T::ELEMENT_TYPE
            )));
        }
        let count = self.length / self.element_type.byte_size();
        self.buffer.read_elements(self.offset, count)
    }
}

/// Satisfies placement requests against some pool of memory. Each device
/// supplies its own strategy; all of them enforce the same usage and type
/// legality rules.
pub trait Allocator: Send + Sync {
    fn capacity(&self) -> usize;
    fn allocated(&self) -> usize;
    fn allocate(
        &self,
        memory_type: MemoryType,
        usage: BufferUsage,
        size: usize,
    ) -> Result<Arc<Buffer>, HalError>;
}

/// Host-heap allocator with byte-capacity bookkeeping. Freed buffers are
/// observed through dropped [`Weak`] handles rather than an explicit free
/// call, mirroring how refs release them.
pub struct HeapAllocator {
    capacity: usize,
    live: Mutex<Vec<(Weak<Buffer>, usize)>>,
}

impl HeapAllocator {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            live: Mutex::new(Vec::new()),
        })
    }

    /// An allocator with effectively unbounded capacity.
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX)
    }
}

impl Allocator for HeapAllocator {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn allocated(&self) -> usize {
        let mut live = self.live.lock().expect("failed to lock");
        live.retain(|(buffer, _)| buffer.strong_count() > 0);
        live.iter().map(|(_, size)| size).sum()
    }

    fn allocate(
        &self,
        memory_type: MemoryType,
        usage: BufferUsage,
        size: usize,
    ) -> Result<Arc<Buffer>, HalError> {
        if usage.is_empty() {
            return Err(HalError::UnsupportedUsage("empty usage".into()));
        }
        if usage.contains(BufferUsage::MAPPING) && !memory_type.contains(MemoryType::HOST_VISIBLE) {
            return Err(HalError::UnsupportedUsage(
                "mapping requires host-visible memory".into(),
            ));
        }

        let mut live = self.live.lock().expect("failed to lock");
        live.retain(|(buffer, _)| buffer.strong_count() > 0);
        let allocated = live.iter().map(|(_, size)| size).sum::<usize>();
        if allocated.checked_add(size).is_none_or(|total| total > self.capacity) {
            return Err(HalError::OutOfMemory {
                requested: size,
                allocated,
                capacity: self.capacity,
            });
        }

        let buffer = Arc::new(Buffer::new(memory_type, usage, size));
        live.push((Arc::downgrade(&buffer), size));
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_buffer(capacity: usize) -> Arc<Buffer> {
        Arc::new(Buffer::new(
            MemoryType::HOST_LOCAL,
            BufferUsage::ALL,
            capacity,
        ))
    }

    #[test]
    fn test_subspan_bounds() {
        let buffer = host_buffer(64);
        for (offset, length) in [(0, 64), (32, 32), (64, 0), (8, 40)] {
            assert!(buffer.subspan(offset, length).is_ok());
        }
        // 32 + 40 > 64
        let err = buffer.subspan(32, 40).unwrap_err();
        assert!(matches!(
            err,
            HalError::OutOfRange {
                offset: 32,
                length: 40,
                capacity: 64,
            }
        ));
        assert!(buffer.subspan(65, 0).is_err());
    }

    #[test]
    fn test_fill_and_load() {
        let buffer = host_buffer(16);
        buffer.fill(0, 16, &0xABu8.to_le_bytes()).unwrap();
        assert_eq!(buffer.load_i32(0, 1).unwrap(), 0xAB);
        buffer.fill(8, 8, &0x01020304i32.to_le_bytes()).unwrap();
        assert_eq!(buffer.load_i32(12, 4).unwrap(), 0x01020304);

        // length not a multiple of the pattern
        assert!(buffer.fill(0, 6, &0u32.to_le_bytes()).is_err());
    }

    #[test]
    fn test_copy_between_buffers() {
        let source = host_buffer(8);
        let target = host_buffer(8);
        source.write_bytes(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        target.copy_from(&source, 4, 0, 4).unwrap();
        let mut read = [0u8; 4];
        target.read_bytes(0, &mut read).unwrap();
        assert_eq!(read, [5, 6, 7, 8]);

        // self-copy must not deadlock
        source.copy_from(&source, 0, 4, 4).unwrap();
        source.read_bytes(4, &mut read).unwrap();
        assert_eq!(read, [1, 2, 3, 4]);
    }

    #[test]
    fn test_usage_checks() {
        let constant = Arc::new(Buffer::new(
            MemoryType::HOST_LOCAL,
            BufferUsage::CONSTANT | BufferUsage::DISPATCH,
            16,
        ));
        assert!(matches!(
            constant.write_bytes(0, &[0]),
            Err(HalError::UnsupportedUsage(_))
        ));
        assert!(matches!(
            constant.fill(0, 4, &[0]),
            Err(HalError::UnsupportedUsage(_))
        ));
    }

    #[test]
    fn test_typed_view() {
        use half::f16;

        let buffer = host_buffer(64);
        let values = [f16::from_f32(0.5), f16::from_f32(-2.0)];
        buffer.write_elements(8, &values).unwrap();

        let view = BufferView::new(buffer.clone(), 8, [2], ElementType::F16).unwrap();
        assert_eq!(view.byte_length(), 4);
        assert_eq!(view.rank(), 1);
        assert_eq!(view.dim(0).unwrap(), 2);
        assert_eq!(view.read_elements::<f16>().unwrap(), values);
        assert!(view.read_elements::<f32>().is_err());

        // shape overflows the backing buffer
        assert!(BufferView::new(buffer, 8, [32], ElementType::F32).is_err());
    }

    #[test]
    fn test_heap_allocator_capacity() {
        let allocator = HeapAllocator::new(64);
        let a = allocator
            .allocate(MemoryType::HOST_LOCAL, BufferUsage::ALL, 48)
            .unwrap();
        let err = allocator
            .allocate(MemoryType::HOST_LOCAL, BufferUsage::ALL, 32)
            .unwrap_err();
        assert!(matches!(err, HalError::OutOfMemory { requested: 32, .. }));

        // releasing the first buffer frees its bytes
        drop(a);
        assert_eq!(allocator.allocated(), 0);
        allocator
            .allocate(MemoryType::HOST_LOCAL, BufferUsage::ALL, 64)
            .unwrap();
    }

    #[test]
    fn test_allocator_legality() {
        let allocator = HeapAllocator::unbounded();
        assert!(matches!(
            allocator.allocate(MemoryType::HOST_LOCAL, BufferUsage::NONE, 4),
            Err(HalError::UnsupportedUsage(_))
        ));
        assert!(matches!(
            allocator.allocate(MemoryType::DEVICE_LOCAL, BufferUsage::MAPPING, 4),
            Err(HalError::UnsupportedUsage(_))
        ));
    }
}
