//! Host side data eligible for device transfer.
//!
//! [`HostBuffer`] is the buffer descriptor used by task graphs. It is a cheap
//! handle, clones refer to the same data and compare equal. Byte size is fixed
//! at creation, resizing means creating a new buffer and a new graph.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::dtype::{DType, Scalar};

/// Process unique identity of a host buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferKey(u64);

impl Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("b{}", self.0))
    }
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(0);

/// When are host and device copies synchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransferPolicy {
    /// Copy only in the first execution after device binding
    FirstExecution,
    /// Copy in every execution
    EveryExecution,
    /// Never copied by the plan, caller transfers explicitly
    UserManaged,
}

impl Display for TransferPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransferPolicy::FirstExecution => "FIRST_EXECUTION",
            TransferPolicy::EveryExecution => "EVERY_EXECUTION",
            TransferPolicy::UserManaged => "USER_MANAGED",
        })
    }
}

#[derive(Debug)]
struct Inner {
    key: BufferKey,
    name: Box<str>,
    dtype: DType,
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

/// Handle to host resident data that can be moved to devices
#[derive(Debug, Clone)]
pub struct HostBuffer {
    inner: Arc<Inner>,
}

impl PartialEq for HostBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.key == other.inner.key
    }
}

impl Eq for HostBuffer {}

impl std::hash::Hash for HostBuffer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.key.hash(state);
    }
}

impl HostBuffer {
    fn from_bytes(dtype: DType, data: Vec<u8>) -> HostBuffer {
        let key = BufferKey(NEXT_KEY.fetch_add(1, Ordering::Relaxed));
        HostBuffer {
            inner: Arc::new(Inner {
                key,
                name: format!("{key}").into(),
                dtype,
                data: RwLock::new(data),
                dirty: AtomicBool::new(true),
            }),
        }
    }

    /// Creates buffer holding copy of `data`
    #[must_use]
    pub fn from_slice<T: Scalar>(data: &[T]) -> HostBuffer {
        HostBuffer::from_bytes(T::dtype(), bytemuck::cast_slice(data).to_vec())
    }

    /// Creates buffer with `len` zeroed elements
    #[must_use]
    pub fn zeros<T: Scalar>(len: usize) -> HostBuffer {
        HostBuffer::from_bytes(T::dtype(), vec![0; len * T::dtype().byte_size()])
    }

    /// Creates buffer with `len` copies of `value`
    #[must_use]
    pub fn filled<T: Scalar>(len: usize, value: T) -> HostBuffer {
        HostBuffer::from_slice(&vec![value; len])
    }

    /// Same buffer with a readable name, used in errors and traces.
    ///
    /// Name can only be set before the handle is cloned. If other handles
    /// already exist, the buffer keeps its current name.
    #[must_use]
    pub fn named(self, name: &str) -> HostBuffer {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.name = name.into();
                HostBuffer { inner: Arc::new(inner) }
            }
            Err(inner) => HostBuffer { inner },
        }
    }

    #[must_use]
    pub fn key(&self) -> BufferKey {
        self.inner.key
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.inner.data.read().len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.byte_size() / self.inner.dtype.byte_size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.byte_size() == 0
    }

    /// Was host data written since last host to device copy?
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty(&self) {
        self.inner.dirty.store(false, Ordering::Release);
    }

    /// Copies data out of the buffer.
    ///
    /// # Panics
    /// Panics if `T` does not match buffer's dtype.
    #[must_use]
    pub fn to_vec<T: Scalar>(&self) -> Vec<T> {
        assert_eq!(T::dtype(), self.dtype(), "reading {} buffer as {}", self.dtype(), T::dtype());
        let data = self.inner.data.read();
        cast_to_vec(&data)
    }

    /// Returns element at `index`.
    ///
    /// # Panics
    /// Panics if `T` does not match buffer's dtype or index is out of bounds.
    #[must_use]
    pub fn get<T: Scalar>(&self, index: usize) -> T {
        assert_eq!(T::dtype(), self.dtype(), "reading {} buffer as {}", self.dtype(), T::dtype());
        let size = T::dtype().byte_size();
        let data = self.inner.data.read();
        bytemuck::pod_read_unaligned(&data[index * size..(index + 1) * size])
    }

    /// Overwrites the whole buffer, marks it dirty.
    ///
    /// # Panics
    /// Panics if `T` does not match buffer's dtype or lengths differ.
    pub fn write<T: Scalar>(&self, values: &[T]) {
        assert_eq!(T::dtype(), self.dtype(), "writing {} into {} buffer", T::dtype(), self.dtype());
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let mut data = self.inner.data.write();
        assert_eq!(bytes.len(), data.len(), "host buffers can not be resized");
        data.copy_from_slice(bytes);
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// Sets one element, marks buffer dirty.
    ///
    /// # Panics
    /// Panics if `T` does not match buffer's dtype or index is out of bounds.
    pub fn set<T: Scalar>(&self, index: usize, value: T) {
        assert_eq!(T::dtype(), self.dtype(), "writing {} into {} buffer", T::dtype(), self.dtype());
        let size = T::dtype().byte_size();
        let mut data = self.inner.data.write();
        data[index * size..(index + 1) * size].copy_from_slice(bytemuck::bytes_of(&value));
        self.inner.dirty.store(true, Ordering::Release);
    }

    /// Raw bytes for host to device copies
    pub(crate) fn read_bytes(&self) -> parking_lot::RwLockReadGuard<'_, Vec<u8>> {
        self.inner.data.read()
    }

    /// Commits bytes copied from device. Does not mark the buffer dirty,
    /// host and device agree after this.
    pub(crate) fn commit_bytes(&self, bytes: &[u8]) {
        let mut data = self.inner.data.write();
        data.copy_from_slice(bytes);
    }
}

pub(crate) fn cast_to_vec<T: Scalar>(bytes: &[u8]) -> Vec<T> {
    let mut res = vec![T::zeroed(); bytes.len() / core::mem::size_of::<T>()];
    bytemuck::cast_slice_mut::<T, u8>(&mut res).copy_from_slice(bytes);
    res
}

/// Named group of buffers transferred and passed to kernels as one unit,
/// like an object whose fields are arrays.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aggregate {
    name: Box<str>,
    members: Vec<HostBuffer>,
}

impl Aggregate {
    #[must_use]
    pub fn new(name: &str) -> Aggregate {
        Aggregate { name: name.into(), members: Vec::new() }
    }

    /// Adds member buffer, duplicates are ignored
    #[must_use]
    pub fn with(mut self, buffer: &HostBuffer) -> Aggregate {
        if !self.members.contains(buffer) {
            self.members.push(buffer.clone());
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn members(&self) -> &[HostBuffer] {
        &self.members
    }

    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.members.iter().map(HostBuffer::byte_size).sum()
    }
}

/// Anything that can be declared as a transfer
#[derive(Debug, Clone)]
pub enum Transferable {
    Buffer(HostBuffer),
    Aggregate(Aggregate),
}

impl Transferable {
    /// Decomposes into member buffers
    pub(crate) fn buffers(&self) -> &[HostBuffer] {
        match self {
            Transferable::Buffer(buffer) => core::slice::from_ref(buffer),
            Transferable::Aggregate(aggregate) => aggregate.members(),
        }
    }
}

impl From<&HostBuffer> for Transferable {
    fn from(value: &HostBuffer) -> Self {
        Transferable::Buffer(value.clone())
    }
}

impl From<HostBuffer> for Transferable {
    fn from(value: HostBuffer) -> Self {
        Transferable::Buffer(value)
    }
}

impl From<&Aggregate> for Transferable {
    fn from(value: &Aggregate) -> Self {
        Transferable::Aggregate(value.clone())
    }
}

impl From<Aggregate> for Transferable {
    fn from(value: Aggregate) -> Self {
        Transferable::Aggregate(value)
    }
}
