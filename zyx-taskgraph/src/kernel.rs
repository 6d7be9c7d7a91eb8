//! Opaque references to compiled kernels.
//!
//! Task graphs never look inside kernels, they only carry them to devices.
//! Devices downcast kernels they know how to run through [`Kernel::as_any`].

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

/// Compiled unit of device code
pub trait Kernel: Debug + Send + Sync + Any {
    /// Name used in traces and profiler output
    fn name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;
}

/// Shared kernel reference, two references are equal only if they point to
/// the same kernel.
#[derive(Debug, Clone)]
pub struct KernelRef(Arc<dyn Kernel>);

impl KernelRef {
    pub fn new(kernel: impl Kernel) -> KernelRef {
        KernelRef(Arc::new(kernel))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Downcast to concrete kernel type
    #[must_use]
    pub fn downcast<K: Kernel>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref::<K>()
    }
}

impl PartialEq for KernelRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for KernelRef {}

impl<K: Kernel> From<K> for KernelRef {
    fn from(value: K) -> Self {
        KernelRef::new(value)
    }
}

impl From<&KernelRef> for KernelRef {
    fn from(value: &KernelRef) -> Self {
        value.clone()
    }
}
