//! Allocation model: type-erased headers (C1), the local collector (C2),
//! and the remote manager (C5), unified behind the [`MemoryManager`]
//! trait.
//!
//! Grounded on `include/ce2103/mm/gc.hpp` (`ce2103::mm::memory_manager`,
//! `ce2103::mm::allocation`, `ce2103::mm::at`, `ce2103::mm::drop_result`)
//! and `src/gc.cpp`.

pub mod header;
pub mod local;
pub mod remote;

use std::mem;

use serde_json::json;

pub use header::Allocation;
pub use local::LocalManager;
pub use remote::RemoteManager;

use crate::error::{ManagedMemoryError, Result};

/// Where an allocation physically lives.
///
/// `Unowned` indicates a null or raw-address-adapted handle with no
/// manager participation — see [`crate::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    Local,
    Remote,
    Unowned,
}

impl Locality {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Locality::Local => "local",
            Locality::Remote => "remote",
            Locality::Unowned => "unknown",
        }
    }
}

/// Outcome of decrementing an allocation's reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropResult {
    /// Count is still greater than 1.
    Reduced,
    /// Count just reached 1 — the last cleanup step is pending.
    Hanging,
    /// Count just reached 0 — storage will be released.
    Lost,
}

/// Common contract shared by the local collector and the remote manager.
///
/// Mirrors `ce2103::mm::memory_manager`: `do_*` methods are the
/// polymorphic primitives (the C++ `virtual`s); `lift`/`drop_id`/`evict`
/// are provided methods that add debug-sink logging around them, exactly
/// as the non-virtual `memory_manager::lift`/`drop`/`evict` wrap
/// `do_lift`/`do_drop`/`do_evict` in the original.
pub trait MemoryManager: Send + Sync {
    /// This manager's locality tag.
    fn locality(&self) -> Locality;

    /// Returns the allocation header for a given ID. For the remote
    /// manager this performs no RPC — materialization happens lazily
    /// on page fault when the returned pointer is dereferenced.
    fn get_base(&self, id: u64) -> *mut Allocation;

    /// Reserves a new allocation of `size` bytes tagged with the given
    /// (debug-only) type name, returning its ID.
    fn do_allocate(&self, size: usize, type_name: &'static str) -> Result<u64>;

    /// Increments an allocation's reference count. Must fail-fast if the
    /// ID is unknown.
    fn do_lift(&self, id: u64);

    /// Decrements an allocation's reference count.
    fn do_drop(&self, id: u64) -> DropResult;

    /// Hints that recent writes to this allocation should now be made
    /// durable. A no-op by default (overridden by the remote manager).
    fn do_evict(&self, _id: u64) {}

    /// Hints that the given address is about to be read or written. A
    /// no-op by default (overridden by the remote manager, whose
    /// dereferences otherwise rely solely on the `SIGSEGV` path).
    fn probe(&self, _address: *const (), _for_write: bool) -> Result<()> {
        Ok(())
    }

    /// Increments the reference count of `id`, logging a debug snapshot.
    fn lift(&self, id: u64) {
        self.do_lift(id);
        crate::debug::global().log("lift", id, self.locality(), &[]);
    }

    /// Decrements the reference count of `id`, logging a debug snapshot.
    fn drop_id(&self, id: u64) -> DropResult {
        let result = self.do_drop(id);
        crate::debug::global().log("drop", id, self.locality(), &[]);
        result
    }

    /// Flushes pending writes for `id` and logs a debug snapshot of its
    /// current contents.
    ///
    /// Relies on the caller having already probed the allocation for the
    /// access that produced the value being evicted — the original makes
    /// the same assumption (`evict` reads raw memory without probing).
    fn evict(&self, id: u64) {
        let representation = unsafe { &*self.get_base(id) }.represent();
        crate::debug::global().log(
            "write",
            id,
            self.locality(),
            &[("value", json!(representation))],
        );

        self.do_evict(id);
    }
}

/// Computes the total allocation size for `count` elements of `T` and
/// places + returns a handle triple `(id, header, payload)` from the
/// given manager.
///
/// Mirrors the template method `memory_manager::allocate_of<T>` in
/// `gc.hpp`: a non-virtual template calling into the manager's virtual
/// `do_allocate`/`get_base`.
pub fn allocate_of<T: 'static>(
    manager: &'static dyn MemoryManager,
    count: usize,
    always_array: bool,
) -> Result<(u64, *mut Allocation, *mut T)> {
    let descriptor = if count == 1 && !always_array {
        header::single_descriptor::<T>()
    } else {
        header::array_descriptor::<T>()
    };

    let total_size = mem::size_of::<Allocation>() + descriptor.header_padding() + descriptor.element_size() * count;

    let id = manager.do_allocate(total_size, std::any::type_name::<T>())?;
    let base = manager.get_base(id);

    unsafe {
        Allocation::init_at(base, descriptor);
        let payload = (*base).payload_base() as *mut T;

        crate::debug::global().log(
            "alloc",
            id,
            manager.locality(),
            &[("type", json!(std::any::type_name::<T>()))],
        );

        Ok((id, base, payload))
    }
}

/// Number of bytes-worth of header + alignment padding for `T`'s
/// allocations, used by the remote manager to compute the number of
/// page-sized parts a header spans.
pub fn header_size_of<T: 'static>() -> usize {
    mem::size_of::<Allocation>() + header::single_descriptor::<T>().header_padding()
}

pub(crate) fn network_failure() -> ManagedMemoryError {
    ManagedMemoryError::NetworkFailure
}
