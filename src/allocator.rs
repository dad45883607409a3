//! Allocator adaptor (C7): bridges managed handles to the shape of a
//! standard container allocator.
//!
//! Grounded on `include/ce2103/mm/allocator.hpp` (`ce2103::mm::allocator`,
//! `ce2103::mm::unsafe_ptr`). `std::alloc::Allocator` is still unstable,
//! so this port exposes the same inherent `allocate`/`deallocate` shape
//! the header does, usable by hand-written collection code rather than
//! through the unstable trait.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use crate::alloc::{self, Locality, MemoryManager};
use crate::error::Result;
use crate::handle::Handle;

/// A raw-pointer-like handle returned by [`Allocator::allocate`].
/// Supports the increment/decrement/offset operations
/// `std::iterator_traits` expects of a random-access iterator, the same
/// set `unsafe_ptr<T>` provides in the original.
pub struct UnsafePtr<T> {
    raw: *mut T,
    id: u64,
    locality: Locality,
}

unsafe impl<T: Send> Send for UnsafePtr<T> {}
unsafe impl<T: Sync> Sync for UnsafePtr<T> {}

impl<T: 'static> UnsafePtr<T> {
    /// Wraps an arbitrary reference with no manager participation —
    /// `unsafe_ptr::pointer_to` in the original.
    pub fn pointer_to(object: &mut T) -> Self {
        UnsafePtr {
            raw: object as *mut T,
            id: 0,
            locality: Locality::Unowned,
        }
    }

    pub fn null() -> Self {
        UnsafePtr {
            raw: std::ptr::null_mut(),
            id: 0,
            locality: Locality::Unowned,
        }
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_null()
    }

    fn manager(&self) -> Option<&'static dyn MemoryManager> {
        crate::handle::manager_for(self.locality)
    }

    /// Dereferences through the backing manager's probe hint, exactly
    /// like every other handle variant's `access()`.
    pub fn get(&self) -> Result<Guard<'_, T>> {
        if self.is_null() {
            return Err(crate::error::ManagedMemoryError::NullDereference);
        }

        if let Some(manager) = self.manager() {
            manager.probe(self.raw as *const (), false)?;
        }

        Ok(Guard {
            raw: self.raw,
            _marker: PhantomData,
        })
    }

    fn clone_with(&self, new_raw: *mut T) -> Self {
        if let Some(manager) = self.manager() {
            manager.lift(self.id);
        }

        UnsafePtr {
            raw: new_raw,
            id: self.id,
            locality: self.locality,
        }
    }

    pub fn add(&self, offset: isize) -> Self {
        self.clone_with(unsafe { self.raw.offset(offset) })
    }

    pub fn sub(&self, offset: isize) -> Self {
        self.add(-offset)
    }

    pub fn offset_from(&self, other: &Self) -> isize {
        unsafe { self.raw.offset_from(other.raw) }
    }
}

impl<T> Clone for UnsafePtr<T> {
    fn clone(&self) -> Self {
        if let Some(manager) = crate::handle::manager_for(self.locality) {
            manager.lift(self.id);
        }

        UnsafePtr {
            raw: self.raw,
            id: self.id,
            locality: self.locality,
        }
    }
}

impl<T> Drop for UnsafePtr<T> {
    fn drop(&mut self) {
        if let Some(manager) = crate::handle::manager_for(self.locality) {
            manager.drop_id(self.id);
        }
    }
}

/// A read guard returned by [`UnsafePtr::get`].
pub struct Guard<'a, T> {
    raw: *mut T,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> Deref for Guard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.raw }
    }
}

impl<'a, T> DerefMut for Guard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.raw }
    }
}

/// A container allocator over managed arrays of `T`. `deallocate` is a
/// no-op: lifetime is refcount-driven, same as `allocator<T>::deallocate`
/// in the original.
pub struct Allocator<T> {
    _marker: PhantomData<T>,
}

impl<T> Default for Allocator<T> {
    fn default() -> Self {
        Allocator { _marker: PhantomData }
    }
}

impl<T> Clone for Allocator<T> {
    fn clone(&self) -> Self {
        Allocator { _marker: PhantomData }
    }
}

// All instances compare equal: allocation identity is global, not tied
// to a particular `Allocator` value.
impl<T> PartialEq for Allocator<T> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<T> Eq for Allocator<T> {}

impl<T: 'static> Allocator<T> {
    pub fn new() -> Self {
        Allocator::default()
    }

    pub fn allocate(&self, count: usize) -> Result<UnsafePtr<T>> {
        let manager = crate::init::default_manager();
        let (id, base, payload) = alloc::allocate_of::<T>(manager, count, true)?;

        // Leaves elements uninitialized; matches the original, which
        // reserves storage without constructing elements (construction
        // is the caller's job via placement-new equivalents).
        unsafe {
            (*base).set_initialized(0);
        }

        Ok(UnsafePtr {
            raw: payload,
            id,
            locality: manager.locality(),
        })
    }

    pub fn deallocate(&self, _ptr: UnsafePtr<T>, _count: usize) {}
}

impl<T: 'static> From<Handle<T>> for UnsafePtr<T> {
    fn from(handle: Handle<T>) -> Self {
        // Reuses the handle's existing refcount rather than lifting a
        // fresh one.
        let (raw, id, locality) = handle.into_raw_parts();
        UnsafePtr { raw, id, locality }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_index_through_pointer_arithmetic() {
        let allocator = Allocator::<i32>::new();
        let base = allocator.allocate(4).unwrap();

        // Elements are uninitialized; write through raw pointer
        // arithmetic like a real allocator's client would.
        for i in 0..4i32 {
            let cursor = base.add(i as isize);
            unsafe {
                std::ptr::write(cursor.raw as *mut i32, i * i);
            }
        }

        for i in 0..4i32 {
            let cursor = base.add(i as isize);
            assert_eq!(*cursor.get().unwrap(), i * i);
        }

        allocator.deallocate(base, 4);
    }

    #[test]
    fn all_allocators_compare_equal() {
        let a = Allocator::<u8>::new();
        let b = Allocator::<u8>::new();
        assert!(a == b);
    }
}
