//! Function handle variant: a managed handle to a type-erased callable.
//!
//! Grounded on the allocation-and-probe shape `include/ce2103/mm/vsptr.hpp`
//! gives every handle variant; the original erases the invocable behind
//! a two-field (vtable + data) carrier object reached through `New`. A
//! `Box<dyn Fn(..) + Send + Sync>` already *is* that two-field carrier
//! (a fat pointer: data pointer + vtable pointer), so this port manages
//! one directly through [`super::Handle`] instead of hand-rolling a
//! vtable struct.

use super::Handle;
use crate::error::Result;

/// A managed handle to a callable taking `Args` and returning `Ret`.
pub struct FnHandle<Args, Ret> {
    handle: Handle<Box<dyn Fn(Args) -> Ret + Send + Sync>>,
}

impl<Args: 'static, Ret: 'static> FnHandle<Args, Ret> {
    /// Erases `callable` behind a managed allocation, using the
    /// process's default manager.
    pub fn new<F>(callable: F) -> Result<Self>
    where
        F: Fn(Args) -> Ret + Send + Sync + 'static,
    {
        let boxed: Box<dyn Fn(Args) -> Ret + Send + Sync> = Box::new(callable);
        Ok(FnHandle {
            handle: Handle::new(boxed)?,
        })
    }

    pub fn is_null(&self) -> bool {
        self.handle.is_null()
    }

    /// Probes the allocation, then dispatches through the carried
    /// callable.
    pub fn call(&self, args: Args) -> Result<Ret> {
        let carrier = self.handle.get()?;
        Ok((carrier)(args))
    }
}

impl<Args, Ret> Clone for FnHandle<Args, Ret> {
    fn clone(&self) -> Self {
        FnHandle {
            handle: self.handle.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calling_dispatches_to_the_erased_closure() {
        let adder = FnHandle::<(i32, i32), i32>::new(|(a, b)| a + b).unwrap();
        assert_eq!(adder.call((2, 3)).unwrap(), 5);
    }

    #[test]
    fn clone_keeps_the_carrier_alive_independently() {
        let counter = std::sync::Arc::new(std::sync::atomic::AtomicI32::new(0));
        let inner = counter.clone();

        let incrementer = FnHandle::<(), i32>::new(move |()| {
            inner.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        })
        .unwrap();

        let second = incrementer.clone();
        incrementer.call(()).unwrap();
        second.call(()).unwrap();

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
