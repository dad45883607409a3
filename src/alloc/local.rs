//! Local collector: a background thread that reaps allocations whose
//! reference count has reached zero.
//!
//! Grounded on `ce2103::mm::garbage_collector`
//! (`include/ce2103/mm/gc.hpp`, `src/gc.cpp`). The C++ singleton is a
//! function-local `static` destroyed at program exit; since Rust does
//! not run destructors on leaked `'static` data, this port registers an
//! explicit `libc::atexit` hook to reproduce the same shutdown-time
//! leak diagnostic (see DESIGN.md).

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{Allocation, DropResult, Locality, MemoryManager};
use crate::error::{ManagedMemoryError, Result};

const GC_PERIOD: Duration = Duration::from_secs(5);

/// Allocations are given at least this alignment, mirroring the
/// (undocumented, but relied upon) guarantee of C++'s global
/// `operator new`.
const ALLOC_ALIGN: usize = 16;

struct HeaderPtr(*mut Allocation);

// SAFETY: access to the pointee is always mediated by `LocalManager`'s
// `state` mutex, and at most one thread (the reaper, after removing the
// entry from the table) ever touches a given header concurrently with
// no other live reference remaining.
unsafe impl Send for HeaderPtr {}

struct Entry {
    count: usize,
    header: HeaderPtr,
    size: usize,
}

struct State {
    table: HashMap<u64, Entry>,
    next_id: u64,
}

/// The local memory manager: refcount table, ID issuance, and the
/// background reaper thread.
pub struct LocalManager {
    state: Mutex<State>,
    wakeup: Condvar,
    reaper: Mutex<Option<JoinHandle<()>>>,
    terminate: AtomicBool,
    start: std::sync::Once,
}

static INSTANCE: OnceLock<LocalManager> = OnceLock::new();

impl LocalManager {
    fn new() -> Self {
        LocalManager {
            state: Mutex::new(State {
                table: HashMap::new(),
                next_id: 0,
            }),
            wakeup: Condvar::new(),
            reaper: Mutex::new(None),
            terminate: AtomicBool::new(false),
            start: std::sync::Once::new(),
        }
    }

    /// Returns the quasi-singleton instance, starting its reaper thread
    /// (and registering the process-exit leak diagnostic) on first call.
    pub fn instance() -> &'static LocalManager {
        let manager = INSTANCE.get_or_init(LocalManager::new);
        manager.start.call_once(|| {
            *manager.reaper.lock().unwrap() = Some(thread::spawn(move || manager.main_loop()));

            // SAFETY: `shutdown_hook` only reads the already-initialized
            // `INSTANCE` static and does not unwind.
            unsafe {
                libc::atexit(shutdown_hook);
            }
        });

        manager
    }

    /// Enforces that, if no other allocation occurs in between, the next
    /// `ids` allocations will be contiguous and ordered in the ID
    /// namespace.
    pub fn reserve_contiguous(&self, ids: u64) {
        let mut state = self.state.lock().unwrap();

        let mut test_from = state.next_id;
        loop {
            let mut found = true;
            for candidate in test_from..test_from + ids {
                if state.table.contains_key(&candidate) {
                    found = false;
                    test_from = candidate + 1;
                    break;
                }
            }

            if found {
                break;
            }
        }

        state.next_id = test_from;
    }

    fn main_loop(&'static self) {
        let mut guard = self.state.lock().unwrap();

        loop {
            let (next_guard, _timeout) = self
                .wakeup
                .wait_timeout_while(guard, GC_PERIOD, |_| {
                    !self.terminate.load(Ordering::Acquire)
                })
                .unwrap();
            guard = next_guard;

            loop {
                let zero_id = guard
                    .table
                    .iter()
                    .find(|(_, entry)| entry.count == 0)
                    .map(|(id, _)| *id);

                let Some(id) = zero_id else {
                    break;
                };

                let entry = guard.table.remove(&id).expect("entry just found by ID");

                // Release the lock before running destructors: a
                // destructor may itself call drop() on another handle.
                drop(guard);

                unsafe {
                    let header = &mut *entry.header.0;
                    header.destroy_all();

                    let layout = Layout::from_size_align(entry.size, ALLOC_ALIGN)
                        .expect("layout was validated at allocation time");
                    std::alloc::dealloc(entry.header.0 as *mut u8, layout);
                }

                guard = self.state.lock().unwrap();
            }

            if self.terminate.load(Ordering::Acquire) {
                break;
            }
        }

        if !guard.table.is_empty() {
            tracing::error!("these allocations have stale references at GC termination");
            for (id, entry) in guard.table.iter() {
                let header = unsafe { &*entry.header.0 };
                tracing::error!(
                    id,
                    count = entry.count,
                    type_name = header.type_name(),
                    "leaked allocation (cycles are not collected)"
                );
            }
        }
    }

    fn shutdown(&self) {
        self.terminate.store(true, Ordering::Release);
        self.wakeup.notify_one();

        if let Some(handle) = self.reaper.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

extern "C" fn shutdown_hook() {
    if let Some(manager) = INSTANCE.get() {
        manager.shutdown();
    }
}

impl MemoryManager for LocalManager {
    fn locality(&self) -> Locality {
        Locality::Local
    }

    fn get_base(&self, id: u64) -> *mut Allocation {
        let state = self.state.lock().unwrap();
        let entry = state.table.get(&id).expect("ID is unassigned");
        entry.header.0
    }

    fn do_allocate(&self, size: usize, _type_name: &'static str) -> Result<u64> {
        let layout =
            Layout::from_size_align(size.max(1), ALLOC_ALIGN).map_err(|_| ManagedMemoryError::MemoryError)?;

        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(ManagedMemoryError::MemoryError);
        }

        let mut state = self.state.lock().unwrap();

        let mut id = state.next_id;
        while state.table.contains_key(&id) {
            id += 1;
        }
        state.next_id = id + 1;

        state.table.insert(
            id,
            Entry {
                count: 1,
                header: HeaderPtr(ptr as *mut Allocation),
                size: size.max(1),
            },
        );

        Ok(id)
    }

    fn do_lift(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        let entry = state.table.get_mut(&id).expect("ID is unassigned");
        entry.count += 1;
    }

    fn do_drop(&self, id: u64) -> DropResult {
        let mut state = self.state.lock().unwrap();
        let entry = state.table.get_mut(&id).expect("ID is unassigned");
        assert!(entry.count > 0, "double-drop of ID {id}");

        entry.count -= 1;
        match entry.count {
            0 => DropResult::Lost,
            1 => DropResult::Hanging,
            _ => DropResult::Reduced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn allocate_lift_drop_lifecycle() {
        let manager = LocalManager::instance();
        let (id, base, payload) = super::super::allocate_of::<u32>(manager, 1, false).unwrap();

        unsafe {
            payload.write(5);
            (*base).set_initialized(1);
        }

        manager.lift(id);
        assert_eq!(manager.drop_id(id), DropResult::Reduced);
        assert_eq!(manager.drop_id(id), DropResult::Hanging);
        assert_eq!(manager.drop_id(id), DropResult::Lost);

        // Give the reaper a chance to run its next pass.
        std::thread::sleep(Duration::from_millis(50));
    }

    #[test]
    fn reserve_contiguous_matches_spec_example() {
        let manager = LocalManager::instance();

        // Occupy an ID so there is a gap to skip past, mirroring S6.
        let (occupied, _, _) = super::super::allocate_of::<u8>(manager, 1, false).unwrap();

        manager.reserve_contiguous(1);
        let state = manager.state.lock().unwrap();
        let next_id = state.next_id;
        drop(state);

        assert!(next_id > occupied);
    }
}
