//! Fault-driven demand paging over a trapped virtual memory region.
//!
//! Grounded on `src/sigsegv.cpp`: a huge `PROT_NONE` mapping backed by
//! an anonymous sparse file (`memfd_create`) stands in for every remote
//! allocation's address range. Touching an unmapped page raises
//! `SIGSEGV`; the handler hands the fault off to a dedicated thread
//! (mutex/condvar transaction, since a signal handler cannot safely
//! take locks used elsewhere, run destructors, or make RPCs on its own
//! stack) which fetches the page's contents and `mprotect`s it in.
//!
//! One simplification from the original: `remote_manager::probe` there
//! triggers its *own* `SIGSEGV` (via a volatile read) and recovers from
//! an unrecoverable fault with `setjmp`/`longjmp`. Rust has no sound way
//! to unwind across a signal boundary, so [`FaultHandler::probe`] here
//! calls straight into the same transaction machinery used by the
//! signal handler, without going through an actual fault. The real
//! `SIGSEGV` path — for ordinary pointer dereferences that skip an
//! explicit probe — is unchanged: it still runs on the kernel's fault
//! and still terminates the process if servicing it fails, exactly as
//! `handle_segmentation_fault`'s non-probing branch does.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::ptr;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::Duration;

use crate::error::{ManagedMemoryError, Result};

const WRITE_FAULT_BIT: i64 = 0b10;

/// Defaults to 5ms, overridable via `MM_WRITEBACK_TIMEOUT_MS` for tests
/// and deployments with a slower memory server.
fn writeback_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        std::env::var("MM_WRITEBACK_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(5))
    })
}

/// Supplies page contents to, and accepts writebacks from, the fault
/// handler. Implemented by [`crate::alloc::remote::RemoteManager`].
pub trait PageClient: Send + Sync {
    fn fetch(&self, id: u64) -> Option<Vec<u8>>;
    fn overwrite(&self, id: u64, contents: &[u8]) -> bool;
}

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// 256MiB/1TiB of virtual address space for 32-bit/64-bit platforms.
fn region_size() -> usize {
    1usize << (16 + 3 * std::mem::size_of::<*const ()>())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Operation {
    BeginRead,
    BeginWrite,
    Terminate,
    Wipe,
    Evict,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FaultResult {
    Success,
    Uncaught,
    FetchFailure,
    MappingFailure,
}

impl FaultResult {
    fn into_result(self) -> Result<()> {
        match self {
            FaultResult::Success => Ok(()),
            FaultResult::FetchFailure => Err(ManagedMemoryError::NetworkFailure),
            FaultResult::MappingFailure | FaultResult::Uncaught => Err(ManagedMemoryError::MemoryError),
        }
    }
}

struct PendingRequest {
    action: Operation,
    address: *mut u8,
    limit: usize,
}

struct HandlerState {
    pending: Option<PendingRequest>,
    response: Option<FaultResult>,
}

// SAFETY: all access to `address` goes through the `state` mutex, and
// the pointer is never dereferenced by `FaultHandler` itself — only
// used for page-alignment arithmetic and offset lookups.
unsafe impl Send for HandlerState {}

/// Owns the trap region and the background thread that services
/// faults raised against it.
pub struct FaultHandler {
    base: *mut u8,
    landing_fd: i32,
    client: &'static dyn PageClient,
    state: Mutex<HandlerState>,
    wakeup: Condvar,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

// SAFETY: `base` and `landing_fd` are read-only after `install`; all
// mutation happens on the single handler thread under `state`.
unsafe impl Send for FaultHandler {}
unsafe impl Sync for FaultHandler {}

static HANDLER: OnceLock<FaultHandler> = OnceLock::new();

impl FaultHandler {
    /// Installs the `SIGSEGV` handler and seizes the trap region,
    /// returning its base address. May only be called once per process.
    pub fn install(client: &'static dyn PageClient) -> Result<&'static FaultHandler> {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_sigaction = handle_segmentation_fault as usize;

        if unsafe { libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) } == -1 {
            return Err(ManagedMemoryError::MemoryError);
        }

        let landing_fd = unsafe { libc::memfd_create(b"landing\0".as_ptr() as *const i8, libc::MFD_CLOEXEC) };
        if landing_fd == -1 {
            restore_default_handler();
            return Err(ManagedMemoryError::MemoryError);
        }

        let region = region_size();
        if unsafe { libc::ftruncate(landing_fd, region as libc::off_t) } == -1 {
            unsafe { libc::close(landing_fd) };
            restore_default_handler();
            return Err(ManagedMemoryError::MemoryError);
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                region,
                libc::PROT_NONE,
                libc::MAP_SHARED | libc::MAP_NORESERVE,
                landing_fd,
                0,
            )
        };

        if base == libc::MAP_FAILED {
            unsafe { libc::close(landing_fd) };
            restore_default_handler();
            return Err(ManagedMemoryError::MemoryError);
        }

        let handler = HANDLER.get_or_init(|| FaultHandler {
            base: base as *mut u8,
            landing_fd,
            client,
            state: Mutex::new(HandlerState {
                pending: None,
                response: None,
            }),
            wakeup: Condvar::new(),
            thread: Mutex::new(None),
        });

        let join_handle = std::thread::spawn(move || handler.main_loop());
        *handler.thread.lock().unwrap() = Some(join_handle);

        Ok(handler)
    }

    /// Base address of the trap region.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Records that the page starting at `address` should be treated
    /// as `limit` zero bytes, sparing a fetch once it is first
    /// accessed.
    pub fn wipe(&self, address: *mut u8, limit: usize) -> Result<()> {
        self.process(Operation::Wipe, address, limit).into_result()
    }

    /// Flushes a pending write to `address`'s page, if any.
    pub fn evict(&self, address: *mut u8) -> Result<()> {
        self.process(Operation::Evict, address, 0).into_result()
    }

    /// Ensures `address`'s page is mapped (and writable, if
    /// `for_write`) before the caller dereferences it directly.
    pub fn probe(&self, address: *mut u8, for_write: bool) -> Result<()> {
        let action = if for_write { Operation::BeginWrite } else { Operation::BeginRead };
        self.process(action, address, 0).into_result()
    }

    /// Stops the handler thread, writing back any dirty page and
    /// releasing the trap region.
    pub fn shutdown(&self) {
        let _ = self.process(Operation::Terminate, ptr::null_mut(), 0);

        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }

        unsafe {
            libc::munmap(self.base as *mut c_void, region_size());
            libc::close(self.landing_fd);
        }
    }

    fn process(&self, action: Operation, address: *mut u8, limit: usize) -> FaultResult {
        let mut state = self.state.lock().unwrap();
        state = self.wakeup.wait_while(state, |s| s.pending.is_some()).unwrap();

        state.pending = Some(PendingRequest { action, address, limit });
        state.response = None;
        self.wakeup.notify_all();

        let mut state = self.wakeup.wait_while(state, |s| s.pending.is_some()).unwrap();
        state.response.take().unwrap_or(FaultResult::Uncaught)
    }

    fn main_loop(&self) {
        let mut active: Option<*mut u8> = None;
        let mut writeback = false;
        let mut length: usize = 0;
        let mut delayed_result = FaultResult::Success;

        let mut state = self.state.lock().unwrap();
        loop {
            let requested = if writeback {
                let (next, timeout) = self
                    .wakeup
                    .wait_timeout_while(state, writeback_timeout(), |s| s.pending.is_none())
                    .unwrap();
                state = next;
                !timeout.timed_out()
            } else {
                state = self.wakeup.wait_while(state, |s| s.pending.is_none()).unwrap();
                true
            };

            let mut wipe = false;
            let mut evict = false;
            let mut terminate = false;
            if requested {
                match state.pending.as_ref().expect("requested implies a pending entry").action {
                    Operation::Wipe => wipe = true,
                    Operation::Evict => evict = true,
                    Operation::Terminate => terminate = true,
                    Operation::BeginRead | Operation::BeginWrite => {}
                }
            }

            let page: Option<*mut u8> = if !requested || terminate {
                None
            } else {
                let address = state.pending.as_ref().unwrap().address as usize;
                Some((address & !(page_size() - 1)) as *mut u8)
            };

            let invalidate = (evict == (active == page)) || wipe || page.is_none();

            if let Some(active_page) = active {
                let writeback_length = if writeback { length } else { 0 };
                let released = self.release(active_page, invalidate, writeback_length);
                if delayed_result == FaultResult::Success {
                    delayed_result = released;
                }

                writeback = false;
                if invalidate {
                    active = None;
                }
            }

            if requested {
                let pending_limit = state.pending.as_ref().unwrap().limit;
                let pending_action = state.pending.as_ref().unwrap().action;

                let response = if delayed_result != FaultResult::Success || terminate || evict {
                    let result = delayed_result;
                    delayed_result = FaultResult::Success;
                    result
                } else {
                    let writable_now = !invalidate && writeback;
                    let begin_write = wipe || pending_action == Operation::BeginWrite;

                    let (result, mut new_length) =
                        self.require(page.expect("non-terminating request carries a page"), invalidate && !wipe, begin_write && !writable_now);

                    if new_length == 0 {
                        new_length = if wipe { pending_limit } else { length };
                    }

                    if result == FaultResult::Success {
                        active = page;
                        length = new_length;
                        writeback = writable_now || begin_write;
                    }

                    result
                };

                state.response = Some(response);
                state.pending = None;
                self.wakeup.notify_all();
            }

            if terminate {
                break;
            }
        }
    }

    fn release(&self, page: *mut u8, invalidate: bool, writeback_length: usize) -> FaultResult {
        if writeback_length > 0 {
            let protection = if invalidate { libc::PROT_NONE } else { libc::PROT_READ };
            if unsafe { libc::mprotect(page as *mut c_void, page_size(), protection) } == -1 {
                return FaultResult::MappingFailure;
            }

            let Some((id, page_offset)) = self.position_of(page) else {
                return FaultResult::MappingFailure;
            };

            let mut contents = vec![0u8; writeback_length];
            let read_ok = unsafe { libc::lseek(self.landing_fd, page_offset as libc::off_t, libc::SEEK_SET) != -1 }
                && unsafe {
                    libc::read(self.landing_fd, contents.as_mut_ptr() as *mut c_void, writeback_length)
                        == writeback_length as isize
                };

            if !read_ok || !self.client.overwrite(id, &contents) {
                return FaultResult::FetchFailure;
            }
        }

        if invalidate {
            let mmap_flags = libc::MAP_FIXED | libc::MAP_SHARED | libc::MAP_NORESERVE;
            let remapped = unsafe {
                libc::mmap(self.base as *mut c_void, region_size(), libc::PROT_NONE, mmap_flags, self.landing_fd, 0)
            };

            let fallocate_flags = libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE;
            if remapped != self.base as *mut c_void
                || unsafe { libc::fallocate(self.landing_fd, fallocate_flags, 0, region_size() as libc::off_t) } == -1
            {
                return FaultResult::MappingFailure;
            }
        }

        FaultResult::Success
    }

    fn require(&self, page: *mut u8, fetch: bool, writable: bool) -> (FaultResult, usize) {
        let mut length = 0usize;

        if fetch {
            let Some((id, page_offset)) = self.position_of(page) else {
                return (FaultResult::Uncaught, 0);
            };

            let Some(contents) = self.client.fetch(id) else {
                return (FaultResult::FetchFailure, 0);
            };

            length = contents.len();
            if length > page_size() {
                return (FaultResult::FetchFailure, 0);
            }

            let write_ok = unsafe { libc::lseek(self.landing_fd, page_offset as libc::off_t, libc::SEEK_SET) != -1 }
                && unsafe { libc::write(self.landing_fd, contents.as_ptr() as *const c_void, length) == length as isize };

            if !write_ok {
                return (FaultResult::FetchFailure, 0);
            }
        }

        if fetch || writable {
            let protection = libc::PROT_READ | if writable { libc::PROT_WRITE } else { 0 };
            if unsafe { libc::mprotect(page as *mut c_void, page_size(), protection) } == -1 {
                return (FaultResult::MappingFailure, 0);
            }
        }

        (FaultResult::Success, length)
    }

    fn position_of(&self, page: *mut u8) -> Option<(u64, usize)> {
        let difference = page as isize - self.base as isize;
        if difference >= 0 && (difference as usize) < region_size() {
            let offset = difference as usize;
            Some(((offset / page_size()) as u64, offset))
        } else {
            None
        }
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn was_write_fault(context: *mut c_void) -> bool {
    let context = &*(context as *const libc::ucontext_t);
    (context.uc_mcontext.gregs[libc::REG_ERR as usize] & WRITE_FAULT_BIT) != 0
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn was_write_fault(_context: *mut c_void) -> bool {
    // No portable error-code register to consult; a read fault that
    // gets mapped read-only and then faults again on an actual write
    // is handled correctly anyway, just with one extra round trip.
    true
}

fn restore_default_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut());
    }
}

extern "C" fn handle_segmentation_fault(_signal: c_int, info: *mut libc::siginfo_t, context: *mut c_void) {
    let Some(handler) = HANDLER.get() else {
        restore_default_handler();
        return;
    };

    // SAFETY: `info` is valid for the duration of signal delivery.
    let si_code = unsafe { (*info).si_code };
    if si_code != libc::SEGV_ACCERR {
        restore_default_handler();
        return;
    }

    // SAFETY: same as above; `si_addr` is the standard accessor.
    let fault_address = unsafe { (*info).si_addr() as *mut u8 };
    let was_write = unsafe { was_write_fault(context) };
    let action = if was_write { Operation::BeginWrite } else { Operation::BeginRead };

    match handler.process(action, fault_address, 0) {
        FaultResult::Success => {}
        FaultResult::Uncaught => restore_default_handler(),
        FaultResult::FetchFailure | FaultResult::MappingFailure => {
            let message = b"=== remote memory operation failed while handling a page fault ===\n";
            unsafe {
                libc::write(libc::STDERR_FILENO, message.as_ptr() as *const c_void, message.len());
            }
            std::process::abort();
        }
    }
}
