//! Remote memory manager: requests allocations from a memory server and
//! materializes their contents on demand through the fault handler.
//!
//! Grounded on `ce2103::mm::remote_manager` (`include/ce2103/mm/client.hpp`,
//! `src/client.cpp`, `src/sigsegv.cpp`). An allocation's size is split
//! into page-sized parts plus a remainder, mirroring
//! `remote_manager::allocate`'s `size / part_size`, `size % part_size`
//! arithmetic; a drop that reaches the last reference destroys the
//! payload locally and releases every part, mirroring
//! `remote_manager::do_drop`'s `hanging` branch.

use std::net::TcpStream;
use std::sync::OnceLock;

use super::{Allocation, DropResult, Locality, MemoryManager};
use crate::error::{ManagedMemoryError, Result};
use crate::fault::{self, FaultHandler, PageClient};
use crate::wire::client::ClientSession;

pub struct RemoteManager {
    client: ClientSession,
    trap: OnceLock<&'static FaultHandler>,
}

static INSTANCE: OnceLock<RemoteManager> = OnceLock::new();

impl RemoteManager {
    /// Establishes the quasi-singleton remote manager over an already
    /// connected socket, given the pre-shared authorization secret.
    /// Returns an error if the handshake or the trap region setup
    /// fails. May only be called once per process.
    pub fn initialize(stream: TcpStream, secret: &str) -> Result<&'static RemoteManager> {
        assert!(INSTANCE.get().is_none(), "remote manager already initialized");

        let client = ClientSession::connect(stream, secret).map_err(|_| ManagedMemoryError::NetworkFailure)?;
        if client.is_lost() {
            return Err(ManagedMemoryError::NetworkFailure);
        }

        let manager = INSTANCE.get_or_init(|| RemoteManager {
            client,
            trap: OnceLock::new(),
        });

        let trap = fault::FaultHandler::install(manager)?;
        let _ = manager.trap.set(trap);

        unsafe {
            libc::atexit(shutdown_hook);
        }

        Ok(manager)
    }

    /// Returns the quasi-singleton instance, or
    /// [`ManagedMemoryError::NoRemoteSession`] if [`initialize`](Self::initialize)
    /// has not (yet, or successfully) run.
    pub fn get_instance() -> Result<&'static RemoteManager> {
        INSTANCE.get().ok_or(ManagedMemoryError::NoRemoteSession)
    }

    fn trap(&self) -> &'static FaultHandler {
        *self.trap.get().expect("install() sets trap before returning a usable manager")
    }

    fn part_size(&self) -> usize {
        fault::page_size()
    }

    fn base_for(&self, id: u64) -> *mut u8 {
        unsafe { self.trap().base().add(id as usize * self.part_size()) }
    }
}

impl PageClient for RemoteManager {
    fn fetch(&self, id: u64) -> Option<Vec<u8>> {
        self.client.fetch(id)
    }

    fn overwrite(&self, id: u64, contents: &[u8]) -> bool {
        self.client.overwrite(id, contents)
    }
}

impl MemoryManager for RemoteManager {
    fn locality(&self) -> Locality {
        Locality::Remote
    }

    fn get_base(&self, id: u64) -> *mut Allocation {
        self.base_for(id) as *mut Allocation
    }

    fn do_allocate(&self, size: usize, type_name: &'static str) -> Result<u64> {
        let part_size = self.part_size();
        let parts = size / part_size;
        let remainder = size % part_size;

        let id = self
            .client
            .allocate(part_size, parts, remainder, type_name)
            .ok_or(ManagedMemoryError::NetworkFailure)?;

        // Speculates the header's page to be all-zero, saving a read
        // round trip during the allocation's own construction.
        self.trap().wipe(self.base_for(id), size.min(part_size))?;

        Ok(id)
    }

    fn do_lift(&self, id: u64) {
        if !self.client.lift(id) {
            panic!("remote lift of ID {id} failed: network failure");
        }
    }

    fn do_drop(&self, id: u64) -> DropResult {
        let result = self
            .client
            .drop_remote(id)
            .unwrap_or_else(|| panic!("remote drop of ID {id} failed: network failure"));

        let DropResult::Hanging = result else {
            return result;
        };

        let header = unsafe { &mut *self.get_base(id) };
        self.trap()
            .probe(header as *mut Allocation as *mut u8, true)
            .expect("probing the header ahead of final cleanup");

        let total_size = header.total_size();
        let parts = (total_size - 1) / self.part_size() + 1;

        // Destroys every object in the allocation before releasing its
        // backing parts.
        unsafe {
            header.destroy_all();
        }

        for part in id..id + parts as u64 {
            // There might be a pending writeback for this part.
            self.trap()
                .evict(self.base_for(part))
                .expect("evicting a part ahead of its final drop");

            let final_result = self.client.drop_remote(part);
            if final_result != Some(DropResult::Lost) {
                panic!("remote drop of part {part} failed: network failure");
            }
        }

        DropResult::Lost
    }

    fn do_evict(&self, id: u64) {
        let _ = self.trap().evict(self.base_for(id));
    }

    fn probe(&self, address: *const (), for_write: bool) -> Result<()> {
        self.trap().probe(address as *mut u8, for_write)
    }
}

extern "C" fn shutdown_hook() {
    if let Some(manager) = INSTANCE.get() {
        manager.trap().shutdown();
        manager.client.finalize();
    }
}
