//! `farmem` — a distributed managed-memory runtime.
//!
//! Application code holds reference-counted [`handle`]s to objects that
//! may live in this process (backed by [`alloc::local::LocalManager`],
//! reclaimed by a background reaper) or on a remote memory server
//! (backed by [`alloc::remote::RemoteManager`], materialized into local
//! virtual memory on demand by [`fault::FaultHandler`]). Dereferencing
//! either kind of handle looks the same to calling code; the locality
//! only changes which manager and which wire traffic back the access.
//!
//! Call [`init::initialize`] once at process start to select a manager
//! (local-only, or local+remote depending on `MM_SERVER`/`MM_PSK`), then
//! build handles with [`handle::Handle::new`] / [`handle::ArrayHandle::new`].

pub mod alloc;
pub mod allocator;
pub mod debug;
pub mod error;
pub mod fault;
pub mod handle;
pub mod init;
pub mod server;
pub mod wire;

pub use error::{ManagedMemoryError, Result};
pub use handle::{ArrayHandle, FnHandle, Handle};
pub use init::{initialize, initialize_local};
