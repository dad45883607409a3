//! Process initialization (C10): selects the process-wide default
//! manager exactly once.
//!
//! Grounded on `src/init.cpp` (`ce2103::mm::initialize_local`,
//! `ce2103::mm::initialize`, `memory_manager::get_default(at::any)`).

use std::net::TcpStream;
use std::sync::{Once, OnceLock};
use std::time::Duration;

use crate::alloc::local::LocalManager;
use crate::alloc::remote::RemoteManager;
use crate::alloc::MemoryManager;

static START: Once = Once::new();
static DEFAULT: OnceLock<&'static dyn MemoryManager> = OnceLock::new();

/// Starts the local collector thread and makes it the process default.
/// Idempotent: only the first call (across `initialize_local`/
/// `initialize`) has any effect.
pub fn initialize_local() {
    START.call_once(|| {
        let _ = DEFAULT.set(LocalManager::instance());
    });
}

/// Consults `MM_SERVER`/`MM_PSK` and, if both are present and the
/// connection/handshake succeeds, makes the remote manager the process
/// default; otherwise falls back to [`initialize_local`], logging the
/// reason at `warn` level exactly where the original writes to
/// `std::cerr`.
pub fn initialize() {
    START.call_once(|| {
        let manager = try_connect_remote().unwrap_or_else(|| {
            tracing::warn!("remote setup failed, falling back to local services");
            LocalManager::instance() as &'static dyn MemoryManager
        });

        let _ = DEFAULT.set(manager);
    });
}

fn try_connect_remote() -> Option<&'static dyn MemoryManager> {
    let endpoint = std::env::var("MM_SERVER").ok()?;

    let secret = match std::env::var("MM_PSK") {
        Ok(secret) => secret,
        Err(_) => {
            tracing::warn!("MM_SERVER is set but not MM_PSK");
            return None;
        }
    };

    let stream = match TcpStream::connect(endpoint.trim()) {
        Ok(stream) => stream,
        Err(_) => {
            tracing::warn!(%endpoint, "connection to the memory server failed");
            return None;
        }
    };

    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));

    match RemoteManager::initialize(stream, &secret) {
        Ok(manager) => Some(manager as &'static dyn MemoryManager),
        Err(_) => {
            tracing::warn!("handshake failed (wrong MM_PSK?)");
            None
        }
    }
}

/// Returns the process default manager, lazily running
/// [`initialize_local`] if nothing has initialized the process yet.
/// Mirrors `memory_manager::get_default(at::any)`.
pub fn default_manager() -> &'static dyn MemoryManager {
    if let Some(manager) = DEFAULT.get() {
        return *manager;
    }

    initialize_local();
    *DEFAULT.get().expect("initialize_local always sets DEFAULT")
}
