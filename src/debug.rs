//! Debug side-channel sink.
//!
//! Mirrors `ce2103::mm::_detail::debug_log`/`debug_chain`: every manager
//! operation (alloc/lift/drop/evict) is rendered as a single JSON object
//! and sent as one line to an optional sink, configured via
//! `MM_DEBUG_TARGET`. This is treated as an external collaborator in the
//! spec; the implementation here is the minimal interface the rest of
//! the crate needs from it.

use std::io::Write;
use std::net::TcpStream;
use std::sync::{Mutex, OnceLock};

use serde_json::{json, Value};

use crate::alloc::Locality;

static INSTANCE: OnceLock<DebugSink> = OnceLock::new();

/// The process-wide debug sink, lazily connected from `MM_DEBUG_TARGET`
/// on first use.
pub fn global() -> &'static DebugSink {
    INSTANCE.get_or_init(DebugSink::from_env)
}

/// A best-effort JSON-lines sink for per-operation debug snapshots.
///
/// Disables itself permanently after the first write failure, since the
/// original leaves the exact reconnection policy unspecified.
pub struct DebugSink {
    target: Mutex<Option<TcpStream>>,
}

impl DebugSink {
    /// Connects to `MM_DEBUG_TARGET` if set; otherwise the sink is
    /// inert and every `log` call is a no-op.
    pub fn from_env() -> Self {
        let target = std::env::var("MM_DEBUG_TARGET")
            .ok()
            .and_then(|endpoint| TcpStream::connect(endpoint.trim()).ok());

        if target.is_none() {
            if let Ok(endpoint) = std::env::var("MM_DEBUG_TARGET") {
                tracing::warn!(%endpoint, "failed to connect to debug sink");
            }
        }

        DebugSink {
            target: Mutex::new(target),
        }
    }

    /// An inert sink that never emits anything, for tests and for the
    /// local-only code path before `MM_DEBUG_TARGET` is consulted.
    pub fn disabled() -> Self {
        DebugSink {
            target: Mutex::new(None),
        }
    }

    /// Logs one memory-manager operation.
    ///
    /// `pairs` are rendered in order as additional object keys, matching
    /// the original's `debug_chain` linked-list-of-pairs shape.
    pub fn log(&self, operation: &str, id: u64, locality: Locality, pairs: &[(&str, Value)]) {
        tracing::trace!(op = operation, id, locality = ?locality, "memory operation");

        let mut guard = match self.target.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };

        let Some(stream) = guard.as_mut() else {
            return;
        };

        let mut object = serde_json::Map::new();
        object.insert("op".to_string(), json!(operation));
        object.insert("id".to_string(), json!(id));
        object.insert("at".to_string(), json!(locality.name()));
        for (key, value) in pairs {
            object.insert((*key).to_string(), value.clone());
        }

        let mut line = Value::Object(object).to_string();
        line.push('\n');

        if stream.write_all(line.as_bytes()).is_err() {
            tracing::warn!("debug sink write failed, disabling it");
            *guard = None;
        }
    }
}
