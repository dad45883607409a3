//! Client side of the wire protocol: the request/response shapes a
//! remote manager needs, on top of [`super::Session`]'s line framing.
//!
//! Grounded on `ce2103::mm::client_session` (`include/ce2103/mm/client.hpp`,
//! `src/client.cpp`). Follows the single-key request schema
//! (`{"alloc":...}`, `{"lift":...}`, ...) rather than the older
//! `{"op":...,"value":...}` shape found in one revision of the original
//! server — see DESIGN.md.

use std::net::TcpStream;
use std::sync::Mutex;

use md5::{Digest, Md5};
use serde_json::{json, Value};

use super::codec::{decode_to_vec, serialize_octets};
use super::Session;
use crate::alloc::DropResult;

/// A connected, authenticated session to a remote memory server.
pub struct ClientSession {
    session: Session,
    // Serializes every request/response pair so concurrent callers on
    // the same session cannot interleave their replies.
    mutex: Mutex<()>,
}

impl ClientSession {
    /// Connects and performs the MD5 pre-shared-secret handshake.
    /// `is_lost()` reports whether authorization or the handshake
    /// itself failed.
    pub fn connect(stream: TcpStream, secret: &str) -> std::io::Result<Self> {
        let session = Session::new(stream)?;
        let client = ClientSession {
            session,
            mutex: Mutex::new(()),
        };

        let mut hasher = Md5::new();
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();

        client.session.send(json!({ "auth": serialize_octets(&digest) }));
        if client.session.receive() != Some(json!(true)) {
            client.session.discard();
        }

        Ok(client)
    }

    pub fn is_lost(&self) -> bool {
        self.session.is_lost()
    }

    /// Terminates the session. Returns whether this was done cleanly
    /// and without leaks, per the server's final `bye` response.
    pub fn finalize(&self) -> bool {
        let _guard = self.mutex.lock().unwrap();
        self.session.send(json!({ "bye": Value::Null }));
        let cleanly_finalized = self.session.receive() == Some(json!({}));
        self.session.discard();
        cleanly_finalized
    }

    /// Requests a piecewise allocation. A run of sequential IDs is
    /// allocated according to the part/remainder split; returns the
    /// first ID.
    pub fn allocate(&self, part_size: usize, parts: usize, remainder: usize, type_name: &str) -> Option<u64> {
        let _guard = self.mutex.lock().unwrap();

        let mut query = serde_json::Map::new();
        // The first part starts with a refcount of 2 (one for the
        // caller, one held until the allocation's contents are wiped).
        query.insert("alloc".to_string(), json!(1));
        query.insert("type".to_string(), json!(type_name));
        if remainder > 0 {
            query.insert("rem".to_string(), json!(remainder));
        }
        if part_size > 0 && parts > 0 {
            query.insert("unit".to_string(), json!(part_size));
            query.insert("parts".to_string(), json!(parts));
        }

        self.session.send(Value::Object(query));

        match self.session.receive().as_ref().and_then(Value::as_u64) {
            Some(id) => Some(id),
            None => {
                self.session.discard();
                None
            }
        }
    }

    pub fn lift(&self, id: u64) -> bool {
        let _guard = self.mutex.lock().unwrap();
        self.session.send(json!({ "lift": id }));
        self.expect_empty()
    }

    pub fn drop_remote(&self, id: u64) -> Option<DropResult> {
        let _guard = self.mutex.lock().unwrap();
        self.session.send(json!({ "drop": id }));

        match self.session.receive() {
            Some(value) if value == json!({}) => Some(DropResult::Reduced),
            Some(value) if value == json!({ "hanging": true }) => Some(DropResult::Hanging),
            Some(value) if value == json!({ "lost": true }) => Some(DropResult::Lost),
            _ => {
                self.session.discard();
                None
            }
        }
    }

    pub fn fetch(&self, id: u64) -> Option<Vec<u8>> {
        let _guard = self.mutex.lock().unwrap();
        self.session.send(json!({ "read": id }));
        let serialized = self.session.receive()?;
        decode_to_vec(&serialized)
    }

    pub fn overwrite(&self, id: u64, contents: &[u8]) -> bool {
        let _guard = self.mutex.lock().unwrap();
        self.session.send(json!({ "write": id, "value": serialize_octets(contents) }));
        self.expect_empty()
    }

    fn expect_empty(&self) -> bool {
        let succeeded = self.session.receive() == Some(json!({}));
        if !succeeded {
            self.session.discard();
        }
        succeeded
    }
}
