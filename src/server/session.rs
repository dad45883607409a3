//! Server session (C8): mirrors the client's wire session on the server
//! side, owning the local manager's refcounts on behalf of a remote
//! peer.
//!
//! Grounded on `src/server.cpp`'s `server_session`, updated to the
//! single-key request schema (`{"alloc":...}`, `{"lift":...}`, ...)
//! rather than that file's literal `{"op":...,"value":...}` shape.

use std::collections::HashMap;
use std::net::TcpStream;

use md5::{Digest, Md5};
use serde_json::{json, Value};

use crate::alloc::local::LocalManager;
use crate::alloc::{DropResult, MemoryManager};
use crate::wire::codec::{deserialize_octets, serialize_octets};
use crate::wire::Session;

/// A single client connection's view of the local manager: which IDs
/// this session has referenced, and whether it has authenticated.
pub struct ServerSession {
    session: Session,
    secret_digest: [u8; 16],
    authorized: bool,
    objects: HashMap<u64, usize>,
}

impl ServerSession {
    pub fn new(stream: TcpStream, plaintext_secret: &str) -> std::io::Result<Self> {
        let mut hasher = Md5::new();
        hasher.update(plaintext_secret.as_bytes());
        let digest = hasher.finalize();

        let mut secret_digest = [0u8; 16];
        secret_digest.copy_from_slice(&digest);

        Ok(ServerSession {
            session: Session::new(stream)?,
            secret_digest,
            authorized: false,
            objects: HashMap::new(),
        })
    }

    pub fn is_lost(&self) -> bool {
        self.session.is_lost()
    }

    /// Reads one request and dispatches it, mirroring
    /// `server_session::handle_command`.
    pub fn handle_command(&mut self) {
        let Some(command) = self.session.receive() else {
            self.session.discard();
            return;
        };

        let Some(object) = command.as_object() else {
            self.fail_bad_request();
            return;
        };

        if let Some(auth) = object.get("auth") {
            self.authorize(auth);
        } else if object.contains_key("bye") {
            self.finalize();
        } else if !self.authorized {
            self.send_error("unauthorized");
        } else if let Some(count) = object.get("alloc") {
            self.allocate(
                count,
                object.get("type").and_then(Value::as_str).unwrap_or(""),
                object.get("unit").and_then(Value::as_u64),
                object.get("parts").and_then(Value::as_u64),
                object.get("rem").and_then(Value::as_u64),
            );
        } else if let Some(id) = object.get("lift").and_then(Value::as_u64) {
            self.lift(id);
        } else if let Some(id) = object.get("drop").and_then(Value::as_u64) {
            self.drop_object(id);
        } else if let Some(id) = object.get("read").and_then(Value::as_u64) {
            self.read_contents(id);
        } else if let Some(id) = object.get("write").and_then(Value::as_u64) {
            match object.get("value") {
                Some(value) => self.write_contents(id, value),
                None => self.fail_bad_request(),
            }
        } else {
            self.fail_bad_request();
        }
    }

    fn authorize(&mut self, encoded: &Value) {
        let Some(bytes) = crate::wire::codec::decode_to_vec(encoded) else {
            self.fail_bad_request();
            return;
        };

        self.authorized = bytes.len() == self.secret_digest.len() && bytes == self.secret_digest;
        self.session.send(json!(self.authorized));

        if !self.authorized {
            self.session.discard();
        }
    }

    fn finalize(&mut self) {
        if self.objects.is_empty() {
            self.session.send(json!({}));
        } else {
            let leaked: Vec<u64> = self.objects.keys().copied().collect();
            self.session.send(json!({ "leaked": leaked }));
        }

        self.session.discard();
    }

    fn allocate(&mut self, count: &Value, type_name: &str, unit: Option<u64>, parts: Option<u64>, rem: Option<u64>) {
        let Some(initial_lifts) = count.as_u64().filter(|n| *n >= 1) else {
            self.fail_bad_request();
            return;
        };

        let parts = parts.unwrap_or(0);
        let unit = unit.unwrap_or(0);
        let rem = rem.unwrap_or(0);
        let total_parts = parts + if rem > 0 { 1 } else { 0 };

        if total_parts == 0 {
            self.fail_wrong_size();
            return;
        }

        // The declared type name is purely descriptive (the debug sink
        // logs the actual Rust element type, `u8`, regardless — the
        // server only ever stores raw byte arrays); nothing on this
        // path needs it to outlive the call.
        tracing::trace!(%type_name, parts, unit, rem, "server alloc request");

        let manager = LocalManager::instance();
        manager.reserve_contiguous(total_parts);

        let mut first_id = None;

        for _ in 0..parts {
            let size = unit as usize;
            match crate::alloc::allocate_of::<u8>(manager, size, true) {
                Ok((id, base, _payload)) => {
                    unsafe { (*base).set_initialized(size) };
                    first_id.get_or_insert(id);
                    self.objects.insert(id, size);
                }
                Err(_) => {
                    self.fail_bad_request();
                    return;
                }
            }
        }

        if rem > 0 {
            match crate::alloc::allocate_of::<u8>(manager, rem as usize, true) {
                Ok((id, _base, _payload)) => {
                    first_id.get_or_insert(id);
                    self.objects.insert(id, rem as usize);
                }
                Err(_) => {
                    self.fail_bad_request();
                    return;
                }
            }
        }

        let first_id = first_id.expect("total_parts > 0 implies at least one allocation ran");
        for _ in 0..initial_lifts {
            manager.lift(first_id);
        }

        self.session.send(json!(first_id));
    }

    fn lift(&mut self, id: u64) {
        if self.expect_extant(id) {
            LocalManager::instance().lift(id);
            self.session.send(json!({}));
        }
    }

    fn drop_object(&mut self, id: u64) {
        if !self.expect_extant(id) {
            return;
        }

        match LocalManager::instance().drop_id(id) {
            DropResult::Reduced => self.session.send(json!({})),
            DropResult::Hanging => self.session.send(json!({ "hanging": true })),
            DropResult::Lost => {
                self.objects.remove(&id);
                self.session.send(json!({ "lost": true }));
            }
        }
    }

    fn read_contents(&mut self, id: u64) {
        let Some(&length) = self.objects.get(&id) else {
            self.send_error("object not found");
            return;
        };

        let manager = LocalManager::instance();
        let header = unsafe { &*manager.get_base(id) };
        let bytes = unsafe { std::slice::from_raw_parts(header.payload_base(), length) };

        self.session.send(json!(serialize_octets(bytes)));
    }

    fn write_contents(&mut self, id: u64, value: &Value) {
        let Some(&length) = self.objects.get(&id) else {
            self.send_error("object not found");
            return;
        };

        let manager = LocalManager::instance();
        let header = unsafe { &*manager.get_base(id) };
        let destination = unsafe { std::slice::from_raw_parts_mut(header.payload_base(), length) };

        if !deserialize_octets(value, destination) {
            self.fail_wrong_size();
            return;
        }

        self.session.send(json!({}));
    }

    fn expect_extant(&mut self, id: u64) -> bool {
        if self.objects.contains_key(&id) {
            true
        } else {
            self.send_error("object not found");
            false
        }
    }

    fn send_error(&self, message: &str) {
        self.session.send(json!({ "error": message }));
    }

    fn fail_bad_request(&self) {
        self.send_error("bad request");
    }

    fn fail_wrong_size(&self) {
        self.send_error("wrong size");
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        let manager = LocalManager::instance();
        for id in self.objects.keys() {
            while !matches!(manager.drop_id(*id), DropResult::Lost) {
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn paired_streams() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn handshake_rejects_wrong_secret_and_closes() {
        // boundary behavior 12.
        let (client_stream, server_stream) = paired_streams();
        let mut server = ServerSession::new(server_stream, "hunter2").unwrap();

        let client = crate::wire::client::ClientSession::connect(client_stream, "wrong secret").unwrap();
        server.handle_command();

        assert!(client.is_lost());
        assert!(server.is_lost());
    }

    #[test]
    fn handshake_accepts_matching_secret() {
        // S1: md5("hunter2") == 2ab96390c7dbe3439de74d0c9b0b1767.
        let (client_stream, server_stream) = paired_streams();
        let mut server = ServerSession::new(server_stream, "hunter2").unwrap();

        let client = crate::wire::client::ClientSession::connect(client_stream, "hunter2").unwrap();
        server.handle_command();

        assert!(!client.is_lost());
        assert!(server.authorized);
    }

    #[test]
    fn alloc_with_no_parts_is_rejected() {
        let (client_stream, server_stream) = paired_streams();
        let mut server = ServerSession::new(server_stream, "hunter2").unwrap();
        let client = crate::wire::client::ClientSession::connect(client_stream, "hunter2").unwrap();
        server.handle_command();

        // parts=0, rem=0: "wrong size" (boundary behavior 11).
        assert_eq!(client.allocate(0, 0, 0, "u8"), None);
        server.handle_command();
    }
}
