//! Wire protocol: line-oriented JSON framing (this module) plus the
//! octet codec ([`codec`]) and the client side of the protocol
//! ([`client`]). The server side lives in [`crate::server`], which
//! reuses [`Session`] the same way.
//!
//! Grounded on `ce2103::mm::session` (`include/ce2103/mm/session.hpp`,
//! `src/session.cpp`).

pub mod client;
pub mod codec;

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::Mutex;

use serde_json::Value;

/// A lost session stops sending and receiving permanently — mirrors
/// `session::discard()` clearing the optional peer socket.
pub(crate) struct Session {
    reader: Mutex<Option<BufReader<TcpStream>>>,
    writer: Mutex<Option<TcpStream>>,
}

impl Session {
    pub(crate) fn new(stream: TcpStream) -> std::io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(Session {
            reader: Mutex::new(Some(BufReader::new(stream))),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.writer.lock().unwrap().is_none()
    }

    pub(crate) fn send(&self, data: Value) {
        let mut writer = self.writer.lock().unwrap();
        let Some(stream) = writer.as_mut() else {
            return;
        };

        let mut line = data.to_string();
        line.push('\n');

        if stream.write_all(line.as_bytes()).is_err() {
            *writer = None;
        }
    }

    pub(crate) fn receive(&self) -> Option<Value> {
        let mut reader = self.reader.lock().unwrap();
        let stream = reader.as_mut()?;

        let mut line = String::new();
        match stream.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => serde_json::from_str(line.trim_end()).ok(),
        }
    }

    pub(crate) fn discard(&self) {
        *self.reader.lock().unwrap() = None;
        *self.writer.lock().unwrap() = None;
    }
}
