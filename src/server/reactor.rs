//! Reactor (C9): the accept loop the `server` binary drives.
//!
//! Grounded on `src/server.cpp`'s `main`: a blocking single-threaded
//! accept loop that runs one [`ServerSession`] to completion before
//! accepting the next connection.

use std::net::TcpListener;

use super::ServerSession;

pub struct Reactor {
    listener: TcpListener,
    secret: String,
}

impl Reactor {
    pub fn new(listener: TcpListener, plaintext_secret: impl Into<String>) -> Self {
        Reactor {
            listener,
            secret: plaintext_secret.into(),
        }
    }

    /// Accepts connections forever, handling each one to completion
    /// before accepting the next. Returns only if accepting a
    /// connection fails.
    pub fn run(&self) -> std::io::Result<()> {
        loop {
            let (stream, peer) = self.listener.accept()?;
            tracing::debug!(%peer, "accepted connection");

            let mut session = match ServerSession::new(stream, &self.secret) {
                Ok(session) => session,
                Err(error) => {
                    tracing::warn!(%error, "failed to set up session");
                    continue;
                }
            };

            while !session.is_lost() {
                session.handle_command();
            }

            tracing::debug!(%peer, "connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn rejects_unauthorized_commands_before_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reactor = Reactor::new(listener, "hunter2");

        let handle = std::thread::spawn(move || {
            let _ = reactor.run();
        });

        let client = TcpStream::connect(addr).unwrap();
        let client = crate::wire::client::ClientSession::connect(client, "hunter2").unwrap();
        assert!(!client.is_lost());

        drop(handle);
    }
}
