//! End-to-end remote allocation, write-back, and terminal drop, wired
//! through an in-process server session over a loopback `TcpStream`
//! (S4/S5 from spec.md §8 — no subprocess spawn of the `server` binary).

use std::net::{TcpListener, TcpStream};
use std::thread;

use farmem::alloc::remote::RemoteManager;
use farmem::alloc::{self, DropResult, MemoryManager};
use farmem::server::ServerSession;

const SECRET: &str = "hunter2";

fn spawn_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut session = ServerSession::new(stream, SECRET).unwrap();
        while !session.is_lost() {
            session.handle_command();
        }
    });

    addr
}

#[test]
fn remote_allocation_write_back_and_terminal_drop() {
    let addr = spawn_server();
    let stream = TcpStream::connect(addr).unwrap();

    let manager: &'static dyn MemoryManager = RemoteManager::initialize(stream, SECRET).unwrap();

    // S4: an allocation of this size, at a 4096-byte page size, splits
    // into a handful of full parts plus a remainder, landing on
    // consecutive IDs (the server allocates `parts + 1` byte arrays).
    let (id, base, payload) = alloc::allocate_of::<[u8; 9000]>(manager, 1, false).unwrap();

    manager.probe(payload as *const (), true).unwrap();
    unsafe {
        std::ptr::write((payload as *mut u8).add(0), 0xABu8);
        (*base).set_initialized(1);
    }

    // `evict` synchronously writes the dirty page back to the server
    // and invalidates the local mapping, so a subsequent probe must
    // refetch over the wire rather than reusing the page we just wrote.
    manager.evict(id);
    manager.probe(payload as *const (), false).unwrap();
    let first_byte = unsafe { *(payload as *const u8) };
    assert_eq!(first_byte, 0xAB, "write-back did not reach the server");

    // S5: dropping the handle's one reference runs the whole
    // destroy/evict/drop-every-part sequence synchronously and reports
    // the allocation as fully released.
    assert_eq!(manager.drop_id(id), DropResult::Lost);
}
