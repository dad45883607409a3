//! Server-side plumbing: the per-connection session (C8) and the
//! single-threaded accept loop (C9) the `server` binary drives.
//!
//! Grounded on `src/server.cpp`. The request schema handled here is the
//! latest single-key shape from SPEC_FULL.md §4.3/§9, not the
//! `{"op":...,"value":...}` shape literally present in that file — see
//! DESIGN.md's open-question resolution.

pub mod reactor;
pub mod session;

pub use reactor::Reactor;
pub use session::ServerSession;
