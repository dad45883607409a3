//! The `server` binary: listens for client connections and services
//! them with the local manager, exactly like `src/server.cpp`'s `main`.

use std::net::TcpListener;

use farmem::server::Reactor;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    farmem::initialize_local();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "server".to_string());

    let Some(endpoint) = args.next() else {
        eprintln!("Usage: {program} <address>:<port>");
        std::process::exit(1);
    };

    let Ok(secret) = std::env::var("MM_PSK") else {
        eprintln!("{program}: error: provide the MM_PSK (password) environment variable");
        std::process::exit(1);
    };

    let listener = match TcpListener::bind(&endpoint) {
        Ok(listener) => listener,
        Err(error) => {
            eprintln!("Error: failed to bind the listening socket: {error}");
            std::process::exit(1);
        }
    };

    let reactor = Reactor::new(listener, secret);
    if let Err(error) = reactor.run() {
        eprintln!("Error: failed to accept a client connection: {error}");
        std::process::exit(1);
    }
}
