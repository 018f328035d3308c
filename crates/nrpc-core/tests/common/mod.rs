//! Shared fixtures for the nrpc integration tests.

#![allow(dead_code)]

use nrpc_core::config::{RoutingSocketOptions, SocketRole};
use nrpc_core::registry::TypeRegistry;
use nrpc_core::{rpc_type, RoutingSocket};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Hello {
    pub name: String,
    pub count: i32,
}

rpc_type!(Hello { name = 1, count = 2 });

/// Registry shared by both sides of most tests.
///
/// - `Echo.Ping` mirrors its input (server side)
/// - `HelloService.Hello` greets by name (server side)
/// - `Peer.Shout` upper-cases a name (client side, for reverse and relayed calls)
pub fn registry() -> Arc<TypeRegistry> {
    TypeRegistry::builder()
        .register_type::<Hello>()
        .service("Echo", |s| s.method::<Value, Value>("Ping", 1))
        .server("Echo", "EchoServer", |s| s.handle("Ping", |doc: Value| doc))
        .service("HelloService", |s| s.method::<Hello, Hello>("Hello", 1))
        .server("HelloService", "HelloServer", |s| {
            s.handle("Hello", |req: Hello| Hello {
                name: format!("Hello {}", req.name),
                count: req.count + 1,
            })
        })
        .service("Peer", |s| s.method::<Hello, Hello>("Shout", 1))
        .server("Peer", "PeerServer", |s| {
            s.handle("Shout", |req: Hello| Hello {
                name: req.name.to_uppercase(),
                count: req.count,
            })
        })
        .build()
}

pub fn server_options() -> RoutingSocketOptions {
    RoutingSocketOptions::new(SocketRole::Bind, "test_server")
        .with_type("Hello")
        .with_server("Echo", "EchoServer")
        .with_server("HelloService", "HelloServer")
}

pub fn client_options() -> RoutingSocketOptions {
    RoutingSocketOptions::new(SocketRole::Connect, "test_client")
        .with_type("Hello")
        .with_type("Echo")
        .with_type("HelloService")
        .with_server("Peer", "PeerServer")
}

/// A fresh `inproc://` address, unique within the test process.
pub fn memory_address(name: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "inproc://{}-{}-{}",
        name,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::SeqCst)
    )
}

/// A loopback port whose reverse partner (port + 10000) was also free.
pub fn free_port_pair() -> u16 {
    for _ in 0..50 {
        let forward = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = forward.local_addr().unwrap().port();
        let Some(reverse_port) = port.checked_add(10_000) else {
            continue;
        };
        if std::net::TcpListener::bind(("127.0.0.1", reverse_port)).is_ok() {
            return port;
        }
    }
    panic!("no free port pair on loopback");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn bind_server(address: &str) -> RoutingSocket {
    let server = RoutingSocket::new(server_options(), registry()).unwrap();
    server.bind(address).unwrap();
    server
}

pub fn connect_client(address: &str, sync: bool) -> RoutingSocket {
    let client = RoutingSocket::new(client_options(), registry()).unwrap();
    client.connect(address, true, sync).unwrap();
    client
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

/// Wait until the server lists exactly `count` live clients.
pub fn wait_for_clients(server: &RoutingSocket, count: usize) -> Vec<u64> {
    let mut ids = Vec::new();
    let reached = wait_until(|| {
        ids = server.get_client_ids().unwrap();
        ids.len() == count
    });
    assert!(reached, "expected {} clients, have {:?}", count, ids);
    ids
}

pub fn ping(n: i32) -> Value {
    json!({ "n": n })
}
