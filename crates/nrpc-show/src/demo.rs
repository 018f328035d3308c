//! Types and services shared by the demo server and client.

use nrpc_core::config::{RoutingSocketOptions, SocketRole};
use nrpc_core::registry::TypeRegistry;
use nrpc_core::rpc_type;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct HelloRequest {
    pub name: String,
    pub count: i32,
}

rpc_type!(HelloRequest { name = 1, count = 2 });

#[derive(Debug, Default, Clone)]
pub struct HelloReply {
    pub greeting: String,
    pub count: i32,
}

rpc_type!(HelloReply { greeting = 1, count = 2 });

pub const HELLO_SERVICE: &str = "HelloService";
pub const STATUS_SERVICE: &str = "ClientStatus";

pub fn registry() -> Arc<TypeRegistry> {
    TypeRegistry::builder()
        .register_type::<HelloRequest>()
        .register_type::<HelloReply>()
        .service(HELLO_SERVICE, |s| s.method::<HelloRequest, HelloReply>("Hello", 1))
        .server(HELLO_SERVICE, "HelloServer", |s| {
            s.handle("Hello", |req: HelloRequest| HelloReply {
                greeting: format!("Hello, {}!", req.name),
                count: req.count,
            })
        })
        .service(STATUS_SERVICE, |s| s.method::<Value, Value>("Uptime", 1))
        .server(STATUS_SERVICE, "ClientStatusServer", |s| {
            let started = std::time::Instant::now();
            s.handle("Uptime", move |_: Value| {
                json!({ "seconds": started.elapsed().as_secs_f64() })
            })
        })
        .build()
}

pub fn server_options() -> RoutingSocketOptions {
    RoutingSocketOptions::new(SocketRole::Bind, "nrpc-show serve")
        .with_type("HelloRequest")
        .with_type("HelloReply")
        .with_server(HELLO_SERVICE, "HelloServer")
        .with_type(STATUS_SERVICE)
}

pub fn client_options() -> RoutingSocketOptions {
    RoutingSocketOptions::new(SocketRole::Connect, "nrpc-show connect")
        .with_type("HelloRequest")
        .with_type("HelloReply")
        .with_type(HELLO_SERVICE)
        .with_server(STATUS_SERVICE, "ClientStatusServer")
}
