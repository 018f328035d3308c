//! Schema reconciliation between peers built from different registries.

mod common;

use common::{init_tracing, memory_address, wait_for_clients};
use nrpc_core::config::{RoutingSocketOptions, SocketRole};
use nrpc_core::registry::{FieldKind, TypeRegistry};
use nrpc_core::routing::{find_new_fields, find_new_methods};
use nrpc_core::{rpc_type, RoutingSocket};
use serde_json::{json, Value};
use std::sync::Arc;

mod server_side {
    #[derive(Debug, Default)]
    pub struct Profile {
        pub name: String,
        pub age: i32,
        pub newonserver: i32,
    }

    nrpc_core::rpc_type!(Profile {
        name = 1,
        age = 2,
        newonserver = 3,
    });
}

mod client_side {
    #[derive(Debug, Default)]
    pub struct Profile {
        pub name: String,
        pub age: i32,
        pub nickname: String,
    }

    nrpc_core::rpc_type!(Profile {
        name = 1,
        age = 2,
        nickname = 3,
    });
}

#[derive(Debug, Default)]
struct Misnumbered {
    value: i32,
}

rpc_type!(Misnumbered { value = 1 });

fn server_registry() -> Arc<TypeRegistry> {
    TypeRegistry::builder()
        .register_type::<server_side::Profile>()
        .service("ProfileService", |s| {
            s.method::<Value, Value>("Get", 1)
                .method::<Value, Value>("Extra", 3)
        })
        .server("ProfileService", "ProfileServer", |s| {
            s.handle("Get", |_: Value| json!({"name": "server"}))
                .handle("Extra", |doc: Value| doc)
        })
        .build()
}

fn client_registry() -> Arc<TypeRegistry> {
    TypeRegistry::builder()
        .register_type::<client_side::Profile>()
        .service("ProfileService", |s| {
            s.method::<Value, Value>("Get", 1)
                .method::<Value, Value>("ClientOnly", 4)
        })
        .build()
}

fn start(name: &str) -> (RoutingSocket, RoutingSocket) {
    init_tracing();
    let address = memory_address(name);

    let server = RoutingSocket::new(
        RoutingSocketOptions::new(SocketRole::Bind, "sync_server")
            .with_type("Profile")
            .with_server("ProfileService", "ProfileServer"),
        server_registry(),
    )
    .unwrap();
    server.bind(&address).unwrap();

    let client = RoutingSocket::new(
        RoutingSocketOptions::new(SocketRole::Connect, "sync_client")
            .with_type("Profile")
            .with_type("ProfileService"),
        client_registry(),
    )
    .unwrap();
    client.connect(&address, true, true).unwrap();
    wait_for_clients(&server, 1);
    (server, client)
}

#[test]
fn test_client_adopts_server_fields_and_methods() {
    let (_server, client) = start("sync-adopt");
    let known = client.known();

    let added = &known.types["Profile"].fields["newonserver"];
    assert!(!added.local);
    assert_eq!(added.kind, FieldKind::Int32);
    assert_eq!((added.offset, added.size), (-1, -1));

    let extra = &known.services["ProfileService"].methods["Extra"];
    assert!(!extra.local);
    assert_eq!(extra.id_value, 3);
    assert_eq!(extra.handler, "Extra");

    // Both sides used id 3 for different fields.
    assert_eq!(
        known.types["Profile"].fields["nickname"].errors.as_str(),
        "Duplicate id!"
    );
    assert_eq!(
        known.services["ProfileService"].methods["ClientOnly"]
            .errors
            .as_str(),
        "Missing remote method! ProfileService, ClientOnly"
    );
}

#[test]
fn test_server_adopts_client_offer() {
    let (server, _client) = start("sync-offer");
    let known = server.known();

    let nickname = &known.types["Profile"].fields["nickname"];
    assert!(!nickname.local);
    assert_eq!(nickname.kind, FieldKind::String);
    assert_eq!(
        known.types["Profile"].fields["newonserver"].errors.as_str(),
        "Duplicate id!"
    );
    assert!(!known.services["ProfileService"].methods["ClientOnly"].local);
}

#[test]
fn test_reconciliation_is_idempotent_after_sync() {
    let (server, client) = start("sync-idempotent");

    let server_schema = server.schema(0);
    let mut known = client.known();
    assert_eq!(find_new_fields(&server_schema, &mut known, false), 0);
    assert_eq!(find_new_methods(&server_schema, &mut known, false), 0);

    let client_schema = client.schema(0);
    let mut known = server.known();
    assert_eq!(find_new_fields(&client_schema, &mut known, false), 0);
    assert_eq!(find_new_methods(&client_schema, &mut known, false), 0);
}

#[test]
fn test_adopted_method_without_handler_answers_empty() {
    let (server, client) = start("sync-handler");

    assert_eq!(
        client
            .server_call("ProfileService.ClientOnly", &json!({"x": 1}))
            .unwrap(),
        json!({})
    );
    assert_eq!(
        server.known().services["ProfileService"].methods["ClientOnly"]
            .errors
            .as_str(),
        "Missing server methods! ProfileService.ClientOnly"
    );

    assert_eq!(
        client.server_call("ProfileService.Get", &json!({})).unwrap(),
        json!({"name": "server"})
    );
}

#[test]
fn test_numbering_mismatch_is_reported_by_both_sides() {
    init_tracing();
    let address = memory_address("sync-numbering");

    let server_registry = TypeRegistry::builder()
        .register_type::<Misnumbered>()
        .service("Counter", |s| s.method::<Value, Value>("Bump", 1))
        .server("Counter", "CounterServer", |s| s.handle("Bump", |doc: Value| doc))
        .build();
    let client_registry = TypeRegistry::builder()
        .register_type::<Misnumbered>()
        .service("Counter", |s| s.method::<Value, Value>("Bump", 7))
        .build();

    let server = RoutingSocket::new(
        RoutingSocketOptions::new(SocketRole::Bind, "numbering_server")
            .with_type("Misnumbered")
            .with_server("Counter", "CounterServer"),
        server_registry,
    )
    .unwrap();
    server.bind(&address).unwrap();

    let client = RoutingSocket::new(
        RoutingSocketOptions::new(SocketRole::Connect, "numbering_client").with_type("Counter"),
        client_registry,
    )
    .unwrap();
    client.connect(&address, true, true).unwrap();

    assert_eq!(
        client.known().services["Counter"].methods["Bump"].errors.as_str(),
        "Method numbering mismatch! Counter, Bump, 1, 7"
    );
    assert_eq!(
        server.known().services["Counter"].methods["Bump"].errors.as_str(),
        "Method numbering mismatch! Counter, Bump, 7, 1"
    );

    // The server's copy of the method carries an error, so calls fail soft.
    assert_eq!(
        client.server_call("Counter.Bump", &json!({"n": 1})).unwrap(),
        json!({})
    );
}

#[test]
fn test_client_method_unknown_to_server_stays_callable() {
    init_tracing();
    let address = memory_address("sync-whisper");

    let server_registry = TypeRegistry::builder()
        .service("Peer", |s| s.method::<Value, Value>("Shout", 1))
        .build();
    let client_registry = TypeRegistry::builder()
        .service("Peer", |s| {
            s.method::<Value, Value>("Shout", 1)
                .method::<Value, Value>("Whisper", 2)
        })
        .server("Peer", "PeerServer", |s| {
            s.handle("Shout", |doc: Value| doc)
                .handle("Whisper", |doc: Value| doc)
        })
        .build();

    let server = RoutingSocket::new(
        RoutingSocketOptions::new(SocketRole::Bind, "whisper_server").with_type("Peer"),
        server_registry,
    )
    .unwrap();
    server.bind(&address).unwrap();

    let client = RoutingSocket::new(
        RoutingSocketOptions::new(SocketRole::Connect, "whisper_client")
            .with_server("Peer", "PeerServer"),
        client_registry,
    )
    .unwrap();
    client.connect(&address, true, true).unwrap();
    let ids = wait_for_clients(&server, 1);

    assert_eq!(
        client.known().services["Peer"].methods["Whisper"].errors.as_str(),
        "Missing remote method! Peer, Whisper"
    );
    assert!(!server.known().services["Peer"].methods["Whisper"].local);

    assert_eq!(
        server.client_call(ids[0], "Peer.Shout", &json!({"n": 1})).unwrap(),
        json!({"n": 1})
    );
    assert_eq!(
        server.client_call(ids[0], "Peer.Whisper", &json!({"n": 2})).unwrap(),
        json!({"n": 2})
    );
}
