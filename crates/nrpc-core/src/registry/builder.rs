//! Startup registration of types, services and servers.
//!
//! The registry is built once with explicit registration calls and then
//! frozen behind an `Arc`. Sockets copy the entries they need out of it.
//!
//! ```
//! use nrpc_core::registry::TypeRegistry;
//! use nrpc_core::rpc_type;
//! use serde_json::Value;
//!
//! #[derive(Debug, Default)]
//! pub struct PingRequest { pub n: i32 }
//! rpc_type!(PingRequest { n = 1 });
//!
//! let registry = TypeRegistry::builder()
//!     .register_type::<PingRequest>()
//!     .service("Echo", |service| service.method::<Value, Value>("Ping", 1))
//!     .server("Echo", "EchoServer", |server| server.handle("Ping", |doc: Value| doc))
//!     .build();
//!
//! assert!(registry.describe_method("Echo", "Ping").is_some());
//! ```

use super::codec::{invoker, TypeCodec, TypedCodec};
use super::descriptor::{MethodInfo, ServerInfo, ServiceInfo, StickyError, TypeInfo};
use super::field::{RpcField, RpcType};
use crate::config::RegistryConfig;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Immutable snapshot of everything registered at startup.
#[derive(Debug)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeInfo>,
    services: BTreeMap<String, ServiceInfo>,
    servers: BTreeMap<String, ServerInfo>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    pub fn describe_type(&self, name: &str) -> Option<&TypeInfo> {
        self.types.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceInfo> {
        self.services.get(name)
    }

    /// Server registered for a service, keyed by service name.
    pub fn server(&self, service_name: &str) -> Option<&ServerInfo> {
        self.servers.get(service_name)
    }

    /// The invokable server method for `service.method`.
    pub fn describe_method(&self, service: &str, method: &str) -> Option<&MethodInfo> {
        self.servers
            .get(service)
            .and_then(|server| server.methods.get(method))
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

/// Collects registrations; consumed by [`build`](Self::build).
pub struct TypeRegistryBuilder {
    types: BTreeMap<String, TypeInfo>,
    services: BTreeMap<String, ServiceInfo>,
    servers: BTreeMap<String, ServerInfo>,
    next_class_id: u32,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            types: BTreeMap::new(),
            services: BTreeMap::new(),
            servers: BTreeMap::new(),
            next_class_id: RegistryConfig::FIRST_CLASS_ID,
        };
        builder.insert_type(
            RegistryConfig::DYNAMIC_OBJECT,
            std::mem::size_of::<Value>(),
            Vec::new(),
            TypedCodec::<Value>::shared(),
        );
        builder
    }

    fn insert_type(
        &mut self,
        name: &str,
        size: usize,
        fields: Vec<super::FieldInfo>,
        codec: Arc<dyn TypeCodec>,
    ) {
        if self.types.contains_key(name) {
            warn!("Type {} registered twice, keeping the first", name);
            return;
        }
        let class_id = self.next_class_id;
        self.next_class_id += 1;
        self.types.insert(
            name.to_string(),
            TypeInfo {
                type_name: name.to_string(),
                size: size as i64,
                fields: fields
                    .into_iter()
                    .map(|field| (field.field_name.clone(), field))
                    .collect(),
                class_id,
                local: true,
                errors: StickyError::default(),
                codec,
            },
        );
    }

    /// Register a struct declared with [`rpc_type!`](crate::rpc_type).
    pub fn register_type<T: RpcType>(mut self) -> Self {
        self.insert_type(
            T::TYPE_NAME,
            std::mem::size_of::<T>(),
            T::field_infos(),
            TypedCodec::<T>::shared(),
        );
        self
    }

    /// Declare a service contract.
    pub fn service<F>(mut self, name: &str, declare: F) -> Self
    where
        F: FnOnce(ServiceBuilder) -> ServiceBuilder,
    {
        let service = declare(ServiceBuilder {
            info: ServiceInfo::new(name),
        })
        .info;
        self.services.insert(name.to_string(), service);
        self
    }

    /// Bind handlers for a service. Method ids come from the service contract.
    pub fn server<F>(mut self, service_name: &str, server_name: &str, declare: F) -> Self
    where
        F: FnOnce(ServerBuilder) -> ServerBuilder,
    {
        let mut server = declare(ServerBuilder {
            info: ServerInfo {
                server_name: server_name.to_string(),
                service_name: service_name.to_string(),
                methods: BTreeMap::new(),
            },
        })
        .info;

        if let Some(service) = self.services.get(service_name) {
            for (name, method) in server.methods.iter_mut() {
                if let Some(declared) = service.methods.get(name) {
                    method.id_value = declared.id_value;
                }
            }
        } else {
            warn!(
                "Server {} registered for undeclared service {}",
                server_name, service_name
            );
        }

        self.servers.insert(service_name.to_string(), server);
        self
    }

    pub fn build(self) -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry {
            types: self.types,
            services: self.services,
            servers: self.servers,
        })
    }
}

impl Default for TypeRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares the methods of a service.
pub struct ServiceBuilder {
    info: ServiceInfo,
}

impl ServiceBuilder {
    pub fn method<Req: RpcField, Res: RpcField>(mut self, name: &str, id_value: i32) -> Self {
        self.info.methods.insert(
            name.to_string(),
            MethodInfo::declared(name, id_value, Req::type_name(), Res::type_name()),
        );
        self
    }
}

/// Binds handlers to the methods of a service.
pub struct ServerBuilder {
    info: ServerInfo,
}

impl ServerBuilder {
    pub fn handle<Req, Res, F>(mut self, name: &str, handler: F) -> Self
    where
        Req: RpcField,
        Res: RpcField,
        F: Fn(Req) -> Res + Send + Sync + 'static,
    {
        let mut method = MethodInfo::declared(name, 0, Req::type_name(), Res::type_name());
        method.invoker = Some(invoker(handler));
        self.info.methods.insert(name.to_string(), method);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_type;

    #[derive(Debug, Default)]
    struct Greeting {
        text: String,
    }

    rpc_type!(Greeting { text = 1 });

    fn registry() -> Arc<TypeRegistry> {
        TypeRegistry::builder()
            .register_type::<Greeting>()
            .service("Greeter", |service| {
                service
                    .method::<Greeting, Greeting>("Greet", 1)
                    .method::<Value, Value>("Raw", 2)
            })
            .server("Greeter", "GreeterServer", |server| {
                server
                    .handle("Greet", |req: Greeting| Greeting {
                        text: format!("hello {}", req.text),
                    })
                    .handle("Raw", |doc: Value| doc)
            })
            .build()
    }

    #[test]
    fn test_dynamic_object_is_always_registered() {
        let registry = TypeRegistry::builder().build();
        let dict = registry.describe_type("dict").unwrap();
        assert_eq!(dict.class_id, RegistryConfig::FIRST_CLASS_ID);
        assert!(dict.fields.is_empty());
    }

    #[test]
    fn test_class_ids_follow_registration_order() {
        let registry = registry();
        let greeting = registry.describe_type("Greeting").unwrap();
        assert_eq!(greeting.class_id, RegistryConfig::FIRST_CLASS_ID + 1);
        assert_eq!(greeting.fields["text"].id_value, 1);
    }

    #[test]
    fn test_server_methods_take_service_ids() {
        let registry = registry();
        let raw = registry.describe_method("Greeter", "Raw").unwrap();
        assert_eq!(raw.id_value, 2);
        assert_eq!(raw.request_type, "dict");
        assert!(raw.invoker.is_some());
    }

    #[test]
    fn test_described_method_invokes_handler() {
        let registry = registry();
        let method = registry.describe_method("Greeter", "Greet").unwrap();
        let codec = &registry.describe_type(&method.request_type).unwrap().codec;

        let request = codec.decode(&serde_json::json!({"text": "bob"})).unwrap();
        let invoke = method.invoker.as_ref().unwrap();
        let response = invoke(request).unwrap();
        let response = codec.encode(&response).unwrap();

        assert_eq!(response, serde_json::json!({"text": "hello bob"}));
    }
}
