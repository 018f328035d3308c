//! Per-socket view of the registry.
//!
//! Each routing socket seeds its own [`KnownRegistry`] from the startup
//! [`TypeRegistry`] and may later extend it with descriptors learned from a
//! peer's schema. Diagnostics are recorded on these copies, never on the
//! shared registry.

use super::builder::TypeRegistry;
use super::descriptor::{ServerInfo, ServiceInfo, StickyError, TypeInfo};
use crate::config::{RegistryConfig, TypeRef};
use crate::error::{NrpcError, Result};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct KnownRegistry {
    pub types: BTreeMap<String, TypeInfo>,
    pub services: BTreeMap<String, ServiceInfo>,
    /// Local servers keyed by service name.
    pub servers: BTreeMap<String, ServerInfo>,
    /// Errors for call targets that resolve to no known service.
    pub unresolved: BTreeMap<String, StickyError>,
}

impl KnownRegistry {
    /// Copy the entries named by `refs` out of `registry`.
    ///
    /// The dynamic document type is always included. Naming an entry the
    /// registry does not contain is a configuration error.
    pub fn seed(registry: &TypeRegistry, refs: &[TypeRef]) -> Result<Self> {
        let mut known = Self::default();
        if let Some(dict) = registry.describe_type(RegistryConfig::DYNAMIC_OBJECT) {
            known
                .types
                .insert(RegistryConfig::DYNAMIC_OBJECT.to_string(), dict.clone());
        }

        for item in refs {
            match item {
                TypeRef::Name(name) => {
                    if let Some(type_info) = registry.describe_type(name) {
                        known.types.insert(name.clone(), type_info.clone());
                    } else if let Some(service) = registry.service(name) {
                        known.services.insert(name.clone(), service.clone());
                    } else {
                        return Err(NrpcError::config(format!(
                            "{} is neither a registered type nor a registered service",
                            name
                        )));
                    }
                }
                TypeRef::Server(service_name, server_name) => {
                    known.add_server(registry, service_name, server_name)?;
                }
            }
        }
        Ok(known)
    }

    fn add_server(
        &mut self,
        registry: &TypeRegistry,
        service_name: &str,
        server_name: &str,
    ) -> Result<()> {
        let service = registry.service(service_name).ok_or_else(|| {
            NrpcError::config(format!("unknown service {}", service_name))
        })?;
        let server = registry
            .server(service_name)
            .filter(|server| server.server_name == server_name)
            .ok_or_else(|| {
                NrpcError::config(format!(
                    "no server {} registered for service {}",
                    server_name, service_name
                ))
            })?;

        let mut service = service.clone();
        for (name, service_method) in service.methods.iter_mut() {
            let Some(server_method) = server.methods.get(name) else {
                continue;
            };
            if server_method.request_type != service_method.request_type
                || server_method.response_type != service_method.response_type
            {
                let message = format!(
                    "Method signature mismatch! {}, {}, {}, {} -> {}, {} -> {}",
                    server_name,
                    service_name,
                    name,
                    server_method.request_type,
                    server_method.response_type,
                    service_method.request_type,
                    service_method.response_type
                );
                warn!("{}", message);
                service_method.block(message);
            }
        }

        self.services.insert(service_name.to_string(), service);
        self.servers.insert(service_name.to_string(), server.clone());
        Ok(())
    }

    /// Record a sticky error for a call target with no known service.
    pub fn record_unresolved(&mut self, service_name: &str, message: String) -> bool {
        self.unresolved
            .entry(service_name.to_string())
            .or_default()
            .set(message)
    }

    pub fn type_count(&self) -> usize {
        self.types
            .keys()
            .filter(|name| name.as_str() != RegistryConfig::DYNAMIC_OBJECT)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc_type;
    use serde_json::Value;

    #[derive(Debug, Default)]
    struct Note {
        body: String,
    }

    rpc_type!(Note { body = 1 });

    fn registry() -> std::sync::Arc<TypeRegistry> {
        TypeRegistry::builder()
            .register_type::<Note>()
            .service("Notes", |s| {
                s.method::<Note, Note>("Echo", 1)
                    .method::<Note, Value>("Loose", 2)
            })
            .server("Notes", "NotesServer", |s| {
                s.handle("Echo", |n: Note| n)
                    .handle("Loose", |n: Note| n)
            })
            .build()
    }

    #[test]
    fn test_seed_copies_named_entries() {
        let registry = registry();
        let known = KnownRegistry::seed(
            &registry,
            &[TypeRef::name("Note"), TypeRef::server("Notes", "NotesServer")],
        )
        .unwrap();

        assert!(known.types.contains_key("dict"));
        assert!(known.types.contains_key("Note"));
        assert_eq!(known.type_count(), 1);
        assert!(known.services.contains_key("Notes"));
        assert!(known.servers.contains_key("Notes"));
    }

    #[test]
    fn test_seed_records_signature_mismatch() {
        let registry = registry();
        let known =
            KnownRegistry::seed(&registry, &[TypeRef::server("Notes", "NotesServer")]).unwrap();

        let service = &known.services["Notes"];
        assert!(!service.methods["Echo"].errors.is_set());
        assert!(service.methods["Loose"]
            .errors
            .as_str()
            .starts_with("Method signature mismatch!"));
    }

    #[test]
    fn test_seed_rejects_unknown_names() {
        let registry = registry();
        assert!(KnownRegistry::seed(&registry, &[TypeRef::name("Nope")]).is_err());
        assert!(
            KnownRegistry::seed(&registry, &[TypeRef::server("Notes", "WrongServer")]).is_err()
        );
    }

    #[test]
    fn test_unresolved_errors_are_sticky() {
        let mut known = KnownRegistry::default();
        assert!(known.record_unresolved("NoSuch", "Missing service! NoSuch.Method".into()));
        assert!(!known.record_unresolved("NoSuch", "Missing service! NoSuch.Other".into()));
        assert_eq!(known.unresolved.len(), 1);
    }
}
