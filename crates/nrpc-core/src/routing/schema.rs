//! Schema documents and reconciliation against a peer's schema.
//!
//! Reconciliation only looks at types and services this socket already
//! knows. Drift is recorded as sticky errors on the local entries; unknown
//! remote fields and methods are queued and, with `do_add`, materialized as
//! `local == false` descriptors.

use crate::config::RegistryConfig;
use crate::registry::{FieldInfo, FieldKind, KnownRegistry, MethodInfo, StickyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Full schema snapshot exchanged by `GetSchema` and `SetSchema`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    pub server_id: u64,
    pub client_id: u64,
    pub metadata: Value,
    pub active_client: u64,
    pub this_socket: String,
    pub entry_file: String,
    pub types: Vec<TypeRow>,
    pub fields: Vec<FieldRow>,
    pub services: Vec<ServiceRow>,
    pub methods: Vec<MethodRow>,
    pub clients: Vec<ClientRow>,
    pub servers: Vec<ServerRow>,
    /// Errors for call targets that matched no known service.
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypeRow {
    pub type_name: String,
    pub size: i64,
    pub fields: usize,
    pub local: bool,
    pub type_errors: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldRow {
    pub type_name: String,
    pub field_name: String,
    pub field_type: String,
    pub id_value: i32,
    pub offset: i64,
    pub size: i64,
    pub local: bool,
    pub field_errors: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceRow {
    pub service_name: String,
    pub methods: usize,
    pub local: bool,
    pub has_server: bool,
    pub service_errors: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodRow {
    pub service_name: String,
    pub method_name: String,
    pub request_type: String,
    pub response_type: String,
    pub id_value: i32,
    pub local: bool,
    pub method_errors: String,
    /// Handler name; peers that omit it use the method name.
    pub handler: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientRow {
    pub main_port: u16,
    pub client_id: u64,
    pub is_validated: bool,
    pub is_lost: bool,
    pub entry_file: String,
    pub client_metadata: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerRow {
    pub port: u16,
    pub entry_file: String,
    pub server_metadata: Value,
}

impl Schema {
    /// Fill the registry rows from `known`. The dynamic document type is omitted.
    pub fn with_registry(mut self, known: &KnownRegistry) -> Self {
        for (type_name, info) in &known.types {
            if type_name == RegistryConfig::DYNAMIC_OBJECT {
                continue;
            }
            self.types.push(TypeRow {
                type_name: type_name.clone(),
                size: info.size,
                fields: info.fields.len(),
                local: info.local,
                type_errors: info.errors.to_string(),
            });
            self.fields
                .extend(info.fields.values().map(|field| FieldRow {
                    type_name: type_name.clone(),
                    field_name: field.field_name.clone(),
                    field_type: field.kind.wire_name().to_string(),
                    id_value: field.id_value,
                    offset: field.offset,
                    size: field.size,
                    local: field.local,
                    field_errors: field.errors.to_string(),
                }));
        }

        for (service_name, service) in &known.services {
            self.services.push(ServiceRow {
                service_name: service_name.clone(),
                methods: service.methods.len(),
                local: service.local,
                has_server: known.servers.contains_key(service_name),
                service_errors: service.errors.to_string(),
            });
            self.methods
                .extend(service.methods.values().map(|method| MethodRow {
                    service_name: service_name.clone(),
                    method_name: method.method_name.clone(),
                    request_type: method.request_type.clone(),
                    response_type: method.response_type.clone(),
                    id_value: method.id_value,
                    local: method.local,
                    method_errors: method.errors.to_string(),
                    handler: Some(method.handler.clone()),
                }));
        }

        self.errors = known
            .unresolved
            .iter()
            .filter(|(_, error)| error.is_set())
            .map(|(name, error)| (name.clone(), error.to_string()))
            .collect();
        self
    }
}

fn record(errors: &mut StickyError, message: String) {
    if errors.set(message.clone()) {
        warn!("{}", message);
    }
}

/// Reconcile the remote field list against the locally known types.
///
/// Returns the number of remote fields unknown locally. With `do_add` they
/// are added as remote-only descriptors, so an immediate second pass finds
/// none.
pub fn find_new_fields(remote: &Schema, known: &mut KnownRegistry, do_add: bool) -> usize {
    let mut queued: Vec<&FieldRow> = Vec::new();

    for row in &remote.fields {
        let Some(type_info) = known.types.get_mut(&row.type_name) else {
            continue;
        };

        if let Some(local) = type_info.fields.get_mut(&row.field_name) {
            if local.id_value != row.id_value {
                let message = format!(
                    "Field numbering mismatch! {}.{}, {}, {}",
                    row.type_name, row.field_name, row.id_value, local.id_value
                );
                record(&mut local.errors, message);
            }
            continue;
        }

        for clash in type_info
            .fields
            .values_mut()
            .filter(|field| field.id_value == row.id_value)
        {
            record(&mut clash.errors, "Duplicate id!".to_string());
        }
        queued.push(row);
    }

    if do_add {
        for row in &queued {
            if let Some(type_info) = known.types.get_mut(&row.type_name) {
                debug!("Adding remote field {}.{}", row.type_name, row.field_name);
                type_info.fields.insert(
                    row.field_name.clone(),
                    FieldInfo::remote(
                        &row.field_name,
                        row.id_value,
                        FieldKind::from_wire_name(&row.field_type),
                    ),
                );
            }
        }
    }
    queued.len()
}

/// Reconcile the remote method list against the locally known services.
///
/// Same contract as [`find_new_fields`].
pub fn find_new_methods(remote: &Schema, known: &mut KnownRegistry, do_add: bool) -> usize {
    let mut queued: Vec<&MethodRow> = Vec::new();

    for row in &remote.methods {
        let Some(service) = known.services.get_mut(&row.service_name) else {
            continue;
        };

        if let Some(local) = service.methods.get_mut(&row.method_name) {
            if local.id_value != row.id_value {
                let message = format!(
                    "Method numbering mismatch! {}, {}, {}, {}",
                    row.service_name, row.method_name, row.id_value, local.id_value
                );
                local.blocked = true;
                record(&mut local.errors, message);
            }
            continue;
        }

        for clash in service
            .methods
            .values_mut()
            .filter(|method| method.id_value == row.id_value)
        {
            record(&mut clash.errors, "Duplicate id!".to_string());
        }
        queued.push(row);
    }

    if do_add {
        for row in &queued {
            if let Some(service) = known.services.get_mut(&row.service_name) {
                debug!("Adding remote method {}.{}", row.service_name, row.method_name);
                service.methods.insert(
                    row.method_name.clone(),
                    MethodInfo {
                        handler: row
                            .handler
                            .clone()
                            .unwrap_or_else(|| row.method_name.clone()),
                        local: false,
                        ..MethodInfo::declared(
                            &row.method_name,
                            row.id_value,
                            row.request_type.clone(),
                            row.response_type.clone(),
                        )
                    },
                );
            }
        }
    }
    queued.len()
}

/// Record which locally known services and methods the peer lacks.
///
/// Only sticky errors are written; no entry is added or removed.
pub fn find_missing_methods(remote: &Schema, known: &mut KnownRegistry) {
    let remote_services: BTreeSet<&str> = remote
        .services
        .iter()
        .map(|row| row.service_name.as_str())
        .collect();
    let remote_methods: BTreeSet<(&str, &str)> = remote
        .methods
        .iter()
        .map(|row| (row.service_name.as_str(), row.method_name.as_str()))
        .collect();

    for (service_name, service) in known.services.iter_mut() {
        if !remote_services.contains(service_name.as_str()) {
            record(
                &mut service.errors,
                format!("Missing remote service! {}", service_name),
            );
            continue;
        }
        for (method_name, method) in service.methods.iter_mut() {
            if !remote_methods.contains(&(service_name.as_str(), method_name.as_str())) {
                record(
                    &mut method.errors,
                    format!("Missing remote method! {}, {}", service_name, method_name),
                );
            }
        }
    }
}
