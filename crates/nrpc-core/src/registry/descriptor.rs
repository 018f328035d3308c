//! Descriptor records for types, fields, services, methods and servers.

use super::codec::{Invoker, TypeCodec};
use super::field::{FieldKind, RpcField};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A diagnostic recorded once and never overwritten or cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StickyError(Option<String>);

impl StickyError {
    /// Record `message` unless an error is already present.
    ///
    /// Returns `true` if this call recorded it.
    pub fn set(&mut self, message: impl Into<String>) -> bool {
        if self.0.is_some() {
            return false;
        }
        self.0 = Some(message.into());
        true
    }

    pub fn get(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// The message, or an empty string when none was recorded.
    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or("")
    }
}

impl Serialize for StickyError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for StickyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A field of a registered type.
///
/// `local == false` marks a field learned from a peer's schema: it exists
/// remotely but has no backing storage here, so `offset` and `size` are -1.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    pub field_name: String,
    pub kind: FieldKind,
    pub id_value: i32,
    pub offset: i64,
    pub size: i64,
    pub local: bool,
    pub errors: StickyError,
}

impl FieldInfo {
    /// Descriptor for a field of `T` reached through `accessor`.
    pub fn local_of<T, F, A>(name: &str, id_value: i32, offset: usize, _accessor: A) -> Self
    where
        F: RpcField,
        A: Fn(&T) -> &F,
    {
        Self {
            field_name: name.to_string(),
            kind: F::kind(),
            id_value,
            offset: offset as i64,
            size: std::mem::size_of::<F>() as i64,
            local: true,
            errors: StickyError::default(),
        }
    }

    /// Descriptor for a field known only from a peer.
    pub fn remote(name: &str, id_value: i32, kind: FieldKind) -> Self {
        Self {
            field_name: name.to_string(),
            kind,
            id_value,
            offset: -1,
            size: -1,
            local: false,
            errors: StickyError::default(),
        }
    }
}

/// A registered type.
#[derive(Clone)]
pub struct TypeInfo {
    pub type_name: String,
    pub size: i64,
    pub fields: BTreeMap<String, FieldInfo>,
    pub class_id: u32,
    pub local: bool,
    pub errors: StickyError,
    pub codec: Arc<dyn TypeCodec>,
}

impl fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeInfo")
            .field("type_name", &self.type_name)
            .field("size", &self.size)
            .field("fields", &self.fields)
            .field("class_id", &self.class_id)
            .field("local", &self.local)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

/// A method of a service or server.
///
/// Service methods describe the contract; server methods additionally carry
/// the invoker. A `blocked` method is never dispatched: its signature or
/// numbering disagrees with what the handler or the peer expects. Other
/// recorded errors are diagnostics only.
#[derive(Clone)]
pub struct MethodInfo {
    pub method_name: String,
    pub request_type: String,
    pub response_type: String,
    pub handler: String,
    pub id_value: i32,
    pub local: bool,
    pub errors: StickyError,
    pub blocked: bool,
    pub invoker: Option<Invoker>,
}

impl MethodInfo {
    pub fn declared(
        name: &str,
        id_value: i32,
        request_type: String,
        response_type: String,
    ) -> Self {
        Self {
            method_name: name.to_string(),
            request_type,
            response_type,
            handler: name.to_string(),
            id_value,
            local: true,
            errors: StickyError::default(),
            blocked: false,
            invoker: None,
        }
    }

    /// Stop dispatching this method and record why.
    ///
    /// Returns `true` if `message` became the recorded error.
    pub fn block(&mut self, message: impl Into<String>) -> bool {
        self.blocked = true;
        self.errors.set(message)
    }
}

impl fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodInfo")
            .field("method_name", &self.method_name)
            .field("request_type", &self.request_type)
            .field("response_type", &self.response_type)
            .field("handler", &self.handler)
            .field("id_value", &self.id_value)
            .field("local", &self.local)
            .field("errors", &self.errors)
            .field("blocked", &self.blocked)
            .field("has_invoker", &self.invoker.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub service_name: String,
    pub methods: BTreeMap<String, MethodInfo>,
    pub local: bool,
    pub errors: StickyError,
}

impl ServiceInfo {
    pub fn new(name: &str) -> Self {
        Self {
            service_name: name.to_string(),
            methods: BTreeMap::new(),
            local: true,
            errors: StickyError::default(),
        }
    }
}

/// A local implementation of a service.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_name: String,
    pub service_name: String,
    pub methods: BTreeMap<String, MethodInfo>,
}
