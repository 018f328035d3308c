//! Field kinds and the traits that connect Rust values to dynamic documents.

use super::descriptor::FieldInfo;
use crate::error::{NrpcError, Result};
use serde_json::Value;

/// Kind of a registered field, as reported in schema documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Unknown,
    Int32,
    Float32,
    String,
    /// Free-form JSON document (`"dict"`).
    Document,
    /// Another registered type, by name.
    Nested(String),
}

impl FieldKind {
    pub fn wire_name(&self) -> &str {
        match self {
            FieldKind::Unknown => "unknown",
            FieldKind::Int32 => "int",
            FieldKind::Float32 => "float",
            FieldKind::String => "str",
            FieldKind::Document => "dict",
            FieldKind::Nested(name) => name,
        }
    }

    pub fn from_wire_name(name: &str) -> Self {
        match name {
            "int" => FieldKind::Int32,
            "float" => FieldKind::Float32,
            "str" => FieldKind::String,
            "dict" => FieldKind::Document,
            "" | "unknown" => FieldKind::Unknown,
            other => FieldKind::Nested(other.to_string()),
        }
    }
}

/// A value that can live in a registered field or be a method argument.
///
/// `assign_from` updates `self` in place: keys missing from the document keep
/// their current values, which is how partial documents decode onto defaults.
pub trait RpcField: Default + Send + 'static {
    fn kind() -> FieldKind;

    fn type_name() -> String {
        Self::kind().wire_name().to_string()
    }

    fn to_document(&self) -> Value;

    fn assign_from(&mut self, doc: &Value) -> Result<()>;
}

/// A registered struct type. Implemented by [`rpc_type!`](crate::rpc_type).
pub trait RpcType: RpcField {
    const TYPE_NAME: &'static str;

    /// Field descriptors in declaration order.
    fn field_infos() -> Vec<FieldInfo>;
}

impl RpcField for i32 {
    fn kind() -> FieldKind {
        FieldKind::Int32
    }

    fn to_document(&self) -> Value {
        Value::from(*self)
    }

    fn assign_from(&mut self, doc: &Value) -> Result<()> {
        *self = doc
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| {
                NrpcError::decode("int", format!("expected a 32-bit integer, got {}", doc))
            })?;
        Ok(())
    }
}

impl RpcField for f32 {
    fn kind() -> FieldKind {
        FieldKind::Float32
    }

    fn to_document(&self) -> Value {
        Value::from(f64::from(*self))
    }

    fn assign_from(&mut self, doc: &Value) -> Result<()> {
        *self = doc
            .as_f64()
            .ok_or_else(|| NrpcError::decode("float", format!("expected a number, got {}", doc)))?
            as f32;
        Ok(())
    }
}

impl RpcField for String {
    fn kind() -> FieldKind {
        FieldKind::String
    }

    fn to_document(&self) -> Value {
        Value::String(self.clone())
    }

    fn assign_from(&mut self, doc: &Value) -> Result<()> {
        let text = doc
            .as_str()
            .ok_or_else(|| NrpcError::decode("str", format!("expected a string, got {}", doc)))?;
        self.clear();
        self.push_str(text);
        Ok(())
    }
}

impl RpcField for Value {
    fn kind() -> FieldKind {
        FieldKind::Document
    }

    fn to_document(&self) -> Value {
        self.clone()
    }

    fn assign_from(&mut self, doc: &Value) -> Result<()> {
        *self = doc.clone();
        Ok(())
    }
}

/// Register a struct as an RPC type.
///
/// Every listed field must implement [`RpcField`]; the number after `=` is
/// the field's wire id. The struct must implement `Default`.
///
/// ```
/// use nrpc_core::rpc_type;
///
/// #[derive(Debug, Default, Clone, PartialEq)]
/// pub struct HelloRequest {
///     pub name: String,
///     pub value: i32,
/// }
///
/// rpc_type!(HelloRequest { name = 1, value = 2 });
/// ```
#[macro_export]
macro_rules! rpc_type {
    ($name:ident { $($field:ident = $id:expr),* $(,)? }) => {
        impl $crate::registry::RpcField for $name {
            fn kind() -> $crate::registry::FieldKind {
                $crate::registry::FieldKind::Nested(stringify!($name).to_string())
            }

            fn type_name() -> String {
                stringify!($name).to_string()
            }

            fn to_document(&self) -> $crate::__serde_json::Value {
                #[allow(unused_mut)]
                let mut map = $crate::__serde_json::Map::new();
                $(
                    map.insert(
                        stringify!($field).to_string(),
                        $crate::registry::RpcField::to_document(&self.$field),
                    );
                )*
                $crate::__serde_json::Value::Object(map)
            }

            fn assign_from(&mut self, doc: &$crate::__serde_json::Value) -> $crate::Result<()> {
                #[allow(unused_variables)]
                let map = doc.as_object().ok_or_else(|| {
                    $crate::NrpcError::decode(stringify!($name), "expected an object")
                })?;
                $(
                    if let Some(value) = map.get(stringify!($field)) {
                        $crate::registry::RpcField::assign_from(&mut self.$field, value)?;
                    }
                )*
                Ok(())
            }
        }

        impl $crate::registry::RpcType for $name {
            const TYPE_NAME: &'static str = stringify!($name);

            fn field_infos() -> Vec<$crate::registry::FieldInfo> {
                vec![
                    $(
                        $crate::registry::FieldInfo::local_of(
                            stringify!($field),
                            $id,
                            ::std::mem::offset_of!($name, $field),
                            |value: &$name| &value.$field,
                        ),
                    )*
                ]
            }
        }
    };
}
