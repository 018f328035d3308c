//! Type, service and server descriptors.
//!
//! - [`TypeRegistry`]: immutable startup registry built through
//!   [`TypeRegistryBuilder`]
//! - [`KnownRegistry`]: the per-socket copy that schema reconciliation extends
//! - [`TypeCodec`]: how a descriptor turns documents into owned instances

mod builder;
mod codec;
mod descriptor;
mod field;
mod known;

pub use builder::{ServerBuilder, ServiceBuilder, TypeRegistry, TypeRegistryBuilder};
pub use codec::{invoker, Instance, Invoker, TypeCodec, TypedCodec};
pub use descriptor::{FieldInfo, MethodInfo, ServerInfo, ServiceInfo, StickyError, TypeInfo};
pub use field::{FieldKind, RpcField, RpcType};
pub use known::KnownRegistry;
