//! Owned, exactly-typed instances and the codecs that fill them.
//!
//! A descriptor never aliases foreign memory: decoding constructs a fresh
//! default value of the registered Rust type and assigns the document onto
//! it; encoding reads the declared fields back out.

use super::field::RpcField;
use crate::error::{NrpcError, Result};
use serde_json::Value;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

/// An owned value of some registered type.
pub type Instance = Box<dyn Any + Send>;

/// Handler bound to a server method.
pub type Invoker = Arc<dyn Fn(Instance) -> Result<Instance> + Send + Sync>;

/// Encode/decode pair owned by a type descriptor.
pub trait TypeCodec: Send + Sync {
    fn type_name(&self) -> String;

    /// A default-initialized instance.
    fn construct(&self) -> Instance;

    fn decode_into(&self, instance: &mut Instance, doc: &Value) -> Result<()>;

    fn encode(&self, instance: &Instance) -> Result<Value>;

    fn decode(&self, doc: &Value) -> Result<Instance> {
        let mut instance = self.construct();
        self.decode_into(&mut instance, doc)?;
        Ok(instance)
    }
}

/// Codec for any [`RpcField`] type, including `serde_json::Value` (`"dict"`).
pub struct TypedCodec<T>(PhantomData<fn() -> T>);

impl<T: RpcField> TypedCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }

    pub fn shared() -> Arc<dyn TypeCodec> {
        Arc::new(Self::new())
    }

    fn mismatch() -> NrpcError {
        NrpcError::decode(T::type_name(), "instance belongs to a different type")
    }
}

impl<T: RpcField> Default for TypedCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RpcField> TypeCodec for TypedCodec<T> {
    fn type_name(&self) -> String {
        T::type_name()
    }

    fn construct(&self) -> Instance {
        Box::new(T::default())
    }

    fn decode_into(&self, instance: &mut Instance, doc: &Value) -> Result<()> {
        instance
            .downcast_mut::<T>()
            .ok_or_else(Self::mismatch)?
            .assign_from(doc)
    }

    fn encode(&self, instance: &Instance) -> Result<Value> {
        Ok(instance
            .downcast_ref::<T>()
            .ok_or_else(Self::mismatch)?
            .to_document())
    }
}

/// Wrap a typed handler as an [`Invoker`].
pub fn invoker<Req, Res, F>(handler: F) -> Invoker
where
    Req: RpcField,
    Res: RpcField,
    F: Fn(Req) -> Res + Send + Sync + 'static,
{
    Arc::new(move |request: Instance| {
        let request = request.downcast::<Req>().map_err(|_| {
            NrpcError::decode(Req::type_name(), "request instance belongs to a different type")
        })?;
        let response: Instance = Box::new(handler(*request));
        Ok(response)
    })
}
