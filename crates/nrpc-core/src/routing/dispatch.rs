//! Turning a `"Service.Method"` call into a local handler invocation.

use crate::registry::{Invoker, KnownRegistry, StickyError, TypeCodec};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Everything needed to run a call once the registry lock is released.
struct Resolved {
    request: Arc<dyn TypeCodec>,
    response: Arc<dyn TypeCodec>,
    invoker: Invoker,
}

/// Run an application call against the known registry.
///
/// Never fails: a call that cannot be resolved records a sticky error on the
/// most specific entry it reached and answers an empty document, as does a
/// request that does not decode.
pub fn incoming_call(known: &RwLock<KnownRegistry>, method_name: &str, request: &Value) -> Value {
    let Some(resolved) = resolve(&mut known.write(), method_name) else {
        return json!({});
    };

    let outcome = resolved
        .request
        .decode(request)
        .and_then(|instance| (resolved.invoker)(instance))
        .and_then(|instance| resolved.response.encode(&instance));
    match outcome {
        Ok(response) => response,
        Err(e) => {
            warn!("Call {} failed: {}", method_name, e);
            json!({})
        }
    }
}

fn resolve(known: &mut KnownRegistry, method_name: &str) -> Option<Resolved> {
    let (service_name, method) = method_name.split_once('.').unwrap_or((method_name, ""));

    let Some(service) = known.services.get_mut(service_name) else {
        let message = format!("Missing service! {}", method_name);
        if known.record_unresolved(service_name, message.clone()) {
            warn!("{}", message);
        }
        return None;
    };

    let Some(server) = known.servers.get(service_name) else {
        fail(&mut service.errors, format!("Missing server! {}", method_name));
        return None;
    };

    let Some(declared) = service.methods.get_mut(method) else {
        fail(&mut service.errors, format!("Missing method! {}", method_name));
        return None;
    };
    if declared.blocked {
        return None;
    }

    let Some(invoker) = server
        .methods
        .get(method)
        .and_then(|implemented| implemented.invoker.clone())
    else {
        fail(
            &mut declared.errors,
            format!("Missing server methods! {}", method_name),
        );
        return None;
    };

    let Some(request) = known.types.get(&declared.request_type) else {
        let message = format!(
            "Unknown method request type! {}, {}",
            method_name, declared.request_type
        );
        fail(&mut declared.errors, message);
        return None;
    };
    let Some(response) = known.types.get(&declared.response_type) else {
        let message = format!(
            "Unknown method response type! {}, {}",
            method_name, declared.response_type
        );
        fail(&mut declared.errors, message);
        return None;
    };

    Some(Resolved {
        request: request.codec.clone(),
        response: response.codec.clone(),
        invoker,
    })
}

fn fail(errors: &mut StickyError, message: String) {
    if errors.set(message.clone()) {
        warn!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TypeRef;
    use crate::registry::TypeRegistry;
    use crate::rpc_type;

    #[derive(Debug, Default)]
    struct Hello {
        name: String,
        count: i32,
    }

    rpc_type!(Hello { name = 1, count = 2 });

    fn known(refs: &[TypeRef]) -> RwLock<KnownRegistry> {
        let registry = TypeRegistry::builder()
            .register_type::<Hello>()
            .service("HelloService", |s| {
                s.method::<Hello, Hello>("Hello", 1)
                    .method::<Value, Value>("Echo", 2)
                    .method::<Value, Value>("Unimplemented", 3)
            })
            .server("HelloService", "HelloServer", |s| {
                s.handle("Hello", |req: Hello| Hello {
                    name: format!("Hello {}", req.name),
                    count: req.count + 1,
                })
                .handle("Echo", |doc: Value| doc)
            })
            .build();
        RwLock::new(KnownRegistry::seed(&registry, refs).unwrap())
    }

    fn served() -> RwLock<KnownRegistry> {
        known(&[
            TypeRef::name("Hello"),
            TypeRef::server("HelloService", "HelloServer"),
        ])
    }

    #[test]
    fn test_typed_call_runs_handler() {
        let known = served();
        let response = incoming_call(
            &known,
            "HelloService.Hello",
            &json!({"name": "World", "count": 1}),
        );
        assert_eq!(response, json!({"name": "Hello World", "count": 2}));
    }

    #[test]
    fn test_document_call_mirrors_input() {
        let known = served();
        let response = incoming_call(&known, "HelloService.Echo", &json!({"n": 1}));
        assert_eq!(response, json!({"n": 1}));
    }

    #[test]
    fn test_unknown_service_records_one_error() {
        let known = served();
        assert_eq!(incoming_call(&known, "NoSuch.Method", &json!({})), json!({}));
        assert_eq!(incoming_call(&known, "NoSuch.Method", &json!({})), json!({}));

        let known = known.read();
        assert_eq!(known.unresolved.len(), 1);
        assert_eq!(
            known.unresolved["NoSuch"].as_str(),
            "Missing service! NoSuch.Method"
        );
    }

    #[test]
    fn test_service_without_server() {
        let known = known(&[TypeRef::name("HelloService")]);
        assert_eq!(incoming_call(&known, "HelloService.Echo", &json!({})), json!({}));
        assert_eq!(
            known.read().services["HelloService"].errors.as_str(),
            "Missing server! HelloService.Echo"
        );
    }

    #[test]
    fn test_unknown_method_is_recorded_on_service() {
        let known = served();
        incoming_call(&known, "HelloService.Nope", &json!({}));
        incoming_call(&known, "HelloService.Other", &json!({}));
        assert_eq!(
            known.read().services["HelloService"].errors.as_str(),
            "Missing method! HelloService.Nope"
        );
    }

    #[test]
    fn test_declared_but_unimplemented_method() {
        let known = served();
        incoming_call(&known, "HelloService.Unimplemented", &json!({}));
        assert_eq!(
            known.read().services["HelloService"].methods["Unimplemented"]
                .errors
                .as_str(),
            "Missing server methods! HelloService.Unimplemented"
        );
    }

    #[test]
    fn test_unknown_request_type() {
        // Hello is not in the known set, so its descriptor cannot be found.
        let known = known(&[TypeRef::server("HelloService", "HelloServer")]);
        assert_eq!(incoming_call(&known, "HelloService.Hello", &json!({})), json!({}));
        assert_eq!(
            known.read().services["HelloService"].methods["Hello"]
                .errors
                .as_str(),
            "Unknown method request type! HelloService.Hello, Hello"
        );

        // Echo only needs the dynamic document type and still works.
        assert_eq!(
            incoming_call(&known, "HelloService.Echo", &json!({"k": 1})),
            json!({"k": 1})
        );
    }

    #[test]
    fn test_method_with_error_answers_empty() {
        let known = served();
        known
            .write()
            .services
            .get_mut("HelloService")
            .unwrap()
            .methods
            .get_mut("Echo")
            .unwrap()
            .block("Method numbering mismatch! HelloService, Echo, 9, 2");
        assert_eq!(incoming_call(&known, "HelloService.Echo", &json!({"n": 1})), json!({}));
    }

    #[test]
    fn test_diagnostic_error_does_not_stop_dispatch() {
        let known = served();
        known
            .write()
            .services
            .get_mut("HelloService")
            .unwrap()
            .methods
            .get_mut("Echo")
            .unwrap()
            .errors
            .set("Missing remote method! HelloService, Echo");
        assert_eq!(
            incoming_call(&known, "HelloService.Echo", &json!({"n": 1})),
            json!({"n": 1})
        );
    }

    #[test]
    fn test_undecodable_request_answers_empty() {
        let known = served();
        let response = incoming_call(&known, "HelloService.Hello", &json!({"count": "three"}));
        assert_eq!(response, json!({}));
        assert!(!known.read().services["HelloService"].methods["Hello"]
            .errors
            .is_set());
    }
}
