//! Server-side method registry and request dispatch.
//!
//! [`Dispatcher::dispatch`] is the single entry point for inbound calls. It
//! never fails: every problem (malformed envelope, unknown method, bad
//! arguments, handler failure or panic) is logged and turned into a JSON-RPC
//! error envelope, or swallowed when the request was a notification.

use crate::binding::{bind, Args, Param};
use crate::config::ProtocolConfig;
use crate::envelope::{ErrorResponse, Request, Response};
use crate::error::{Result, RpcError};
use crate::taxonomy::ErrorKind;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Future returned by suspending handlers.
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

type BlockingFn = dyn Fn(Args) -> Result<Value> + Send + Sync;
type SuspendingFn = dyn Fn(Args) -> HandlerFuture + Send + Sync;

#[derive(Clone)]
enum Invoker {
    Blocking(Arc<BlockingFn>),
    Suspending(Arc<SuspendingFn>),
}

/// A registered procedure: its parameter descriptor and handler.
#[derive(Clone)]
pub struct Method {
    params: Vec<Param>,
    invoker: Invoker,
}

impl Method {
    /// A handler that runs to completion without suspending.
    pub fn sync<F>(params: Vec<Param>, handler: F) -> Self
    where
        F: Fn(Args) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            params,
            invoker: Invoker::Blocking(Arc::new(handler)),
        }
    }

    /// A handler that suspends; dispatch waits for its future.
    pub fn asynchronous<F, Fut>(params: Vec<Param>, handler: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            params,
            invoker: Invoker::Suspending(Arc::new(move |args| handler(args).boxed())),
        }
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn is_async(&self) -> bool {
        matches!(self.invoker, Invoker::Suspending(_))
    }

    async fn invoke(&self, args: Args) -> Result<Value> {
        match &self.invoker {
            Invoker::Blocking(handler) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| handler(args)))
                    .unwrap_or_else(|panic| Err(panicked(panic)))
            }
            Invoker::Suspending(handler) => AssertUnwindSafe(handler(args))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panicked(panic))),
        }
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("params", &self.params)
            .field("is_async", &self.is_async())
            .finish()
    }
}

fn panicked(panic: Box<dyn std::any::Any + Send>) -> RpcError {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    RpcError::other(format!("Handler panicked: {}", detail))
}

/// Registry of callable methods.
#[derive(Debug, Default)]
pub struct Dispatcher {
    methods: RwLock<HashMap<String, Method>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, replacing any earlier registration.
    pub async fn register(&self, name: impl Into<String>, method: Method) {
        let name = name.into();
        debug!(
            "Registering method {} ({} params, async: {})",
            name,
            method.params.len(),
            method.is_async()
        );
        if self.methods.write().await.insert(name.clone(), method).is_some() {
            debug!("Replaced existing registration for {}", name);
        }
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.methods.read().await.contains_key(name)
    }

    /// Registered method names, sorted.
    pub async fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Handle one raw request envelope.
    ///
    /// Returns the reply text to send back, or `None` for notifications.
    /// Requests that cannot be parsed at all get a ParseError reply without id.
    pub async fn dispatch(&self, raw: &str) -> Option<String> {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(e) => return self.error_reply(&e, None),
        };

        let id = request.id;
        let outcome = self.execute(request).await;

        match (id, outcome) {
            (None, Ok(_)) => None,
            (None, Err(e)) => {
                self.log_error(&e);
                debug!("Not replying to failed notification");
                None
            }
            (Some(id), Ok(result)) => match Response::new(result, id).encode() {
                Ok(encoded) => Some(encoded),
                Err(e) => self.error_reply(&e, Some(id)),
            },
            (Some(id), Err(e)) => self.error_reply(&e, Some(id)),
        }
    }

    async fn execute(&self, request: Request) -> Result<Value> {
        if request.jsonrpc != ProtocolConfig::JSONRPC_VERSION {
            return Err(RpcError::protocol(
                ErrorKind::InvalidRequest,
                format!(
                    "Invalid Request: expected jsonrpc {}",
                    ProtocolConfig::JSONRPC_VERSION
                ),
            ));
        }

        info!("Request to method {}", request.method);

        let method = self
            .methods
            .read()
            .await
            .get(&request.method)
            .cloned()
            .ok_or_else(|| {
                RpcError::protocol(
                    ErrorKind::MethodNotFound,
                    format!("Method not found: {}", request.method),
                )
            })?;

        let args = bind(method.params(), request.params)?;
        method.invoke(args).await
    }

    fn error_reply(&self, error: &RpcError, id: Option<i64>) -> Option<String> {
        self.log_error(error);
        match ErrorResponse::from_error(error, id).encode() {
            Ok(encoded) => Some(encoded),
            Err(e) => {
                error!("Failed to encode error response: {}", e);
                None
            }
        }
    }

    fn log_error(&self, error: &RpcError) {
        error!(
            "Generated error {} : {}",
            error.to_rpc_error_code(),
            error.to_rpc_message()
        );
        if error.kind().is_none() {
            error!("Exception: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct ExampleModel {
        x: i64,
        y: i64,
        z: f64,
    }

    async fn dispatcher() -> Dispatcher {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(
                "model",
                Method::sync(
                    vec![
                        Param::int("a"),
                        Param::string("b"),
                        Param::record::<ExampleModel>("c"),
                    ],
                    |args| {
                        let c = args.record::<ExampleModel>("c")?;
                        Ok(json!({
                            "a": args.i64("a")?,
                            "b": args.str("b")?,
                            "c": [c.x, c.y, c.z],
                        }))
                    },
                ),
            )
            .await;
        dispatcher
            .register(
                "date",
                Method::sync(vec![Param::timestamp("d")], |args| {
                    args.timestamp("d")?;
                    Ok(json!(6))
                }),
            )
            .await;
        dispatcher
            .register(
                "uuid",
                Method::sync(vec![Param::uuid("v")], |_| Err(RpcError::other("Generic"))),
            )
            .await;
        dispatcher
            .register(
                "async_func",
                Method::asynchronous(vec![Param::int("a"), Param::string("b")], |args| async move {
                    tokio::task::yield_now().await;
                    Ok::<_, RpcError>(json!([args.i64("a")?, args.str("b")?]))
                }),
            )
            .await;
        dispatcher
            .register("no_parameter", Method::sync(vec![], |_| Ok(Value::Null)))
            .await;
        dispatcher
            .register(
                "panics",
                Method::sync(vec![], |_| -> Result<Value> { panic!("kaboom") }),
            )
            .await;
        dispatcher
    }

    async fn call(dispatcher: &Dispatcher, request: Value) -> Option<Value> {
        dispatcher
            .dispatch(&request.to_string())
            .await
            .map(|reply| serde_json::from_str(&reply).unwrap())
    }

    #[tokio::test]
    async fn test_register_tracks_names() {
        let dispatcher = dispatcher().await;
        assert!(dispatcher.is_registered("date").await);
        assert!(!dispatcher.is_registered("missing").await);
        assert_eq!(dispatcher.method_names().await.len(), 6);
    }

    #[tokio::test]
    async fn test_reregistration_last_wins() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register("m", Method::sync(vec![], |_| Ok(json!(1))))
            .await;
        dispatcher
            .register("m", Method::sync(vec![], |_| Ok(json!(2))))
            .await;

        let reply = call(&dispatcher, json!({"jsonrpc": "2.0", "method": "m", "id": 1}))
            .await
            .unwrap();
        assert_eq!(reply["result"], json!(2));
        assert_eq!(dispatcher.method_names().await, vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_coerces_record_argument() {
        let dispatcher = dispatcher().await;
        let reply = call(
            &dispatcher,
            json!({"jsonrpc": "2.0", "method": "model", "params": [1, "2", {"x": 1, "y": 2, "z": 0.9}], "id": 3}),
        )
        .await
        .unwrap();

        assert_eq!(reply["result"], json!({"a": 1, "b": "2", "c": [1, 2, 0.9]}));
        assert_eq!(reply["id"], json!(3));
    }

    #[tokio::test]
    async fn test_dispatch_named_params() {
        let dispatcher = dispatcher().await;
        let reply = call(
            &dispatcher,
            json!({"jsonrpc": "2.0", "method": "date", "params": {"d": "2020-01-10T04:54:54Z"}, "id": 1}),
        )
        .await
        .unwrap();
        assert_eq!(reply, json!({"jsonrpc": "2.0", "result": 6, "id": 1}));
    }

    #[tokio::test]
    async fn test_dispatch_exact_response_text() {
        let dispatcher = dispatcher().await;
        let reply = dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","method":"date","params":["2020-01-10"],"id":1}"#)
            .await;
        assert_eq!(reply.as_deref(), Some(r#"{"jsonrpc":"2.0","result":6,"id":1}"#));
    }

    #[tokio::test]
    async fn test_dispatch_missing_arguments() {
        let dispatcher = dispatcher().await;
        let reply = call(&dispatcher, json!({"jsonrpc": "2.0", "method": "model", "id": 9}))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], json!(-32602));
        assert_eq!(reply["id"], json!(9));

        // Two of three positional arguments, cast along the way
        let reply = call(
            &dispatcher,
            json!({"jsonrpc": "2.0", "method": "model", "params": ["3", 1], "id": 10}),
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], json!(-32602));
    }

    #[tokio::test]
    async fn test_dispatch_handler_error_is_internal() {
        let dispatcher = dispatcher().await;
        let reply = call(
            &dispatcher,
            json!({"jsonrpc": "2.0", "method": "uuid", "params": ["1f4f3860-c530-4989-b185-fdecd0a00ccd"], "id": 1}),
        )
        .await
        .unwrap();
        assert_eq!(
            reply,
            json!({"jsonrpc": "2.0", "error": {"code": -32603, "message": "Internal error"}, "id": 1})
        );
    }

    #[tokio::test]
    async fn test_dispatch_async_handler() {
        let dispatcher = dispatcher().await;
        let reply = call(
            &dispatcher,
            json!({"jsonrpc": "2.0", "method": "async_func", "params": ["3", 1], "id": 1}),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"], json!([3, "1"]));
    }

    #[tokio::test]
    async fn test_dispatch_invalid_params_shape_is_parse_error() {
        let dispatcher = dispatcher().await;
        let reply = call(
            &dispatcher,
            json!({"jsonrpc": "2.0", "method": "async_func", "params": "invalid", "id": 1}),
        )
        .await
        .unwrap();
        assert_eq!(reply["error"]["code"], json!(-32700));
        assert!(reply.get("id").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_garbage_is_parse_error() {
        let dispatcher = dispatcher().await;
        let reply = dispatcher.dispatch("not valid json").await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], json!(-32700));
    }

    #[tokio::test]
    async fn test_notifications_never_reply() {
        let dispatcher = dispatcher().await;
        for request in [
            json!({"jsonrpc": "2.0", "method": "no_parameter", "params": null}),
            json!({"jsonrpc": "2.0", "method": "no_parameter", "id": null}),
            json!({"jsonrpc": "2.0", "method": "uuid", "params": ["x"]}),
            json!({"jsonrpc": "2.0", "method": "model"}),
            json!({"jsonrpc": "2.0", "method": "missing"}),
            json!({"jsonrpc": "2.0", "method": "panics"}),
            json!({"jsonrpc": "1.0", "method": "no_parameter"}),
        ] {
            assert!(call(&dispatcher, request.clone()).await.is_none(), "{}", request);
        }
    }

    #[tokio::test]
    async fn test_zero_id_gets_a_reply() {
        let dispatcher = dispatcher().await;
        let reply = call(&dispatcher, json!({"jsonrpc": "2.0", "method": "no_parameter", "id": 0}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"jsonrpc": "2.0", "result": null, "id": 0}));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dispatcher = dispatcher().await;
        let reply = call(&dispatcher, json!({"jsonrpc": "2.0", "method": "missing", "id": 5}))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], json!(-32601));
        assert_eq!(reply["error"]["message"], json!("Method not found: missing"));
        assert_eq!(reply["id"], json!(5));
    }

    #[tokio::test]
    async fn test_wrong_version_is_invalid_request() {
        let dispatcher = dispatcher().await;
        let reply = call(&dispatcher, json!({"jsonrpc": "1.0", "method": "no_parameter", "id": 2}))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], json!(2));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let dispatcher = dispatcher().await;
        let reply = call(&dispatcher, json!({"jsonrpc": "2.0", "method": "panics", "id": 4}))
            .await
            .unwrap();
        assert_eq!(reply["error"]["code"], json!(-32603));
        assert_eq!(reply["id"], json!(4));
    }

    #[tokio::test]
    async fn test_handler_raised_protocol_error_keeps_code() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register(
                "strict",
                Method::sync(vec![], |_| {
                    Err(RpcError::protocol(ErrorKind::InvalidRequest, "nope"))
                }),
            )
            .await;
        let reply = call(&dispatcher, json!({"jsonrpc": "2.0", "method": "strict", "id": 8}))
            .await
            .unwrap();
        assert_eq!(
            reply,
            json!({"jsonrpc": "2.0", "error": {"code": -32600, "message": "nope"}, "id": 8})
        );
    }
}
