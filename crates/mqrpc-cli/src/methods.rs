//! Demo methods served by the CLI.

use chrono::{DateTime, FixedOffset};
use mqrpc::{Args, Method, Param, RpcError, RpcNode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

/// Method names registered by [`register_all`].
pub const METHODS: [&str; 5] = ["ping", "echo", "add", "days_between", "scale_point"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

fn add(args: Args) -> mqrpc::Result<Value> {
    let a = args.i64("a")?;
    let b = args.i64("b")?;
    a.checked_add(b)
        .map(Value::from)
        .ok_or_else(|| RpcError::other(format!("{} + {} overflows", a, b)))
}

fn days_between(args: Args) -> mqrpc::Result<Value> {
    let start: DateTime<FixedOffset> = args.timestamp("start")?;
    let end = args.timestamp("end")?;
    Ok(json!((end - start).num_days()))
}

fn scale_point(args: Args) -> mqrpc::Result<Value> {
    let point = args.record::<Point>("point")?;
    let factor = args.f64("factor")?;
    Ok(serde_json::to_value(Point {
        x: point.x * factor,
        y: point.y * factor,
    })?)
}

/// Register every demo method on `node`.
pub async fn register_all(node: &RpcNode) {
    node.register("ping", Method::sync(vec![], |_| Ok(json!("pong"))))
        .await;
    node.register(
        "echo",
        Method::asynchronous(vec![Param::any("value")], |args: Args| async move {
            let value = args.value("value")?.clone();
            debug!("echo {}", value);
            Ok::<_, RpcError>(value)
        }),
    )
    .await;
    node.register("add", Method::sync(vec![Param::int("a"), Param::int("b")], add))
        .await;
    node.register(
        "days_between",
        Method::sync(
            vec![Param::timestamp("start"), Param::timestamp("end")],
            days_between,
        ),
    )
    .await;
    node.register(
        "scale_point",
        Method::sync(
            vec![Param::record::<Point>("point"), Param::float("factor")],
            scale_point,
        ),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqrpc::{Dispatcher, ErrorKind, MemoryBroker, Settings};
    use std::sync::Arc;

    async fn dispatcher() -> Arc<Dispatcher> {
        let node = RpcNode::new(Settings::new("demo"), Arc::new(MemoryBroker::new()));
        register_all(&node).await;
        node.dispatcher().clone()
    }

    #[tokio::test]
    async fn test_all_methods_registered() {
        let dispatcher = dispatcher().await;
        let mut expected: Vec<String> = METHODS.iter().map(|m| m.to_string()).collect();
        expected.sort();
        assert_eq!(dispatcher.method_names().await, expected);
    }

    #[tokio::test]
    async fn test_demo_methods() {
        let dispatcher = dispatcher().await;

        let reply = dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#)
            .await
            .unwrap();
        assert_eq!(reply, r#"{"jsonrpc":"2.0","result":"pong","id":1}"#);

        let reply = dispatcher
            .dispatch(r#"{"jsonrpc":"2.0","method":"echo","params":{"value":[1,"a"]},"id":2}"#)
            .await
            .unwrap();
        assert_eq!(reply, r#"{"jsonrpc":"2.0","result":[1,"a"],"id":2}"#);

        let reply = dispatcher
            .dispatch(
                r#"{"jsonrpc":"2.0","method":"scale_point","params":[{"x":1.0,"y":2.0},0.5],"id":3}"#,
            )
            .await
            .unwrap();
        assert_eq!(
            reply,
            r#"{"jsonrpc":"2.0","result":{"x":0.5,"y":1.0},"id":3}"#
        );
    }

    #[tokio::test]
    async fn test_add_overflow_is_internal_error() {
        let dispatcher = dispatcher().await;
        let raw = format!(
            r#"{{"jsonrpc":"2.0","method":"add","params":[{},1],"id":4}}"#,
            i64::MAX
        );
        let reply = dispatcher.dispatch(&raw).await.unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(
            value["error"]["code"],
            json!(ErrorKind::InternalError.code())
        );
    }
}
