//! mqrpc - JSON-RPC 2.0 calls and notifications over a topic message broker.
//!
//! A service registers methods on an [`RpcNode`] and listens on one queue per
//! method. A client starts a caller on its own node, which declares an
//! exclusive reply queue, and invokes remote methods through [`RemoteCall`].
//! Replies find their waiting caller through a correlation token carried on
//! every message.
//!
//! # Example
//!
//! ```rust,ignore
//! use mqrpc::{MemoryBroker, Method, Param, RpcNode, Settings};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> mqrpc::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!
//!     let service = RpcNode::new(Settings::new("calc"), broker.clone());
//!     service
//!         .register(
//!             "add",
//!             Method::sync(vec![Param::int("a"), Param::int("b")], |args| {
//!                 Ok(json!(args.i64("a")? + args.i64("b")?))
//!             }),
//!         )
//!         .await;
//!     service.start_listener().await?;
//!
//!     let client = RpcNode::new(Settings::new("calc"), broker);
//!     client.start_caller().await?;
//!     let add = client.caller("add", false).await?;
//!     assert_eq!(add.call(vec![json!(2), json!(3)]).await?, Some(json!(5)));
//!     Ok(())
//! }
//! ```

pub mod binding;
pub mod caller;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod node;
pub mod taxonomy;
pub mod transport;

// Re-export commonly used types
pub use binding::{bind, Arg, Args, CastTarget, Decode, Param};
pub use caller::RemoteCall;
pub use config::{ProtocolConfig, Settings, TransportConfig};
pub use correlation::{CorrelationRegistry, PendingCall};
pub use dispatcher::{Dispatcher, HandlerFuture, Method};
pub use envelope::{ErrorResponse, ErrorStatus, Params, Reply, Request, Response};
pub use error::{Result, RpcError};
pub use listener::{RequestListener, ResponseListener};
pub use node::RpcNode;
pub use taxonomy::ErrorKind;
pub use transport::memory::MemoryBroker;
