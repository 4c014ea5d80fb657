//! Line-oriented call session.
//!
//! Each input line is a JSON object naming a method and its params:
//!
//! ```text
//! {"method": "add", "params": [2, 3]}
//! {"method": "echo", "params": {"value": "hi"}, "notify": true}
//! ```
//!
//! Each line produces one output line: the result as JSON, `sent` for
//! notifications, or `error <code>: <message>`. A session keeps one caller
//! per method and mode, so request ids keep counting across lines.

use mqrpc::{Params, RemoteCall, RpcError, RpcNode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct CallLine {
    pub method: String,
    #[serde(default)]
    pub params: Option<Params>,
    /// Fire and forget: publish without waiting for a reply.
    #[serde(default)]
    pub notify: bool,
}

impl CallLine {
    pub fn parse(line: &str) -> Result<Self, RpcError> {
        Ok(serde_json::from_str(line)?)
    }
}

fn render_error(error: &RpcError) -> String {
    match error {
        RpcError::UnknownErrorCode { code, message } => format!(
            "error {}: {}",
            code,
            message.as_deref().unwrap_or("unknown error")
        ),
        RpcError::Protocol { .. } => {
            format!("error {}: {}", error.to_rpc_error_code(), error)
        }
        other => format!("error: {}", other),
    }
}

/// Callers for one client node, reused across input lines.
pub struct CallSession<'a> {
    client: &'a RpcNode,
    timeout: Option<Duration>,
    /// Keyed by (method, notify).
    callers: HashMap<(String, bool), RemoteCall>,
}

impl<'a> CallSession<'a> {
    pub fn new(client: &'a RpcNode, timeout: Option<Duration>) -> Self {
        Self {
            client,
            timeout,
            callers: HashMap::new(),
        }
    }

    async fn caller(&mut self, method: &str, notify: bool) -> Result<&RemoteCall, RpcError> {
        let key = (method.to_string(), notify);
        if !self.callers.contains_key(&key) {
            let caller = self.client.caller(method, notify).await?;
            let caller = match self.timeout {
                Some(timeout) => caller.with_timeout(timeout),
                None => caller,
            };
            self.callers.insert(key.clone(), caller);
        }
        self.callers
            .get(&key)
            .ok_or_else(|| RpcError::other(format!("No caller for {}", method)))
    }

    /// Run one input line and render the outcome.
    pub async fn run_line(&mut self, line: &str) -> String {
        let call = match CallLine::parse(line) {
            Ok(call) => call,
            Err(e) => return render_error(&e),
        };
        debug!("Calling {} (notify: {})", call.method, call.notify);

        let caller = match self.caller(&call.method, call.notify).await {
            Ok(caller) => caller,
            Err(e) => return render_error(&e),
        };

        match caller.call(call.params.unwrap_or_default()).await {
            Ok(Some(result)) => result.to_string(),
            Ok(None) => "sent".to_string(),
            Err(e) => render_error(&e),
        }
    }
}
