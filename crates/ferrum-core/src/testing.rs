//! In-memory collaborators for tests.
//!
//! [`RecordingExecutor`] stands in for the remote API: it records every
//! operation, answers from canned responses, and echoes message posts back
//! as if the remote had created them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::error::{RequestError, RequestResult};
use crate::executor::{Method, Operation, RequestExecutor};

const MESSAGES_ROUTE: &str = "/channels/{channel_id}/messages";

#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Operation>>,
    responses: Mutex<HashMap<(Method, String), VecDeque<RequestResult<Value>>>>,
    next_message_id: AtomicU64,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicU64::new(9000),
            ..Default::default()
        }
    }

    /// Queues a response for the next call to `method path`.
    pub fn respond(&self, method: Method, path: impl Into<String>, result: RequestResult<Value>) {
        self.responses
            .lock()
            .entry((method, path.into()))
            .or_default()
            .push_back(result);
    }

    /// Every operation executed so far.
    pub fn calls(&self) -> Vec<Operation> {
        self.calls.lock().clone()
    }

    /// Contents of every message posted so far, in order.
    pub fn sent_messages(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|op| op.method == Method::Post && op.route == MESSAGES_ROUTE)
            .filter_map(|op| op.body.as_ref()?.get("content")?.as_str().map(str::to_string))
            .collect()
    }

    fn echo_message(&self, operation: &Operation) -> Value {
        let channel_id = operation
            .params
            .iter()
            .find(|(name, _)| *name == "channel_id")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let content = operation
            .body
            .as_ref()
            .and_then(|b| b.get("content"))
            .cloned()
            .unwrap_or(Value::Null);
        json!({
            "id": self.next_message_id.fetch_add(1, Ordering::Relaxed).to_string(),
            "channel_id": channel_id,
            "author": {"id": "1", "username": "ferrum", "bot": true},
            "content": content,
        })
    }
}

#[async_trait]
impl RequestExecutor for RecordingExecutor {
    async fn execute(&self, operation: Operation) -> RequestResult<Value> {
        self.calls.lock().push(operation.clone());

        let queued = self
            .responses
            .lock()
            .get_mut(&(operation.method, operation.path()))
            .and_then(VecDeque::pop_front);
        if let Some(result) = queued {
            return result;
        }

        if operation.method == Method::Post && operation.route == MESSAGES_ROUTE {
            return Ok(self.echo_message(&operation));
        }
        Err(RequestError::from_status(404, format!("no route for {operation}")))
    }
}
