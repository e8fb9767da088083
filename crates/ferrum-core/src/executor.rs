//! Outbound request contract.
//!
//! The runtime never speaks the remote's wire format directly. Every outbound
//! call is described as an [`Operation`] and handed to a [`RequestExecutor`];
//! the HTTP implementation lives in `ferrum-gateway`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RequestResult;

/// HTTP-like verb of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical outbound operation.
///
/// `route` is a template such as `/channels/{channel_id}/messages`; the
/// placeholders are filled from `params` by [`Operation::path`].
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub method: Method,
    pub route: &'static str,
    pub params: Vec<(&'static str, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Operation {
    pub fn new(method: Method, route: &'static str) -> Self {
        Self {
            method,
            route,
            params: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(route: &'static str) -> Self {
        Self::new(Method::Get, route)
    }

    pub fn post(route: &'static str) -> Self {
        Self::new(Method::Post, route)
    }

    pub fn patch(route: &'static str) -> Self {
        Self::new(Method::Patch, route)
    }

    pub fn delete(route: &'static str) -> Self {
        Self::new(Method::Delete, route)
    }

    /// Binds a route placeholder.
    pub fn param(mut self, name: &'static str, value: impl ToString) -> Self {
        self.params.push((name, value.to_string()));
        self
    }

    /// Appends a query string pair.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Sets the JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Returns the route with every bound placeholder substituted.
    pub fn path(&self) -> String {
        let mut path = self.route.to_string();
        for (name, value) in &self.params {
            path = path.replace(&format!("{{{name}}}"), value);
        }
        path
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path())
    }
}

/// Turns operations into remote calls.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Executes one operation and returns the decoded response body.
    ///
    /// Responses without a body decode to `Value::Null`.
    async fn execute(&self, operation: Operation) -> RequestResult<Value>;
}

/// Shared request executor.
pub type BoxedExecutor = Arc<dyn RequestExecutor>;
