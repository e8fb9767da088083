//! HTTP request executor over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use ferrum_core::{Method, Operation, RequestError, RequestExecutor, RequestResult};

use crate::manager::Credentials;

/// Default API base.
pub const DEFAULT_API_BASE: &str = "https://api.fluxer.app";

/// Default API version segment.
pub const DEFAULT_API_VERSION: &str = "1";

/// Settings for [`HttpExecutor`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub api_version: String,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Executes [`Operation`]s against the REST API with bot authorization.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
    base: Url,
    authorization: String,
}

impl HttpExecutor {
    pub fn new(config: &HttpConfig, credentials: &Credentials) -> RequestResult<Self> {
        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .user_agent(concat!("ferrum/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RequestError::transport(e.to_string()))?;
        let base = format!(
            "{}/v{}",
            config.base_url.trim_end_matches('/'),
            config.api_version.trim_start_matches('v')
        );
        let base = Url::parse(&base)
            .map_err(|e| RequestError::transport(format!("invalid API base {base}: {e}")))?;

        Ok(Self {
            client,
            base,
            authorization: format!("Bot {}", credentials.token()),
        })
    }

    /// Full URL for an operation, query string included.
    pub fn endpoint(&self, operation: &Operation) -> RequestResult<Url> {
        let raw = format!("{}{}", self.base.as_str().trim_end_matches('/'), operation.path());
        let mut url =
            Url::parse(&raw).map_err(|e| RequestError::transport(format!("invalid URL {raw}: {e}")))?;
        if !operation.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &operation.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }
}

fn method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// Pulls a human readable message out of an error body.
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            if body.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("unknown error")
                    .to_string()
            } else {
                body.to_string()
            }
        })
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, operation: Operation) -> RequestResult<Value> {
        let url = self.endpoint(&operation)?;
        debug!(operation = %operation, "Executing request");

        let mut request = self
            .client
            .request(method(operation.method), url)
            .header(reqwest::header::AUTHORIZATION, &self.authorization);
        if let Some(body) = &operation.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RequestError::transport(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = error_message(status, &body);
            warn!(operation = %operation, status = status.as_u16(), message = %message, "Request failed");
            return Err(RequestError::from_status(status.as_u16(), message));
        }

        response
            .json()
            .await
            .map_err(|e| RequestError::decode(e.to_string()))
    }
}

impl std::fmt::Debug for HttpExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExecutor")
            .field("base", &self.base.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> HttpExecutor {
        HttpExecutor::new(&HttpConfig::default(), &Credentials::new("Bot secret")).unwrap()
    }

    #[test]
    fn test_endpoint_includes_version_and_query() {
        let op = Operation::get("/channels/{channel_id}/messages")
            .param("channel_id", 42)
            .query("limit", 10);
        let url = executor().endpoint(&op).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.fluxer.app/v1/channels/42/messages?limit=10"
        );
    }

    #[test]
    fn test_authorization_uses_bot_scheme() {
        assert_eq!(executor().authorization, "Bot secret");
    }

    #[test]
    fn test_error_message_prefers_json_message() {
        assert_eq!(
            error_message(StatusCode::FORBIDDEN, r#"{"message":"Missing Access"}"#),
            "Missing Access"
        );
        assert_eq!(error_message(StatusCode::NOT_FOUND, ""), "Not Found");
        assert_eq!(error_message(StatusCode::BAD_REQUEST, "oops"), "oops");
    }
}
