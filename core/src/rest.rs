/// REST access to the backend: snapshot, create, edit, delete
use crate::error::{Result, SyncError};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// What the sync engine needs from the backend. `RestClient` is the real one;
/// tests substitute in-memory fakes.
pub trait Backend: Clone + Send + Sync + 'static {
    /// GET a collection or resource
    fn fetch(&self, path: &str) -> impl Future<Output = Result<Value>> + Send;

    /// POST a new resource; returns the created representation
    fn create(&self, path: &str, body: Value) -> impl Future<Output = Result<Value>> + Send;

    /// PATCH an existing resource; returns the updated representation
    fn update(&self, path: &str, body: Value) -> impl Future<Output = Result<Value>> + Send;

    /// DELETE a resource
    fn remove(&self, path: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Bearer-authenticated JSON client
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base: String,
    token: Option<String>,
}

impl RestClient {
    pub fn new(base: &str, token: Option<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base, path)
        } else {
            format!("{}/{}", self.base, path)
        }
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header(ACCEPT, "application/json");
        match &self.token {
            Some(t) => req.header(AUTHORIZATION, format!("Bearer {}", t.trim())),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = self.authorized(req).send().await?;
        decode(resp).await
    }
}

impl Backend for RestClient {
    async fn fetch(&self, path: &str) -> Result<Value> {
        debug!("GET {}", path);
        self.send(self.http.get(self.url(path))).await
    }

    async fn create(&self, path: &str, body: Value) -> Result<Value> {
        debug!("POST {}", path);
        self.send(self.http.post(self.url(path)).json(&body)).await
    }

    async fn update(&self, path: &str, body: Value) -> Result<Value> {
        debug!("PATCH {}", path);
        self.send(self.http.patch(self.url(path)).json(&body)).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        debug!("DELETE {}", path);
        self.send(self.http.delete(self.url(path))).await.map(|_| ())
    }
}

/// Map a response to JSON, or to `SyncError::Server` carrying the body's message.
async fn decode(resp: Response) -> Result<Value> {
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| error_message(&body))
            .unwrap_or_default();
        return Err(SyncError::Server {
            status: status.as_u16(),
            message,
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| SyncError::Protocol(format!("Response is not JSON: {}", e)))
}

/// Structured error text: `message`, `detail` or `error`, or the first
/// field error of a validation body like `{"content": ["may not be blank"]}`.
pub fn error_message(body: &Value) -> Option<String> {
    for key in ["message", "detail", "error"] {
        if let Some(s) = body.get(key).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }
    body.as_object()?.values().find_map(|v| match v {
        Value::Array(list) => list.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_message_shapes() {
        assert_eq!(
            error_message(&json!({"message": "Conversation is closed"})).as_deref(),
            Some("Conversation is closed")
        );
        assert_eq!(
            error_message(&json!({"detail": "Not found."})).as_deref(),
            Some("Not found.")
        );
        assert_eq!(
            error_message(&json!({"content": ["This field may not be blank."]})).as_deref(),
            Some("This field may not be blank.")
        );
        assert_eq!(error_message(&json!({"status": 500})), None);
        assert_eq!(error_message(&json!("oops")), None);
    }

    #[test]
    fn test_url_join() {
        let client = RestClient::new("http://host:8000/", Some("t".into()), None).unwrap();
        assert_eq!(client.url("/api/x/"), "http://host:8000/api/x/");
        assert_eq!(client.url("api/x/"), "http://host:8000/api/x/");
    }
}
