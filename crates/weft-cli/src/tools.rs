//! Built-in tools available to workflows run from the command line.
//!
//! - `echo` returns its resolved parameters unchanged.
//! - `http` performs a request with `reqwest` and returns status, headers,
//!   and body (parsed as JSON when possible).

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use weft_core::catalog::{ToolCatalog, ToolError, ToolResponse};

const ECHO: &str = "echo";
const HTTP: &str = "http";

pub struct CliToolCatalog {
    http_client: reqwest::Client,
}

impl CliToolCatalog {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("weft/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http_client })
    }

    pub fn tool_names() -> &'static [&'static str] {
        &[ECHO, HTTP]
    }

    async fn http(&self, params: &Map<String, Value>) -> Result<ToolResponse, ToolError> {
        let request = HttpParams::from_params(params)?;

        let mut builder = self.http_client.request(request.method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        match &request.body {
            Some(Value::String(text)) => builder = builder.body(text.clone()),
            Some(body) => builder = builder.json(body),
            None => {}
        }

        let response = builder.send().await.map_err(|e| {
            ToolError::Invocation(format!("HTTP request to '{}' failed: {e}", request.url))
        })?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("<binary>").to_string()))
            .collect();
        let text = response.text().await.map_err(|e| {
            ToolError::Invocation(format!("failed to read HTTP response body: {e}"))
        })?;

        tracing::info!(
            url = request.url.as_str(),
            status = status.as_u16(),
            body_len = text.len(),
            "HTTP tool completed"
        );

        if !status.is_success() {
            return Ok(ToolResponse::failed(format!(
                "HTTP {} from '{}'",
                status.as_u16(),
                request.url
            )));
        }

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(ToolResponse::ok(json!({
            "status": status.as_u16(),
            "headers": headers,
            "body": body,
        })))
    }
}

impl ToolCatalog for CliToolCatalog {
    fn contains(&self, tool_id: &str) -> bool {
        Self::tool_names().iter().any(|name| *name == tool_id)
    }

    async fn invoke(
        &self,
        tool_id: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolResponse, ToolError> {
        match tool_id {
            ECHO => Ok(ToolResponse::ok(Value::Object(params.clone()))),
            HTTP => self.http(params).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

/// Parameters of the `http` tool.
#[derive(Debug, PartialEq)]
struct HttpParams {
    method: reqwest::Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Value>,
}

impl HttpParams {
    fn from_params(params: &Map<String, Value>) -> Result<Self, ToolError> {
        let invalid = |message: String| ToolError::InvalidParams {
            tool: HTTP.to_string(),
            message,
        };

        let url = params
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("'url' must be a string".to_string()))?
            .to_string();

        let method = match params.get("method") {
            None | Some(Value::Null) => reqwest::Method::GET,
            Some(Value::String(m)) => m
                .to_uppercase()
                .parse()
                .map_err(|_| invalid(format!("invalid HTTP method: {m}")))?,
            Some(other) => return Err(invalid(format!("'method' must be a string, got {other}"))),
        };

        let headers = match params.get("headers") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect(),
            Some(other) => return Err(invalid(format!("'headers' must be an object, got {other}"))),
        };

        let body = params.get("body").filter(|b| !b.is_null()).cloned();

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }
}
