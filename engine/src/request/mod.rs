//! Request Executor
//!
//! Performs the outbound HTTP call of a request step. Method, URL, query,
//! headers, body and attachments are templated from the transition
//! context; a credential reference is resolved through the vault and its
//! material merged in just before dispatch.
//!
//! # Transport isolation
//!
//! Calls without a proxy share one pooled [`reqwest::Client`]. A call with a
//! proxy override gets its own client with pooling disabled, built and
//! dropped with the call, so proxy settings never reach concurrent calls.
//!
//! # Timeouts
//!
//! The whole call (credential resolution, connect, upload and body read) runs
//! under one `tokio::time::timeout`. When it elapses the future is dropped,
//! which cancels the call and releases everything it held.

use crate::config::HttpConfig;
use crate::secrets::scrub;
use crate::template::{render_text, render_value};
use crate::vault::{auth, CredentialRef, CredentialVault};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Proxy, RequestBuilder};
use sdk::errors::EngineError;
use sdk::types::BotId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn default_method() -> String {
    "GET".to_string()
}

/// How a request body is encoded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    #[default]
    Json,
    Form,
    Text,
}

/// A file part of a multipart request; `content` is templated text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub field: String,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub content: String,
}

/// Configuration of a request step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub query: BTreeMap<String, Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub body_format: BodyFormat,
    /// Non-empty attachments switch the body to `multipart/form-data`
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    /// Proxy URL for this call only (templated)
    #[serde(default)]
    pub proxy: Option<String>,
    /// Session variable receiving the response, `response` when unset
    #[serde(default)]
    pub result_variable: Option<String>,
    /// Treat non-2xx statuses as request failures
    #[serde(default)]
    pub error_on_status: bool,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            body_format: BodyFormat::default(),
            attachments: Vec::new(),
            credential: None,
            proxy: None,
            result_variable: None,
            error_on_status: false,
        }
    }

    pub fn result_variable(&self) -> &str {
        self.result_variable.as_deref().unwrap_or("response")
    }
}

/// Structured result of an outbound call
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, the raw text otherwise
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Shape stored into session variables
    pub fn to_json(&self) -> Value {
        json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

fn failed(message: impl Into<String>) -> EngineError {
    EngineError::RequestExecutionFailed(scrub(&message.into()))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn form_pairs(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), as_text(v))).collect(),
        _ => Vec::new(),
    }
}

/// Executes request steps
pub struct RequestExecutor {
    vault: Arc<CredentialVault>,
    client: Client,
    http: HttpConfig,
    default_timeout: Duration,
}

impl RequestExecutor {
    pub fn new(
        vault: Arc<CredentialVault>,
        http: &HttpConfig,
        default_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let client = Self::build_client(http, None)?;
        Ok(Self {
            vault,
            client,
            http: http.clone(),
            default_timeout,
        })
    }

    fn build_client(http: &HttpConfig, proxy: Option<&str>) -> Result<Client, EngineError> {
        let mut builder = Client::builder()
            .connect_timeout(http.connect_timeout())
            .user_agent(http.user_agent.clone());

        builder = match proxy {
            Some(url) => {
                let proxy = Proxy::all(url).map_err(|e| failed(format!("invalid proxy: {}", e)))?;
                builder.proxy(proxy).pool_max_idle_per_host(0)
            }
            None => builder.pool_max_idle_per_host(http.pool_max_idle_per_host),
        };

        builder
            .build()
            .map_err(|e| failed(format!("failed to build HTTP client: {}", e)))
    }

    /// Run a request step.
    ///
    /// `timeout` overrides the default per-call timeout.
    ///
    /// # Errors
    ///
    /// - `RequestTimeout` when the call exceeds its timeout
    /// - `RequestExecutionFailed` on transport failure, invalid method/URL,
    ///   or a non-2xx status when `error_on_status` is set
    /// - credential resolution and decryption errors from the vault
    pub async fn execute(
        &self,
        bot: BotId,
        spec: &RequestSpec,
        context: &Value,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, EngineError> {
        let timeout = timeout.unwrap_or(self.default_timeout);

        match tokio::time::timeout(timeout, self.dispatch(bot, spec, context)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    bot = %bot,
                    method = %spec.method,
                    timeout_secs = timeout.as_secs(),
                    "Request timed out"
                );
                Err(EngineError::RequestTimeout(timeout.as_secs()))
            }
        }
    }

    async fn dispatch(
        &self,
        bot: BotId,
        spec: &RequestSpec,
        context: &Value,
    ) -> Result<HttpResponse, EngineError> {
        let method = Method::from_bytes(spec.method.trim().to_uppercase().as_bytes())
            .map_err(|_| failed(format!("invalid method '{}'", spec.method)))?;
        let url = render_text(&spec.url, context);
        let parsed = reqwest::Url::parse(&url).map_err(|e| failed(format!("invalid url: {}", e)))?;

        let material = match &spec.credential {
            Some(reference) => {
                let resolved = self.vault.resolve(bot, reference).await?;
                Some(auth::material_for(&resolved)?)
            }
            None => None,
        };

        let client = match spec.proxy.as_deref() {
            Some(proxy) => {
                let proxy = render_text(proxy, context);
                tracing::debug!(proxy = %scrub(&proxy), "Using isolated proxy client");
                Self::build_client(&self.http, Some(&proxy))?
            }
            None => self.client.clone(),
        };

        let mut builder = client.request(method.clone(), parsed);

        let mut query: Vec<(String, String)> = spec
            .query
            .iter()
            .map(|(k, v)| (render_text(k, context), as_text(&render_value(v, context))))
            .collect();
        if let Some(material) = &material {
            query.extend(material.query.iter().cloned());
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }

        for (name, value) in &spec.headers {
            builder = builder.header(name.as_str(), render_text(value, context));
        }
        if let Some(material) = &material {
            for (name, value) in &material.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some((username, password)) = &material.basic {
                builder = builder.basic_auth(username, password.as_ref());
            }
        }

        builder = self.attach_body(builder, spec, context)?;

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                failed(format!("connection failed: {}", e))
            } else {
                failed(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| failed(format!("failed to read response body: {}", e)))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        tracing::debug!(
            bot = %bot,
            method = %method,
            url = %scrub(&url),
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );

        if spec.error_on_status && !status.is_success() {
            return Err(failed(format!("upstream returned {}", status)));
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }

    fn attach_body(
        &self,
        builder: RequestBuilder,
        spec: &RequestSpec,
        context: &Value,
    ) -> Result<RequestBuilder, EngineError> {
        let rendered = spec.body.as_ref().map(|b| render_value(b, context));

        if !spec.attachments.is_empty() {
            let mut form = Form::new();
            if let Some(body) = &rendered {
                for (name, value) in form_pairs(body) {
                    form = form.text(name, value);
                }
            }
            for attachment in &spec.attachments {
                let mut part = Part::text(render_text(&attachment.content, context))
                    .file_name(render_text(&attachment.filename, context));
                if let Some(content_type) = &attachment.content_type {
                    part = part
                        .mime_str(content_type)
                        .map_err(|e| failed(format!("invalid content type: {}", e)))?;
                }
                form = form.part(attachment.field.clone(), part);
            }
            return Ok(builder.multipart(form));
        }

        Ok(match (rendered, spec.body_format) {
            (None, _) => builder,
            (Some(body), BodyFormat::Json) => builder.json(&body),
            (Some(body), BodyFormat::Form) => builder.form(&form_pairs(&body)),
            (Some(body), BodyFormat::Text) => builder.body(as_text(&body)),
        })
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
