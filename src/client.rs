//! Client facade and error types.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{Datelike, Local, NaiveDate};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog;
use crate::config::{ConfigStore, ServerConfig};
use crate::credentials::{self, AuthPlacement, ResolvedCredential};
use crate::endpoint::{self, EndpointParams, Operation};
use crate::http::{self, PreparedRequest};
use crate::model::{ChatRequest, ModelDescriptor, ModelProviderInfo, SpeechRequest, UsageSummary};
use crate::options::{AccessSettings, TransportOptions};
use crate::payload::{self, PayloadShape};
use crate::providers::{Dialect, ProviderDescriptor, ProviderRegistry};
use crate::stream::{CancelHandle, ChatHandle, ChatReply, ChatStream, StreamError};

/// Coarse classification of a [`ClientError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoCredential,
    IncompleteProviderConfig,
    UnknownProvider,
    Network,
    Timeout,
    Unauthorized,
    QuotaExceeded,
    Malformed,
    Canceled,
    Upstream,
    Unsupported,
    ModelUnavailable,
    Config,
}

/// Errors that can occur during client operations.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("no credential available for provider `{provider}`")]
    NoCredential { provider: String },

    #[error("incomplete configuration for provider `{provider}`: {reason}")]
    IncompleteProviderConfig { provider: String, reason: String },

    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("provider `{provider}` does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("model `{model}` is not available on this server")]
    ModelUnavailable { model: String },

    #[error("HTTP error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("unauthorized: {message}")]
    Unauthorized { status: Option<u16>, message: String },

    #[error("quota exceeded: {message}")]
    QuotaExceeded { message: String },

    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("request canceled")]
    Canceled,

    #[error("configuration error: {0}")]
    Config(String),

    /// Terminal error of a stream that was collected into a response.
    #[error("{}", .0.message)]
    Stream(StreamError),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NoCredential { .. } => ErrorKind::NoCredential,
            ClientError::IncompleteProviderConfig { .. } => ErrorKind::IncompleteProviderConfig,
            ClientError::UnknownProvider(_) => ErrorKind::UnknownProvider,
            ClientError::Unsupported { .. } => ErrorKind::Unsupported,
            ClientError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            ClientError::Network(e) if e.is_timeout() => ErrorKind::Timeout,
            ClientError::Network(_) => ErrorKind::Network,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ClientError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            ClientError::Upstream { .. } => ErrorKind::Upstream,
            ClientError::Malformed(_) | ClientError::Parse(_) => ErrorKind::Malformed,
            ClientError::Canceled => ErrorKind::Canceled,
            ClientError::Config(_) => ErrorKind::Config,
            ClientError::Stream(error) => error.kind,
        }
    }
}

impl From<StreamError> for ClientError {
    fn from(error: StreamError) -> Self {
        match error.kind {
            ErrorKind::Canceled => ClientError::Canceled,
            _ => ClientError::Stream(error),
        }
    }
}

/// Entry point: forwards requests to the registered providers.
///
/// Cheap to clone; clones share the registry, configuration and connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    registry: Arc<ProviderRegistry>,
    config: Arc<ConfigStore>,
    http: reqwest::Client,
    transport: TransportOptions,
}

impl Client {
    pub fn new(
        registry: ProviderRegistry,
        config: ServerConfig,
        transport: TransportOptions,
    ) -> Result<Self, ClientError> {
        let http = http::build_http_client(&transport)?;
        Ok(Self {
            registry: Arc::new(registry),
            config: Arc::new(ConfigStore::new(config)),
            http,
            transport,
        })
    }

    /// Client configured from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ClientError> {
        let config = ServerConfig::load();
        let registry = ProviderRegistry::from_config(&config);
        Self::new(registry, config, TransportOptions::default())
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.snapshot()
    }

    /// Swap the server configuration. Requests already started keep the old one.
    pub fn reload_config(&self, config: ServerConfig) {
        self.config.replace(config);
        info!("server configuration reloaded");
    }

    /// Start a chat request.
    ///
    /// Configuration problems are returned here, before any network I/O.
    /// Everything after that arrives through the returned handle.
    pub fn chat(
        &self,
        provider: &str,
        request: ChatRequest,
        settings: &AccessSettings,
    ) -> Result<ChatHandle, ClientError> {
        let config = self.config.snapshot();
        let descriptor = self.registry.lookup(provider)?;
        if catalog::is_model_unavailable(&config, &request.model, &descriptor.id) {
            return Err(ClientError::ModelUnavailable {
                model: request.model.clone(),
            });
        }

        let traits = catalog::classify(&request.model, &config.vision_models);
        let credential = credentials::resolve(descriptor, &settings.credentials, &config)?;
        let payload = payload::build_payload(descriptor.dialect, &request, &traits)?;
        let streaming = request.stream && payload.shape == PayloadShape::Chat;
        let operation = match payload.shape {
            PayloadShape::Chat => Operation::Chat,
            PayloadShape::Image => Operation::Image,
        };
        let url = self.build_url(descriptor, operation, settings, &config, Some(&request.model), streaming)?;
        let timeout = self.timeout_for(&request.model);
        let prepared = self.prepare(Method::POST, url, descriptor, &credential, Some(payload.body), timeout, streaming)?;

        info!(
            provider = %descriptor.id,
            model = %request.model,
            streaming,
            credential = ?credential.source,
            "dispatching chat request"
        );

        let cancel = CancelHandle::new();
        let dialect = descriptor.dialect;
        let reply = if streaming {
            let raw = http::stream_lines(self.http.clone(), self.transport.clone(), prepared, cancel.token());
            ChatReply::Streaming(ChatStream::new(dialect, raw, cancel.clone(), descriptor.id.clone()))
        } else {
            let http_client = self.http.clone();
            let transport = self.transport.clone();
            let token = cancel.token();
            let provider = descriptor.id.clone();
            let shape = payload.shape;
            ChatReply::Buffered(Box::pin(async move {
                let result = async {
                    let response = http::send(&http_client, &transport, prepared, &token).await?;
                    let body = http::read_body(response, timeout, &token).await?;
                    payload::parse_response(dialect, shape, &body)
                }
                .await;
                match &result {
                    Err(ClientError::Canceled) => debug!(provider = %provider, "request canceled"),
                    Err(e) => warn!(provider = %provider, kind = ?e.kind(), "chat request failed: {}", e),
                    Ok(_) => debug!(provider = %provider, "chat request completed"),
                }
                result
            }))
        };
        Ok(ChatHandle::new(reply, cancel))
    }

    /// Text-to-speech; returns the raw audio bytes.
    pub async fn speech(
        &self,
        provider: &str,
        request: &SpeechRequest,
        settings: &AccessSettings,
    ) -> Result<Bytes, ClientError> {
        let config = self.config.snapshot();
        let descriptor = self.registry.lookup(provider)?;
        let credential = credentials::resolve(descriptor, &settings.credentials, &config)?;
        let url = self.build_url(descriptor, Operation::Speech, settings, &config, Some(&request.model), false)?;
        let timeout = self.transport.timeout.unwrap_or(catalog::REQUEST_TIMEOUT);
        let body = serde_json::to_value(request)?;
        let prepared = self.prepare(Method::POST, url, descriptor, &credential, Some(body), timeout, false)?;

        debug!(provider = %descriptor.id, model = %request.model, "requesting speech");
        let token = CancelHandle::new().token();
        let response = http::send(&self.http, &self.transport, prepared, &token).await?;
        http::read_body(response, timeout, &token).await
    }

    /// Models the provider itself lists.
    pub async fn list_models(
        &self,
        provider: &str,
        settings: &AccessSettings,
    ) -> Result<Vec<ModelDescriptor>, ClientError> {
        let config = self.config.snapshot();
        let descriptor = self.registry.lookup(provider)?;
        let credential = credentials::resolve(descriptor, &settings.credentials, &config)?;
        let url = self.build_url(descriptor, Operation::Models, settings, &config, None, false)?;
        let body = self.get(descriptor, &credential, url).await?;
        let names = payload::parse_model_list(descriptor.dialect, &body)?;

        let provider_info = ModelProviderInfo {
            id: descriptor.id.clone(),
            provider_name: descriptor.display_name.clone(),
            provider_type: descriptor.id.clone(),
            sorted: descriptor.sorted,
        };
        // The OpenAI listing includes embeddings, audio and moderation models.
        let chat_only = descriptor.id == "openai";
        Ok(names
            .into_iter()
            .filter(|name| !chat_only || name.starts_with("gpt-") || name.starts_with("chatgpt-"))
            .enumerate()
            .map(|(position, name)| ModelDescriptor {
                display_name: name.clone(),
                name,
                available: true,
                sorted: 1000 + position as i32,
                provider: provider_info.clone(),
                is_default: false,
            })
            .collect())
    }

    /// Account usage for the current month.
    pub async fn usage(&self, provider: &str, settings: &AccessSettings) -> Result<UsageSummary, ClientError> {
        let config = self.config.snapshot();
        let descriptor = self.registry.lookup(provider)?;
        let credential = credentials::resolve(descriptor, &settings.credentials, &config)?;

        let today = Local::now().date_naive();
        let start_date = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
        let end_date = today.succ_opt().unwrap_or(today);
        let usage_url = self.build_url(
            descriptor,
            Operation::Usage { start_date, end_date },
            settings,
            &config,
            None,
            false,
        )?;
        let subscription_url = self.build_url(descriptor, Operation::Subscription, settings, &config, None, false)?;

        let (usage, subscription) = futures::try_join!(
            self.get(descriptor, &credential, usage_url),
            self.get(descriptor, &credential, subscription_url)
        )?;
        crate::api::openai::parse_usage(&usage, &subscription)
    }

    /// The server model table: built-ins edited by `CUSTOM_MODELS`, default flagged.
    pub fn available_models(&self) -> Vec<ModelDescriptor> {
        catalog::available_models(&self.config.snapshot())
    }

    fn timeout_for(&self, model: &str) -> Duration {
        self.transport
            .timeout
            .unwrap_or_else(|| catalog::request_timeout(model))
    }

    fn build_url(
        &self,
        descriptor: &ProviderDescriptor,
        operation: Operation,
        settings: &AccessSettings,
        config: &ServerConfig,
        model: Option<&str>,
        stream: bool,
    ) -> Result<String, ClientError> {
        let table_deployment = match (descriptor.dialect, model, &settings.azure.deployment) {
            (Dialect::Azure, Some(model), None) => catalog::azure_deployment(&config.custom_models, model),
            _ => None,
        };
        let params = EndpointParams {
            base_url: settings.base_url.as_deref(),
            model,
            stream,
            azure_deployment: settings.azure.deployment.as_deref().or(table_deployment.as_deref()),
            azure_api_version: settings
                .azure
                .api_version
                .as_deref()
                .or(config.azure_api_version.as_deref()),
        };
        endpoint::build_endpoint(descriptor, operation, &params)
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        method: Method,
        url: String,
        descriptor: &ProviderDescriptor,
        credential: &ResolvedCredential,
        body: Option<serde_json::Value>,
        timeout: Duration,
        streaming: bool,
    ) -> Result<PreparedRequest, ClientError> {
        let auth = credential.placement(descriptor.auth_style);
        if let AuthPlacement::Header { name, value } = &auth {
            if !is_valid_header(name, value.expose_secret()) {
                return Err(ClientError::Config("credential is not a valid header value".to_string()));
            }
        }
        for (name, value) in self.transport.extra_headers.iter().flatten() {
            if !is_valid_header(name, value) {
                return Err(ClientError::Config(format!("invalid extra header `{}`", name)));
            }
        }
        Ok(PreparedRequest {
            method,
            url,
            dialect: descriptor.dialect,
            auth,
            body,
            timeout,
            streaming,
        })
    }

    async fn get(
        &self,
        descriptor: &ProviderDescriptor,
        credential: &ResolvedCredential,
        url: String,
    ) -> Result<Bytes, ClientError> {
        let timeout = self.transport.timeout.unwrap_or(catalog::REQUEST_TIMEOUT);
        let prepared = self.prepare(Method::GET, url, descriptor, credential, None, timeout, false)?;
        let token = CancelHandle::new().token();
        let response = http::send(&self.http, &self.transport, prepared, &token).await?;
        http::read_body(response, timeout, &token).await
    }
}

fn is_valid_header(name: &str, value: &str) -> bool {
    HeaderName::from_bytes(name.as_bytes()).is_ok() && HeaderValue::from_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, ResponseContent};
    use crate::options::Credentials;
    use crate::stream::{ChatListener, StreamEvent};
    use futures::StreamExt;
    use nonempty::nonempty;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(payloads: &[serde_json::Value]) -> String {
        let mut body: String = payloads
            .iter()
            .map(|p| format!("data: {}\n\n", p))
            .collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn openai_delta(delta: serde_json::Value) -> serde_json::Value {
        json!({"choices": [{"index": 0, "delta": delta, "finish_reason": null}]})
    }

    fn client_with(config: ServerConfig) -> Client {
        let registry = ProviderRegistry::from_config(&config);
        Client::new(registry, config, TransportOptions::default()).unwrap()
    }

    fn env(pairs: Vec<(&'static str, String)>) -> ServerConfig {
        ServerConfig::from_lookup(move |name| {
            pairs.iter().find(|(key, _)| *key == name).map(|(_, v)| v.clone())
        })
    }

    async fn collect(handle: ChatHandle) -> Vec<StreamEvent> {
        match handle.into_reply() {
            ChatReply::Streaming(stream) => stream.collect().await,
            ChatReply::Buffered(_) => panic!("expected a stream"),
        }
    }

    #[tokio::test]
    async fn test_streaming_with_server_key_and_empty_terminator() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: {}\n\ndata: {{}}\n\n",
            openai_delta(json!({"content": "Hel"})),
            openai_delta(json!({"content": "lo"}))
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-abc"))
            .and(body_partial_json(json!({"model": "gpt-4o", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(env(vec![("OPENAI_API_KEY", "sk-abc".into()), ("BASE_URL", server.uri())]));
        let settings = AccessSettings::new(Credentials::with_api_key(""));
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]).with_stream(true);

        let handle = client.chat("openai", request, &settings).unwrap();
        assert!(handle.is_streaming());
        assert_eq!(
            collect(handle).await,
            vec![
                StreamEvent::Text("Hel".into()),
                StreamEvent::Text("lo".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_caller_key_wins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-caller"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(env(vec![("OPENAI_API_KEY", "sk-server".into())]));
        let settings = AccessSettings::new(Credentials::with_api_key("sk-caller")).with_base_url(server.uri());
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]);
        let response = client.chat("openai", request, &settings).unwrap().response().await.unwrap();
        assert_eq!(response.text(), Some("ok"));
    }

    #[tokio::test]
    async fn test_azure_missing_deployment_fails_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("az-key"))
            .with_base_url(server.uri())
            .with_azure_api_version("2024-02-01");
        let request = || ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]);

        let err = client.chat("azure", request(), &settings).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IncompleteProviderConfig);

        let settings = AccessSettings::new(Credentials::with_api_key("az-key"))
            .with_base_url(server.uri())
            .with_azure_deployment("prod");
        let err = client.chat("azure", request(), &settings).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IncompleteProviderConfig);
    }

    #[tokio::test]
    async fn test_azure_deployment_from_custom_models() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/deployments/prod-4o/chat/completions"))
            .and(query_param("api-version", "2024-02-01"))
            .and(header("api-key", "az-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "from azure"}, "finish_reason": "stop"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(env(vec![
            ("AZURE_API_KEY", "az-server".into()),
            ("AZURE_URL", server.uri()),
            ("AZURE_API_VERSION", "2024-02-01".into()),
            ("CUSTOM_MODELS", "gpt-4o@azure=prod-4o".into()),
        ]));
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]);
        let response = client
            .chat("azure", request, &AccessSettings::default())
            .unwrap()
            .response()
            .await
            .unwrap();
        assert_eq!(response.text(), Some("from azure"));
    }

    #[tokio::test]
    async fn test_gemini_server_key_in_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-pro:generateContent"))
            .and(query_param("key", "g-server"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "Bonjour"}]}, "finishReason": "STOP"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(env(vec![
            ("GOOGLE_API_KEY", "g-server".into()),
            ("GOOGLE_URL", server.uri()),
        ]));
        let request = ChatRequest::new("gemini-1.5-pro", nonempty![ChatMessage::user("hello")]);
        let handle = client.chat("google", request, &AccessSettings::default()).unwrap();
        assert!(!handle.is_streaming());
        let response = handle.response().await.unwrap();
        assert_eq!(response.text(), Some("Bonjour"));
    }

    #[tokio::test]
    async fn test_reasoning_then_text() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            openai_delta(json!({"reasoning_content": "let me think"})),
            openai_delta(json!({"content": "42"})),
        ]);
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let request = ChatRequest::new("deepseek-reasoner", nonempty![ChatMessage::user("?")]).with_stream(true);
        assert_eq!(
            collect(client.chat("openai", request, &settings).unwrap()).await,
            vec![
                StreamEvent::Reasoning("let me think".into()),
                StreamEvent::Text("42".into()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_upstream_rejection_is_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "ak"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "type": "error",
                "error": {"type": "invalid_request_error", "message": "image exceeds 5 MB maximum"}
            })))
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("ak")).with_base_url(server.uri());
        let request = ChatRequest::new("claude-3-5-sonnet-20241022", nonempty![ChatMessage::user("hi")]);
        let err = client.chat("anthropic", request, &settings).unwrap().response().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().contains("image exceeds 5 MB maximum"));
    }

    #[tokio::test]
    async fn test_quota_error_arrives_as_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({"error": {"message": "billing hard limit"}})))
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]).with_stream(true);
        let events = collect(client.chat("openai", request, &settings).unwrap()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(e) if e.kind == ErrorKind::QuotaExceeded));
    }

    #[tokio::test]
    async fn test_cancel_before_any_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse_body(&[openai_delta(json!({"content": "late"}))]), "text/event-stream")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]).with_stream(true);
        let handle = client.chat("openai", request, &settings).unwrap();
        let cancel = handle.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
            cancel.cancel();
        });

        let events = collect(handle).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(e) if e.kind == ErrorKind::Canceled));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let transport = TransportOptions::default().with_timeout(Duration::from_millis(100));
        let client = Client::new(ProviderRegistry::builtin(), ServerConfig::default(), transport).unwrap();
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]);
        let err = client.chat("openai", request, &settings).unwrap().response().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_configuration_errors_are_synchronous() {
        let client = client_with(ServerConfig::default());
        let request = || ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]);

        let err = client.chat("nope", request(), &AccessSettings::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);

        let err = client.chat("anthropic", request(), &AccessSettings::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoCredential);

        client.reload_config(ServerConfig {
            disable_gpt4: true,
            ..ServerConfig::default()
        });
        let settings = AccessSettings::new(Credentials::with_api_key("sk"));
        let err = client.chat("openai", request(), &settings).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }

    #[tokio::test]
    async fn test_image_generation_is_buffered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(body_partial_json(json!({"prompt": "a fox", "response_format": "b64_json"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{"b64_json": "aGk="}]})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let request = ChatRequest::new("dall-e-3", nonempty![ChatMessage::user("a fox")]).with_stream(true);
        let handle = client.chat("openai", request, &settings).unwrap();
        assert!(!handle.is_streaming());
        let response = handle.response().await.unwrap();
        assert!(matches!(response.content, ResponseContent::Images(ref images) if images.len() == 1));
    }

    struct Transcript {
        text: String,
        finished: bool,
    }

    impl ChatListener for Transcript {
        fn on_update(&mut self, message: &str, _delta: &str) {
            self.text = message.to_string();
        }

        fn on_finish(&mut self, _response: crate::model::ChatResponse) {
            self.finished = true;
        }
    }

    #[tokio::test]
    async fn test_anthropic_stream_through_listener() {
        let server = MockServer::start().await;
        let body = [
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":1,\"output_tokens\":1}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi \"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"there\"}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        ]
        .concat();
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("ak")).with_base_url(server.uri());
        let request = ChatRequest::new("claude-3-5-sonnet-20241022", nonempty![ChatMessage::user("hi")]).with_stream(true);
        let mut transcript = Transcript {
            text: String::new(),
            finished: false,
        };
        client.chat("anthropic", request, &settings).unwrap().drive(&mut transcript).await;
        assert_eq!(transcript.text, "Hi there");
        assert!(transcript.finished);
    }

    #[tokio::test]
    async fn test_list_models_filters_openai() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "gpt-4o"}, {"id": "whisper-1"}, {"id": "chatgpt-4o-latest"}]
            })))
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let models = client.list_models("openai", &settings).await.unwrap();
        let names: Vec<_> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["gpt-4o", "chatgpt-4o-latest"]);
        assert_eq!(models[0].provider.provider_name, "OpenAI");
    }

    #[tokio::test]
    async fn test_usage() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dashboard/billing/usage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"total_usage": 1999.0})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dashboard/billing/subscription"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hard_limit_usd": 120.0})))
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let summary = client.usage("openai", &settings).await.unwrap();
        assert_eq!(summary, UsageSummary { used: 19.99, total: 120.0 });

        let err = client.usage("anthropic", &settings).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_speech_returns_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(json!({"model": "tts-1", "voice": "alloy"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(server.uri());
        let request = SpeechRequest {
            model: "tts-1".into(),
            input: "hello".into(),
            voice: "alloy".into(),
            response_format: None,
            speed: None,
        };
        let audio = client.speech("openai", &request, &settings).await.unwrap();
        assert_eq!(audio.as_ref(), &[1, 2, 3]);
    }

    /// Serves one connection with `response` verbatim, then either holds the
    /// socket open or closes it.
    async fn raw_server(response: String, hold_open: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 8192];
            while let Ok(Ok(read)) = tokio::time::timeout(Duration::from_millis(50), socket.read(&mut request)).await {
                if read == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            if hold_open {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
        format!("http://{}", addr)
    }

    fn sse_chunk(payload: &serde_json::Value) -> String {
        let data = format!("data: {}\n\n", payload);
        format!("{:x}\r\n{}\r\n", data.len(), data)
    }

    const CHUNKED_SSE_HEAD: &str =
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n";

    const STALLED_ERROR: &str =
        "HTTP/1.1 500 Internal Server Error\r\nContent-Type: text/plain\r\nContent-Length: 100\r\n\r\nerror";

    fn short_timeout_client() -> Client {
        let transport = TransportOptions::default().with_timeout(Duration::from_millis(200));
        Client::new(ProviderRegistry::builtin(), ServerConfig::default(), transport).unwrap()
    }

    #[tokio::test]
    async fn test_stalled_error_body_times_out() {
        let base_url = raw_server(STALLED_ERROR.to_string(), true).await;
        let client = short_timeout_client();
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(base_url);
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]);

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            client.chat("openai", request, &settings).unwrap().response(),
        )
        .await
        .expect("request outlived its timeout");
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_stalled_error_body_times_out_when_streaming() {
        let base_url = raw_server(STALLED_ERROR.to_string(), true).await;
        let client = short_timeout_client();
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(base_url);
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]).with_stream(true);

        let events = tokio::time::timeout(
            Duration::from_secs(3),
            collect(client.chat("openai", request, &settings).unwrap()),
        )
        .await
        .expect("stream outlived its timeout");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(e) if e.kind == ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_idle_stream_times_out_after_first_chunk() {
        let response = format!("{}{}", CHUNKED_SSE_HEAD, sse_chunk(&openai_delta(json!({"content": "Hi"}))));
        let base_url = raw_server(response, true).await;
        let client = short_timeout_client();
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(base_url);
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]).with_stream(true);

        let events = tokio::time::timeout(
            Duration::from_secs(3),
            collect(client.chat("openai", request, &settings).unwrap()),
        )
        .await
        .expect("stream outlived its timeout");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Text("Hi".into()));
        assert!(matches!(&events[1], StreamEvent::Error(e) if e.kind == ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_connection_dropped_mid_stream() {
        let response = format!("{}{}", CHUNKED_SSE_HEAD, sse_chunk(&openai_delta(json!({"content": "Hi"}))));
        let base_url = raw_server(response, false).await;
        let client = client_with(ServerConfig::default());
        let settings = AccessSettings::new(Credentials::with_api_key("sk")).with_base_url(base_url);
        let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("hi")]).with_stream(true);

        let events = tokio::time::timeout(
            Duration::from_secs(3),
            collect(client.chat("openai", request, &settings).unwrap()),
        )
        .await
        .expect("stream did not end after the connection closed");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Text("Hi".into()));
        assert!(matches!(&events[1], StreamEvent::Error(e) if e.kind == ErrorKind::Network));
    }
}
