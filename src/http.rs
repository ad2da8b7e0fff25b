//! HTTP transport: client construction, auth placement, cancellation and
//! status classification.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ClientError;
use crate::credentials::AuthPlacement;
use crate::options::TransportOptions;
use crate::payload;
use crate::providers::Dialect;
use crate::sse::SSEResponseExt;
use crate::stream::{RawItem, RawStream};

/// Build a configured HTTP client from transport options.
///
/// Timeouts are applied per request, not here, since they depend on the model.
pub fn build_http_client(transport_options: &TransportOptions) -> Result<Client, ClientError> {
    let mut builder = Client::builder();

    if let Some(proxy_url) = &transport_options.proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| ClientError::Config(format!("invalid proxy URL: {}", e)))?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// Add extra headers to a request if specified in transport options.
pub fn add_extra_headers(
    mut request: RequestBuilder,
    extra_headers: &Option<HashMap<String, String>>,
) -> RequestBuilder {
    if let Some(headers) = extra_headers {
        for (key, value) in headers {
            request = request.header(key, value);
        }
    }
    request
}

/// Attach the resolved credential.
pub fn apply_auth(request: RequestBuilder, auth: &AuthPlacement) -> RequestBuilder {
    match auth {
        AuthPlacement::Header { name, value } => request.header(name.as_str(), value.expose_secret()),
        AuthPlacement::Query { name, value } => {
            request.query(&[(name.as_str(), value.expose_secret())])
        }
    }
}

/// Everything needed to send one upstream request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    /// Never contains credentials; safe to log.
    pub url: String,
    pub dialect: Dialect,
    pub auth: AuthPlacement,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub streaming: bool,
}

impl PreparedRequest {
    fn into_builder(self, client: &Client, transport: &TransportOptions) -> RequestBuilder {
        let mut request = client.request(self.method, &self.url);
        for (name, value) in self.dialect.static_headers() {
            request = request.header(*name, *value);
        }
        if self.streaming {
            request = request.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        request = add_extra_headers(request, &transport.extra_headers);
        request = apply_auth(request, &self.auth);
        match self.body {
            Some(body) => request.json(&body),
            None => request,
        }
    }
}

/// Send and wait for the response head, bounded by the request timeout and
/// the cancel token. Non-success statuses become errors.
pub async fn send(
    client: &Client,
    transport: &TransportOptions,
    request: PreparedRequest,
    cancel: &CancellationToken,
) -> Result<Response, ClientError> {
    let timeout = request.timeout;
    let dialect = request.dialect;
    debug!(method = %request.method, url = %request.url, streaming = request.streaming, "sending upstream request");
    let builder = request.into_builder(client, transport);

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ClientError::Canceled),
        result = tokio::time::timeout(timeout, builder.send()) => match result {
            Err(_) => return Err(ClientError::Timeout(timeout)),
            Ok(result) => result?,
        },
    };
    check_status(response, dialect, timeout, cancel).await
}

/// Read the whole body, with the same timeout and cancellation rules.
pub async fn read_body(
    response: Response,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Bytes, ClientError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ClientError::Canceled),
        result = tokio::time::timeout(timeout, response.bytes()) => match result {
            Err(_) => Err(ClientError::Timeout(timeout)),
            Ok(result) => Ok(result?),
        },
    }
}

/// The error body is read under the same timeout and cancel token as the
/// handshake. A body that fails to arrive for other reasons is treated as empty.
async fn check_status(
    response: Response,
    dialect: Dialect,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = match read_body(response, timeout, cancel).await {
        Ok(body) => body,
        Err(e @ (ClientError::Timeout(_) | ClientError::Canceled)) => return Err(e),
        Err(_) => Bytes::new(),
    };
    Err(classify_status(status, dialect, &String::from_utf8_lossy(&body)))
}

/// Map a non-success status to an error. The provider's message is kept
/// verbatim; nothing is fabricated in its place.
pub fn classify_status(status: StatusCode, dialect: Dialect, body: &str) -> ClientError {
    let message = payload::error_message(dialect, body).unwrap_or_else(|| body.trim().to_string());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Unauthorized {
            status: Some(status.as_u16()),
            message,
        },
        StatusCode::PAYMENT_REQUIRED => ClientError::QuotaExceeded { message },
        StatusCode::TOO_MANY_REQUESTS if body.contains("insufficient_quota") => {
            ClientError::QuotaExceeded { message }
        }
        _ => ClientError::Upstream {
            status: Some(status.as_u16()),
            message,
        },
    }
}

/// Open a streamed request and yield its data lines. Each chunk waits at most
/// `request.timeout`; cancellation drops the response.
pub(crate) fn stream_lines(
    client: Client,
    transport: TransportOptions,
    request: PreparedRequest,
    cancel: CancellationToken,
) -> RawStream {
    let idle = request.timeout;
    Box::pin(async_stream::stream! {
        let response = match send(&client, &transport, request, &cancel).await {
            Ok(response) => response,
            Err(e) => {
                yield RawItem::Failed(e);
                return;
            }
        };
        let mut lines = Box::pin(response.sse());
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ClientError::Canceled),
                next = tokio::time::timeout(idle, lines.next()) => next.map_err(|_| ClientError::Timeout(idle)),
            };
            match next {
                Ok(Some(Ok(data))) => yield RawItem::Data(data),
                Ok(Some(Err(e))) | Err(e) => {
                    yield RawItem::Failed(e);
                    return;
                }
                Ok(None) => return,
            }
        }
    })
}
