//! URL construction per provider dialect.

use chrono::NaiveDate;

use crate::client::ClientError;
use crate::providers::{Dialect, ProviderDescriptor};

/// Upstream operation a URL is built for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Chat,
    Image,
    Speech,
    Models,
    Usage { start_date: NaiveDate, end_date: NaiveDate },
    Subscription,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Chat => "chat",
            Operation::Image => "image generation",
            Operation::Speech => "speech",
            Operation::Models => "model listing",
            Operation::Usage { .. } => "usage",
            Operation::Subscription => "subscription",
        }
    }
}

/// Per-request inputs to [`build_endpoint`].
#[derive(Debug, Clone, Default)]
pub struct EndpointParams<'a> {
    /// Caller's base URL, wins over everything else.
    pub base_url: Option<&'a str>,
    pub model: Option<&'a str>,
    pub stream: bool,
    pub azure_deployment: Option<&'a str>,
    pub azure_api_version: Option<&'a str>,
}

/// Full URL for `operation` on `descriptor`.
///
/// The result never contains credentials; query-parameter auth is added when
/// the request is sent.
pub fn build_endpoint(
    descriptor: &ProviderDescriptor,
    operation: Operation,
    params: &EndpointParams<'_>,
) -> Result<String, ClientError> {
    let incomplete = |reason: &str| ClientError::IncompleteProviderConfig {
        provider: descriptor.id.clone(),
        reason: reason.to_string(),
    };
    let unsupported = || ClientError::Unsupported {
        provider: descriptor.id.clone(),
        operation: operation.name(),
    };

    let base = resolve_base_url(descriptor, params.base_url).ok_or_else(|| incomplete("no base URL configured"))?;

    let path_model = match operation {
        Operation::Chat if descriptor.requires_model_in_path => {
            Some(non_empty(params.model).ok_or_else(|| incomplete("model is required in the path"))?)
        }
        _ => None,
    };

    let path = match descriptor.dialect {
        Dialect::OpenAi => match operation {
            Operation::Chat => "v1/chat/completions".to_string(),
            Operation::Image => "v1/images/generations".to_string(),
            Operation::Speech => "v1/audio/speech".to_string(),
            Operation::Models => "v1/models".to_string(),
            Operation::Usage { start_date, end_date } => format!(
                "dashboard/billing/usage?start_date={}&end_date={}",
                start_date.format("%Y-%m-%d"),
                end_date.format("%Y-%m-%d")
            ),
            Operation::Subscription => "dashboard/billing/subscription".to_string(),
        },
        Dialect::Azure => {
            let action = match operation {
                Operation::Chat => "chat/completions",
                Operation::Image => "images/generations",
                Operation::Speech => "audio/speech",
                _ => return Err(unsupported()),
            };
            let deployment = non_empty(params.azure_deployment).ok_or_else(|| incomplete("no deployment configured"))?;
            let version = non_empty(params.azure_api_version).ok_or_else(|| incomplete("no API version configured"))?;
            format!("deployments/{}/{}?api-version={}", deployment, action, version)
        }
        Dialect::Anthropic => match operation {
            Operation::Chat => "v1/messages".to_string(),
            Operation::Models => "v1/models".to_string(),
            _ => return Err(unsupported()),
        },
        Dialect::Gemini => match operation {
            Operation::Chat => {
                let model = path_model.ok_or_else(|| incomplete("provider does not place the model in the path"))?;
                if params.stream {
                    format!("v1beta/models/{}:streamGenerateContent?alt=sse", model)
                } else {
                    format!("v1beta/models/{}:generateContent", model)
                }
            }
            Operation::Models => "v1beta/models".to_string(),
            _ => return Err(unsupported()),
        },
    };

    Ok(format!("{}/{}", base, path))
}

/// Caller override, else operator override, else the built-in default;
/// trailing slashes removed.
pub fn resolve_base_url(descriptor: &ProviderDescriptor, caller: Option<&str>) -> Option<String> {
    if let Some(url) = non_empty(caller) {
        let url = url.trim_end_matches('/');
        if url.starts_with("http") || descriptor.dialect == Dialect::Azure {
            return Some(url.to_string());
        }
        return Some(format!("https://{}", url));
    }
    non_empty(descriptor.base_url_override.as_deref())
        .or_else(|| non_empty(descriptor.base_url_default.as_deref()))
        .map(|url| url.trim_end_matches('/').to_string())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
