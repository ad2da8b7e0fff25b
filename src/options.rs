//! Caller-supplied settings: credentials, per-call overrides and transport tuning.

use std::collections::HashMap;
use std::time::Duration;

/// A secret string type for sensitive data like API keys.
/// Prevents accidental logging or display of secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    /// Create a new secret string.
    pub fn new(s: String) -> Self {
        Self(s)
    }

    /// Get the underlying secret value.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    /// True when the secret is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self::new(s.to_string())
    }
}

/// Credentials supplied by the caller for one request. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<SecretString>,
    pub api_secret: Option<SecretString>,
    pub access_code: Option<SecretString>,
}

impl Credentials {
    pub fn with_api_key(api_key: impl Into<SecretString>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    pub fn with_access_code(access_code: impl Into<SecretString>) -> Self {
        Self {
            access_code: Some(access_code.into()),
            ..Self::default()
        }
    }
}

/// Azure deployment addressing. Either field may also come from server config.
#[derive(Debug, Clone, Default)]
pub struct AzureSettings {
    pub deployment: Option<String>,
    pub api_version: Option<String>,
}

/// Everything a caller supplies with a request besides the request body.
///
/// This replaces a process-wide settings store: callers pass it explicitly and
/// cache it however they like.
#[derive(Debug, Clone, Default)]
pub struct AccessSettings {
    pub credentials: Credentials,

    /// Custom base URL for the selected provider.
    pub base_url: Option<String>,

    pub azure: AzureSettings,
}

impl AccessSettings {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ..Self::default()
        }
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Set the Azure deployment name.
    pub fn with_azure_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.azure.deployment = Some(deployment.into());
        self
    }

    /// Set the Azure API version.
    pub fn with_azure_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.azure.api_version = Some(api_version.into());
        self
    }
}

/// HTTP transport tuning shared by every request of a [`crate::Client`].
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Overrides the model-dependent request timeout.
    pub timeout: Option<Duration>,

    /// HTTP proxy URL
    pub proxy: Option<String>,

    /// Additional HTTP headers to include in requests
    pub extra_headers: Option<HashMap<String, String>>,
}

impl TransportOptions {
    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, proxy: String) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Add a single extra header.
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.extra_headers
            .get_or_insert_with(HashMap::new)
            .insert(key, value);
        self
    }
}
