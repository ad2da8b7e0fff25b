//! Server-side configuration: fallback keys, base URL overrides, access codes
//! and model table customization.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::options::SecretString;
use crate::providers::PROVIDERS;

/// Operator configuration, read once from the environment.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Fallback API key per provider id.
    pub api_keys: HashMap<String, SecretString>,
    /// Fallback secret per provider id, for `key:secret` providers.
    pub api_secrets: HashMap<String, SecretString>,
    /// Base URL override per provider id.
    pub base_urls: HashMap<String, String>,
    pub azure_api_version: Option<String>,
    /// Access codes callers must present to use the fallback keys.
    pub access_codes: Vec<SecretString>,
    /// Model table edits, e.g. `-all,+gpt-4o,gpt-4o@azure=my-deploy`.
    pub custom_models: String,
    pub default_model: String,
    pub disable_gpt4: bool,
    /// Extra model names to treat as vision capable.
    pub vision_models: Vec<String>,
}

impl ServerConfig {
    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = ServerConfig::default();
        for spec in PROVIDERS {
            // A comma list holds several keys; the first non-empty one wins.
            if let Some(key) = get(spec.key_env).and_then(|keys| first_of_list(&keys)) {
                config.api_keys.insert(spec.id.to_string(), key.into());
            }
            if let Some(secret) = spec.secret_env.and_then(|name| get(name)) {
                config.api_secrets.insert(spec.id.to_string(), secret.into());
            }
            if let Some(url) = get(spec.url_env) {
                config.base_urls.insert(spec.id.to_string(), url);
            }
        }

        config.azure_api_version = get("AZURE_API_VERSION");
        config.access_codes = get("CODE")
            .map(|codes| split_list(&codes).map(SecretString::from).collect())
            .unwrap_or_default();
        config.custom_models = get("CUSTOM_MODELS").unwrap_or_default();
        config.default_model = get("DEFAULT_MODEL").unwrap_or_default();
        config.disable_gpt4 = get("DISABLE_GPT4").is_some_and(|v| v == "1" || v == "true");
        config.vision_models = get("VISION_MODELS")
            .map(|models| split_list(&models).map(String::from).collect())
            .unwrap_or_default();

        config
    }

    /// Read from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load `.env` if present, then read the process environment.
    pub fn load() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded environment file"),
            Err(e) if e.not_found() => debug!("no .env file found"),
            Err(e) => debug!(error = %e, "failed to read .env file"),
        }
        Self::from_env()
    }

    /// Whether callers without their own key must present an access code.
    pub fn needs_access_code(&self) -> bool {
        !self.access_codes.is_empty()
    }

    pub fn is_access_code_valid(&self, code: &str) -> bool {
        self.access_codes
            .iter()
            .any(|known| known.expose_secret() == code)
    }

    /// Fallback key for exactly this provider.
    pub fn fallback_key(&self, provider: &str) -> Option<&SecretString> {
        self.api_keys.get(provider)
    }

    pub fn fallback_secret(&self, provider: &str) -> Option<&SecretString> {
        self.api_secrets.get(provider)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn first_of_list(value: &str) -> Option<String> {
    split_list(value).next().map(String::from)
}

/// Shared, atomically replaceable configuration.
///
/// Readers take a snapshot and keep it for the whole request, so a reload
/// never changes the settings of a call already in flight.
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<Arc<ServerConfig>>,
}

impl ConfigStore {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn snapshot(&self) -> Arc<ServerConfig> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, config: ServerConfig) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        debug!("server configuration replaced");
    }
}
