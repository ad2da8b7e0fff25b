//! Provider registry.
//!
//! Each supported upstream is one [`ProviderSpec`] entry: how it authenticates,
//! where it lives by default, which wire dialect it speaks, and which
//! environment variables carry its server-side key and base URL. Adding a
//! provider that speaks an existing dialect means adding one entry here.

use std::collections::HashMap;

use crate::client::ClientError;
use crate::config::ServerConfig;

/// Request/response schema family spoken by a provider.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// OpenAI Chat Completions and the vendors that clone it.
    OpenAi,
    /// OpenAI payloads behind Azure deployment URLs.
    Azure,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Generative Language API.
    Gemini,
}

impl Dialect {
    /// Headers every request in this dialect carries, besides auth.
    pub fn static_headers(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Dialect::Anthropic => &[("anthropic-version", "2023-06-01")],
            Dialect::OpenAi | Dialect::Azure | Dialect::Gemini => &[],
        }
    }

    /// Largest inline image, in decoded bytes, the provider accepts.
    pub fn inline_image_limit(&self) -> usize {
        match self {
            Dialect::Anthropic => 5 * 1024 * 1024,
            Dialect::OpenAi | Dialect::Azure | Dialect::Gemini => 20 * 1024 * 1024,
        }
    }
}

/// Where the resolved credential goes on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `<header>: <key>`
    Header(&'static str),
    /// `?<param>=<key>`
    QueryParam(&'static str),
}

/// Static description of one provider.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub auth_style: AuthStyle,
    pub dialect: Dialect,
    /// `None` when the deployment URL is always operator supplied (Azure).
    pub base_url_default: Option<&'static str>,
    pub requires_model_in_path: bool,
    /// Server-side key, e.g. `OPENAI_API_KEY`.
    pub key_env: &'static str,
    /// Server-side base URL override, e.g. `BASE_URL`.
    pub url_env: &'static str,
    /// Providers that authenticate with `key:secret`.
    pub secret_env: Option<&'static str>,
}

/// Complete list of built-in providers, in display order.
pub static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        id: "openai",
        display_name: "OpenAI",
        auth_style: AuthStyle::Bearer,
        dialect: Dialect::OpenAi,
        base_url_default: Some("https://api.openai.com"),
        requires_model_in_path: false,
        key_env: "OPENAI_API_KEY",
        url_env: "BASE_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "azure",
        display_name: "Azure",
        auth_style: AuthStyle::Header("api-key"),
        dialect: Dialect::Azure,
        base_url_default: None,
        requires_model_in_path: false,
        key_env: "AZURE_API_KEY",
        url_env: "AZURE_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "google",
        display_name: "Google",
        auth_style: AuthStyle::QueryParam("key"),
        dialect: Dialect::Gemini,
        base_url_default: Some("https://generativelanguage.googleapis.com"),
        requires_model_in_path: true,
        key_env: "GOOGLE_API_KEY",
        url_env: "GOOGLE_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "anthropic",
        display_name: "Anthropic",
        auth_style: AuthStyle::Header("x-api-key"),
        dialect: Dialect::Anthropic,
        base_url_default: Some("https://api.anthropic.com"),
        requires_model_in_path: false,
        key_env: "ANTHROPIC_API_KEY",
        url_env: "ANTHROPIC_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "alibaba",
        display_name: "Alibaba",
        auth_style: AuthStyle::Bearer,
        dialect: Dialect::OpenAi,
        base_url_default: Some("https://dashscope.aliyuncs.com/compatible-mode"),
        requires_model_in_path: false,
        key_env: "ALIBABA_API_KEY",
        url_env: "ALIBABA_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "moonshot",
        display_name: "Moonshot",
        auth_style: AuthStyle::Bearer,
        dialect: Dialect::OpenAi,
        base_url_default: Some("https://api.moonshot.cn"),
        requires_model_in_path: false,
        key_env: "MOONSHOT_API_KEY",
        url_env: "MOONSHOT_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "iflytek",
        display_name: "Iflytek",
        auth_style: AuthStyle::Bearer,
        dialect: Dialect::OpenAi,
        base_url_default: Some("https://spark-api-open.xf-yun.com"),
        requires_model_in_path: false,
        key_env: "IFLYTEK_API_KEY",
        url_env: "IFLYTEK_URL",
        secret_env: Some("IFLYTEK_API_SECRET"),
    },
    ProviderSpec {
        id: "deepseek",
        display_name: "DeepSeek",
        auth_style: AuthStyle::Bearer,
        dialect: Dialect::OpenAi,
        base_url_default: Some("https://api.deepseek.com"),
        requires_model_in_path: false,
        key_env: "DEEPSEEK_API_KEY",
        url_env: "DEEPSEEK_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "xai",
        display_name: "XAI",
        auth_style: AuthStyle::Bearer,
        dialect: Dialect::OpenAi,
        base_url_default: Some("https://api.x.ai"),
        requires_model_in_path: false,
        key_env: "XAI_API_KEY",
        url_env: "XAI_URL",
        secret_env: None,
    },
    ProviderSpec {
        id: "siliconflow",
        display_name: "SiliconFlow",
        auth_style: AuthStyle::Bearer,
        dialect: Dialect::OpenAi,
        base_url_default: Some("https://api.siliconflow.cn"),
        requires_model_in_path: false,
        key_env: "SILICONFLOW_API_KEY",
        url_env: "SILICONFLOW_URL",
        secret_env: None,
    },
];

/// Look up a built-in spec by id.
pub fn find_spec(id: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|spec| spec.id == id)
}

/// A provider as the rest of the crate sees it: the static spec plus any
/// operator override, frozen at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub auth_style: AuthStyle,
    pub dialect: Dialect,
    pub base_url_default: Option<String>,
    pub base_url_override: Option<String>,
    pub requires_model_in_path: bool,
    /// Whether the credential is `key:secret`.
    pub pairs_secret: bool,
    /// Position in model listings.
    pub sorted: i32,
}

impl ProviderDescriptor {
    fn from_spec(spec: &ProviderSpec, sorted: i32) -> Self {
        Self {
            id: spec.id.to_string(),
            display_name: spec.display_name.to_string(),
            auth_style: spec.auth_style,
            dialect: spec.dialect,
            base_url_default: spec.base_url_default.map(String::from),
            base_url_override: None,
            requires_model_in_path: spec.requires_model_in_path,
            pairs_secret: spec.secret_env.is_some(),
            sorted,
        }
    }
}

/// Read-only mapping from provider id to descriptor.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderDescriptor>,
}

impl ProviderRegistry {
    /// Registry with every built-in provider and no overrides.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for (position, spec) in PROVIDERS.iter().enumerate() {
            registry.register(ProviderDescriptor::from_spec(spec, position as i32 + 1));
        }
        registry
    }

    /// Built-in providers with the base URL overrides from server config applied.
    pub fn from_config(config: &ServerConfig) -> Self {
        let mut registry = Self::builtin();
        for descriptor in registry.providers.values_mut() {
            descriptor.base_url_override = config.base_urls.get(&descriptor.id).cloned();
        }
        registry
    }

    /// Add or replace an entry. Only meaningful before the registry is shared.
    pub fn register(&mut self, descriptor: ProviderDescriptor) {
        self.providers.insert(descriptor.id.clone(), descriptor);
    }

    pub fn lookup(&self, id: &str) -> Result<&ProviderDescriptor, ClientError> {
        self.providers
            .get(id)
            .ok_or_else(|| ClientError::UnknownProvider(id.to_string()))
    }

    /// Provider ids in listing order.
    pub fn ids(&self) -> Vec<&str> {
        let mut descriptors: Vec<&ProviderDescriptor> = self.providers.values().collect();
        descriptors.sort_by_key(|d| d.sorted);
        descriptors.into_iter().map(|d| d.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ErrorKind;

    #[test]
    fn test_builtin_lookup() {
        let registry = ProviderRegistry::builtin();
        let openai = registry.lookup("openai").unwrap();
        assert_eq!(openai.auth_style, AuthStyle::Bearer);
        assert_eq!(openai.dialect, Dialect::OpenAi);

        let google = registry.lookup("google").unwrap();
        assert!(google.requires_model_in_path);
        assert_eq!(google.auth_style, AuthStyle::QueryParam("key"));

        assert!(registry.lookup("iflytek").unwrap().pairs_secret);
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::builtin();
        let err = registry.lookup("nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
    }

    #[test]
    fn test_ids_follow_spec_order() {
        let registry = ProviderRegistry::builtin();
        let ids = registry.ids();
        assert_eq!(ids.len(), PROVIDERS.len());
        assert_eq!(&ids[..4], &["openai", "azure", "google", "anthropic"]);
    }

    #[test]
    fn test_config_overrides_base_url() {
        let config = ServerConfig::from_lookup(|key| match key {
            "ANTHROPIC_URL" => Some("https://claude.internal/".to_string()),
            _ => None,
        });
        let registry = ProviderRegistry::from_config(&config);
        let anthropic = registry.lookup("anthropic").unwrap();
        assert_eq!(
            anthropic.base_url_override.as_deref(),
            Some("https://claude.internal/")
        );
        assert_eq!(registry.lookup("openai").unwrap().base_url_override, None);
    }
}
