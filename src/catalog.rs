//! Model catalog: family detection, timeouts and the server model table.
//!
//! The table starts from [`DEFAULT_MODELS`] and is edited by the operator's
//! `CUSTOM_MODELS` string, a comma list where each entry is one of:
//!
//! - `+name` or `name`: make `name` available (on every provider listing it)
//! - `-name`: hide `name`
//! - `name@provider`: restrict the edit to one provider
//! - `name=Display`: also rename it (for Azure the display name is the deployment)
//! - `-all` / `+all`: toggle every model
//!
//! Names that match nothing are added under a custom provider.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::ServerConfig;
use crate::model::{ModelDescriptor, ModelProviderInfo};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const SLOW_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

static VISION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"vision",
        r"gpt-4o",
        r"gpt-4\.1",
        r"claude.*[34]",
        r"gemini-1\.5",
        r"gemini-exp",
        r"gemini-2\.[05]",
        r"learnlm",
        r"qwen-vl",
        r"qwen2-vl",
        r"^dall-e-3$",
        r"glm-4v",
        r"(?i)vl",
        r"o3",
        r"o4-mini",
        r"(?i)grok-4",
        r"gpt-5",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static VISION_EXCLUSIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"claude-3-5-haiku-20241022"]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

/// How the payload adapter must treat a model.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModelFamily {
    /// Image generation (`dall-e-3`): a prompt, not a conversation.
    ImageGeneration,
    /// `o1`/`o3`/`o4-mini`: fixed sampling, `max_completion_tokens`.
    Reasoning,
    /// `gpt-5*`: temperature pinned to 1, `max_completion_tokens`.
    Gpt5,
    Chat,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ModelTraits {
    pub family: ModelFamily,
    pub vision: bool,
}

pub fn is_image_model(model: &str) -> bool {
    model == "dall-e-3"
}

pub fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4-mini")
}

pub fn is_vision_model(model: &str, extra: &[String]) -> bool {
    if extra.iter().any(|name| name == model) {
        return true;
    }
    // `gpt-4-turbo` previews are text only.
    let turbo = model.contains("gpt-4-turbo") && !model.contains("preview");
    (turbo || VISION_PATTERNS.iter().any(|re| re.is_match(model)))
        && !VISION_EXCLUSIONS.iter().any(|re| re.is_match(model))
}

/// Family and vision capability, with extra vision names from server config.
pub fn classify(model: &str, vision_models: &[String]) -> ModelTraits {
    let family = if is_image_model(model) {
        ModelFamily::ImageGeneration
    } else if is_reasoning_model(model) {
        ModelFamily::Reasoning
    } else if model.starts_with("gpt-5") {
        ModelFamily::Gpt5
    } else {
        ModelFamily::Chat
    };
    ModelTraits {
        family,
        vision: is_vision_model(model, vision_models),
    }
}

/// Timeout for the handshake and each streamed chunk.
pub fn request_timeout(model: &str) -> Duration {
    let model = model.to_lowercase();
    let slow = model.starts_with("dall-e")
        || model.starts_with("dalle")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.contains("deepseek-r")
        || model.contains("-thinking");
    if slow {
        SLOW_REQUEST_TIMEOUT
    } else {
        REQUEST_TIMEOUT
    }
}

pub fn is_gpt4_model(model: &str) -> bool {
    (model.starts_with("gpt-4") || model.starts_with("chatgpt-4o") || model.starts_with("o1"))
        && !model.starts_with("gpt-4o-mini")
}

/// Built-in models per provider id, in listing order.
pub static DEFAULT_MODELS: &[(&str, &[&str])] = &[
    (
        "openai",
        &[
            "gpt-4o",
            "gpt-4o-mini",
            "gpt-4.1",
            "gpt-4.1-mini",
            "gpt-4-turbo",
            "gpt-5",
            "gpt-5-mini",
            "o1",
            "o3",
            "o4-mini",
            "dall-e-3",
        ],
    ),
    ("azure", &["gpt-4o", "gpt-4o-mini", "gpt-4.1", "o3", "dall-e-3"]),
    (
        "google",
        &["gemini-1.5-pro", "gemini-1.5-flash", "gemini-2.0-flash", "gemini-2.5-pro"],
    ),
    (
        "anthropic",
        &[
            "claude-3-5-haiku-20241022",
            "claude-3-5-sonnet-20241022",
            "claude-3-7-sonnet-20250219",
            "claude-sonnet-4-20250514",
        ],
    ),
    ("alibaba", &["qwen-turbo", "qwen-plus", "qwen-max", "qwen-vl-plus"]),
    ("moonshot", &["moonshot-v1-8k", "moonshot-v1-32k", "moonshot-v1-128k"]),
    ("iflytek", &["general", "generalv3", "pro-128k", "4.0Ultra"]),
    ("deepseek", &["deepseek-chat", "deepseek-coder", "deepseek-reasoner"]),
    ("xai", &["grok-beta", "grok-2-vision-1212", "grok-4"]),
    (
        "siliconflow",
        &["deepseek-ai/DeepSeek-V3", "deepseek-ai/DeepSeek-R1", "Qwen/Qwen2.5-VL-72B-Instruct"],
    ),
];

/// The built-in model list as descriptors, all available.
pub fn default_models() -> Vec<ModelDescriptor> {
    let mut seq = 1000;
    let mut models = Vec::new();
    for (position, (provider_id, names)) in DEFAULT_MODELS.iter().enumerate() {
        let display = crate::providers::find_spec(provider_id)
            .map(|spec| spec.display_name)
            .unwrap_or(provider_id);
        let provider = ModelProviderInfo {
            id: provider_id.to_string(),
            provider_name: display.to_string(),
            provider_type: provider_id.to_string(),
            sorted: position as i32 + 1,
        };
        for name in names.iter() {
            models.push(ModelDescriptor {
                name: name.to_string(),
                display_name: name.to_string(),
                available: true,
                sorted: seq,
                provider: provider.clone(),
                is_default: false,
            });
            seq += 1;
        }
    }
    models
}

/// Split `model@provider` at the last `@`.
pub fn split_model_provider(full_name: &str) -> (&str, Option<&str>) {
    match full_name.rsplit_once('@') {
        Some((model, provider)) => (model, Some(provider)),
        None => (full_name, None),
    }
}

/// Sequence for entries added by `CUSTOM_MODELS`: the same id always gets the
/// same number, and every number sorts before the built-ins.
struct CustomSeq {
    next: i32,
    assigned: HashMap<String, i32>,
}

impl CustomSeq {
    fn new() -> Self {
        Self {
            next: -1000,
            assigned: HashMap::new(),
        }
    }

    fn next(&mut self, id: &str) -> i32 {
        if let Some(seq) = self.assigned.get(id) {
            return *seq;
        }
        let seq = self.next;
        self.next += 1;
        self.assigned.insert(id.to_string(), seq);
        seq
    }
}

fn table_key(model: &ModelDescriptor) -> String {
    format!("{}@{}", model.name, model.provider.id)
}

/// Apply the `CUSTOM_MODELS` edits to `models`. Order is insertion order.
pub fn collect_model_table(models: &[ModelDescriptor], custom_models: &str) -> Vec<ModelDescriptor> {
    let mut table: Vec<ModelDescriptor> = models
        .iter()
        .cloned()
        .map(|mut m| {
            m.display_name = m.name.clone();
            m
        })
        .collect();
    let mut seq = CustomSeq::new();

    for entry in custom_models.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let available = !entry.starts_with('-');
        let name_config = entry
            .strip_prefix('+')
            .or_else(|| entry.strip_prefix('-'))
            .unwrap_or(entry);
        let (name, display_name) = match name_config.split_once('=') {
            Some((name, display)) => (name, Some(display).filter(|d| !d.is_empty())),
            None => (name_config, None),
        };

        if name == "all" {
            table.iter_mut().for_each(|m| m.available = available);
            continue;
        }

        let (model_name, provider_id) = split_model_provider(name);
        let mut matched = 0;
        for model in table.iter_mut() {
            if model.name == model_name && provider_id.map_or(true, |p| p == model.provider.id) {
                matched += 1;
                model.available = available;
                if let Some(display) = display_name {
                    model.display_name = display.to_string();
                }
            }
        }

        if matched == 0 {
            let provider_name = provider_id.unwrap_or("OpenAI");
            let provider = ModelProviderInfo {
                id: provider_name.to_lowercase(),
                provider_name: provider_name.to_string(),
                provider_type: "custom".to_string(),
                sorted: seq.next(provider_name),
            };
            let key = format!("{}@{}", model_name, provider.id);
            let descriptor = ModelDescriptor {
                name: model_name.to_string(),
                display_name: display_name.unwrap_or(model_name).to_string(),
                available,
                sorted: seq.next(&key),
                provider,
                is_default: false,
            };
            match table.iter_mut().find(|m| table_key(m) == key) {
                Some(existing) => *existing = descriptor,
                None => table.push(descriptor),
            }
        }
    }

    table
}

/// Like [`collect_model_table`], flagging the operator's default model.
///
/// `name@provider` must match exactly; a bare name flags the first
/// available model with that name.
pub fn collect_model_table_with_default(
    models: &[ModelDescriptor],
    custom_models: &str,
    default_model: &str,
) -> Vec<ModelDescriptor> {
    let mut table = collect_model_table(models, custom_models);
    if default_model.is_empty() {
        return table;
    }
    let target = if default_model.contains('@') {
        table.iter_mut().find(|m| table_key(m) == default_model)
    } else {
        table
            .iter_mut()
            .find(|m| m.available && m.name == default_model)
    };
    if let Some(model) = target {
        model.is_default = true;
    }
    table
}

/// Sort by provider then by position within the provider.
pub fn sort_models(models: &mut [ModelDescriptor]) {
    models.sort_by_key(|m| (m.provider.sorted, m.sorted));
}

/// The full server model list, sorted.
pub fn available_models(config: &ServerConfig) -> Vec<ModelDescriptor> {
    let mut models =
        collect_model_table_with_default(&default_models(), &config.custom_models, &config.default_model);
    sort_models(&mut models);
    models
}

/// Azure deployment for `model`: the display name of `model@azure`.
pub fn azure_deployment(custom_models: &str, model: &str) -> Option<String> {
    collect_model_table(&default_models(), custom_models)
        .into_iter()
        .find(|m| m.name == model && m.provider.id == "azure" && m.display_name != m.name)
        .map(|m| m.display_name)
}

/// Whether the server refuses `model` on `provider_id`.
///
/// Once `CUSTOM_MODELS` is set, only models the table lists as available on
/// this provider are served.
pub fn is_model_unavailable(config: &ServerConfig, model: &str, provider_id: &str) -> bool {
    if config.disable_gpt4 && is_gpt4_model(&model.to_lowercase()) {
        return true;
    }
    if config.custom_models.is_empty() {
        return false;
    }
    let key = format!("{}@{}", model, provider_id.to_lowercase());
    !collect_model_table(&default_models(), &config.custom_models)
        .iter()
        .any(|m| table_key(m) == key && m.available)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(models: &'a [ModelDescriptor], key: &str) -> Option<&'a ModelDescriptor> {
        models.iter().find(|m| table_key(m) == key)
    }

    #[test]
    fn test_families() {
        assert_eq!(classify("dall-e-3", &[]).family, ModelFamily::ImageGeneration);
        assert_eq!(classify("o1-mini", &[]).family, ModelFamily::Reasoning);
        assert_eq!(classify("o4-mini", &[]).family, ModelFamily::Reasoning);
        assert_eq!(classify("gpt-5-mini", &[]).family, ModelFamily::Gpt5);
        assert_eq!(classify("gpt-4o", &[]).family, ModelFamily::Chat);
    }

    #[test]
    fn test_vision_detection() {
        assert!(is_vision_model("gpt-4o", &[]));
        assert!(is_vision_model("claude-3-opus-20240229", &[]));
        assert!(is_vision_model("gemini-2.0-flash", &[]));
        assert!(is_vision_model("gpt-4-turbo", &[]));
        assert!(!is_vision_model("gpt-4-turbo-preview", &[]));
        assert!(!is_vision_model("claude-3-5-haiku-20241022", &[]));
        assert!(!is_vision_model("gpt-3.5-turbo", &[]));
        assert!(is_vision_model("my-model", &["my-model".to_string()]));
    }

    #[test]
    fn test_timeouts() {
        assert_eq!(request_timeout("gpt-4o"), REQUEST_TIMEOUT);
        assert_eq!(request_timeout("o1-preview"), SLOW_REQUEST_TIMEOUT);
        assert_eq!(request_timeout("DALL-E-3"), SLOW_REQUEST_TIMEOUT);
        assert_eq!(request_timeout("deepseek-reasoner"), SLOW_REQUEST_TIMEOUT);
        assert_eq!(request_timeout("gemini-2.0-flash-thinking-exp"), SLOW_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_gpt4_family() {
        assert!(is_gpt4_model("gpt-4o"));
        assert!(is_gpt4_model("o1-mini"));
        assert!(!is_gpt4_model("gpt-4o-mini"));
        assert!(!is_gpt4_model("gpt-3.5-turbo"));
    }

    #[test]
    fn test_custom_models_hide_and_rename() {
        let table = collect_model_table(&default_models(), "-all,+gpt-4o@openai=GPT Omni");
        let omni = find(&table, "gpt-4o@openai").unwrap();
        assert!(omni.available);
        assert_eq!(omni.display_name, "GPT Omni");
        assert!(!find(&table, "gpt-4o@azure").unwrap().available);
        assert!(!find(&table, "gemini-1.5-pro@google").unwrap().available);
    }

    #[test]
    fn test_custom_models_add_unknown() {
        let table = collect_model_table(&default_models(), "my-llm@Acme=Acme LLM,other-llm");
        let acme = find(&table, "my-llm@acme").unwrap();
        assert_eq!(acme.display_name, "Acme LLM");
        assert_eq!(acme.provider.provider_type, "custom");
        assert_eq!(acme.provider.provider_name, "Acme");
        assert!(acme.sorted < 0);

        let other = find(&table, "other-llm@openai").unwrap();
        assert_eq!(other.provider.provider_name, "OpenAI");
    }

    #[test]
    fn test_default_model_flag() {
        let table = collect_model_table_with_default(&default_models(), "", "gpt-4o");
        let flagged: Vec<_> = table.iter().filter(|m| m.is_default).map(table_key).collect();
        assert_eq!(flagged, vec!["gpt-4o@openai"]);

        let table = collect_model_table_with_default(&default_models(), "", "gpt-4o@azure");
        assert!(find(&table, "gpt-4o@azure").unwrap().is_default);
    }

    #[test]
    fn test_sorted_listing_puts_custom_first() {
        let config = ServerConfig {
            custom_models: "mine@Local".into(),
            ..ServerConfig::default()
        };
        let models = available_models(&config);
        assert_eq!(models[0].name, "mine");
        assert_eq!(models[1].name, "gpt-4o");
    }

    #[test]
    fn test_azure_deployment_from_display_name() {
        assert_eq!(
            azure_deployment("gpt-4o@azure=prod-4o", "gpt-4o").as_deref(),
            Some("prod-4o")
        );
        assert_eq!(azure_deployment("", "gpt-4o"), None);
    }

    #[test]
    fn test_model_gating() {
        let config = ServerConfig {
            custom_models: "-gpt-4o-mini@openai".into(),
            ..ServerConfig::default()
        };
        assert!(is_model_unavailable(&config, "gpt-4o-mini", "openai"));
        assert!(!is_model_unavailable(&config, "gpt-4o-mini", "azure"));
        assert!(is_model_unavailable(&config, "some-new-model", "openai"));
        assert!(is_model_unavailable(&config, "gpt-4o", "acme"));

        let config = ServerConfig {
            custom_models: "+some-new-model@openai".into(),
            ..ServerConfig::default()
        };
        assert!(!is_model_unavailable(&config, "some-new-model", "openai"));
        assert!(!is_model_unavailable(&config, "gpt-4o", "openai"));

        assert!(!is_model_unavailable(&ServerConfig::default(), "some-new-model", "openai"));

        let config = ServerConfig {
            disable_gpt4: true,
            ..ServerConfig::default()
        };
        assert!(is_model_unavailable(&config, "gpt-4o", "openai"));
        assert!(!is_model_unavailable(&config, "gpt-4o-mini", "openai"));
    }
}
