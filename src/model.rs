//! Common data models for provider-agnostic chat requests and responses.

use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of the message sender.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Reference to an image attached to a message.
///
/// `data:` URLs are kept inline so dialects that want raw base64 (Anthropic,
/// Gemini) don't have to re-parse them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageRef {
    Url(String),
    Inline { mime_type: String, data: String },
}

impl ImageRef {
    /// Parse a URL, turning `data:<mime>;base64,<data>` into [`ImageRef::Inline`].
    ///
    /// # Example
    /// ```
    /// use chatrelay::model::ImageRef;
    ///
    /// let image = ImageRef::parse("data:image/png;base64,aGVsbG8=");
    /// assert_eq!(
    ///     image,
    ///     ImageRef::Inline { mime_type: "image/png".into(), data: "aGVsbG8=".into() }
    /// );
    /// ```
    pub fn parse(url: &str) -> Self {
        url.strip_prefix("data:")
            .and_then(|rest| rest.split_once(','))
            .and_then(|(meta, data)| {
                meta.strip_suffix(";base64").map(|mime| ImageRef::Inline {
                    mime_type: mime.to_string(),
                    data: data.to_string(),
                })
            })
            .unwrap_or_else(|| ImageRef::Url(url.to_string()))
    }

    /// The image as a URL, re-encoding inline data as a `data:` URL.
    pub fn to_url(&self) -> String {
        match self {
            ImageRef::Url(url) => url.clone(),
            ImageRef::Inline { mime_type, data } => format!("data:{};base64,{}", mime_type, data),
        }
    }

    /// Decoded size in bytes of inline data. `None` for remote URLs.
    pub fn inline_size(&self) -> Option<usize> {
        match self {
            ImageRef::Url(_) => None,
            ImageRef::Inline { data, .. } => {
                let padding = data.bytes().rev().take_while(|b| *b == b'=').count();
                Some(((data.len() / 4) * 3 + (data.len() % 4) * 3 / 4).saturating_sub(padding.min(2)))
            }
        }
    }
}

/// One block of multimodal content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentPart {
    Text(String),
    Image(ImageRef),
}

/// Message content: plain text or an ordered list of blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
}

impl ChatMessage {
    pub fn new(role: Role, content: Content) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, Content::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, Content::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, Content::Text(text.into()))
    }

    /// Text of the message: the whole string, or the first text block.
    pub fn text(&self) -> &str {
        match &self.content {
            Content::Text(text) => text,
            Content::Parts(parts) => parts
                .iter()
                .find_map(|part| match part {
                    ContentPart::Text(text) => Some(text.as_str()),
                    ContentPart::Image(_) => None,
                })
                .unwrap_or_default(),
        }
    }

    /// Images attached to the message, in order.
    pub fn images(&self) -> impl Iterator<Item = &ImageRef> {
        let parts: &[ContentPart] = match &self.content {
            Content::Text(_) => &[],
            Content::Parts(parts) => parts,
        };
        parts.iter().filter_map(|part| match part {
            ContentPart::Image(image) => Some(image),
            ContentPart::Text(_) => None,
        })
    }
}

/// Sampling parameters shared by the chat dialects.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.5,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

/// Parameters for image-generation models.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageOptions {
    pub size: String,
    pub quality: String,
    pub style: String,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            size: "1024x1024".to_string(),
            quality: "standard".to_string(),
            style: "vivid".to_string(),
        }
    }
}

/// A function the model may call. Forwarded to the provider unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

/// Provider-agnostic chat request, built fresh per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: NonEmpty<ChatMessage>,
    pub model: String,
    pub sampling: SamplingParams,
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub image: Option<ImageOptions>,
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: NonEmpty<ChatMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            sampling: SamplingParams::default(),
            stream: false,
            max_tokens: None,
            image: None,
            tools: Vec::new(),
        }
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_image_options(mut self, image: ImageOptions) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| m.images().next().is_some())
    }
}

/// Text-to-speech request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

/// Reason for finishing the response generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    /// Map the provider's raw reason string.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" | "STOP" => FinishReason::Stop,
            "length" | "max_tokens" | "MAX_TOKENS" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "SAFETY" | "RECITATION" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
}

/// A complete tool call, arguments kept as the raw JSON text the model produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn parsed_arguments(&self) -> Result<Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&self.arguments)
    }
}

/// An image returned by an image-generation model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedImage {
    Url(String),
    Base64(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseContent {
    Text(String),
    Images(Vec<GeneratedImage>),
}

impl Default for ResponseContent {
    fn default() -> Self {
        ResponseContent::Text(String::new())
    }
}

/// Provider-agnostic chat response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub content: ResponseContent,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            ResponseContent::Text(text) => Some(text),
            ResponseContent::Images(_) => None,
        }
    }
}

/// The provider a listed model belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelProviderInfo {
    pub id: String,
    pub provider_name: String,
    pub provider_type: String,
    pub sorted: i32,
}

/// An entry in a model listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub name: String,
    pub display_name: String,
    pub available: bool,
    pub sorted: i32,
    pub provider: ModelProviderInfo,
    #[serde(default)]
    pub is_default: bool,
}

/// Account usage, in the provider's billing currency.
#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageSummary {
    pub used: f64,
    pub total: f64,
}
