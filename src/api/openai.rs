//! OpenAI Chat Completions dialect, shared by Azure and the OpenAI-compatible vendors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::{ModelFamily, ModelTraits};
use crate::client::ClientError;
use crate::model::{
    ChatRequest, ChatResponse, Content, ContentPart, FinishReason, GeneratedImage, ImageOptions,
    ResponseContent, ToolCall, ToolDefinition, Usage, UsageSummary,
};
use crate::stream::{Fragment, ToolCallFragment};

/// Leading directive that keeps Markdown output on for reasoning models.
const REASONING_DIRECTIVE: &str = "Formatting re-enabled";

/// Vision models get at least this many output tokens.
const VISION_MIN_MAX_TOKENS: u32 = 4000;

// --- Request Types ---

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<OpenAiTool>,
}

#[derive(Debug, Serialize)]
pub struct OpenAiMessage {
    pub role: String,
    pub content: OpenAiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    Text(String),
    Parts(Vec<OpenAiContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAiContentPart {
    Text { text: String },
    ImageUrl { image_url: OpenAiImageUrl },
}

#[derive(Debug, Serialize)]
pub struct OpenAiImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAiTool {
    #[serde(rename = "type")]
    pub tool_type: &'static str,
    pub function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
pub struct OpenAiFunction {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

impl From<&ToolDefinition> for OpenAiTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            tool_type: "function",
            function: OpenAiFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ImageGenerationRequest {
    pub model: String,
    pub prompt: String,
    pub response_format: &'static str,
    pub n: u32,
    pub size: String,
    pub quality: String,
    pub style: String,
}

impl ChatCompletionRequest {
    /// Shape a chat request for the model's family.
    pub fn new(request: &ChatRequest, traits: &ModelTraits) -> Self {
        let reasoning = traits.family == ModelFamily::Reasoning;
        let completion_tokens = reasoning || traits.family == ModelFamily::Gpt5;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if reasoning {
            messages.push(OpenAiMessage {
                role: "developer".to_string(),
                content: OpenAiContent::Text(REASONING_DIRECTIVE.to_string()),
            });
        }
        messages.extend(request.messages.iter().map(|message| OpenAiMessage {
            role: message.role.as_str().to_string(),
            content: if traits.vision {
                convert_content(&message.content)
            } else {
                OpenAiContent::Text(message.text().to_string())
            },
        }));

        let sampling = &request.sampling;
        let max_tokens = if completion_tokens {
            None
        } else if traits.vision {
            Some(request.max_tokens.unwrap_or(0).max(VISION_MIN_MAX_TOKENS))
        } else {
            request.max_tokens
        };

        Self {
            model: request.model.clone(),
            messages,
            stream: request.stream,
            temperature: if completion_tokens { 1.0 } else { sampling.temperature },
            top_p: if reasoning { 1.0 } else { sampling.top_p },
            presence_penalty: (!reasoning).then_some(sampling.presence_penalty),
            frequency_penalty: (!reasoning).then_some(sampling.frequency_penalty),
            max_tokens,
            max_completion_tokens: if completion_tokens { request.max_tokens } else { None },
            tools: request.tools.iter().map(OpenAiTool::from).collect(),
        }
    }
}

impl ImageGenerationRequest {
    /// The last message's text becomes the prompt.
    pub fn new(request: &ChatRequest) -> Self {
        let options = request.image.clone().unwrap_or_default();
        let ImageOptions { size, quality, style } = options;
        Self {
            model: request.model.clone(),
            prompt: request.messages.last().text().to_string(),
            response_format: "b64_json",
            n: 1,
            size,
            quality,
            style,
        }
    }
}

fn convert_content(content: &Content) -> OpenAiContent {
    match content {
        Content::Text(text) => OpenAiContent::Text(text.clone()),
        Content::Parts(parts) => OpenAiContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text(text) => OpenAiContentPart::Text { text: text.clone() },
                    ContentPart::Image(image) => OpenAiContentPart::ImageUrl {
                        image_url: OpenAiImageUrl { url: image.to_url() },
                    },
                })
                .collect(),
        ),
    }
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

impl From<OpenAiUsage> for Usage {
    fn from(usage: OpenAiUsage) -> Self {
        Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
    b64_json: Option<String>,
}

/// Error body shape shared by OpenAI and most compatible vendors.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Object { message: String },
    Text(String),
}

impl ErrorDetail {
    fn message(self) -> String {
        match self {
            ErrorDetail::Object { message, .. } | ErrorDetail::Text(message) => message,
        }
    }
}

/// Error a 200 response can still carry.
fn embedded_error(body: &[u8]) -> Option<ClientError> {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .map(|err| ClientError::Upstream {
            status: None,
            message: err.error.message(),
        })
}

/// The provider's error message, if the body has the usual `{error: ...}` shape.
pub fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|err| err.error.message())
}

pub fn parse_chat_response(body: &[u8]) -> Result<ChatResponse, ClientError> {
    if let Some(err) = embedded_error(body) {
        return Err(err);
    }
    let completion: ChatCompletion = serde_json::from_slice(body)?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ClientError::Malformed("response has no choices".to_string()))?;

    Ok(ChatResponse {
        content: ResponseContent::Text(choice.message.content.unwrap_or_default()),
        reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect(),
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_wire),
        usage: completion.usage.map(Usage::from),
    })
}

pub fn parse_image_response(body: &[u8]) -> Result<ChatResponse, ClientError> {
    if let Some(err) = embedded_error(body) {
        return Err(err);
    }
    let response: ImageGenerationResponse = serde_json::from_slice(body)?;
    let images = response
        .data
        .into_iter()
        .filter_map(|image| match (image.b64_json, image.url) {
            (Some(data), _) => Some(GeneratedImage::Base64(data)),
            (None, Some(url)) => Some(GeneratedImage::Url(url)),
            (None, None) => None,
        })
        .collect();
    Ok(ChatResponse {
        content: ResponseContent::Images(images),
        finish_reason: Some(FinishReason::Stop),
        ..ChatResponse::default()
    })
}

// --- Streaming ---

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    #[serde(alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    id: Option<String>,
    #[serde(default)]
    function: ChunkFunction,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunction {
    name: Option<String>,
    arguments: Option<String>,
}

/// Decode one streamed `data:` payload.
pub fn decode_chunk(data: &str) -> Result<Vec<Fragment>, serde_json::Error> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    let mut fragments = Vec::new();

    for choice in chunk.choices {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            fragments.push(Fragment::Reasoning(reasoning));
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            fragments.push(Fragment::Text(content));
        }
        for call in delta.tool_calls {
            fragments.push(Fragment::ToolCall(ToolCallFragment {
                id: call.id.filter(|id| !id.is_empty()),
                name: call.function.name,
                args_chunk: call.function.arguments.unwrap_or_default(),
            }));
        }
        if let Some(reason) = choice.finish_reason {
            fragments.push(Fragment::Finish(FinishReason::from_wire(&reason)));
        }
    }
    if let Some(usage) = chunk.usage {
        fragments.push(Fragment::Usage(usage.into()));
    }
    Ok(fragments)
}

// --- Models and billing ---

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

pub fn parse_model_list(body: &[u8]) -> Result<Vec<String>, ClientError> {
    let list: ModelList = serde_json::from_slice(body)?;
    Ok(list.data.into_iter().map(|m| m.id).collect())
}

#[derive(Debug, Deserialize)]
struct BillingUsage {
    total_usage: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BillingSubscription {
    hard_limit_usd: Option<f64>,
}

/// Combine the usage and subscription bodies.
///
/// `total_usage` is reported in cents; both figures are rounded to cents.
pub fn parse_usage(usage: &[u8], subscription: &[u8]) -> Result<UsageSummary, ClientError> {
    for body in [usage, subscription] {
        if let Some(err) = embedded_error(body) {
            return Err(err);
        }
    }
    let usage: BillingUsage = serde_json::from_slice(usage)?;
    let subscription: BillingSubscription = serde_json::from_slice(subscription)?;
    Ok(UsageSummary {
        used: usage.total_usage.map(|cents| cents.round() / 100.0).unwrap_or_default(),
        total: subscription
            .hard_limit_usd
            .map(|usd| (usd * 100.0).round() / 100.0)
            .unwrap_or_default(),
    })
}
