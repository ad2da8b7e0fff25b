//! Anthropic Messages API dialect.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::ModelTraits;
use crate::client::{ClientError, ErrorKind};
use crate::model::{
    ChatRequest, ChatResponse, ContentPart, FinishReason, ImageRef, ResponseContent, Role, ToolCall,
    Usage,
};
use crate::stream::{Fragment, ToolCallFragment};

/// `max_tokens` is mandatory for Anthropic.
const DEFAULT_MAX_TOKENS: u32 = 4096;

// --- Request Types ---

#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub temperature: f32,
    /// Omitted at the default of 1.0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<AnthropicTool>,
}

#[derive(Debug, Serialize)]
pub struct AnthropicMessage {
    pub role: &'static str,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl MessagesRequest {
    /// System messages move to the top-level `system` field; consecutive
    /// messages from the same role are merged into one turn.
    pub fn new(request: &ChatRequest, traits: &ModelTraits) -> Self {
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text())
            .filter(|text| !text.is_empty())
            .join("\n");

        let mut messages: Vec<AnthropicMessage> = Vec::new();
        for message in request.messages.iter().filter(|m| m.role != Role::System) {
            let role = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            let blocks = content_blocks(message, traits.vision);
            if blocks.is_empty() {
                continue;
            }
            match messages.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => messages.push(AnthropicMessage { role, content: blocks }),
            }
        }

        Self {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: Some(system).filter(|s| !s.is_empty()),
            temperature: request.sampling.temperature,
            top_p: Some(request.sampling.top_p).filter(|top_p| *top_p != 1.0),
            stream: request.stream,
            tools: request
                .tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.parameters.clone(),
                })
                .collect(),
        }
    }
}

fn content_blocks(message: &crate::model::ChatMessage, vision: bool) -> Vec<ContentBlock> {
    use crate::model::Content;

    let text_block = |text: &str| {
        Some(text)
            .filter(|t| !t.trim().is_empty())
            .map(|t| ContentBlock::Text { text: t.to_string() })
    };

    match &message.content {
        Content::Text(text) => text_block(text).into_iter().collect(),
        Content::Parts(_) if !vision => text_block(message.text()).into_iter().collect(),
        Content::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => text_block(text),
                ContentPart::Image(ImageRef::Inline { mime_type, data }) => Some(ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: mime_type.clone(),
                        data: data.clone(),
                    },
                }),
                ContentPart::Image(ImageRef::Url(url)) => Some(ContentBlock::Image {
                    source: ImageSource::Url { url: url.clone() },
                }),
            })
            .collect(),
    }
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

impl From<AnthropicUsage> for Usage {
    fn from(usage: AnthropicUsage) -> Self {
        Usage {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

/// The provider's error message, if the body has Anthropic's error shape.
pub fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|err| err.error.message)
}

pub fn parse_response(body: &[u8]) -> Result<ChatResponse, ClientError> {
    if let Ok(err) = serde_json::from_slice::<ErrorBody>(body) {
        return Err(ClientError::Upstream {
            status: None,
            message: format!("{}: {}", err.error.error_type, err.error.message),
        });
    }
    let response: MessagesResponse = serde_json::from_slice(body)?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ResponseBlock::Text { text: t } => text.push_str(&t),
            ResponseBlock::Thinking { thinking } => reasoning.push_str(&thinking),
            ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: input.to_string(),
            }),
            ResponseBlock::Other => {}
        }
    }

    Ok(ChatResponse {
        content: ResponseContent::Text(text),
        reasoning: Some(reasoning).filter(|r| !r.is_empty()),
        tool_calls,
        finish_reason: response.stop_reason.as_deref().map(FinishReason::from_wire),
        usage: response.usage.map(Usage::from),
    })
}

// --- SSE Event Types ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        content_block: StartBlock,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    MessageDelta {
        delta: MessageDelta,
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error {
        error: AnthropicError,
    },
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

/// Decode one streamed event payload.
pub fn decode_event(data: &str) -> Result<Vec<Fragment>, serde_json::Error> {
    let event: StreamEvent = serde_json::from_str(data)?;
    let fragments = match event {
        StreamEvent::MessageStart { message } => message
            .usage
            .map(|usage| vec![Fragment::Usage(usage.into())])
            .unwrap_or_default(),
        StreamEvent::ContentBlockStart { content_block } => match content_block {
            StartBlock::Text { text } if !text.is_empty() => vec![Fragment::Text(text)],
            StartBlock::Thinking { thinking } if !thinking.is_empty() => {
                vec![Fragment::Reasoning(thinking)]
            }
            StartBlock::ToolUse { id, name } => vec![Fragment::ToolCall(ToolCallFragment {
                id: Some(id),
                name: Some(name),
                args_chunk: String::new(),
            })],
            _ => Vec::new(),
        },
        StreamEvent::ContentBlockDelta { delta } => match delta {
            Delta::TextDelta { text } => vec![Fragment::Text(text)],
            Delta::ThinkingDelta { thinking } => vec![Fragment::Reasoning(thinking)],
            Delta::InputJsonDelta { partial_json } => vec![Fragment::ToolCall(ToolCallFragment {
                id: None,
                name: None,
                args_chunk: partial_json,
            })],
            Delta::Other => Vec::new(),
        },
        StreamEvent::MessageDelta { delta, usage } => {
            let mut fragments = Vec::new();
            if let Some(reason) = delta.stop_reason {
                fragments.push(Fragment::Finish(FinishReason::from_wire(&reason)));
            }
            if let Some(usage) = usage {
                fragments.push(Fragment::Usage(usage.into()));
            }
            fragments
        }
        StreamEvent::MessageStop => vec![Fragment::Terminate],
        StreamEvent::Error { error } => vec![Fragment::Failure {
            kind: ErrorKind::Upstream,
            message: format!("{}: {}", error.error_type, error.message),
        }],
        StreamEvent::Ignored => Vec::new(),
    };
    Ok(fragments)
}

// --- Models ---

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
