//! Google Generative Language (Gemini) dialect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::ModelTraits;
use crate::client::{ClientError, ErrorKind};
use crate::model::{
    ChatMessage, ChatRequest, ChatResponse, Content, ContentPart, FinishReason, ImageRef,
    ResponseContent, Role, ToolCall, Usage,
};
use crate::stream::{Fragment, ToolCallFragment};

// --- Request Types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
}

#[derive(Debug, Serialize)]
pub struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum GeminiPart {
    Text(String),
    InlineData(InlineData),
    FileData(FileData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub mime_type: String,
    pub file_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

impl GenerateContentRequest {
    /// The model goes in the URL, not the body.
    pub fn new(request: &ChatRequest, traits: &ModelTraits) -> Self {
        let system_parts: Vec<GeminiPart> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text())
            .filter(|text| !text.is_empty())
            .map(|text| GeminiPart::Text(text.to_string()))
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|message| GeminiContent {
                role: Some(match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                }),
                parts: parts(message, traits.vision),
            })
            .filter(|content| !content.parts.is_empty())
            .collect();

        let tools = if request.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|tool| FunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    })
                    .collect(),
            }]
        };

        Self {
            contents,
            system_instruction: (!system_parts.is_empty()).then(|| GeminiContent {
                role: None,
                parts: system_parts,
            }),
            generation_config: GenerationConfig {
                temperature: request.sampling.temperature,
                top_p: request.sampling.top_p,
                max_output_tokens: request.max_tokens,
            },
            tools,
        }
    }
}

fn parts(message: &ChatMessage, vision: bool) -> Vec<GeminiPart> {
    match &message.content {
        Content::Parts(parts) if vision => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) if text.is_empty() => None,
                ContentPart::Text(text) => Some(GeminiPart::Text(text.clone())),
                ContentPart::Image(ImageRef::Inline { mime_type, data }) => {
                    Some(GeminiPart::InlineData(InlineData {
                        mime_type: mime_type.clone(),
                        data: data.clone(),
                    }))
                }
                ContentPart::Image(ImageRef::Url(url)) => Some(GeminiPart::FileData(FileData {
                    mime_type: mime_from_url(url).to_string(),
                    file_uri: url.clone(),
                })),
            })
            .collect(),
        _ => Some(message.text())
            .filter(|text| !text.is_empty())
            .map(|text| GeminiPart::Text(text.to_string()))
            .into_iter()
            .collect(),
    }
}

fn mime_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_lowercase();
    match path.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    }
}

// --- Response Types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

impl From<UsageMetadata> for Usage {
    fn from(usage: UsageMetadata) -> Self {
        Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

/// The provider's error message, if the body has Google's error shape.
pub fn error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|err| err.error.message)
}

/// Gemini does not id its function calls; ids are synthesized in order.
fn call_id(index: usize) -> String {
    format!("call_{}", index)
}

pub fn parse_response(body: &[u8]) -> Result<ChatResponse, ClientError> {
    if let Ok(err) = serde_json::from_slice::<ErrorBody>(body) {
        return Err(ClientError::Upstream {
            status: None,
            message: err.error.message,
        });
    }
    let response: GenerateContentResponse = serde_json::from_slice(body)?;
    if let Some(reason) = blocked(&response) {
        return Err(ClientError::Upstream {
            status: None,
            message: format!("prompt blocked: {}", reason),
        });
    }

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    let mut finish_reason = None;
    if let Some(candidate) = response.candidates.into_iter().next() {
        finish_reason = candidate.finish_reason.as_deref().map(FinishReason::from_wire);
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    id: call_id(tool_calls.len()),
                    name: call.name,
                    arguments: call.args.to_string(),
                });
            } else if let Some(t) = part.text {
                if part.thought {
                    reasoning.push_str(&t);
                } else {
                    text.push_str(&t);
                }
            }
        }
    }

    Ok(ChatResponse {
        content: ResponseContent::Text(text),
        reasoning: Some(reasoning).filter(|r| !r.is_empty()),
        tool_calls,
        finish_reason,
        usage: response.usage_metadata.map(Usage::from),
    })
}

fn blocked(response: &GenerateContentResponse) -> Option<&str> {
    if !response.candidates.is_empty() {
        return None;
    }
    response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.as_deref())
}

/// Decode one streamed chunk. `opened_calls` is the number of tool calls
/// already seen in this stream, so synthesized ids stay unique.
pub fn decode_chunk(data: &str, opened_calls: usize) -> Result<Vec<Fragment>, serde_json::Error> {
    let response: GenerateContentResponse = serde_json::from_str(data)?;
    if let Some(reason) = blocked(&response) {
        return Ok(vec![Fragment::Failure {
            kind: ErrorKind::Upstream,
            message: format!("prompt blocked: {}", reason),
        }]);
    }

    let mut fragments = Vec::new();
    let mut calls = opened_calls;
    for candidate in response.candidates {
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                fragments.push(Fragment::ToolCall(ToolCallFragment {
                    id: Some(call_id(calls)),
                    name: Some(call.name),
                    args_chunk: call.args.to_string(),
                }));
                calls += 1;
            } else if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                fragments.push(if part.thought {
                    Fragment::Reasoning(text)
                } else {
                    Fragment::Text(text)
                });
            }
        }
        if let Some(reason) = candidate.finish_reason {
            fragments.push(Fragment::Finish(FinishReason::from_wire(&reason)));
        }
    }
    if let Some(usage) = response.usage_metadata {
        fragments.push(Fragment::Usage(usage.into()));
    }
    Ok(fragments)
}

// --- Models ---

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

/// Model ids without the `models/` prefix.
pub fn parse_model_list(body: &[u8]) -> Result<Vec<String>, ClientError> {
    let list: ModelList = serde_json::from_slice(body)?;
    Ok(list
        .models
        .into_iter()
        .map(|m| m.name.strip_prefix("models/").map(String::from).unwrap_or(m.name))
        .collect())
}
