//! Dialect dispatch for request bodies, buffered responses and stream chunks.

use serde_json::Value;

use crate::api::{anthropic, gemini, openai};
use crate::catalog::{ModelFamily, ModelTraits};
use crate::client::ClientError;
use crate::model::{ChatRequest, ChatResponse};
use crate::providers::Dialect;
use crate::stream::Fragment;

/// What kind of upstream call a payload is for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadShape {
    Chat,
    /// Image generation; never streamed.
    Image,
}

/// A serialized request body.
#[derive(Debug, Clone)]
pub struct Payload {
    pub shape: PayloadShape,
    pub body: Value,
}

/// Shape `request` for `dialect`. The model id is never rewritten.
pub fn build_payload(
    dialect: Dialect,
    request: &ChatRequest,
    traits: &ModelTraits,
) -> Result<Payload, ClientError> {
    check_image_sizes(dialect, request)?;

    let (shape, body) = match dialect {
        Dialect::OpenAi | Dialect::Azure if traits.family == ModelFamily::ImageGeneration => (
            PayloadShape::Image,
            serde_json::to_value(openai::ImageGenerationRequest::new(request))?,
        ),
        Dialect::OpenAi | Dialect::Azure => (
            PayloadShape::Chat,
            serde_json::to_value(openai::ChatCompletionRequest::new(request, traits))?,
        ),
        Dialect::Anthropic => (
            PayloadShape::Chat,
            serde_json::to_value(anthropic::MessagesRequest::new(request, traits))?,
        ),
        Dialect::Gemini => (
            PayloadShape::Chat,
            serde_json::to_value(gemini::GenerateContentRequest::new(request, traits))?,
        ),
    };
    Ok(Payload { shape, body })
}

fn check_image_sizes(dialect: Dialect, request: &ChatRequest) -> Result<(), ClientError> {
    if !request.has_images() {
        return Ok(());
    }
    let limit = dialect.inline_image_limit();
    let too_large = request
        .messages
        .iter()
        .flat_map(|m| m.images())
        .filter_map(|image| image.inline_size())
        .find(|size| *size > limit);
    match too_large {
        Some(size) => Err(ClientError::Malformed(format!(
            "inline image of {} bytes exceeds the {} byte limit",
            size, limit
        ))),
        None => Ok(()),
    }
}

/// Parse a complete (non-streamed) response body.
pub fn parse_response(
    dialect: Dialect,
    shape: PayloadShape,
    body: &[u8],
) -> Result<ChatResponse, ClientError> {
    match (dialect, shape) {
        (Dialect::OpenAi | Dialect::Azure, PayloadShape::Image) => openai::parse_image_response(body),
        (Dialect::OpenAi | Dialect::Azure, PayloadShape::Chat) => openai::parse_chat_response(body),
        (Dialect::Anthropic, _) => anthropic::parse_response(body),
        (Dialect::Gemini, _) => gemini::parse_response(body),
    }
}

/// Decode one stream data line into fragments.
pub fn decode_chunk(
    dialect: Dialect,
    data: &str,
    opened_calls: usize,
) -> Result<Vec<Fragment>, serde_json::Error> {
    match dialect {
        Dialect::OpenAi | Dialect::Azure => openai::decode_chunk(data),
        Dialect::Anthropic => anthropic::decode_event(data),
        Dialect::Gemini => gemini::decode_chunk(data, opened_calls),
    }
}

pub fn parse_model_list(dialect: Dialect, body: &[u8]) -> Result<Vec<String>, ClientError> {
    match dialect {
        Dialect::OpenAi | Dialect::Azure => openai::parse_model_list(body),
        Dialect::Anthropic => anthropic::parse_model_list(body),
        Dialect::Gemini => gemini::parse_model_list(body),
    }
}

/// Human-readable message from an error body, when the dialect's shape matches.
pub fn error_message(dialect: Dialect, body: &str) -> Option<String> {
    match dialect {
        Dialect::OpenAi | Dialect::Azure => openai::error_message(body),
        Dialect::Anthropic => anthropic::error_message(body),
        Dialect::Gemini => gemini::error_message(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::classify;
    use crate::client::ErrorKind;
    use crate::model::{ChatMessage, Content, ContentPart, ImageRef, Role};
    use nonempty::nonempty;

    fn image_request(model: &str, bytes: usize) -> ChatRequest {
        // 4 base64 chars per 3 bytes
        let data = "A".repeat(bytes / 3 * 4);
        let message = ChatMessage::new(
            Role::User,
            Content::Parts(vec![
                ContentPart::Text("look".into()),
                ContentPart::Image(ImageRef::Inline {
                    mime_type: "image/png".into(),
                    data,
                }),
            ]),
        );
        ChatRequest::new(model, nonempty![message])
    }

    #[test]
    fn test_image_limit_per_dialect() {
        let six_mib = 6 * 1024 * 1024;
        let request = image_request("claude-3-opus-20240229", six_mib);
        assert!(request.has_images());
        let traits = classify(&request.model, &[]);

        let err = build_payload(Dialect::Anthropic, &request, &traits).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let request = image_request("gpt-4o", six_mib);
        let traits = classify(&request.model, &[]);
        assert!(build_payload(Dialect::OpenAi, &request, &traits).is_ok());

        let text_only = ChatRequest::new("claude-3-opus-20240229", nonempty![ChatMessage::user("hi")]);
        assert!(!text_only.has_images());
        assert!(build_payload(Dialect::Anthropic, &text_only, &traits).is_ok());
    }

    #[test]
    fn test_image_model_shape() {
        let request = ChatRequest::new("dall-e-3", nonempty![ChatMessage::user("a cat")]).with_stream(true);
        let traits = classify(&request.model, &[]);
        let payload = build_payload(Dialect::OpenAi, &request, &traits).unwrap();
        assert_eq!(payload.shape, PayloadShape::Image);
        assert_eq!(payload.body["prompt"], "a cat");
        assert!(payload.body.get("stream").is_none());
    }

    #[test]
    fn test_model_id_untouched() {
        let request = ChatRequest::new("my-org/custom-model", nonempty![ChatMessage::user("hi")]);
        let traits = classify(&request.model, &[]);
        for dialect in [Dialect::OpenAi, Dialect::Anthropic] {
            let payload = build_payload(dialect, &request, &traits).unwrap();
            assert_eq!(payload.body["model"], "my-org/custom-model");
        }
    }

    #[test]
    fn test_error_message_shapes() {
        let body = r#"{"error":{"type":"invalid_request_error","message":"bad model"}}"#;
        assert_eq!(error_message(Dialect::Anthropic, body).as_deref(), Some("bad model"));
        assert_eq!(error_message(Dialect::OpenAi, body).as_deref(), Some("bad model"));
        assert_eq!(error_message(Dialect::Gemini, "not json"), None);
    }
}
