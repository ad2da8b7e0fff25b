//! # chatrelay - Multi-provider chat relay
//!
//! Takes provider-neutral chat requests and forwards them to OpenAI-compatible
//! services, Azure OpenAI, Anthropic and Google Gemini, then brings the replies
//! back as one uniform response or event stream.
//!
//! ## Features
//! - Async-first, tokio compatible
//! - Static provider table with per-provider auth placement and base URLs
//! - Caller keys, or server keys guarded by access codes
//! - Streaming over SSE and NDJSON, reconciled into [`StreamEvent`]s
//! - Cancellation and per-model timeouts
//! - Server model table edited through `CUSTOM_MODELS`
//!
//! ## Architecture
//!
//! A request flows through these steps:
//!
//! 1. **Lookup**: [`ProviderRegistry`] resolves the provider id
//! 2. **Credentials**: [`credentials::resolve`] picks the caller or server key
//! 3. **Payload**: [`payload::build_payload`] shapes the body for the dialect
//! 4. **Endpoint**: [`endpoint::build_endpoint`] builds the URL
//! 5. **Transport**: [`http`] sends it, then [`stream`] reconciles the reply
//!
//! Steps 1 to 4 happen before any network I/O, so configuration errors come
//! back from [`Client::chat`] directly.
//!
//! ## Example
//! ```no_run
//! use chatrelay::{AccessSettings, ChatMessage, ChatRequest, Client, Credentials, StreamEvent};
//! use chatrelay::stream::ChatReply;
//! use futures::StreamExt;
//! use nonempty::nonempty;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::from_env()?;
//!     let settings = AccessSettings::new(Credentials::with_api_key("sk-..."));
//!     let request = ChatRequest::new("gpt-4o", nonempty![ChatMessage::user("Hello!")]).with_stream(true);
//!
//!     let handle = client.chat("openai", request, &settings)?;
//!     if let ChatReply::Streaming(mut events) = handle.into_reply() {
//!         while let Some(event) = events.next().await {
//!             match event {
//!                 StreamEvent::Text(delta) => print!("{}", delta),
//!                 StreamEvent::Error(error) => eprintln!("{}", error.message),
//!                 _ => {}
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod catalog;
pub mod client;
pub mod config;
pub mod credentials;
pub mod endpoint;
pub mod http;
pub mod model;
pub mod options;
pub mod payload;
pub mod providers;
pub mod sse;
pub mod stream;

// Re-exports for convenience
pub use client::{Client, ClientError, ErrorKind};
pub use config::ServerConfig;
pub use model::{ChatMessage, ChatRequest, ChatResponse, ModelDescriptor};
pub use options::{AccessSettings, Credentials, TransportOptions};
pub use providers::{Dialect, ProviderRegistry};
pub use stream::{CancelHandle, ChatHandle, ChatListener, StreamEvent};
