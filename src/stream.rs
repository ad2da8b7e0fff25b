//! Stream reconciliation: provider chunks in, uniform [`StreamEvent`]s out.
//!
//! A [`Reconciler`] is a pure state machine over decoded data lines. It moves
//! `Open → (Thinking | Emitting)* → Closed` and emits exactly one terminal
//! event (`Done` or `Error`), after which all input is ignored.
//! [`ChatStream`] drives one over a live response.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClientError, ErrorKind};
use crate::model::{ChatResponse, FinishReason, ResponseContent, ToolCall, Usage};
use crate::payload;
use crate::providers::Dialect;

/// Partial tool call as it arrives on the wire.
///
/// A fragment with an `id` opens a new call; one without continues the most
/// recently opened call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub id: Option<String>,
    pub name: Option<String>,
    pub args_chunk: String,
}

/// Error delivered through the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ClientError> for StreamError {
    fn from(error: &ClientError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Uniform event emitted while a response streams.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Text(String),
    Reasoning(String),
    ToolCallFragment(ToolCallFragment),
    Done,
    /// Terminal. Cancellation arrives as `kind: Canceled`.
    Error(StreamError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error(_))
    }
}

/// One decoded unit of a provider chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Reasoning(String),
    Text(String),
    ToolCall(ToolCallFragment),
    Finish(FinishReason),
    Usage(Usage),
    /// The provider's explicit end of stream.
    Terminate,
    /// The provider reported an error inside the stream.
    Failure { kind: ErrorKind, message: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Thinking,
    Emitting,
    Closed,
}

/// Turns data lines into events and keeps the running aggregate.
#[derive(Debug)]
pub struct Reconciler {
    dialect: Dialect,
    state: StreamState,
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
}

impl Reconciler {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: StreamState::Open,
            text: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            finish_reason: None,
            usage: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Feed one data payload (the text after `data:`, or an NDJSON line).
    pub fn push(&mut self, data: &str) -> Vec<StreamEvent> {
        if self.is_closed() {
            return Vec::new();
        }
        let data = data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "{}" {
            // Bare empty object is a terminator some proxies send.
            return self.finish();
        }

        let fragments = match payload::decode_chunk(self.dialect, data, self.tool_calls.len()) {
            Ok(fragments) => fragments,
            Err(e) => {
                return self.fail(StreamError {
                    kind: ErrorKind::Malformed,
                    message: format!("undecodable stream chunk: {}", e),
                })
            }
        };

        let mut events = Vec::new();
        for fragment in fragments {
            match fragment {
                Fragment::Reasoning(delta) => {
                    self.state = StreamState::Thinking;
                    self.reasoning.push_str(&delta);
                    events.push(StreamEvent::Reasoning(delta));
                }
                Fragment::Text(delta) => {
                    self.state = StreamState::Emitting;
                    self.text.push_str(&delta);
                    events.push(StreamEvent::Text(delta));
                }
                Fragment::ToolCall(fragment) => match self.apply_tool_call(&fragment) {
                    Ok(()) => {
                        self.state = StreamState::Emitting;
                        events.push(StreamEvent::ToolCallFragment(fragment));
                    }
                    Err(error) => {
                        events.extend(self.fail(error));
                        return events;
                    }
                },
                Fragment::Finish(reason) => self.finish_reason = Some(reason),
                Fragment::Usage(usage) => self.usage = Some(usage),
                Fragment::Terminate => {
                    events.extend(self.finish());
                    return events;
                }
                Fragment::Failure { kind, message } => {
                    events.extend(self.fail(StreamError { kind, message }));
                    return events;
                }
            }
        }
        events
    }

    fn apply_tool_call(&mut self, fragment: &ToolCallFragment) -> Result<(), StreamError> {
        match &fragment.id {
            Some(id) => {
                self.tool_calls.push(ToolCall {
                    id: id.clone(),
                    name: fragment.name.clone().unwrap_or_default(),
                    arguments: fragment.args_chunk.clone(),
                });
                Ok(())
            }
            None => {
                let call = self.tool_calls.last_mut().ok_or_else(|| StreamError {
                    kind: ErrorKind::Malformed,
                    message: "tool call fragment arrived before any call id".to_string(),
                })?;
                if let Some(name) = &fragment.name {
                    call.name.push_str(name);
                }
                call.arguments.push_str(&fragment.args_chunk);
                Ok(())
            }
        }
    }

    /// End of body or an explicit terminator.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.is_closed() {
            return Vec::new();
        }
        self.state = StreamState::Closed;
        vec![StreamEvent::Done]
    }

    /// Transport, decode or cancellation failure.
    pub fn fail(&mut self, error: StreamError) -> Vec<StreamEvent> {
        if self.is_closed() {
            return Vec::new();
        }
        self.state = StreamState::Closed;
        vec![StreamEvent::Error(error)]
    }

    /// Everything received so far.
    pub fn response(&self) -> ChatResponse {
        ChatResponse {
            content: ResponseContent::Text(self.text.clone()),
            reasoning: Some(self.reasoning.clone()).filter(|r| !r.is_empty()),
            tool_calls: self.tool_calls.clone(),
            finish_reason: self.finish_reason.clone(),
            usage: self.usage.clone(),
        }
    }
}

/// Cancels one in-flight request. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent. The request's connection is dropped and at most one
    /// `Canceled` error is delivered.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// What the transport hands the reconciler.
#[derive(Debug)]
pub(crate) enum RawItem {
    Data(String),
    Failed(ClientError),
}

pub(crate) type RawStream = Pin<Box<dyn Stream<Item = RawItem> + Send>>;

/// Stream of [`StreamEvent`]s for one request. Ends after the terminal event.
pub struct ChatStream {
    raw: RawStream,
    reconciler: Reconciler,
    pending: VecDeque<StreamEvent>,
    cancel: CancelHandle,
    provider: String,
}

impl ChatStream {
    pub(crate) fn new(dialect: Dialect, raw: RawStream, cancel: CancelHandle, provider: String) -> Self {
        Self {
            raw,
            reconciler: Reconciler::new(dialect),
            pending: VecDeque::new(),
            cancel,
            provider,
        }
    }

    pub fn state(&self) -> StreamState {
        self.reconciler.state()
    }

    /// Aggregate of everything streamed so far.
    pub fn response(&self) -> ChatResponse {
        self.reconciler.response()
    }

    fn close_transport(&mut self) {
        self.raw = Box::pin(stream::empty());
    }

    fn record(&mut self, events: Vec<StreamEvent>) {
        for event in &events {
            if let StreamEvent::Error(error) = event {
                if error.kind == ErrorKind::Canceled {
                    debug!(provider = %self.provider, "stream canceled");
                } else {
                    warn!(provider = %self.provider, kind = ?error.kind, "stream failed: {}", error.message);
                }
            }
        }
        self.pending.extend(events);
        if self.reconciler.is_closed() {
            self.close_transport();
        }
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        loop {
            if this.cancel.is_canceled() && !this.reconciler.is_closed() {
                this.pending.clear();
                let events = this.reconciler.fail(StreamError::from(&ClientError::Canceled));
                this.record(events);
            }
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if this.reconciler.is_closed() {
                return Poll::Ready(None);
            }
            let events = match this.raw.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => this.reconciler.finish(),
                Poll::Ready(Some(RawItem::Data(data))) => this.reconciler.push(&data),
                Poll::Ready(Some(RawItem::Failed(error))) => this.reconciler.fail(StreamError::from(&error)),
            };
            this.record(events);
        }
    }
}

/// The result side of a chat call: exactly one of a buffered response or an
/// event stream.
pub enum ChatReply {
    Buffered(BoxFuture<'static, Result<ChatResponse, ClientError>>),
    Streaming(ChatStream),
}

/// Handle for one chat request.
pub struct ChatHandle {
    reply: ChatReply,
    cancel: CancelHandle,
}

impl ChatHandle {
    pub(crate) fn new(reply: ChatReply, cancel: CancelHandle) -> Self {
        Self { reply, cancel }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.reply, ChatReply::Streaming(_))
    }

    pub fn into_reply(self) -> ChatReply {
        self.reply
    }

    /// Wait for a buffered response.
    ///
    /// For a streamed request this collects the stream and returns the
    /// aggregate, or the terminal error.
    pub async fn response(self) -> Result<ChatResponse, ClientError> {
        match self.reply {
            ChatReply::Buffered(future) => future.await,
            ChatReply::Streaming(mut stream) => {
                while let Some(event) = stream.next().await {
                    match event {
                        StreamEvent::Done => return Ok(stream.response()),
                        StreamEvent::Error(error) => return Err(ClientError::from(error)),
                        _ => {}
                    }
                }
                Ok(stream.response())
            }
        }
    }

    /// Deliver the result through callbacks.
    pub async fn drive<L: ChatListener + ?Sized>(self, listener: &mut L) {
        match self.reply {
            ChatReply::Buffered(future) => match future.await {
                Ok(response) => listener.on_finish(response),
                Err(ClientError::Canceled) => listener.on_cancel(),
                Err(error) => listener.on_error(StreamError::from(&error)),
            },
            ChatReply::Streaming(mut stream) => {
                let mut message = String::new();
                while let Some(event) = stream.next().await {
                    match event {
                        StreamEvent::Text(delta) => {
                            message.push_str(&delta);
                            listener.on_update(&message, &delta);
                        }
                        StreamEvent::Reasoning(delta) => listener.on_reasoning(&delta),
                        StreamEvent::ToolCallFragment(fragment) => listener.on_tool_call(&fragment),
                        StreamEvent::Done => listener.on_finish(stream.response()),
                        StreamEvent::Error(error) if error.kind == ErrorKind::Canceled => listener.on_cancel(),
                        StreamEvent::Error(error) => listener.on_error(error),
                    }
                }
            }
        }
    }
}

/// Callbacks for [`ChatHandle::drive`]. Only `on_finish` is required.
pub trait ChatListener: Send {
    /// Called per text delta with the full message so far.
    fn on_update(&mut self, _message: &str, _delta: &str) {}

    fn on_reasoning(&mut self, _delta: &str) {}

    fn on_tool_call(&mut self, _fragment: &ToolCallFragment) {}

    fn on_finish(&mut self, response: ChatResponse);

    fn on_error(&mut self, _error: StreamError) {}

    fn on_cancel(&mut self) {}
}
