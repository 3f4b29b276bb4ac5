use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

use crate::cancel::CancelToken;

/// Which host surface produced a request. Informational at this layer —
/// it never affects client or queue behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSource {
    Editor,
    Canvas,
}

/// Fragment callback: invoked zero or more times, synchronously, in arrival
/// order, before the final Response is produced. Shared so the request can
/// move into a queue task while the UI keeps no handle.
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One model invocation. Immutable once handed to the client or queue.
#[derive(Clone)]
pub struct Request {
    /// Caller-assigned unique id; the map key across client, queue, and
    /// renderer.
    pub id: String,
    pub prompt: String,
    /// Injected as a leading system message ("Context: ...") when present.
    pub context: Option<String>,
    /// Creation time, informational only.
    pub timestamp: SystemTime,
    pub source: RequestSource,
    pub cancel_token: Option<CancelToken>,
    /// When true the client delivers incremental fragments via `on_stream`.
    pub stream: bool,
    pub on_stream: Option<StreamCallback>,
}

impl Request {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            context: None,
            timestamp: SystemTime::now(),
            source: RequestSource::Editor,
            cancel_token: None,
            stream: false,
            on_stream: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_source(mut self, source: RequestSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    /// Enable streaming delivery through the given callback.
    pub fn with_stream(mut self, on_stream: StreamCallback) -> Self {
        self.stream = true;
        self.on_stream = Some(on_stream);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel_token
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("prompt", &self.prompt)
            .field("context", &self.context)
            .field("source", &self.source)
            .field("stream", &self.stream)
            .field("has_on_stream", &self.on_stream.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Successful outcome of one request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Echoes `Request.id`.
    pub id: String,
    /// Full text; equals the concatenation of all streamed fragments when
    /// streaming was used.
    pub content: String,
    pub model: String,
    #[serde(skip)]
    pub timestamp: SystemTime,
    pub tokens_used: Option<u64>,
    pub finish_reason: Option<String>,
}
