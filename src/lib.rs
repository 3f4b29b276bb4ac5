//! quill — request lifecycle engine for an LLM note-assistant.
//!
//! The host editor builds a [`request::Request`] (prompt, optional context,
//! optional streaming callback) and hands it to a [`queue::RequestQueue`],
//! which admits at most a configured number of concurrent calls into the
//! [`client::RequestClient`]. The client talks to one OpenAI-compatible
//! chat-completion endpoint with retry, timeout, and cooperative
//! cancellation, and pushes SSE fragments to the caller as they arrive.
//! All failures surface as classified [`error::QuillError`] values.

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod render;
pub mod request;

pub use cancel::CancelToken;
pub use client::RequestClient;
pub use config::Config;
pub use error::{ErrorKind, QuillError};
pub use queue::{QueueStatus, RequestQueue};
pub use request::{Request, RequestSource, Response};
