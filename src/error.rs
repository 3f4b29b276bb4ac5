use serde::Serialize;
use thiserror::Error;

/// Classified failure kind. Retry eligibility is a pure function of the
/// kind — retry policy must never be decided anywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Api,
    Auth,
    Timeout,
    RateLimit,
    InvalidRequest,
    Cancelled,
    Unknown,
}

#[derive(Debug, Error)]
pub enum QuillError {
    #[error("network error: {details}")]
    Network { details: String },

    #[error("API error ({status}): {details}")]
    Api { status: u16, details: String },

    #[error("authentication failed ({status}): {details}")]
    Auth { status: u16, details: String },

    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("rate limited: {details}")]
    RateLimited { details: String },

    #[error("invalid request: {details}")]
    InvalidRequest { details: String },

    #[error("request cancelled")]
    Cancelled,

    #[error("unknown error: {details}")]
    Unknown { details: String },
}

impl QuillError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network { .. } => ErrorKind::Network,
            Self::Api { .. } => ErrorKind::Api,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Returns true for transient errors that may succeed on retry.
    /// 5xx = server error (retryable), 4xx = client error (not retryable).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Timeout { .. } => true,
            Self::RateLimited { .. } => true,
            Self::Api { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }

    /// A short message safe to surface in the host UI. Does not leak
    /// endpoint URLs or raw upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network { .. } => "network error — check your connection".to_string(),
            Self::Api { status, .. } => format!("the model API returned an error ({status})"),
            Self::Auth { .. } => "authentication failed — check your API key".to_string(),
            Self::Timeout { elapsed_ms } => format!("request timed out after {elapsed_ms}ms"),
            Self::RateLimited { .. } => "rate limited — try again shortly".to_string(),
            Self::InvalidRequest { details } => format!("invalid request: {details}"),
            Self::Cancelled => "request cancelled".to_string(),
            Self::Unknown { .. } => "request failed".to_string(),
        }
    }

    /// Build an error from a non-success HTTP status plus its body text.
    ///
    /// Retry eligibility here always agrees with what `classify` decides
    /// for the equivalent formatted message. Kinds agree too, with one
    /// deliberate exception: 400/422 observed structurally become
    /// `invalid_request`, while the text classifier only sees a generic
    /// embedded 4xx and reports `api`. Both are non-retryable.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth {
                status,
                details: body,
            },
            429 => Self::RateLimited { details: body },
            400 | 422 => Self::InvalidRequest { details: body },
            _ => Self::Api {
                status,
                details: body,
            },
        }
    }

    /// Normalize an opaque transport error message into a classified error.
    /// Precedence order is load-bearing: an aborted-because-cancelled request
    /// may also mention "timeout" in its message, and cancel must win.
    pub fn classify(details: impl Into<String>) -> Self {
        let details = details.into();
        let lower = details.to_lowercase();

        if lower.contains("cancel") {
            return Self::Cancelled;
        }
        if lower.contains("network") || lower.contains("fetch") {
            return Self::Network { details };
        }
        if lower.contains("timeout") {
            return Self::Timeout { elapsed_ms: 0 };
        }
        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
        {
            let status = if lower.contains("403") || lower.contains("forbidden") {
                403
            } else {
                401
            };
            return Self::Auth { status, details };
        }
        if lower.contains("429") || lower.contains("rate limit") {
            return Self::RateLimited { details };
        }
        if let Some(status) = embedded_status(&lower) {
            return Self::Api { status, details };
        }
        if lower.contains("api error") {
            return Self::Api {
                status: 500,
                details,
            };
        }
        Self::Unknown { details }
    }
}

impl From<reqwest::Error> for QuillError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout { elapsed_ms: 0 }
        } else if e.is_connect() || e.is_request() {
            Self::Network {
                details: e.to_string(),
            }
        } else {
            Self::classify(e.to_string())
        }
    }
}

/// Scan for a standalone 3-digit HTTP status token in 400..=599.
/// "500" in "HTTP 500: oops" matches; the "500" inside "15000ms" does not.
fn embedded_status(lower: &str) -> Option<u16> {
    let bytes = lower.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let mut end = i;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end - i == 3 {
                if let Ok(code) = lower[i..end].parse::<u16>() {
                    if (400..=599).contains(&code) {
                        return Some(code);
                    }
                }
            }
            i = end;
        } else {
            i += 1;
        }
    }
    None
}
