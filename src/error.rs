use std::time::Duration;

/// Error taxonomy shared by every pipeline component.
///
/// The API layer translates `kind()` / `http_status()` into transport
/// responses; nothing below this layer knows about transports.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("expired: {0}")]
    Expired(String),

    /// Timeout, 429, or 5xx from the claims authority. Retried with backoff.
    #[error("transient external error: {message}")]
    TransientExternal {
        message: String,
        retry_after: Option<Duration>,
    },

    /// 4xx validation from the claims authority. Never retried.
    #[error("fatal external error: {0}")]
    FatalExternal(String),

    /// Proof bundle generation failed. Does not affect submission state.
    #[error("render error: {0}")]
    Render(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("scorer error: {0}")]
    Scorer(String),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        PipelineError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        PipelineError::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        PipelineError::TransientExternal {
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn transient_with_retry_after(msg: impl Into<String>, retry_after: Duration) -> Self {
        PipelineError::TransientExternal {
            message: msg.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        PipelineError::Store(msg.into())
    }

    /// Stable kind string included in every API error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Conflict(_) => "conflict",
            PipelineError::Expired(_) => "expired",
            PipelineError::TransientExternal { .. } => "transient_external_error",
            PipelineError::FatalExternal(_) => "fatal_external_error",
            PipelineError::Render(_) => "render_error",
            PipelineError::Store(_) => "store_error",
            PipelineError::Scorer(_) => "scorer_error",
        }
    }

    /// HTTP status the thin API layer maps this kind onto.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineError::Validation(_) => 400,
            PipelineError::NotFound(_) => 404,
            PipelineError::Conflict(_) => 409,
            PipelineError::Expired(_) => 410,
            PipelineError::TransientExternal { .. } => 502,
            PipelineError::FatalExternal(_) => 400,
            PipelineError::Render(_) | PipelineError::Store(_) | PipelineError::Scorer(_) => 500,
        }
    }

    /// Whether the submission engine may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::TransientExternal { .. })
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Store(e.to_string())
    }
}
