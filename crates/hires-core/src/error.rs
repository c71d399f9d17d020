//! Typed error hierarchy for the upscaler core.
//!
//! Uses `thiserror` for library-grade errors.  Every variant maps to a
//! stable integer code via [`HiresError::error_code`] and to an HTTP-like
//! status via [`HiresError::status`], so a boundary layer can translate each
//! kind into a distinct response without string parsing.
//!
//! # Error codes
//!
//! - 10x: request validation
//! - 11x: batch outcome
//! - 12x: inference
//! - 13x: session lifecycle
//! - 14x: storage / codecs / configuration
//!
//! All codes stay below 256 so the CLI can use them verbatim as exit codes.

use std::path::PathBuf;

/// All errors originating from the upscaler core.
#[derive(Debug, thiserror::Error)]
pub enum HiresError {
    // ── Request validation ───────────────────────────────────────────
    #[error("Invalid model name '{0}'")]
    InvalidModel(String),

    #[error("Scale must be 2, 3, or 4 (got {0})")]
    InvalidScale(u32),

    #[error("No images provided")]
    NoImages,

    #[error("Maximum {limit} images allowed per batch (got {actual})")]
    BatchTooLarge { limit: usize, actual: usize },

    // ── Batch outcome ────────────────────────────────────────────────
    #[error("No valid images were processed ({skipped} skipped)")]
    EmptyBatch { skipped: usize },

    // ── Inference ────────────────────────────────────────────────────
    #[error("Resource exhausted while upscaling {file} (tiling retry also failed): {reason}")]
    ResourceExhausted { file: String, reason: String },

    #[error("Inference failed on {file}: {reason}")]
    Inference { file: String, reason: String },

    #[error("Engine initialization failed for {model}: {reason}")]
    EngineInit { model: String, reason: String },

    #[error("Weights for {model} not found locally at {} and no remote source is configured", .local.display())]
    WeightsUnavailable { model: String, local: PathBuf },

    // ── Session lifecycle ────────────────────────────────────────────
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("File not found: {session}/{name}")]
    ResultNotFound { session: String, name: String },

    /// A batch aborted after `session` was opened; its results stay on disk
    /// until the caller purges them.
    #[error("{source} (session {session} kept; purge it when done)")]
    SessionAborted {
        session: String,
        #[source]
        source: Box<HiresError>,
    },

    // ── Storage / codecs / configuration ─────────────────────────────
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encode error for {file}: {reason}")]
    Encode { file: String, reason: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HiresError {
    /// Wrap an [`std::io::Error`] with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach the session whose results outlive this error.
    pub fn in_session(self, session: impl ToString) -> Self {
        Self::SessionAborted {
            session: session.to_string(),
            source: Box::new(self),
        }
    }

    /// Session left behind by a failed batch, if any.
    pub fn session(&self) -> Option<&str> {
        match self {
            Self::SessionAborted { session, .. } => Some(session.as_str()),
            _ => None,
        }
    }

    /// The failure itself, looking through session context.
    pub fn cause(&self) -> &HiresError {
        match self {
            Self::SessionAborted { source, .. } => source.cause(),
            other => other,
        }
    }

    /// Stable integer error code for structured telemetry and exit codes.
    ///
    /// Session context does not change the code.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::SessionAborted { source, .. } => source.error_code(),
            Self::InvalidModel(_) => 101,
            Self::InvalidScale(_) => 102,
            Self::NoImages => 103,
            Self::BatchTooLarge { .. } => 104,
            Self::EmptyBatch { .. } => 110,
            Self::ResourceExhausted { .. } => 120,
            Self::Inference { .. } => 121,
            Self::EngineInit { .. } => 122,
            Self::WeightsUnavailable { .. } => 123,
            Self::SessionNotFound(_) => 130,
            Self::ResultNotFound { .. } => 131,
            Self::Io { .. } => 140,
            Self::Encode { .. } => 141,
            Self::Archive(_) => 142,
            Self::Config(_) => 143,
        }
    }

    /// HTTP-like status a transport layer should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Self::SessionAborted { source, .. } => source.status(),
            Self::InvalidModel(_) | Self::InvalidScale(_) | Self::NoImages => 400,
            Self::BatchTooLarge { .. } => 413,
            Self::EmptyBatch { .. } => 422,
            Self::ResourceExhausted { .. } => 503,
            Self::SessionNotFound(_) | Self::ResultNotFound { .. } => 404,
            Self::Inference { .. }
            | Self::EngineInit { .. }
            | Self::WeightsUnavailable { .. }
            | Self::Io { .. }
            | Self::Encode { .. }
            | Self::Archive(_)
            | Self::Config(_) => 500,
        }
    }

    /// Whether the caller (not the service) is at fault.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status())
    }

    /// Short machine-readable kind label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionAborted { source, .. } => source.kind(),
            Self::InvalidModel(_) => "invalid_model",
            Self::InvalidScale(_) => "invalid_scale",
            Self::NoImages => "no_images",
            Self::BatchTooLarge { .. } => "batch_too_large",
            Self::EmptyBatch { .. } => "empty_batch",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::Inference { .. } => "inference",
            Self::EngineInit { .. } => "engine_init",
            Self::WeightsUnavailable { .. } => "weights_unavailable",
            Self::SessionNotFound(_) => "session_not_found",
            Self::ResultNotFound { .. } => "result_not_found",
            Self::Io { .. } => "io",
            Self::Encode { .. } => "encode",
            Self::Archive(_) => "archive",
            Self::Config(_) => "config",
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, HiresError>;
