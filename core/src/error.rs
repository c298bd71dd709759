use thiserror::Error;

/// ocifold error types
#[derive(Error, Debug)]
pub enum FoldError {
    /// Image reference could not be parsed
    #[error("Invalid reference: {0}")]
    Reference(String),

    /// Reading a manifest, config, or blob failed
    #[error("Read failed: {subject} - {message}")]
    Read { subject: String, message: String },

    /// Node is neither image-shaped nor index-shaped
    #[error("Unsupported media type for {subject}: {media_type}")]
    UnsupportedMediaType { subject: String, media_type: String },

    /// Layer blob upload failed
    #[error("Upload failed: {digest} - {message}")]
    Upload { digest: String, message: String },

    /// Writing an image to a local layout failed
    #[error("Commit failed: {subject} - {message}")]
    Commit { subject: String, message: String },

    /// Pushing a manifest tree failed
    #[error("Push failed: {reference} - {message}")]
    Push { reference: String, message: String },

    /// Index nesting exceeded the configured ceiling
    #[error("Max depth exceeded: {depth}")]
    MaxDepthExceeded { depth: usize },

    /// No image in the tree matched the requested platform
    #[error("Cannot find image for platform {platform}")]
    PlatformNotFound { platform: String },

    /// Destination would overwrite the source being read
    #[error("Destructive operation: source and destination are both {path}")]
    DestructiveWrite { path: String },

    /// A streaming layer was asked for its digest before being consumed
    #[error("Layer digest is not known until the layer stream has been consumed")]
    LayerNotFinalized,

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for FoldError {
    fn from(err: serde_json::Error) -> Self {
        FoldError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for FoldError {
    fn from(err: serde_yaml::Error) -> Self {
        FoldError::Serialization(err.to_string())
    }
}

impl FoldError {
    /// Shorthand for a [`FoldError::Read`] with the given subject.
    pub fn read(subject: impl Into<String>, message: impl std::fmt::Display) -> Self {
        FoldError::Read {
            subject: subject.into(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for ocifold operations
pub type Result<T> = std::result::Result<T, FoldError>;
