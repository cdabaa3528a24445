//! Error types surfaced by sinks, players and content
//!
//! `ErrorKind` is the plain discriminant carried by the players' `error`
//! signal; `MediaError` is the rich error used for internal propagation.

use std::fmt;

/// Category of a media error, as delivered on the `error` signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No renderer matches the negotiated caps
    NotNegotiated,
    /// The decoding pipeline reported an error
    Decoding,
    /// URI could not be parsed or the source is unreachable
    IoOrUri,
    /// Out-of-range index or invalid region
    InvalidArgument,
    /// The requested element is not present in the pipeline
    NotSupported,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotNegotiated => "not-negotiated",
            ErrorKind::Decoding => "decoding",
            ErrorKind::IoOrUri => "io-or-uri",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::NotSupported => "not-supported",
        };
        f.write_str(name)
    }
}

/// Errors from the media bridge
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    #[error("caps not negotiated: {0}")]
    NotNegotiated(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("invalid uri or unreachable source: {0}")]
    IoOrUri(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl MediaError {
    /// Map the error onto the kind delivered with the `error` signal
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::NotNegotiated(_) => ErrorKind::NotNegotiated,
            MediaError::Decoding(_) | MediaError::Gpu(_) => ErrorKind::Decoding,
            MediaError::IoOrUri(_) | MediaError::Io(_) | MediaError::Config(_) => ErrorKind::IoOrUri,
            MediaError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MediaError::NotSupported(_) => ErrorKind::NotSupported,
        }
    }

    /// Build an error of the given kind
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotNegotiated => MediaError::NotNegotiated(message),
            ErrorKind::Decoding => MediaError::Decoding(message),
            ErrorKind::IoOrUri => MediaError::IoOrUri(message),
            ErrorKind::InvalidArgument => MediaError::InvalidArgument(message),
            ErrorKind::NotSupported => MediaError::NotSupported(message),
        }
    }

    /// The message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            MediaError::NotNegotiated(m)
            | MediaError::Decoding(m)
            | MediaError::IoOrUri(m)
            | MediaError::InvalidArgument(m)
            | MediaError::NotSupported(m)
            | MediaError::Gpu(m)
            | MediaError::Config(m)
            | MediaError::Io(m) => m,
        }
    }
}

impl From<std::io::Error> for MediaError {
    fn from(err: std::io::Error) -> Self {
        MediaError::Io(err.to_string())
    }
}

impl From<quick_xml::DeError> for MediaError {
    fn from(err: quick_xml::DeError) -> Self {
        MediaError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ErrorKind::NotNegotiated,
            ErrorKind::Decoding,
            ErrorKind::IoOrUri,
            ErrorKind::InvalidArgument,
            ErrorKind::NotSupported,
        ] {
            assert_eq!(MediaError::from_kind(kind, "x").kind(), kind);
        }
    }

    #[test]
    fn test_gpu_errors_surface_as_decoding() {
        let err = MediaError::Gpu("context lost".into());
        assert_eq!(err.kind(), ErrorKind::Decoding);
        assert_eq!(err.message(), "context lost");
        assert_eq!(err.to_string(), "GPU error: context lost");
    }
}
