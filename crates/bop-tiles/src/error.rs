use std::fmt::Display;

/// Errors surfaced by the tile engine.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The swap file has no free range large enough for the request.
    #[error("swap space exhausted: requested {requested} bytes, capacity {capacity}")]
    SwapExhausted { requested: u64, capacity: u64 },
    /// Compression/decompression error.
    #[error("compression error: {0}")]
    Compression(String),
    /// Data read back from swap or a stream did not decode.
    #[error("data corruption: {0}")]
    Corruption(String),
    /// A tile stream header or tile record was malformed.
    #[error("tile stream format error: {0}")]
    Format(String),
    /// Stream and grid disagree on the pixel size.
    #[error("pixel size mismatch: expected {expected}, found {found}")]
    PixelSizeMismatch { expected: usize, found: usize },
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TileError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a compression error from a displayable value.
    pub fn compression<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Compression(msg.to_string())
    }

    /// Create a corruption error from a displayable value.
    pub fn corruption<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Corruption(msg.to_string())
    }

    /// Create a stream format error from a displayable value.
    pub fn format<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Format(msg.to_string())
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }

    /// Whether the error only degrades service (the operation can be skipped
    /// and retried later) rather than indicating bad data.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(self, Self::SwapExhausted { .. } | Self::Io(_))
    }
}

/// Convenience result alias for tile engine operations.
pub type TileResult<T> = Result<T, TileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_render_messages() {
        let err = TileError::format("missing DATA field");
        assert_eq!(err.to_string(), "tile stream format error: missing DATA field");
        let err = TileError::PixelSizeMismatch { expected: 4, found: 3 };
        assert_eq!(err.to_string(), "pixel size mismatch: expected 4, found 3");
    }

    #[test]
    fn classifies_resource_exhaustion() {
        assert!(TileError::SwapExhausted { requested: 10, capacity: 5 }.is_resource_exhaustion());
        assert!(!TileError::corruption("bad lzf").is_resource_exhaustion());
    }
}
