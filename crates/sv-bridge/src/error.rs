//! Error types for the bridge crate.

use thiserror::Error;

use crate::engine::EntryPoint;

/// Status value returned by the engine convention for host-side failures.
pub const STATUS_FAILURE: i32 = -1;

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Foreign allocator returned a null address
    #[error("foreign allocation of {bytes} bytes failed")]
    Alloc {
        /// Requested size in bytes
        bytes: usize,
    },

    /// Engine reported a negative status code
    #[error("{entry} returned status {code}")]
    Engine {
        /// Entry point that failed
        entry: EntryPoint,
        /// Status code, unmodified
        code: i32,
    },

    /// Access outside the foreign memory region
    #[error("foreign memory access out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds {
        /// Start address
        addr: u32,
        /// Length in bytes
        len: usize,
    },

    /// Host buffer sample width does not match the negotiated audio format
    #[error("sample format mismatch: engine renders {expected:?}, buffer holds {actual:?}")]
    FormatMismatch {
        /// Width negotiated at init
        expected: crate::flags::SampleWidth,
        /// Width of the host buffer
        actual: crate::flags::SampleWidth,
    },

    /// Host buffer holds fewer samples than the request needs
    #[error("buffer too small: need {needed} samples, have {actual}")]
    BufferTooSmall {
        /// Samples required
        needed: usize,
        /// Samples available
        actual: usize,
    },

    /// Render requested before `init`
    #[error("engine is not initialized")]
    NotInitialized,

    /// Engine module does not export a required symbol
    #[error("missing export: {0}")]
    MissingExport(String),

    /// WebAssembly runtime error (compile, link, trap)
    #[error("WASM runtime error: {0}")]
    Wasm(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// The integer status a caller following the engine's own convention
    /// would observe for this failure.
    pub fn status(&self) -> i32 {
        match self {
            BridgeError::Engine { code, .. } => *code,
            _ => STATUS_FAILURE,
        }
    }

    /// True if the failure happened on the host side before reaching the engine.
    pub fn is_host_side(&self) -> bool {
        !matches!(self, BridgeError::Engine { .. })
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Map a status-style return value: negative codes become [`BridgeError::Engine`].
pub(crate) fn check_status(entry: EntryPoint, code: i32) -> Result<i32> {
    if code < 0 {
        Err(BridgeError::Engine { entry, code })
    } else {
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_status_passes_through() {
        let err = check_status(EntryPoint::OpenSlot, -7).unwrap_err();
        assert_eq!(err.status(), -7);
        assert!(!err.is_host_side());
    }

    #[test]
    fn test_host_side_status_is_sentinel() {
        let err = BridgeError::Alloc { bytes: 16 };
        assert_eq!(err.status(), STATUS_FAILURE);
        assert!(err.is_host_side());
        assert_eq!(check_status(EntryPoint::Play, 0).unwrap(), 0);
    }
}
