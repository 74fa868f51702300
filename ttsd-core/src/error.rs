use thiserror::Error;

/// All errors produced by the TTS daemon system, client- and daemon-side.
///
/// Each variant maps one-to-one onto the numeric taxonomy in the external
/// interface: the client library never synthesizes a code not listed
/// there, it only converts engine/IPC codes through this enum.
#[derive(Debug, Error)]
pub enum TtsError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("out of network")]
    NetworkDown,

    #[error("invalid state")]
    InvalidState,

    #[error("invalid voice")]
    InvalidVoice,

    #[error("engine not found")]
    EngineNotFound,

    #[error("timed out")]
    TimedOut,

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("audio policy blocked")]
    AudioPolicyBlocked,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TtsError {
    /// The stable numeric code from the client-visible error table.
    pub fn code(&self) -> i32 {
        match self {
            TtsError::OutOfMemory => -12,       // -ENOMEM
            TtsError::Io(_) => -5,              // -EIO
            TtsError::InvalidParameter(_) => -22, // -EINVAL
            TtsError::NetworkDown => -100,       // -ENETDOWN
            TtsError::InvalidState => -0x0100021,
            TtsError::InvalidVoice => -0x0100022,
            TtsError::EngineNotFound => -0x0100023,
            TtsError::TimedOut => -0x0100024,
            TtsError::OperationFailed(_) => -0x0100025,
            TtsError::AudioPolicyBlocked => -0x0100026,
            TtsError::Other(_) => -0x0100025,
        }
    }

    /// `true` for the one status that the IPC retry policy retries on.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, TtsError::TimedOut)
    }

    /// Converts a wire status code one-to-one back into the taxonomy. Any
    /// code outside the known table still round-trips through
    /// `OperationFailed` rather than panicking — the daemon is trusted not
    /// to emit one, but a client must not crash if it ever does.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TtsError::OperationFailed("unexpected success code".into()),
            -12 => TtsError::OutOfMemory,
            -5 => TtsError::Io(std::io::Error::other("daemon reported I/O error")),
            -22 => TtsError::InvalidParameter("daemon reported invalid parameter".into()),
            -100 => TtsError::NetworkDown,
            -0x0100021 => TtsError::InvalidState,
            -0x0100022 => TtsError::InvalidVoice,
            -0x0100023 => TtsError::EngineNotFound,
            -0x0100024 => TtsError::TimedOut,
            -0x0100026 => TtsError::AudioPolicyBlocked,
            _ => TtsError::OperationFailed(format!("unrecognized status code {code}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, TtsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip_through_from_code() {
        for err in [
            TtsError::InvalidState,
            TtsError::InvalidVoice,
            TtsError::EngineNotFound,
            TtsError::TimedOut,
            TtsError::AudioPolicyBlocked,
            TtsError::NetworkDown,
            TtsError::OutOfMemory,
        ] {
            let code = err.code();
            assert_eq!(TtsError::from_code(code).code(), code);
        }
    }

    #[test]
    fn is_timed_out_only_true_for_timed_out_variant() {
        assert!(TtsError::TimedOut.is_timed_out());
        assert!(!TtsError::InvalidState.is_timed_out());
    }

    #[test]
    fn unrecognized_code_falls_back_to_operation_failed() {
        assert_eq!(
            TtsError::from_code(-999_999).code(),
            TtsError::OperationFailed(String::new()).code()
        );
    }
}
