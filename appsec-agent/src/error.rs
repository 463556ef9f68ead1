use thiserror::Error;

/// Errors that can occur in the application security agent library
#[derive(Error, Debug)]
pub enum AppSecError {
    /// Rule file missing or unparseable - fatal to WAF initialization
    #[error("Configuration load error: {0}")]
    ConfigLoad(String),

    /// The compiled ruleset contains no usable rules
    #[error("Invalid ruleset: {0}")]
    InvalidRuleset(String),

    /// Host value outside the supported encoding set
    #[error("Unsupported type for WAF encoding: {0}")]
    UnsupportedType(String),

    /// Evaluation input was not an address map
    #[error("Invalid WAF input object: {0}")]
    InvalidObject(String),

    /// Invalid argument passed to an evaluation call
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal evaluation failure - logged, treated as no-match
    #[error("WAF engine internal error: {0}")]
    EngineInternal(String),

    /// Remote config integrity check failed - aborts the current poll cycle
    #[error("Remote config verification error: {0}")]
    RemoteConfigVerification(String),

    /// Remote config agent unreachable or returned an error status
    #[error("Remote config transport error: {0}")]
    RemoteConfigTransport(String),

    /// A registered product callback failed - scoped to one config
    #[error("Callback application error for {product}: {message}")]
    CallbackApplication { product: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using AppSecError
pub type Result<T> = std::result::Result<T, AppSecError>;

impl AppSecError {
    /// True for errors that abort one remote-config poll cycle but must not
    /// stop the scheduler.
    pub fn aborts_poll_cycle(&self) -> bool {
        matches!(
            self,
            AppSecError::RemoteConfigVerification(_) | AppSecError::RemoteConfigTransport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppSecError::ConfigLoad("rules.json not found".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration load error: rules.json not found"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AppSecError = io_err.into();
        assert!(matches!(err, AppSecError::Io(_)));
    }

    #[test]
    fn test_cycle_scoped_errors() {
        assert!(AppSecError::RemoteConfigTransport("503".to_string()).aborts_poll_cycle());
        assert!(AppSecError::RemoteConfigVerification("hash".to_string()).aborts_poll_cycle());
        assert!(!AppSecError::CallbackApplication {
            product: "ASM_DATA".to_string(),
            message: "boom".to_string()
        }
        .aborts_poll_cycle());
    }
}
