use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Run-level and configuration-level failures.
///
/// Per-unit failures (bad descriptor, missing dependency, crash, timeout) never
/// surface here; they are recorded as diagnostics and the run continues.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Discovery root unreadable: {path}: {reason}")]
    UnreadableRoot { path: String, reason: String },

    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("No runnable units in execution plan ({excluded} excluded)")]
    NothingRunnable { excluded: usize },

    #[error("Plugin error: {0}")]
    Plugin(#[from] crate::plugin::PluginError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid file context: {0}")]
    FileContext(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn unreadable_root<E: std::fmt::Display>(path: &std::path::Path, e: E) -> Self {
        Self::UnreadableRoot {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }

    /// Category of this error in the diagnostics taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            OrchestratorError::NothingRunnable { .. } => ErrorCategory::Dependency,
            _ => ErrorCategory::Configuration,
        }
    }
}

/// Failure taxonomy shared by diagnostics and run-level errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A unit's descriptor or callable failed to load
    Discovery,
    /// A declared dependency is missing or cyclic
    Dependency,
    /// A unit's callable raised during execution
    Runtime,
    /// A unit exceeded its time budget
    Timeout,
    /// The caller aborted the run
    Cancelled,
    /// Unreadable roots, bad config, unknown tier
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Discovery => "discovery",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Configuration => "configuration",
        }
    }

}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_display_matches_serde() {
        for category in [
            ErrorCategory::Discovery,
            ErrorCategory::Dependency,
            ErrorCategory::Runtime,
            ErrorCategory::Timeout,
            ErrorCategory::Cancelled,
            ErrorCategory::Configuration,
        ] {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category));
        }
    }

    #[test]
    fn test_error_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
    }

    #[test]
    fn test_run_level_error_categories() {
        let err = OrchestratorError::NothingRunnable { excluded: 3 };
        assert_eq!(err.category(), ErrorCategory::Dependency);
        assert!(err.to_string().contains("3 excluded"));

        let err = OrchestratorError::UnknownTier("gold".to_string());
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
