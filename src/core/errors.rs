//! DRIFT-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DriftError>;

/// Top-level error type for the drift agent.
#[derive(Debug, Error)]
pub enum DriftError {
    #[error("[DRIFT-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DRIFT-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[DRIFT-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DRIFT-1101] invalid drift definition: {details}")]
    InvalidDefinition { details: String },

    #[error("[DRIFT-2001] malformed change-set at line {line}: {details}")]
    ChangeSetFormat { line: usize, details: String },

    #[error("[DRIFT-2002] change-set cannot be encoded: {details}")]
    InvalidChangeSet { details: String },

    #[error("[DRIFT-2003] bundle archive failure at {path}: {details}")]
    Archive { path: PathBuf, details: String },

    #[error("[DRIFT-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DRIFT-3001] base directory does not exist: {path}")]
    MissingBaseDirectory { path: PathBuf },

    #[error("[DRIFT-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DRIFT-3003] stream IO failure in {context}: {source}")]
    StreamIo {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("[DRIFT-3004] transport failure: {details}")]
    Transport { details: String },

    #[error("[DRIFT-3005] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[DRIFT-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DriftError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DRIFT-1001",
            Self::MissingConfig { .. } => "DRIFT-1002",
            Self::ConfigParse { .. } => "DRIFT-1003",
            Self::InvalidDefinition { .. } => "DRIFT-1101",
            Self::ChangeSetFormat { .. } => "DRIFT-2001",
            Self::InvalidChangeSet { .. } => "DRIFT-2002",
            Self::Archive { .. } => "DRIFT-2003",
            Self::Serialization { .. } => "DRIFT-2101",
            Self::MissingBaseDirectory { .. } => "DRIFT-3001",
            Self::Io { .. } => "DRIFT-3002",
            Self::StreamIo { .. } => "DRIFT-3003",
            Self::Transport { .. } => "DRIFT-3004",
            Self::ChannelClosed { .. } => "DRIFT-3005",
            Self::Runtime { .. } => "DRIFT-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::StreamIo { .. }
                | Self::Transport { .. }
                | Self::ChannelClosed { .. }
                | Self::MissingBaseDirectory { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for format errors.
    #[must_use]
    pub fn format(line: usize, details: impl Into<String>) -> Self {
        Self::ChangeSetFormat {
            line,
            details: details.into(),
        }
    }

    /// Convenience constructor for zip failures tied to a bundle path.
    #[must_use]
    pub fn archive(path: impl AsRef<Path>, err: impl std::fmt::Display) -> Self {
        Self::Archive {
            path: path.as_ref().to_path_buf(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DriftError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<zip::result::ZipError> for DriftError {
    fn from(value: zip::result::ZipError) -> Self {
        Self::Archive {
            path: PathBuf::new(),
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DriftError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<toml::ser::Error> for DriftError {
    fn from(value: toml::ser::Error) -> Self {
        Self::Serialization {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_of_each() -> Vec<DriftError> {
        vec![
            DriftError::InvalidConfig {
                details: String::new(),
            },
            DriftError::MissingConfig {
                path: PathBuf::new(),
            },
            DriftError::ConfigParse {
                context: "",
                details: String::new(),
            },
            DriftError::InvalidDefinition {
                details: String::new(),
            },
            DriftError::format(1, ""),
            DriftError::InvalidChangeSet {
                details: String::new(),
            },
            DriftError::archive("", ""),
            DriftError::Serialization {
                context: "",
                details: String::new(),
            },
            DriftError::MissingBaseDirectory {
                path: PathBuf::new(),
            },
            DriftError::io("", std::io::Error::other("test")),
            DriftError::StreamIo {
                context: "",
                source: std::io::Error::other("test"),
            },
            DriftError::Transport {
                details: String::new(),
            },
            DriftError::ChannelClosed { component: "" },
            DriftError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = one_of_each();
        let codes: Vec<&str> = errors.iter().map(DriftError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_display_includes_code() {
        for err in one_of_each() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain error code: {msg}"
            );
        }
    }

    #[test]
    fn format_errors_carry_line_number() {
        let err = DriftError::format(7, "declared 2 files, found 1");
        let msg = err.to_string();
        assert!(msg.contains("line 7"), "{msg}");
        assert!(msg.contains("declared 2 files"), "{msg}");
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(DriftError::io("/x", std::io::Error::other("t")).is_retryable());
        assert!(
            DriftError::Transport {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            DriftError::MissingBaseDirectory {
                path: PathBuf::new()
            }
            .is_retryable()
        );

        assert!(!DriftError::format(1, "bad").is_retryable());
        assert!(
            !DriftError::InvalidDefinition {
                details: String::new()
            }
            .is_retryable()
        );
        assert!(
            !DriftError::InvalidConfig {
                details: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = DriftError::io(
            "/tmp/test.txt",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "DRIFT-3002");
        assert!(err.to_string().contains("/tmp/test.txt"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: DriftError = json_err.into();
        assert_eq!(err.code(), "DRIFT-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: DriftError = toml_err.into();
        assert_eq!(err.code(), "DRIFT-1003");
    }
}
