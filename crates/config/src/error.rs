//! Configuration error types.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    #[diagnostic(code(hearth::config::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Syntax(#[from] kdl::KdlError),

    #[error("missing '{0}' block")]
    #[diagnostic(
        code(hearth::config::missing_block),
        help("add an `acme {{ domain \"example.com\" }}` block")
    )]
    MissingBlock(&'static str),

    #[error("missing required field '{0}'")]
    #[diagnostic(code(hearth::config::missing_field))]
    MissingField(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    #[diagnostic(code(hearth::config::invalid_value))]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
