use thiserror::Error;

/// Errors raised while reading, building or encoding manifest data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// A manifest document could not be parsed.
    #[error("malformed manifest at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("invalid attribute name `{0}`")]
    InvalidName(String),

    #[error("value of attribute `{name}` must not contain line breaks or NUL")]
    InvalidValue { name: String },

    /// Two dependency edges share a name but disagree on version or optionality.
    #[error("plugin dependency `{name}` is declared twice (`{first}` and `{second}`)")]
    DuplicateDependency {
        name: String,
        first: String,
        second: String,
    },

    #[error("invalid plugin dependency: {0}")]
    InvalidDependency(String),
}

impl ManifestError {
    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        ManifestError::Malformed {
            line,
            reason: reason.into(),
        }
    }
}
