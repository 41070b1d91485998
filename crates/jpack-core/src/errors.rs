use std::{io, path::PathBuf};

use jpack_manifest::ManifestError;
use thiserror::Error;

use crate::classfile::ClassFileError;

pub type Result<T> = std::result::Result<T, PackError>;

/// Canonical error enumeration for the packaging core.
#[derive(Debug, Error)]
pub enum PackError {
    /// A partial manifest or manifest attribute was rejected.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The policy engine itself failed while scanning a directory.
    #[error("restricted API scan of {} failed: {message}", .dir.display())]
    ScanInternal { dir: PathBuf, message: String },

    /// Restricted APIs were used and failures are not ignored.
    #[error("Restricted APIs were detected - see https://tiny.cc/jenkins-restricted\n{report}")]
    RestrictedApiViolation { report: String },

    /// A version could not be derived from git history.
    #[error("git version for {} failed: {message}", .root.display())]
    GitVersion { root: PathBuf, message: String },

    #[error("multiple legacy hudson.Plugin subclasses: {}", .0.join(", "))]
    MultiplePluginClasses(Vec<String>),

    #[error("invalid class file {}: {source}", .path.display())]
    ClassFile {
        path: PathBuf,
        #[source]
        source: ClassFileError,
    },

    #[error("io error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PackError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PackError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn scan(dir: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        PackError::ScanInternal {
            dir: dir.into(),
            message: message.into(),
        }
    }
}
