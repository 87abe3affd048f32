use crate::backup::result_error::{WithDebugObjectAndFnName, WithMsg};
use derive_more::Display;
use itertools::Itertools;
use std::fmt::Debug;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    StripPrefix(#[from] std::path::StripPrefixError),
    #[error(transparent)]
    WalkDir(#[from] walkdir::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Globset(#[from] globset::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error("{0:?} not found")]
    NotFound(PathBuf),
    #[error("Backup metadata {path:?} cannot be parsed: {reason}")]
    CorruptState { path: PathBuf, reason: String },
    #[error("Archive {path:?} is corrupt: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },
    #[error("Archive {path:?} entry {entry:?} cannot be decrypted: {reason}")]
    Authentication {
        path: PathBuf,
        entry: String,
        reason: String,
    },
    #[error("Archive {path:?} entry {entry:?} escapes the restore directory")]
    PathTraversal { path: PathBuf, entry: String },
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{:?} {} failed:\n{}", obj_debug, fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithDebugObjAndFnName {
        error: Box<Error>,
        obj_debug: Box<dyn Debug + Send>,
        fn_name: String,
    },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

/// Failure classes reported to whoever renders errors to the operator.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    #[display("io")]
    Io,
    #[display("not_found")]
    NotFound,
    #[display("corrupt_state")]
    CorruptState,
    #[display("corrupt_archive")]
    CorruptArchive,
    #[display("authentication")]
    Authentication,
    #[display("path_traversal")]
    PathTraversal,
    #[display("configuration")]
    Configuration,
    #[display("internal")]
    Internal,
}

impl<S: Into<String>, O: Debug + Send + 'static> WithDebugObjectAndFnName<S, O> for Error {
    fn with_debug_object_and_fn_name(self, obj: O, fn_name: S) -> Self {
        Error::WithDebugObjAndFnName {
            error: Box::new(self),
            obj_debug: Box::new(obj),
            fn_name: fn_name.into(),
        }
    }
}

impl<S: Into<String>> WithMsg<S> for Error {
    fn with_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    pub fn chain(self, other: Error) -> Error {
        Error::LotsOfError(self.into_iter().chain(other.into_iter()).collect_vec())
    }

    /// Classifies the error, looking through context wrappers.
    ///
    /// An aggregate reports the first non-io category it contains, so one
    /// corrupt archive among skipped files is not hidden.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io(_) | Error::StripPrefix(_) | Error::WalkDir(_) | Error::Notify(_) => {
                ErrorCategory::Io
            }
            Error::Zip(zip::result::ZipError::Io(_)) => ErrorCategory::Io,
            Error::Zip(zip::result::ZipError::InvalidPassword) => ErrorCategory::Authentication,
            Error::Zip(_) => ErrorCategory::CorruptArchive,
            Error::Globset(_) | Error::ValidationError(_) | Error::Configuration(_) => {
                ErrorCategory::Configuration
            }
            Error::SerdeJson(_) | Error::ThreadPoolBuildError(_) => ErrorCategory::Internal,
            Error::NotFound(_) => ErrorCategory::NotFound,
            Error::CorruptState { .. } => ErrorCategory::CorruptState,
            Error::CorruptArchive { .. } => ErrorCategory::CorruptArchive,
            Error::Authentication { .. } => ErrorCategory::Authentication,
            Error::PathTraversal { .. } => ErrorCategory::PathTraversal,
            Error::WithMsg { error, .. } => error.category(),
            Error::WithDebugObjAndFnName { error, .. } => error.category(),
            Error::LotsOfError(errors) => errors
                .iter()
                .map(Error::category)
                .find(|c| *c != ErrorCategory::Io)
                .unwrap_or(ErrorCategory::Io),
        }
    }
}
