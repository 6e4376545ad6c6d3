//! Error types shared by the store, the mutator and the layer pipeline.
use std::fmt;
use thiserror::Error;

/// The pipeline stage an error surfaced from.
///
/// Used by [`Error::Stage`] so the top-level caller can tell which step of a
/// repack failed without every stage inventing its own message format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OpenStore,
    ReadBundle,
    ParseBaseline,
    ComputeDiff,
    GenerateLayer,
    AddLayer,
    Commit,
    PublishReference,
    RefreshBundle,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OpenStore => "open store",
            Self::ReadBundle => "read bundle metadata",
            Self::ParseBaseline => "parse baseline",
            Self::ComputeDiff => "compute filesystem diff",
            Self::GenerateLayer => "generate diff layer",
            Self::AddLayer => "add diff layer",
            Self::Commit => "commit mutated image",
            Self::PublishReference => "publish reference",
            Self::RefreshBundle => "refresh bundle metadata",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// A digest, reference name or path does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored object is structurally invalid
    #[error("invalid image detected: {0}")]
    Invalid(String),

    /// A descriptor carries a media type we do not understand
    #[error("unknown media type: {0}")]
    UnknownType(String),

    /// The backing store cannot perform the requested operation
    #[error("operation not implemented: {0}")]
    NotImplemented(String),

    /// The operation would overwrite an existing object with different content
    #[error("operation would clobber existing object: {0}")]
    Clobber(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("engine has been closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error wrapped with the pipeline stage it came from
    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Strips any [`Error::Stage`] wrappers and returns the underlying error.
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_unknown_type(&self) -> bool {
        matches!(self.root(), Self::UnknownType(_))
    }

    /// The first stage this error was wrapped with, if any.
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Attach a [`Stage`] to the error side of a result.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T, E: Into<Error>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|e| Error::Stage {
            stage,
            source: Box::new(e.into()),
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
