use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Which of the three run outputs an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Documents,
    Relational,
    CategoryIndex,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputKind::Documents => "document store",
            OutputKind::Relational => "relational store",
            OutputKind::CategoryIndex => "category index",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A record abandoned by the parser. `title` is whatever had been read so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRecord {
    pub title: Option<String>,
    pub reason: String,
}

impl fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.title {
            Some(t) => write!(f, "{} (title {:?})", self.reason, t),
            None => f.write_str(&self.reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot read {path}: {source}")]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported dump format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("malformed record: {0}")]
    MalformedRecord(MalformedRecord),

    #[error("{output} failed: {source}")]
    Persistence {
        output: OutputKind,
        #[source]
        source: StoreError,
    },

    #[error("no dump files found under {root}")]
    NoInput { root: PathBuf },
}

impl PipelineError {
    pub fn file_access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::FileAccess {
            path: path.into(),
            source,
        }
    }

    pub fn persistence(output: OutputKind, source: impl Into<StoreError>) -> Self {
        PipelineError::Persistence {
            output,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::FileAccess { .. } | PipelineError::NoInput { .. } => {
                ErrorKind::FileAccess
            }
            PipelineError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            PipelineError::MalformedRecord(_) => ErrorKind::MalformedRecord,
            PipelineError::Persistence { .. } => ErrorKind::Persistence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FileAccess,
    UnsupportedFormat,
    MalformedRecord,
    Persistence,
}

/// Per-kind tallies of recoverable errors seen during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub file_access: usize,
    pub unsupported_format: usize,
    pub malformed_record: usize,
    pub persistence: usize,
}

impl ErrorCounts {
    pub fn record(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::FileAccess => self.file_access += 1,
            ErrorKind::UnsupportedFormat => self.unsupported_format += 1,
            ErrorKind::MalformedRecord => self.malformed_record += 1,
            ErrorKind::Persistence => self.persistence += 1,
        }
    }

    pub fn merge(&mut self, other: &ErrorCounts) {
        self.file_access += other.file_access;
        self.unsupported_format += other.unsupported_format;
        self.malformed_record += other.malformed_record;
        self.persistence += other.persistence;
    }

    pub fn total(&self) -> usize {
        self.file_access + self.unsupported_format + self.malformed_record + self.persistence
    }
}
