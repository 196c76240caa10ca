use std::io;
use std::path::{Path, PathBuf};

/// Result type alias for cloud file I/O.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the chunked cloud codec.
///
/// Every variant names the offending file. Per-record anomalies (clamped
/// values, degenerate normals) are deliberately NOT errors: they are
/// recovered locally with documented fallbacks and at most one aggregated
/// warning per session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying open/read/write failure.
    #[error("{}: I/O error: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The header text is malformed (missing magic, bad counts, list
    /// property inside the vertex element, missing end_header, ...).
    #[error("{}: invalid header: {reason}", path.display())]
    HeaderParse { path: PathBuf, reason: String },

    /// The file declares a format other than binary_little_endian 1.0.
    /// ASCII and big-endian clouds are rejected here, never misparsed.
    #[error("{}: unsupported format `{found}` (only binary_little_endian 1.0 is supported)", path.display())]
    UnsupportedFormat { path: PathBuf, found: String },

    /// A vertex property uses a scalar type outside the standard registry.
    /// Skipping it would silently corrupt every subsequent field offset,
    /// so it is a hard error.
    #[error("{}: property `{property}` has unknown scalar type `{type_name}`", path.display())]
    UnknownPropertyType {
        path: PathBuf,
        property: String,
        type_name: String,
    },

    /// The destination does not support seeking back to the record-count
    /// field. The file on disk is structurally valid but its declared
    /// count is wrong.
    #[error("{}: cannot seek back to patch the record count: {source}", path.display())]
    NonSeekableOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The binary payload ends in the middle of a record.
    #[error("{}: payload ends mid-record ({actual} trailing bytes, record is {expected} bytes)", path.display())]
    TruncatedPayload {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    /// Random-access record index beyond the declared count.
    #[error("{}: record index {index} out of range (cloud has {count} records)", path.display())]
    OutOfRangeIndex {
        path: PathBuf,
        index: u64,
        count: u64,
    },
}

impl Error {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn header(path: &Path, reason: impl Into<String>) -> Self {
        Error::HeaderParse {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}
