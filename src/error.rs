use std::{fmt, io};

/// Terminal failure of an import job.
///
/// Every variant carries a human readable context. The process exit code
/// does not distinguish between kinds; the kind is only visible in logs.
#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    #[error("Invalid source/content-type combination: {0}")]
    InvalidCombination(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Archive must contain exactly one disk image: {0}")]
    AmbiguousArchiveContents(String),

    #[error("Corrupt source: {0}")]
    CorruptSource(String),

    #[error("Insufficient space: {0}")]
    InsufficientSpace(String),

    #[error("Invalid size {0:?}: {1}")]
    SizeParse(String, &'static str),

    #[error("Write failed on {0}: {1}")]
    WriteFailure(String, io::Error),

    #[error("Cannot measure available space in {0}: {1}")]
    SpaceUnknown(String, io::Error),
}

impl ImportError {
    /// Name of the failure kind, for log entries.
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::InvalidCombination(_) => "InvalidCombination",
            ImportError::SourceUnavailable(_) => "SourceUnavailable",
            ImportError::UnsupportedFormat(_) => "UnsupportedFormat",
            ImportError::AmbiguousArchiveContents(_) => "AmbiguousArchiveContents",
            ImportError::CorruptSource(_) => "CorruptSource",
            ImportError::InsufficientSpace(_) => "InsufficientSpace",
            ImportError::SizeParse(..) => "SizeParseError",
            ImportError::WriteFailure(..) => "WriteFailure",
            ImportError::SpaceUnknown(..) => "SpaceUnknown",
        }
    }

    pub(crate) fn write(path: impl fmt::Display, error: io::Error) -> Self {
        ImportError::WriteFailure(path.to_string(), error)
    }

    /// Classify an error produced while reading from a decoded stream.
    ///
    /// Decoders report their own format errors as `io::Error`. Those
    /// with a wrapped [`ImportError`] (see [`into_io`](Self::into_io))
    /// are unwrapped, and everything else is a corrupt source.
    pub(crate) fn from_read(error: io::Error) -> Self {
        if error
            .get_ref()
            .is_some_and(|e| e.is::<ImportError>())
        {
            if let Some(inner) = error.into_inner() {
                if let Ok(e) = inner.downcast::<ImportError>() {
                    return *e;
                }
            }

            return ImportError::CorruptSource("unknown decoder error".into());
        }

        ImportError::CorruptSource(error.to_string())
    }

    /// Wrap this error in an `io::Error`, so it can cross a `Read`
    /// implementation without losing its kind.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

#[test]
fn errors_cross_read_boundaries() {
    let err = ImportError::UnsupportedFormat("vmdk".into()).into_io();
    assert!(matches!(
        ImportError::from_read(err),
        ImportError::UnsupportedFormat(f) if f == "vmdk"
    ));

    let err = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
    let err = ImportError::from_read(err);
    assert_eq!(err.kind(), "CorruptSource");
}
