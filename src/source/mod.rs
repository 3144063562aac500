//! Readers for every supported transport.
//!
//! Each [`SourceKind`] maps to one [`SourceReader`] implementation. The
//! reader is selected from the tag in the job descriptor, and it yields a
//! byte stream plus its length, when the transport declares one.

mod file;
mod http;
pub(crate) mod registry;
mod s3;
pub(crate) mod tls;
mod upload;

use std::{fmt, io::Read};

use crate::{Context, ImportError, JobDescriptor, SourceKind};

pub(crate) use file::FileSource;
pub(crate) use http::HttpSource;
pub(crate) use registry::RegistrySource;
pub(crate) use s3::ObjectStoreSource;
pub(crate) use upload::UploadSource;

/// Byte stream opened by a [`SourceReader`].
pub struct SourceStream {
    pub reader: Box<dyn Read + Send>,

    /// Number of bytes in the stream, if the source declared it.
    pub length: Option<u64>,
}

impl fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceStream")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Capabilities of a transport.
pub trait SourceReader {
    /// Connect to the source and return its stream.
    fn open(&mut self, ctx: &Context) -> Result<SourceStream, ImportError>;

    /// Release any resource held by the source after the stream is done.
    fn close(&mut self) {}
}

/// Build the reader for the source of `job`.
///
/// Returns `None` for [`SourceKind::None`]: there is nothing to open, and
/// the import creates a blank image.
pub(crate) fn for_job(job: &JobDescriptor) -> Result<Option<Box<dyn SourceReader>>, ImportError> {
    let source: Box<dyn SourceReader> = match job.source {
        SourceKind::None => return Ok(None),
        SourceKind::ObjectStore => Box::new(ObjectStoreSource::new(job)?),
        SourceKind::PublicHttps => Box::new(HttpSource::new(job)?),
        SourceKind::LocalFile => Box::new(FileSource::new(job)),
        SourceKind::Registry => Box::new(RegistrySource::new(job)?),
        SourceKind::Upload => Box::new(UploadSource::new(job)),
    };

    Ok(Some(source))
}
