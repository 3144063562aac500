use std::{fs::File, path::PathBuf};

use crate::{Context, ImportError, JobDescriptor};

use super::{SourceReader, SourceStream};

/// Source for images already present in the local filesystem.
pub(crate) struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// The endpoint can be a path, or a `file://` URL.
    pub fn new(job: &JobDescriptor) -> Self {
        let path = url::Url::parse(&job.endpoint)
            .ok()
            .filter(|u| u.scheme() == "file")
            .and_then(|u| u.to_file_path().ok())
            .unwrap_or_else(|| PathBuf::from(&job.endpoint));

        FileSource { path }
    }
}

impl SourceReader for FileSource {
    fn open(&mut self, ctx: &Context) -> Result<SourceStream, ImportError> {
        let _enter = ctx.span.enter();

        let unavailable =
            |e: std::io::Error| ImportError::SourceUnavailable(format!("{}: {e}", self.path.display()));

        let file = File::open(&self.path).map_err(unavailable)?;
        let metadata = file.metadata().map_err(unavailable)?;

        if metadata.is_dir() {
            return Err(ImportError::SourceUnavailable(format!(
                "{} is a directory",
                self.path.display()
            )));
        }

        tracing::info!(path = %self.path.display(), length = metadata.len(), "Reading local file.");

        Ok(SourceStream {
            reader: Box::new(file),
            length: metadata.is_file().then_some(metadata.len()),
        })
    }
}

#[test]
fn file_urls_and_paths() {
    let mut job = crate::JobDescriptor::default();

    job.endpoint = "file:///var/images/disk.img".into();
    assert_eq!(FileSource::new(&job).path, PathBuf::from("/var/images/disk.img"));

    job.endpoint = "relative/disk.img".into();
    assert_eq!(FileSource::new(&job).path, PathBuf::from("relative/disk.img"));
}

#[test]
fn missing_file_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();

    let mut job = crate::JobDescriptor::default();
    job.endpoint = dir.path().join("missing.img").display().to_string();

    let result = FileSource::new(&job).open(&Context::new(crate::Progress::new()));
    assert!(matches!(result, Err(ImportError::SourceUnavailable(_))));
}
