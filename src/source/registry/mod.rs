//! Source for disk images distributed as container images.
//!
//! The image must contain a single regular file under the `disk/`
//! directory, in any of its layers. That file is the disk image. It is
//! copied to an unnamed file in the scratch directory, and that file is
//! the stream returned to the pipeline.

mod client;
mod manifests;
mod mediatype;
mod reference;

use std::{
    fs::File,
    io::{self, Read, Seek},
    path::{Path, PathBuf},
};

use crate::{
    fs::{normalize_path, Directory},
    source::{http::basic_auth, tls},
    Context, ImportError, JobDescriptor,
};

use self::{
    client::{Client, HttpError},
    manifests::Blob,
    mediatype::MediaType,
    reference::{ParseError, Reference},
};

use super::{SourceReader, SourceStream};

/// Directory, inside the container image, for the disk image.
const DISK_DIRECTORY: &str = "/disk";

#[derive(thiserror::Error, Debug)]
pub(crate) enum RegistryError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] HttpError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid digest: {0}")]
    InvalidDigest(#[from] crate::digest::DigestError),

    #[error("Invalid reference: {0}")]
    InvalidReference(#[from] ParseError),

    #[error("Missing or invalid Content-Type.")]
    MissingContentType,

    #[error("Invalid Content-Type: {0}")]
    InvalidContentType(MediaType),

    #[error("No image for the architecture.")]
    MissingArchitecture,
}

impl From<RegistryError> for ImportError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::HttpRequest(_)
            | RegistryError::InvalidReference(_)
            | RegistryError::MissingArchitecture => ImportError::SourceUnavailable(error.to_string()),

            RegistryError::Json(_) | RegistryError::InvalidDigest(_) => {
                ImportError::CorruptSource(error.to_string())
            }

            RegistryError::MissingContentType | RegistryError::InvalidContentType(_) => {
                ImportError::UnsupportedFormat(error.to_string())
            }
        }
    }
}

pub(crate) struct RegistrySource {
    endpoint: String,
    agent: ureq::Agent,
    credentials: Option<String>,
    scratch_dir: PathBuf,
}

impl RegistrySource {
    pub fn new(job: &JobDescriptor) -> Result<Self, ImportError> {
        Reference::try_from(job.endpoint.as_str()).map_err(RegistryError::from)?;

        Ok(RegistrySource {
            endpoint: job.endpoint.clone(),
            agent: tls::agent(job.cert_dir.as_deref(), job.insecure_tls)?,
            credentials: job
                .access_key
                .as_deref()
                .zip(job.secret_key.as_deref())
                .map(|(user, password)| basic_auth(user, password)),
            scratch_dir: job.scratch_dir.clone(),
        })
    }
}

impl SourceReader for RegistrySource {
    fn open(&mut self, ctx: &Context) -> Result<SourceStream, ImportError> {
        let _enter = ctx.span.enter();

        let reference = Reference::try_from(self.endpoint.as_str()).map_err(RegistryError::from)?;
        tracing::info!(%reference, "Pulling container image.");

        let client = Client::new(&reference, self.agent.clone(), self.credentials.clone());
        let manifest = manifests::get(&reference, &client)?;

        let scratch = Directory::new(self.scratch_dir.as_path())
            .map_err(|e| ImportError::write(self.scratch_dir.display(), e.into()))?;

        let mut disk: Option<(File, PathBuf)> = None;

        for blob in &manifest.layers {
            tracing::debug!(digest = blob.digest.as_str(), size = blob.size, "Scanning layer.");
            scan_layer(&client, blob, &scratch, &self.scratch_dir, &mut disk)?;
        }

        let Some((mut file, path)) = disk else {
            return Err(ImportError::AmbiguousArchiveContents(format!(
                "no file in {DISK_DIRECTORY} of {reference}"
            )));
        };

        let length = file
            .stream_position()
            .and_then(|len| file.rewind().map(|_| len))
            .map_err(|e| ImportError::write(self.scratch_dir.display(), e))?;

        tracing::info!(path = %path.display(), length, "Disk image extracted from container image.");

        Ok(SourceStream {
            reader: Box::new(file),
            length: Some(length),
        })
    }
}

/// Look for the disk image in the layer `blob`.
///
/// If found, it is copied to a new file in `scratch`, which is stored
/// in `disk`. Finding a second disk image is an error.
fn scan_layer(
    client: &Client,
    blob: &Blob,
    scratch: &Directory,
    scratch_path: &Path,
    disk: &mut Option<(File, PathBuf)>,
) -> Result<(), ImportError> {
    let blob_id = blob.digest.as_str();
    let corrupt = |e: io::Error| ImportError::CorruptSource(format!("layer {blob_id}: {e}"));

    let mut input = client
        .download_blob(&blob.digest)
        .map_err(RegistryError::from)?;

    // Uncompress and extract files from the archive.
    let reader: Box<dyn Read + '_> = match blob.media_type {
        MediaType::DockerFsTarGzip | MediaType::OciFsTarGzip => {
            Box::new(flate2::read::GzDecoder::new(&mut input))
        }

        #[cfg(feature = "zstd")]
        MediaType::OciFsTarZstd => {
            Box::new(zstd::stream::read::Decoder::new(&mut input).map_err(corrupt)?)
        }

        MediaType::OciFsTar | MediaType::DockerFsTar => Box::new(&mut input),

        unknown => {
            return Err(ImportError::UnsupportedFormat(format!(
                "layer {blob_id} has media type {unknown}"
            )))
        }
    };

    let mut archive = tar::Archive::new(reader);

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;

        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }

        let path = entry.path().map_err(corrupt)?.into_owned();
        let (parent, _) = normalize_path(&path).map_err(corrupt)?;

        if parent != Path::new(DISK_DIRECTORY) {
            continue;
        }

        if let Some((_, previous)) = disk {
            return Err(ImportError::AmbiguousArchiveContents(format!(
                "found {} and {} in {DISK_DIRECTORY}",
                previous.display(),
                path.display()
            )));
        }

        let mut file = scratch
            .tmpfile()
            .map_err(|e| ImportError::write(scratch_path.display(), e.into()))?;

        io::copy(&mut entry, &mut file).map_err(|e| {
            if e.kind() == io::ErrorKind::StorageFull {
                ImportError::write(scratch_path.display(), e)
            } else {
                corrupt(e)
            }
        })?;

        *disk = Some((file, path));
    }

    drop(archive);

    // Consume the rest of the blob, so its digest is verified.
    io::copy(&mut input, &mut io::sink()).map_err(corrupt)?;

    Ok(())
}
