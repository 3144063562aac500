//! Import a virtual-machine disk image from a remote or local source, and
//! write it to the storage that backs the disk.
//!
//! A job is described by a [`JobDescriptor`], and executed by [`run`]:
//!
//! ```no_run
//! use disk_importer::{run, Context, JobDescriptor, Progress, SourceKind};
//!
//! let job = JobDescriptor {
//!     source: SourceKind::PublicHttps,
//!     endpoint: "https://example.com/images/cirros.qcow2".into(),
//!     available_space: 10 << 30,
//!     ..JobDescriptor::default()
//! };
//!
//! let result = run(&job, &Context::new(Progress::new()));
//! std::process::exit(result.exit_code().into());
//! ```

mod archive;
mod blank;
pub mod config;
mod decode;
mod digest;
mod error;
mod fs;
mod pipeline;
mod quantity;
mod source;
mod space;
mod writer;

use std::path::PathBuf;

pub use error::ImportError;
pub use pipeline::{run, TransferResult};
pub use quantity::parse_quantity;
pub use source::{SourceReader, SourceStream};
pub use space::{available_space, AllocationSize, Progress, SpaceAccountant};

/// Transport used to get the image.
#[derive(clap::ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SourceKind {
    /// S3-compatible object store.
    #[value(name = "s3")]
    ObjectStore,

    /// Public HTTP(S) URL.
    #[default]
    #[value(name = "http")]
    PublicHttps,

    /// Path in the local filesystem.
    #[value(name = "file")]
    LocalFile,

    /// Container registry.
    #[value(name = "registry")]
    Registry,

    /// Data pushed to the importer by an external client.
    #[value(name = "upload")]
    Upload,

    /// No source. A blank image is created.
    #[value(name = "none")]
    None,
}

/// How the bytes of the source are interpreted.
#[derive(clap::ValueEnum, Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ContentType {
    /// A disk image, written to the write path.
    #[default]
    #[value(name = "kubevirt")]
    DiskImage,

    /// A tar archive, extracted to the data directory.
    #[value(name = "archive")]
    Archive,
}

/// Everything needed to run a single import.
#[derive(Clone, Debug)]
pub struct JobDescriptor {
    /// Destination for disk images. Can be a regular file or a block
    /// device.
    pub write_path: PathBuf,

    /// Destination for archives.
    pub data_dir: PathBuf,

    /// Directory for temporary files. They are never visible in the
    /// filesystem.
    pub scratch_dir: PathBuf,

    pub source: SourceKind,
    pub content_type: ContentType,
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,

    /// Region for signed object store requests.
    pub region: String,

    /// Requested size, as a quantity string (like `10Gi`).
    pub image_size: Option<String>,

    /// Bytes available in the destination.
    pub available_space: u64,

    /// Directory with additional CA certificates, in PEM files.
    pub cert_dir: Option<PathBuf>,

    pub insecure_tls: bool,

    /// Address to listen for uploads.
    pub upload_address: String,
}

impl Default for JobDescriptor {
    fn default() -> Self {
        JobDescriptor {
            write_path: PathBuf::from(config::DEFAULT_WRITE_PATH),
            data_dir: PathBuf::from(config::DEFAULT_DATA_DIR),
            scratch_dir: std::env::temp_dir(),
            source: SourceKind::default(),
            content_type: ContentType::default(),
            endpoint: String::new(),
            access_key: None,
            secret_key: None,
            region: config::DEFAULT_REGION.to_owned(),
            image_size: None,
            available_space: 0,
            cert_dir: None,
            insecure_tls: false,
            upload_address: config::DEFAULT_UPLOAD_ADDRESS.to_owned(),
        }
    }
}

/// State shared by all the components of a job.
#[derive(Clone, Debug)]
pub struct Context {
    /// Span for the log events of the job.
    pub span: tracing::Span,

    /// Bytes written to the destination.
    pub progress: Progress,
}

impl Context {
    pub fn new(progress: Progress) -> Self {
        Context {
            span: tracing::info_span!("import"),
            progress,
        }
    }
}
