//! Configuration of the importer process.
//!
//! Every option can be set with a command-line flag or with an
//! environment variable. The environment is the usual way, since the
//! importer is launched by a controller.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;

use crate::{
    available_space, pipeline::check_combination, space::is_block_device, ContentType, ImportError,
    JobDescriptor, SourceKind,
};

pub const DEFAULT_WRITE_PATH: &str = "/data/disk.img";

pub const DEFAULT_DATA_DIR: &str = "/data";

pub const DEFAULT_REGION: &str = "us-east-1";

pub const DEFAULT_UPLOAD_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Config {
    /// Location of the image: URL, path, or registry reference.
    #[arg(long, env = "IMPORTER_ENDPOINT", default_value = "")]
    pub endpoint: String,

    #[arg(long, env = "IMPORTER_ACCESS_KEY_ID")]
    pub access_key: Option<String>,

    #[arg(long, env = "IMPORTER_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    #[arg(long, env = "IMPORTER_SOURCE", value_enum, default_value = "http")]
    pub source: SourceKind,

    #[arg(long, env = "IMPORTER_CONTENTTYPE", value_enum, default_value = "kubevirt")]
    pub content_type: ContentType,

    /// Requested size of the image (like `10Gi`).
    #[arg(long, env = "IMPORTER_IMAGE_SIZE")]
    pub image_size: Option<String>,

    /// Directory with PEM files of additional CA certificates.
    #[arg(long, env = "IMPORTER_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Don't verify TLS certificates.
    #[arg(long, env = "INSECURE_TLS")]
    pub insecure_tls: bool,

    #[arg(long, env = "IMPORTER_WRITE_PATH", default_value = DEFAULT_WRITE_PATH)]
    pub write_path: PathBuf,

    #[arg(long, env = "IMPORTER_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Directory for temporary files. Defaults to the system temporary
    /// directory.
    #[arg(long, env = "IMPORTER_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Region for signed object store requests.
    #[arg(long, env = "IMPORTER_REGION", default_value = DEFAULT_REGION)]
    pub region: String,

    #[arg(long, env = "IMPORTER_UPLOAD_ADDRESS", default_value = DEFAULT_UPLOAD_ADDRESS)]
    pub upload_address: String,

    /// Seconds between progress reports.
    #[arg(long, env = "IMPORTER_PROGRESS_INTERVAL", default_value_t = 10)]
    pub progress_interval: u64,
}

impl Config {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval.max(1))
    }

    /// Build the job descriptor. The available space is measured in the
    /// destination for the content type.
    ///
    /// Space that can't be measured is an error, even with an image size,
    /// because the size is only an upper bound for the allocation.
    pub fn into_job(self) -> Result<JobDescriptor, ImportError> {
        check_combination(self.source, self.content_type)?;

        let target = space_target(self.content_type, &self.write_path, &self.data_dir);
        let available_space = available_space(&target)?;

        tracing::debug!(path = %target.display(), available_space, "Measured available space.");

        Ok(JobDescriptor {
            write_path: self.write_path,
            data_dir: self.data_dir,
            scratch_dir: self.scratch_dir.unwrap_or_else(std::env::temp_dir),
            source: self.source,
            content_type: self.content_type,
            endpoint: self.endpoint,
            access_key: self.access_key.filter(|k| !k.is_empty()),
            secret_key: self.secret_key.filter(|k| !k.is_empty()),
            region: self.region,
            image_size: self.image_size.filter(|s| !s.trim().is_empty()),
            available_space,
            cert_dir: self.cert_dir,
            insecure_tls: self.insecure_tls,
            upload_address: self.upload_address,
        })
    }
}

/// Path where the available space is measured.
///
/// Block devices are measured directly. For anything else, it is the
/// closest existing directory to the destination.
fn space_target(content_type: ContentType, write_path: &Path, data_dir: &Path) -> PathBuf {
    let destination = match content_type {
        ContentType::Archive => data_dir,
        ContentType::DiskImage if is_block_device(write_path) => return write_path.to_owned(),
        ContentType::DiskImage => write_path.parent().unwrap_or(write_path),
    };

    destination
        .ancestors()
        .find(|p| p.is_dir())
        .unwrap_or_else(|| Path::new("."))
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flags() {
        let config = Config::try_parse_from([
            "disk-importer",
            "--source",
            "s3",
            "--content-type",
            "archive",
            "--endpoint",
            "s3://minio.local/images/disk.tar",
            "--image-size",
            "10Gi",
            "--insecure-tls",
        ])
        .unwrap();

        assert_eq!(config.source, SourceKind::ObjectStore);
        assert_eq!(config.content_type, ContentType::Archive);
        assert_eq!(config.image_size.as_deref(), Some("10Gi"));
        assert!(config.insecure_tls);

        assert!(Config::try_parse_from(["disk-importer", "--source", "ftp"]).is_err());
    }

    #[test]
    fn check_combination_before_measuring() {
        let config = Config::try_parse_from([
            "disk-importer",
            "--source",
            "registry",
            "--content-type",
            "archive",
            "--data-dir",
            "/nonexistent/data",
        ])
        .unwrap();

        assert!(matches!(
            config.into_job(),
            Err(ImportError::InvalidCombination(_))
        ));
    }

    #[test]
    fn measure_closest_directory() {
        let dir = tempfile::tempdir().unwrap();
        let write_path = dir.path().join("a/b/disk.img");

        assert_eq!(
            space_target(ContentType::DiskImage, &write_path, Path::new("/")),
            dir.path()
        );

        assert_eq!(
            space_target(ContentType::Archive, &write_path, dir.path()),
            dir.path()
        );
    }
}
