use std::fs;

use disk_importer::{ImportError, JobDescriptor, SourceKind, TransferResult};

mod common;

use common::{
    blobs::{Blob, CONFIG, LAYER_GZIP, LAYER_TAR},
    qcow2,
    registry::start_registry,
    run_job,
};

fn config() -> Blob {
    Blob::new(CONFIG, &br#"{"architecture": "amd64", "os": "linux"}"#[..])
}

fn registry_job(dir: &tempfile::TempDir, port: u16, tag: &str) -> JobDescriptor {
    JobDescriptor {
        source: SourceKind::Registry,
        endpoint: format!("docker://127.0.0.1:{port}/disks/cirros:{tag}"),
        available_space: 4 << 20,
        write_path: dir.path().join("disk.img"),
        scratch_dir: dir.path().to_owned(),
        ..JobDescriptor::default()
    }
}

#[test]
fn import_container_disk() {
    let dir = tempfile::tempdir().unwrap();

    let mut data = vec![0u8; 256 * 1024];
    data[..4096].fill(0x42);
    data[200_000..201_000].fill(0x24);

    let layers = vec![
        Blob::archive(LAYER_TAR)
            .directory("etc")
            .regular("etc/os-release", "ID=cirros")
            .build(),
        Blob::archive(LAYER_GZIP)
            .directory("disk")
            .regular("disk/cirros.qcow2", qcow2::from_raw(&data))
            .build(),
    ];

    let port = start_registry("disks/cirros", "0.6", config(), layers);

    let job = registry_job(&dir, port, "0.6");
    let (result, progress) = run_job(&job);

    assert!(matches!(
        result,
        TransferResult::Success { bytes_written } if bytes_written == data.len() as u64
    ));
    assert_eq!(progress.bytes(), data.len() as u64);
    assert_eq!(fs::read(&job.write_path).unwrap(), data);

    // Scratch files are never visible.
    let scratch: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(scratch, ["disk.img"]);
}

#[cfg(feature = "zstd")]
#[test]
fn import_raw_disk_from_zstd_layer() {
    use common::blobs::LAYER_ZSTD;

    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 13) as u8).collect();

    let layers = vec![Blob::archive(LAYER_ZSTD)
        .directory("disk")
        .regular("disk/disk.img", &data)
        .build()];

    let port = start_registry("disks/raw", "zstd", config(), layers);

    let mut job = registry_job(&dir, port, "zstd");
    job.endpoint = format!("docker://127.0.0.1:{port}/disks/raw:zstd");

    let (result, _) = run_job(&job);

    assert!(result.is_success(), "{result:?}");
    assert_eq!(fs::read(&job.write_path).unwrap(), data);
}

#[test]
fn reject_multiple_disks() {
    let dir = tempfile::tempdir().unwrap();

    let layers = vec![
        Blob::archive(LAYER_GZIP)
            .regular("disk/a.img", [1u8; 1024])
            .build(),
        Blob::archive(LAYER_TAR)
            .regular("disk/b.img", [2u8; 1024])
            .build(),
    ];

    let port = start_registry("disks/cirros", "two", config(), layers);

    let (result, _) = run_job(&registry_job(&dir, port, "two"));

    assert!(matches!(
        result,
        TransferResult::Failure(ImportError::AmbiguousArchiveContents(_))
    ));
}

#[test]
fn reject_image_without_disk() {
    let dir = tempfile::tempdir().unwrap();

    let layers = vec![Blob::archive(LAYER_GZIP)
        .regular("usr/bin/true", [0u8; 16])
        .build()];

    let port = start_registry("disks/cirros", "empty", config(), layers);

    let (result, _) = run_job(&registry_job(&dir, port, "empty"));

    assert!(matches!(
        result,
        TransferResult::Failure(ImportError::AmbiguousArchiveContents(_))
    ));
}

#[test]
fn reject_invalid_digest() {
    let dir = tempfile::tempdir().unwrap();

    let mut layer = Blob::archive(LAYER_TAR)
        .regular("disk/disk.img", [3u8; 2048])
        .build();

    // Change the content, but keep the digest.
    let mut data = layer.data.to_vec();
    data[600] ^= 0xff;
    layer.data = data.into();

    let port = start_registry("disks/cirros", "bad", config(), vec![layer]);

    let (result, _) = run_job(&registry_job(&dir, port, "bad"));

    assert!(matches!(
        result,
        TransferResult::Failure(ImportError::CorruptSource(_))
    ));
    assert!(!dir.path().join("disk.img").exists());
}

#[test]
fn missing_tag() {
    let dir = tempfile::tempdir().unwrap();

    let port = start_registry("disks/cirros", "0.6", config(), vec![]);

    let (result, _) = run_job(&registry_job(&dir, port, "latest"));

    assert!(matches!(
        result,
        TransferResult::Failure(ImportError::SourceUnavailable(_))
    ));
}
