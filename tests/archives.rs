use std::fs;

use disk_importer::{ContentType, ImportError, JobDescriptor, SourceKind, TransferResult};

mod common;

use common::{gzip, http::serve, run_job, tarball};

#[test]
fn extract_archive_from_object_store() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");

    let archive = tarball(&[
        ("disk/disk.img", &[7u8; 8192][..]),
        ("disk/README", &b"cirros"[..]),
    ]);

    let (port, requests) = serve("/images/cirros.tar.gz", gzip(&archive), false);

    let job = JobDescriptor {
        source: SourceKind::ObjectStore,
        content_type: ContentType::Archive,
        endpoint: format!("http://127.0.0.1:{port}/images/cirros.tar.gz"),
        access_key: Some("AKIDEXAMPLE".into()),
        secret_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into()),
        available_space: 1 << 20,
        data_dir: data_dir.clone(),
        ..JobDescriptor::default()
    };

    let (result, progress) = run_job(&job);

    assert!(matches!(
        result,
        TransferResult::Success {
            bytes_written: 8198
        }
    ));
    assert_eq!(progress.bytes(), 8198);

    assert_eq!(fs::read(data_dir.join("disk/disk.img")).unwrap(), [7u8; 8192]);
    assert_eq!(fs::read(data_dir.join("disk/README")).unwrap(), b"cirros");

    // The request is signed.
    let request = requests.recv().unwrap();
    let authorization = request.header("Authorization").unwrap();

    assert!(authorization.starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    assert!(authorization.contains("/us-east-1/s3/aws4_request"));
    assert!(request.header("x-amz-date").is_some());
}

#[test]
fn reject_archive_with_two_images() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");

    let archive = tarball(&[
        ("a/one.img", &[1u8; 1024][..]),
        ("b/two.QCOW2", &[2u8; 1024][..]),
    ]);
    let (port, _) = serve("/bucket/disks.tar", archive, false);

    let job = JobDescriptor {
        source: SourceKind::ObjectStore,
        content_type: ContentType::Archive,
        endpoint: format!("http://127.0.0.1:{port}/bucket/disks.tar"),
        available_space: 1 << 20,
        data_dir: data_dir.clone(),
        ..JobDescriptor::default()
    };

    let (result, _) = run_job(&job);

    assert!(matches!(
        result,
        TransferResult::Failure(ImportError::AmbiguousArchiveContents(_))
    ));
    assert_ne!(result.exit_code(), 0);

    // Data directory is left empty.
    assert!(fs::read_dir(&data_dir).unwrap().next().is_none());
}

#[test]
fn reject_archive_without_images() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");

    let (port, _) = serve("/files.tar", tarball(&[("notes.txt", &b"none"[..])]), false);

    let job = JobDescriptor {
        source: SourceKind::PublicHttps,
        content_type: ContentType::Archive,
        endpoint: format!("http://127.0.0.1:{port}/files.tar"),
        available_space: 1 << 20,
        data_dir: data_dir.clone(),
        ..JobDescriptor::default()
    };

    let (result, _) = run_job(&job);

    assert!(matches!(
        result,
        TransferResult::Failure(ImportError::AmbiguousArchiveContents(_))
    ));
    assert!(!data_dir.join("notes.txt").exists());
}

#[test]
fn archive_entries_share_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");

    let archive = tarball(&[
        ("disk.img", &[1u8; 3000][..]),
        ("extra.bin", &[2u8; 3000][..]),
    ]);
    let (port, _) = serve("/disk.tar", archive, false);

    let job = JobDescriptor {
        source: SourceKind::PublicHttps,
        content_type: ContentType::Archive,
        endpoint: format!("http://127.0.0.1:{port}/disk.tar"),
        available_space: 5000,
        data_dir: data_dir.clone(),
        ..JobDescriptor::default()
    };

    let (result, progress) = run_job(&job);

    assert!(matches!(
        result,
        TransferResult::Failure(ImportError::InsufficientSpace(_))
    ));
    assert_eq!(progress.bytes(), 5000);
    assert!(fs::read_dir(&data_dir).unwrap().next().is_none());
}
