#![allow(dead_code)]

pub mod blobs;
pub mod http;
pub mod qcow2;
pub mod registry;

use disk_importer::{run, Context, JobDescriptor, Progress, TransferResult};

/// Run a job with a new progress counter.
pub fn run_job(job: &JobDescriptor) -> (TransferResult, Progress) {
    let progress = Progress::new();
    let result = run(job, &Context::new(progress.clone()));
    (result, progress)
}

/// Compress `data` with gzip.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Build a tar archive with regular files.
pub fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::file());
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, path, *data).unwrap();
    }

    builder.into_inner().unwrap()
}
