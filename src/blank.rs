//! Create an empty disk image when the job has no source.

use std::{fs::OpenOptions, path::Path};

use crate::{
    space::{device_capacity, is_block_device},
    writer::{wipe, WIPE_LEN},
    ImportError, SpaceAccountant,
};

/// Create a blank image at `path` with the size of the allocation.
///
/// For regular files, the image is a sparse raw file, which is what a
/// new disk in a filesystem-backed volume looks like. For block devices,
/// the capacity is checked, and the first and last MiB are cleared, so no
/// stale partition table is visible from the guest.
///
/// Returns the size of the image.
pub(crate) fn create_blank_image(
    path: &Path,
    accountant: &SpaceAccountant,
) -> Result<u64, ImportError> {
    let error = |e| ImportError::write(path.display(), e);
    let size = accountant.allocation().bytes;

    if is_block_device(path) {
        let capacity = device_capacity(path).map_err(error)?;
        accountant.check_capacity(capacity)?;

        let mut device = OpenOptions::new().write(true).open(path).map_err(error)?;

        let head = WIPE_LEN.min(capacity);
        wipe(&mut device, 0, head).map_err(error)?;

        let tail = WIPE_LEN.min(capacity - head);
        wipe(&mut device, capacity - tail, tail).map_err(error)?;

        device.sync_all().map_err(error)?;

        tracing::info!(path = %path.display(), capacity, "Block device cleared.");
        return Ok(size);
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(error)?;
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(error)?;

    file.set_len(size).map_err(error)?;
    file.sync_all().map_err(error)?;

    tracing::info!(path = %path.display(), size, "Blank image created.");

    Ok(size)
}

#[test]
fn create_sparse_file() {
    use std::os::unix::fs::MetadataExt;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");

    let accountant = SpaceAccountant::new(1 << 30, Some("64Mi"), crate::Progress::new()).unwrap();

    assert_eq!(create_blank_image(&path, &accountant).unwrap(), 64 << 20);

    let metadata = std::fs::metadata(&path).unwrap();
    assert_eq!(metadata.len(), 64 << 20);
    assert!(metadata.blocks() * 512 < 1 << 20);
}
