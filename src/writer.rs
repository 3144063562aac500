//! Destination for flat disk images.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{
    space::{device_capacity, is_block_device},
    ImportError,
};

/// Blocks of zeros with this size are not written to regular files.
const SPARSE_BLOCK: usize = 4096;

/// Bytes cleared at the start of a block device after a failure.
pub(crate) const WIPE_LEN: u64 = 1 << 20;

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Destination {
    File,

    /// Block device, with its capacity.
    BlockDevice(u64),
}

/// Writer for the disk image at the write path.
///
/// Regular files are written sparse: blocks of zeros are skipped with a
/// seek, and the final size is set in [`finish`](Self::finish). Block
/// devices are written in full, since they can contain stale data.
pub(crate) struct DiskWriter {
    file: File,
    path: PathBuf,
    destination: Destination,
    offset: u64,
}

impl DiskWriter {
    pub fn open(path: &Path) -> Result<Self, ImportError> {
        let error = |e| ImportError::write(path.display(), e);

        let (file, destination) = if is_block_device(path) {
            let capacity = device_capacity(path).map_err(error)?;
            let file = OpenOptions::new().write(true).open(path).map_err(error)?;
            (file, Destination::BlockDevice(capacity))
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(error)?;
            }

            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(error)?;

            (file, Destination::File)
        };

        tracing::debug!(path = %path.display(), ?destination, "Destination opened.");

        Ok(DiskWriter {
            file,
            path: path.to_owned(),
            destination,
            offset: 0,
        })
    }

    pub fn destination(&self) -> Destination {
        self.destination
    }

    /// Set the final size of the image, and flush it to the storage.
    ///
    /// Returns the number of bytes in the image.
    pub fn finish(self) -> Result<u64, ImportError> {
        let error = |e| ImportError::write(self.path.display(), e);

        if self.destination == Destination::File {
            self.file.set_len(self.offset).map_err(error)?;
        }

        self.file.sync_all().map_err(error)?;

        Ok(self.offset)
    }

    /// Leave the destination in a state that can't be mistaken for a
    /// valid image.
    ///
    /// Regular files are truncated to zero bytes. The first MiB of block
    /// devices is cleared, so partition tables and filesystem headers are
    /// lost.
    pub fn discard(mut self) {
        let result = match self.destination {
            Destination::File => self.file.set_len(0),
            Destination::BlockDevice(capacity) => {
                wipe(&mut self.file, 0, WIPE_LEN.min(capacity))
            }
        };

        if let Err(e) = result.and_then(|_| self.file.sync_all()) {
            tracing::error!(path = %self.path.display(), %e, "Cannot discard partial image.");
        }
    }
}

impl Write for DiskWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.destination != Destination::File {
            let n = self.file.write(buf)?;
            self.offset += n as u64;
            return Ok(n);
        }

        for block in buf.chunks(SPARSE_BLOCK) {
            if block.len() == SPARSE_BLOCK && block.iter().all(|b| *b == 0) {
                self.file.seek(SeekFrom::Current(SPARSE_BLOCK as i64))?;
            } else {
                self.file.write_all(block)?;
            }

            self.offset += block.len() as u64;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Write `len` zeros at `offset`.
pub(crate) fn wipe(file: &mut File, offset: u64, len: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    io::copy(&mut io::repeat(0).take(len), file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    #[test]
    fn skip_zero_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images/disk.img");

        let mut writer = DiskWriter::open(&path).unwrap();
        assert_eq!(writer.destination(), Destination::File);

        writer.write_all(b"head").unwrap();
        writer.write_all(&vec![0; 1 << 20]).unwrap();
        writer.write_all(b"tail").unwrap();
        writer.write_all(&vec![0; 8 * SPARSE_BLOCK]).unwrap();

        let len = writer.finish().unwrap();
        assert_eq!(len, 8 + (1 << 20) + 8 * SPARSE_BLOCK as u64);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len() as u64, len);
        assert_eq!(&data[..4], b"head");
        assert_eq!(&data[4 + (1 << 20)..8 + (1 << 20)], b"tail");
        assert!(data[4..4 + (1 << 20)].iter().all(|b| *b == 0));

        // Most of the zeros are holes.
        let blocks = std::fs::metadata(&path).unwrap().blocks() * 512;
        assert!(blocks < len / 2);
    }

    #[test]
    fn discard_truncates_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");

        let mut writer = DiskWriter::open(&path).unwrap();
        writer.write_all(&[1; 10_000]).unwrap();
        writer.discard();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
