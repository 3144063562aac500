use std::{
    fs::File,
    io::{self, Read, Seek, Write},
    os::unix::fs::FileTypeExt,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{quantity::parse_quantity, ImportError};

/// Size of the buffer used to move data from a source to a destination.
pub(crate) const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Number of bytes transferred to the destination.
///
/// The counter only grows. Clones share the same value, so it can be
/// read from a reporting thread while the transfer updates it.
#[derive(Clone, Debug, Default)]
pub struct Progress(Arc<AtomicU64>);

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Bytes that can be written to the destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocationSize {
    pub bytes: u64,

    /// `true` if the available space is smaller than the requested size.
    pub truncated: bool,
}

impl AllocationSize {
    /// Reconcile the `requested` size with the `available` space.
    ///
    /// Without a requested size, all the available space is used.
    pub fn new(available: u64, requested: Option<u64>) -> Self {
        match requested {
            Some(requested) if available < requested => AllocationSize {
                bytes: available,
                truncated: true,
            },

            Some(requested) => AllocationSize {
                bytes: requested,
                truncated: false,
            },

            None => AllocationSize {
                bytes: available,
                truncated: false,
            },
        }
    }
}

/// Measure the space available for an import at `path`.
///
/// For block devices, this is the capacity of the device. For anything
/// else, it is the space available to unprivileged users in the
/// filesystem containing `path`.
pub fn available_space(path: &Path) -> Result<u64, ImportError> {
    let unknown = |e| ImportError::SpaceUnknown(path.display().to_string(), e);

    if is_block_device(path) {
        return device_capacity(path).map_err(unknown);
    }

    let stat = rustix::fs::statvfs(path).map_err(|e| unknown(e.into()))?;

    stat.f_bavail
        .checked_mul(stat.f_frsize)
        .ok_or_else(|| unknown(io::Error::other("statvfs overflow")))
}

pub(crate) fn is_block_device(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

/// Size of a block device, from the end position of a file descriptor.
pub(crate) fn device_capacity(path: &Path) -> io::Result<u64> {
    File::open(path)?.seek(io::SeekFrom::End(0))
}

/// Enforce the allocation size while data is written to the destination.
///
/// The counter of written bytes is cumulative across all calls to
/// [`copy`](Self::copy), so multiple files (like archive entries) share
/// the same ceiling.
pub struct SpaceAccountant {
    allocation: AllocationSize,
    written: u64,
    progress: Progress,
}

impl SpaceAccountant {
    /// Compute the allocation size from the `available` space and the
    /// `requested` quantity string.
    ///
    /// A truncated allocation is logged as a warning.
    pub fn new(
        available: u64,
        requested: Option<&str>,
        progress: Progress,
    ) -> Result<Self, ImportError> {
        let requested = requested
            .filter(|r| !r.trim().is_empty())
            .map(parse_quantity)
            .transpose()?;

        let allocation = AllocationSize::new(available, requested);

        if allocation.truncated {
            tracing::warn!(
                available,
                requested,
                "Available space less than requested size, using {} bytes.",
                allocation.bytes,
            );
        }

        Ok(SpaceAccountant {
            allocation,
            written: 0,
            progress,
        })
    }

    pub fn allocation(&self) -> AllocationSize {
        self.allocation
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Reject a declared length that does not fit in the allocation.
    pub fn check_declared(&self, length: u64) -> Result<(), ImportError> {
        if length > self.allocation.bytes {
            return Err(ImportError::InsufficientSpace(format!(
                "source needs {length} bytes, but only {} are allocated",
                self.allocation.bytes
            )));
        }

        Ok(())
    }

    /// Reject an allocation larger than the `capacity` of a device.
    pub fn check_capacity(&self, capacity: u64) -> Result<(), ImportError> {
        if self.allocation.bytes > capacity {
            return Err(ImportError::InsufficientSpace(format!(
                "allocation of {} bytes exceeds device capacity of {capacity} bytes",
                self.allocation.bytes
            )));
        }

        Ok(())
    }

    /// Copy all data from `reader` to `writer`.
    ///
    /// Data is written up to the allocation size. If the reader produces
    /// more data, the copy stops at that exact offset, and it returns
    /// [`ImportError::InsufficientSpace`].
    ///
    /// Returns the number of bytes copied in this call.
    pub fn copy<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<u64, ImportError>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let start = self.written;

        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => return Ok(self.written - start),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImportError::from_read(e)),
            };

            let remaining = self.allocation.bytes - self.written;
            let fits = n.min(usize::try_from(remaining).unwrap_or(usize::MAX));

            if fits > 0 {
                writer
                    .write_all(&buffer[..fits])
                    .map_err(|e| ImportError::write("destination", e))?;

                self.written += fits as u64;
                self.progress.add(fits as u64);
            }

            if fits < n {
                return Err(ImportError::InsufficientSpace(format!(
                    "source exceeds the allocation of {} bytes",
                    self.allocation.bytes
                )));
            }
        }
    }
}

#[test]
fn allocation_is_min_of_available_and_requested() {
    for (available, requested) in [(0, 0), (5, 10), (10, 5), (10, 10), (u64::MAX, 1), (1, u64::MAX)] {
        let allocation = AllocationSize::new(available, Some(requested));
        assert_eq!(allocation.bytes, available.min(requested));
        assert_eq!(allocation.truncated, available < requested);
    }

    assert_eq!(
        AllocationSize::new(123, None),
        AllocationSize {
            bytes: 123,
            truncated: false
        }
    );
}

#[test]
fn stop_copy_at_allocation_size() {
    let progress = Progress::new();
    let mut accountant = SpaceAccountant::new(1000, None, progress.clone()).unwrap();

    let mut output = Vec::new();
    let err = accountant
        .copy(&mut io::repeat(7).take(1001), &mut output)
        .unwrap_err();

    assert!(matches!(err, ImportError::InsufficientSpace(_)));
    assert_eq!(output.len(), 1000);
    assert_eq!(progress.bytes(), 1000);

    // Exactly the allocation size is accepted.
    let mut accountant = SpaceAccountant::new(1000, None, Progress::new()).unwrap();
    let mut output = Vec::new();
    assert_eq!(
        accountant
            .copy(&mut io::repeat(7).take(1000), &mut output)
            .unwrap(),
        1000
    );
}

#[test]
fn ceiling_is_shared_across_copies() {
    let mut accountant = SpaceAccountant::new(3 << 20, Some("2Mi"), Progress::new()).unwrap();
    assert!(!accountant.allocation().truncated);

    let mut sink = io::sink();
    accountant
        .copy(&mut io::repeat(0).take(1 << 20), &mut sink)
        .unwrap();

    let err = accountant
        .copy(&mut io::repeat(0).take((1 << 20) + 1), &mut sink)
        .unwrap_err();

    assert!(matches!(err, ImportError::InsufficientSpace(_)));
    assert_eq!(accountant.written(), 2 << 20);
}

#[test]
fn declared_lengths() {
    let accountant = SpaceAccountant::new(100, Some("1Ki"), Progress::new()).unwrap();
    assert!(accountant.allocation().truncated);
    assert!(accountant.check_declared(100).is_ok());
    assert!(accountant.check_declared(101).is_err());
    assert!(accountant.check_capacity(99).is_err());
}

#[test]
fn invalid_requested_size() {
    assert!(matches!(
        SpaceAccountant::new(100, Some("ten"), Progress::new()),
        Err(ImportError::SizeParse(..))
    ));
}

#[test]
fn measure_available_space() {
    let dir = tempfile::tempdir().unwrap();
    assert!(available_space(dir.path()).unwrap() > 0);

    let missing = dir.path().join("missing");
    assert!(matches!(
        available_space(&missing),
        Err(ImportError::SpaceUnknown(path, _)) if path == missing.display().to_string()
    ));
}
