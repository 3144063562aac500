//! Extract a tar stream into the data directory.
//!
//! Every entry is created with file descriptors relative to the data
//! directory, and paths are resolved with `openat2(2)`, so an entry can't
//! create files outside of it, even through symlinks created by previous
//! entries.

use std::{
    ffi::OsStr,
    fs::File,
    io::{self, ErrorKind::AlreadyExists, ErrorKind::NotFound, Read},
    path::{Path, PathBuf},
};

use rustix::{
    fd::{AsFd, BorrowedFd, OwnedFd},
    fs::Mode,
};

use crate::{
    fs::{clear_directory, normalize_path, DirFdCache, Directory},
    ImportError, SpaceAccountant,
};

/// Extensions for files that are accepted as disk images.
const IMAGE_EXTENSIONS: &[&str] = &["img", "raw", "qcow2", "iso"];

macro_rules! try_io {
    ($path:expr, $e:expr $(,)?) => {
        $e.map_err(|e| ImportError::write($path.display(), io::Error::from(e)))?
    };
}

/// Extract all entries from `reader` into `data_dir`.
///
/// The contents of regular files are written through `accountant`. The
/// archive must contain exactly one disk image (see [`is_image_entry`]).
///
/// On any failure, the data directory is emptied.
///
/// Returns the path of the disk image, relative to `data_dir`.
pub(crate) fn extract<R: Read>(
    reader: R,
    data_dir: &Path,
    accountant: &mut SpaceAccountant,
) -> Result<PathBuf, ImportError> {
    let result = extract_all(reader, data_dir, accountant);

    if let Err(err) = &result {
        tracing::warn!(data_dir = %data_dir.display(), %err, "Archive extraction failed.");

        if let Err(e) = clear_directory(data_dir) {
            tracing::error!(data_dir = %data_dir.display(), %e, "Cannot clear data directory.");
        }
    }

    result
}

fn extract_all<R: Read>(
    reader: R,
    data_dir: &Path,
    accountant: &mut SpaceAccountant,
) -> Result<PathBuf, ImportError> {
    try_io!(data_dir, std::fs::create_dir_all(data_dir));
    let target = try_io!(data_dir, Directory::new(data_dir));

    let mut archive = tar::Archive::new(reader);
    let mut extractor = Extractor::new(&target, accountant);

    for entry in archive.entries().map_err(ImportError::from_read)? {
        extractor.unpack(entry)?;
    }

    let mut images = extractor.images;

    match images.len() {
        1 => {
            let image = images.remove(0);
            tracing::info!(image = %image.display(), "Disk image extracted.");
            Ok(image)
        }

        0 => Err(ImportError::AmbiguousArchiveContents(
            "no disk image in the archive".into(),
        )),

        n => Err(ImportError::AmbiguousArchiveContents(format!(
            "found {n} disk images: {}",
            images
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Return `true` if `file_name` has the extension of a disk image.
fn is_image_entry(file_name: &Path) -> bool {
    file_name
        .extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|i| ext.eq_ignore_ascii_case(i)))
}

struct Extractor<'a> {
    target: &'a Directory,
    dirs_cache: DirFdCache<'a>,
    accountant: &'a mut SpaceAccountant,
    cached_link_dirfd: Option<(PathBuf, OwnedFd)>,
    images: Vec<PathBuf>,
}

impl<'a> Extractor<'a> {
    fn new(target: &'a Directory, accountant: &'a mut SpaceAccountant) -> Self {
        Self {
            target,
            dirs_cache: DirFdCache::new(target),
            accountant,
            cached_link_dirfd: None,
            images: Vec::new(),
        }
    }

    fn unpack(&mut self, entry: io::Result<tar::Entry<impl Read>>) -> Result<(), ImportError> {
        let entry = entry.map_err(ImportError::from_read)?;

        let entry_path = entry.path().map_err(ImportError::from_read)?.into_owned();

        let (parent_path, file_name) = normalize_path(&entry_path)
            .map_err(|e| ImportError::CorruptSource(format!("{}: {e}", entry_path.display())))?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                try_io!(entry_path, self.unpack_dir(parent_path, &file_name, &entry))
            }

            tar::EntryType::Regular | tar::EntryType::Continuous => {
                self.unpack_regular(&parent_path, &file_name, entry)?;

                if is_image_entry(&file_name) {
                    self.images.push(parent_path.join(file_name));
                }
            }

            tar::EntryType::Symlink | tar::EntryType::Link => {
                try_io!(
                    entry_path,
                    self.unpack_link(self.target.as_fd(), parent_path, &file_name, &entry)
                )
            }

            other => {
                tracing::info!(path = %entry_path.display(), entry_type = ?other, "Entry skipped.");
            }
        }

        Ok(())
    }

    fn path_fd(&mut self, path: impl AsRef<Path>) -> io::Result<BorrowedFd<'_>> {
        Ok(self.dirs_cache.get(path, true)?)
    }

    fn unpack_dir(
        &mut self,
        parent_path: impl AsRef<Path>,
        file_name: &Path,
        entry: &tar::Entry<impl Read>,
    ) -> io::Result<()> {
        use rustix::fs;

        let mode = entry_mode(entry.header(), 0o755);

        let parent_fd = self.path_fd(parent_path)?;
        let result = fs::mkdirat(parent_fd, file_name, mode);

        if let Err(e) = result {
            // Ignore the error if the directory already exists.
            if e.kind() == AlreadyExists && !Self::is_directory(parent_fd, file_name)? {
                return Err(e.into());
            }
        }

        Ok(())
    }

    fn unpack_regular(
        &mut self,
        parent_path: &Path,
        file_name: &Path,
        mut entry: tar::Entry<impl Read>,
    ) -> Result<(), ImportError> {
        use rustix::fs;

        let path = parent_path.join(file_name);
        let mode = entry_mode(entry.header(), 0o644);

        let parent_fd = try_io!(path, self.dirs_cache.get(parent_path, true));

        let mut output = loop {
            let result = fs::openat2(
                parent_fd,
                file_name,
                fs::OFlags::CREATE | fs::OFlags::EXCL | fs::OFlags::WRONLY | fs::OFlags::CLOEXEC,
                mode,
                fs::ResolveFlags::BENEATH,
            );

            match result {
                Ok(f) => break File::from(f),

                Err(e) if e.kind() == AlreadyExists => {
                    try_io!(path, fs::unlinkat(parent_fd, file_name, fs::AtFlags::empty()));
                }

                Err(e) => return Err(ImportError::write(path.display(), e.into())),
            }
        };

        self.accountant.copy(&mut entry, &mut output)?;

        drop(output);

        if let Ok(mtime) = entry.header().mtime() {
            let mtime = make_timestamps(mtime);
            try_io!(
                path,
                fs::utimensat(parent_fd, file_name, &mtime, fs::AtFlags::SYMLINK_NOFOLLOW)
            );
        }

        Ok(())
    }

    /// Unpack hard and symbolic links.
    fn unpack_link(
        &mut self,
        root_fd: BorrowedFd,
        parent_path: impl AsRef<Path>,
        file_name: &Path,
        entry: &tar::Entry<impl Read>,
    ) -> io::Result<()> {
        use rustix::fs;

        let dest = match entry.link_name()? {
            Some(dest) => dest,
            None => return Err(io::Error::new(NotFound, "Missing link")),
        };

        let parent_fd = self.dirs_cache.get(parent_path, true)?;

        let is_symlink = entry.header().entry_type().is_symlink();

        loop {
            let result = if is_symlink {
                fs::symlinkat(dest.as_ref(), parent_fd, file_name)
            } else {
                // Hard links are resolved inside the data directory. The
                // descriptor for the directory of the source is cached,
                // since archives usually have consecutive links in the
                // same directory.

                let (old_parent, old_name) = normalize_path(&dest)?;

                let old_dirfd = match self.cached_link_dirfd.take() {
                    Some((cached_path, fd)) if cached_path == old_parent => fd,

                    _ => fs::openat2(
                        root_fd,
                        &old_parent,
                        fs::OFlags::PATH | fs::OFlags::NOFOLLOW,
                        fs::Mode::empty(),
                        fs::ResolveFlags::IN_ROOT | fs::ResolveFlags::NO_MAGICLINKS,
                    )?,
                };

                let result = fs::linkat(
                    &old_dirfd,
                    old_name,
                    parent_fd,
                    file_name,
                    fs::AtFlags::empty(),
                );

                self.cached_link_dirfd = Some((old_parent, old_dirfd));

                result
            };

            match result {
                Ok(_) => break,

                Err(e) if e.kind() == AlreadyExists => {
                    fs::unlinkat(parent_fd, file_name, fs::AtFlags::empty())?;
                }

                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn is_directory(parent: BorrowedFd, file_name: &Path) -> io::Result<bool> {
        let stat = rustix::fs::statat(parent, file_name, rustix::fs::AtFlags::empty())?;
        Ok(rustix::fs::FileType::from_raw_mode(stat.st_mode) == rustix::fs::FileType::Directory)
    }
}

/// Permission bits of an entry, or `default` if the header has none.
fn entry_mode(header: &tar::Header, default: u32) -> Mode {
    let mode = header.mode().map(|m| m & 0o7777).unwrap_or(default);
    Mode::from_bits_retain(mode)
}

fn make_timestamps(mtime: u64) -> rustix::fs::Timestamps {
    let mtime = rustix::fs::Timespec {
        tv_sec: i64::try_from(mtime).unwrap_or_default(),
        tv_nsec: 0,
    };

    rustix::fs::Timestamps {
        last_access: mtime,
        last_modification: mtime,
    }
}
