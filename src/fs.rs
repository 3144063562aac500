use std::{
    fs::File,
    io,
    num::NonZeroUsize,
    path::{Component, Path, PathBuf},
};

use rustix::{
    fd::{AsFd, BorrowedFd, OwnedFd},
    fs::{mkdirat, openat, openat2, Mode, OFlags, ResolveFlags},
    io::Errno,
    path::Arg,
};

/// Provides some functions to create files and directories under a specific path.
///
/// It relies on a file descriptor to ensure that new entries are never created
/// outside the root.
pub(crate) struct Directory {
    fd: OwnedFd,
}

impl From<OwnedFd> for Directory {
    fn from(fd: OwnedFd) -> Self {
        Directory { fd }
    }
}

impl AsFd for Directory {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Directory {
    pub fn new<P: Arg>(target: P) -> Result<Self, Errno> {
        let fd = openat(
            rustix::fs::CWD,
            target,
            OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;

        Ok(Directory { fd })
    }

    /// Create an unnamed temporary regular file.
    ///
    /// The file is released by the kernel when it is closed, so scratch
    /// data never outlives the process.
    pub fn tmpfile(&self) -> Result<File, Errno> {
        openat(
            self,
            c".",
            OFlags::TMPFILE | OFlags::RDWR | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR,
        )
        .map(File::from)
    }

    /// Return a file descriptor for a directory.
    ///
    /// If `create` is `true`, the directory is created if it does not exist.
    pub fn open_directory<P>(&self, path: P, create: bool) -> Result<OwnedFd, Errno>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut created = false;

        loop {
            let result = openat2(
                self,
                path,
                OFlags::PATH | OFlags::DIRECTORY | OFlags::CLOEXEC,
                Mode::empty(),
                ResolveFlags::IN_ROOT | ResolveFlags::NO_MAGICLINKS,
            );

            // A second `NotFound` means that the name exists, but it is a
            // dangling symlink.
            match result {
                Err(e) if create && !created && e.kind() == io::ErrorKind::NotFound => (),
                r => return r,
            }

            created = true;

            // At this point, the directory does not exist, and we want
            // to create it.

            let file_name = match path.file_name() {
                Some(f) => f,
                None => return Err(Errno::NOENT),
            };

            // Get a FD to the parent to use `mkdirat`. This is needed to be
            // able to rely on `RESOLVE_IN_ROOT` to resolve symlinks inside
            // our own root.
            let owned_slot;
            let parent = match path.parent() {
                Some(p) if p == Path::new("") || p == Path::new("/") => &self.fd,

                None => &self.fd,

                Some(p) => {
                    owned_slot = self.open_directory(p, create)?;
                    &owned_slot
                }
            };

            match mkdirat(parent.as_fd(), file_name, Mode::from_raw_mode(0o755)) {
                Err(Errno::EXIST) | Ok(()) => (),
                Err(e) => return Err(e),
            }
        }
    }
}

/// LRU cache of file descriptors for directories.
pub(crate) struct DirFdCache<'a> {
    directory: &'a Directory,
    cache: lru::LruCache<PathBuf, OwnedFd>,
}

/// Number of entries in a file descriptor cache.
const FDS_CACHE: usize = 16;

impl<'a> DirFdCache<'a> {
    pub fn new(directory: &'a Directory) -> Self {
        let cache = lru::LruCache::new(NonZeroUsize::new(FDS_CACHE).unwrap_or(NonZeroUsize::MIN));
        DirFdCache { directory, cache }
    }

    /// Get a file descriptor for a directory.
    pub fn get<P>(&mut self, path: P, create: bool) -> Result<BorrowedFd<'_>, Errno>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();

        self.cache
            .try_get_or_insert_ref(path, || self.directory.open_directory(path, create))
            .map(|fd| fd.as_fd())
    }
}

/// Convert a path from an archive entry to a path relative to the
/// extraction root.
///
/// The path is returned in a `(parent, file_name)` pair.
///
/// The parent is always prefixed with `/`.
pub(crate) fn normalize_path<T: AsRef<Path>>(path: T) -> io::Result<(PathBuf, PathBuf)> {
    let mut parent_path = PathBuf::from("/");
    let mut file_name = None;

    // Similar to `tar::Entry::unpack_in`.
    for component in path.as_ref().components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,

            // Don't trust entries with `..` in the path.
            Component::ParentDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Found '..' in the path.",
                ));
            }

            Component::Normal(part) => {
                if let Some(previous) = file_name.take() {
                    parent_path.push(previous);
                }

                file_name = Some(part)
            }
        }
    }

    let file_name = match file_name {
        Some(file_name) => PathBuf::from(file_name),

        None => PathBuf::from("."),
    };

    Ok((parent_path, file_name))
}

/// Remove every entry inside `path`, keeping the directory itself.
pub(crate) fn clear_directory(path: &Path) -> io::Result<()> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

#[test]
fn reject_parent_components() {
    assert!(normalize_path("a/../../b").is_err());

    let (parent, name) = normalize_path("./disk/image.img").unwrap();
    assert_eq!(parent, Path::new("/disk"));
    assert_eq!(name, Path::new("image.img"));
}

#[test]
fn create_nested_directories() {
    let target = tempfile::tempdir().unwrap();
    let dir = Directory::new(target.path()).unwrap();

    dir.open_directory("a/b/c", true).unwrap();
    assert!(target.path().join("a/b/c").is_dir());

    clear_directory(target.path()).unwrap();
    assert!(std::fs::read_dir(target.path()).unwrap().next().is_none());
}
