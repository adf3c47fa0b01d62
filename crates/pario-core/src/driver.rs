//! Filesystem drivers
//!
//! A driver performs the local open and close of one backend. The collective
//! open picks its strategy from the driver's [`Features`].

use crate::access::AccessMode;
use crate::{Error, Result};
use nix::fcntl::OFlag;
use nix::sys::stat::{mode_t, Mode};
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Default permissions for created files, before the umask
pub const DEFAULT_PERM: u32 = 0o666;

/// Capabilities a driver declares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Collective reads and writes go through the generic two-phase code
    pub two_phase: bool,
    /// One process opens and shares the result with the group
    pub scalable_open: bool,
    /// Client caching may hide a file another process just created
    pub loose_consistency: bool,
}

/// A file opened by a driver
#[derive(Debug)]
pub struct DriverFile {
    fd: Option<OwnedFd>,
    token: Vec<u8>,
}

impl DriverFile {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd: Some(fd),
            token: Vec::new(),
        }
    }

    /// A file without a local descriptor, identified by `token`
    pub fn detached(token: Vec<u8>) -> Self {
        Self { fd: None, token }
    }

    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }
}

/// Open/close operations of one filesystem backend
pub trait FsDriver: Send + Sync {
    /// Name recorded as `romio_filesystem_type`
    fn name(&self) -> &'static str;

    fn features(&self) -> Features;

    fn uses_generic_read(&self) -> bool {
        self.features().two_phase
    }

    fn uses_generic_write(&self) -> bool {
        self.features().two_phase
    }

    fn open(&self, path: &Path, mode: AccessMode, perm: u32) -> Result<DriverFile>;

    /// State a scalable-open root hands to the rest of the group
    fn export(&self, file: &DriverFile) -> Vec<u8> {
        file.token().to_vec()
    }

    /// Open from state exported by the root of a scalable open
    fn attach(&self, path: &Path, token: &[u8], mode: AccessMode, perm: u32) -> Result<DriverFile> {
        let _ = token;
        self.open(path, mode.without(AccessMode::CREATE | AccessMode::EXCL), perm)
    }

    fn close(&self, file: DriverFile) -> Result<()>;
}

fn posix_open(path: &Path, mode: AccessMode, perm: u32) -> Result<DriverFile> {
    let mut flags = OFlag::O_CLOEXEC;
    if mode.contains(AccessMode::RDWR) {
        flags |= OFlag::O_RDWR;
    } else if mode.contains(AccessMode::WRONLY) {
        flags |= OFlag::O_WRONLY;
    } else {
        flags |= OFlag::O_RDONLY;
    }
    if mode.contains(AccessMode::CREATE) {
        flags |= OFlag::O_CREAT;
    }
    if mode.contains(AccessMode::EXCL) {
        flags |= OFlag::O_EXCL;
    }
    if mode.contains(AccessMode::APPEND) {
        flags |= OFlag::O_APPEND;
    }

    let raw = nix::fcntl::open(path, flags, Mode::from_bits_truncate(perm as mode_t))
        .map_err(std::io::Error::from)?;
    // Safety: `raw` was just returned by open(2) and is owned by nobody else
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    Ok(DriverFile::from_fd(fd))
}

fn posix_close(file: DriverFile) -> Result<()> {
    if let Some(fd) = file.fd {
        nix::unistd::close(fd.into_raw_fd()).map_err(std::io::Error::from)?;
    }
    Ok(())
}

/// Local POSIX filesystem
#[derive(Debug, Default)]
pub struct UfsDriver;

impl FsDriver for UfsDriver {
    fn name(&self) -> &'static str {
        "ufs"
    }

    fn features(&self) -> Features {
        Features {
            two_phase: true,
            ..Features::default()
        }
    }

    fn open(&self, path: &Path, mode: AccessMode, perm: u32) -> Result<DriverFile> {
        posix_open(path, mode, perm)
    }

    fn close(&self, file: DriverFile) -> Result<()> {
        posix_close(file)
    }
}

/// NFS mount: POSIX calls, loose cache consistency, locking read/write paths
#[derive(Debug, Default)]
pub struct NfsDriver;

impl FsDriver for NfsDriver {
    fn name(&self) -> &'static str {
        "nfs"
    }

    fn features(&self) -> Features {
        Features {
            loose_consistency: true,
            ..Features::default()
        }
    }

    fn open(&self, path: &Path, mode: AccessMode, perm: u32) -> Result<DriverFile> {
        posix_open(path, mode, perm)
    }

    fn close(&self, file: DriverFile) -> Result<()> {
        posix_close(file)
    }
}

/// Operation recorded by [`TestfsDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestfsOp {
    Open(PathBuf, AccessMode),
    Attach(PathBuf),
    Close,
}

/// Driver that touches no storage and records every call
///
/// Declares scalable open: the opener's token is the path itself.
#[derive(Debug, Default)]
pub struct TestfsDriver {
    ops: Mutex<Vec<TestfsOp>>,
}

impl TestfsDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations performed so far
    pub fn ops(&self) -> Vec<TestfsOp> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, op: TestfsOp) {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner).push(op);
    }
}

impl FsDriver for TestfsDriver {
    fn name(&self) -> &'static str {
        "testfs"
    }

    fn features(&self) -> Features {
        Features {
            two_phase: true,
            scalable_open: true,
            loose_consistency: false,
        }
    }

    fn open(&self, path: &Path, mode: AccessMode, _perm: u32) -> Result<DriverFile> {
        self.record(TestfsOp::Open(path.to_path_buf(), mode));
        Ok(DriverFile::detached(
            path.to_string_lossy().into_owned().into_bytes(),
        ))
    }

    fn attach(&self, path: &Path, token: &[u8], _mode: AccessMode, _perm: u32) -> Result<DriverFile> {
        if token != path.to_string_lossy().as_bytes() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "scalable open token does not match path",
            )));
        }
        self.record(TestfsOp::Attach(path.to_path_buf()));
        Ok(DriverFile::detached(token.to_vec()))
    }

    fn close(&self, _file: DriverFile) -> Result<()> {
        self.record(TestfsOp::Close);
        Ok(())
    }
}

/// Filesystem kind tag selecting a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemKind {
    Ufs,
    Nfs,
    Testfs,
}

impl FileSystemKind {
    pub fn name(&self) -> &'static str {
        match self {
            FileSystemKind::Ufs => "ufs",
            FileSystemKind::Nfs => "nfs",
            FileSystemKind::Testfs => "testfs",
        }
    }

    /// Split an optional `kind:` prefix off `path`
    ///
    /// Paths without a known prefix are local POSIX files.
    pub fn resolve(path: &str) -> (FileSystemKind, &str) {
        for kind in [FileSystemKind::Ufs, FileSystemKind::Nfs, FileSystemKind::Testfs] {
            if let Some(rest) = path
                .strip_prefix(kind.name())
                .and_then(|rest| rest.strip_prefix(':'))
            {
                return (kind, rest);
            }
        }
        (FileSystemKind::Ufs, path)
    }

    /// A fresh driver for this kind
    pub fn driver(&self) -> Arc<dyn FsDriver> {
        match self {
            FileSystemKind::Ufs => Arc::new(UfsDriver),
            FileSystemKind::Nfs => Arc::new(NfsDriver),
            FileSystemKind::Testfs => Arc::new(TestfsDriver::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefix() {
        assert_eq!(FileSystemKind::resolve("nfs:/mnt/a"), (FileSystemKind::Nfs, "/mnt/a"));
        assert_eq!(FileSystemKind::resolve("testfs:x"), (FileSystemKind::Testfs, "x"));
        assert_eq!(FileSystemKind::resolve("/plain/path"), (FileSystemKind::Ufs, "/plain/path"));
        assert_eq!(FileSystemKind::resolve("nfsish:/a"), (FileSystemKind::Ufs, "nfsish:/a"));
    }

    #[test]
    fn test_ufs_exclusive_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let driver = UfsDriver;
        let mode = AccessMode::CREATE | AccessMode::EXCL | AccessMode::RDWR;

        let file = driver.open(&path, mode, DEFAULT_PERM).unwrap();
        assert!(file.fd().is_some());
        driver.close(file).unwrap();

        let err = driver.open(&path, mode, DEFAULT_PERM).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::AlreadyExists),
            other => panic!("unexpected error: {:?}", other),
        }
        let file = driver.open(&path, mode.without(AccessMode::EXCL), DEFAULT_PERM).unwrap();
        driver.close(file).unwrap();
    }

    #[test]
    fn test_ufs_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(UfsDriver
            .open(&dir.path().join("missing"), AccessMode::RDONLY, DEFAULT_PERM)
            .is_err());
    }

    #[test]
    fn test_testfs_records_ops() {
        let driver = TestfsDriver::new();
        let path = Path::new("/virtual/file");
        let file = driver.open(path, AccessMode::CREATE | AccessMode::RDWR, 0).unwrap();
        let token = driver.export(&file);
        let attached = driver.attach(path, &token, AccessMode::RDWR, 0).unwrap();
        driver.close(attached).unwrap();
        assert!(driver.attach(Path::new("/other"), &token, AccessMode::RDWR, 0).is_err());

        assert_eq!(
            driver.ops(),
            vec![
                TestfsOp::Open(path.to_path_buf(), AccessMode::CREATE | AccessMode::RDWR),
                TestfsOp::Attach(path.to_path_buf()),
                TestfsOp::Close,
            ]
        );
    }

    #[test]
    fn test_features() {
        assert!(UfsDriver.uses_generic_read() && UfsDriver.uses_generic_write());
        assert!(!NfsDriver.uses_generic_write());
        assert!(TestfsDriver::new().features().scalable_open);
    }
}
