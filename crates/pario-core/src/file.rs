//! Per-process handle of a collectively opened file

use crate::access::AccessMode;
use crate::aggregators::AggregatorMembership;
use crate::driver::{DriverFile, FileSystemKind, FsDriver};
use crate::dtype::Datatype;
use crate::hints::{HintSet, Hints};
use crate::log_buffer::LogBuffer;
use crate::{Error, Result};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One process's view of a collectively opened file
pub struct FileHandle {
    pub(crate) path: PathBuf,
    pub(crate) fs_kind: FileSystemKind,
    pub(crate) driver: Arc<dyn FsDriver>,
    pub(crate) rank: i32,
    /// Independent file pointer, in bytes
    pub(crate) fp_ind: u64,
    /// Position of the system file pointer
    pub(crate) fp_sys_posn: u64,
    /// Shared file pointer, in etypes
    pub(crate) fp_shared: u64,
    pub(crate) disp: u64,
    pub(crate) etype: Datatype,
    pub(crate) filetype: Datatype,
    pub(crate) perm: u32,
    /// Mode as requested by the user
    pub(crate) orig_access_mode: AccessMode,
    /// Mode for any later open; never exclusive once the open completed
    pub(crate) access_mode: AccessMode,
    /// Effective hint set
    pub(crate) info: HintSet,
    pub(crate) hints: Hints,
    pub(crate) ranklist: Vec<i32>,
    pub(crate) membership: Cell<AggregatorMembership>,
    pub(crate) file: Option<DriverFile>,
    /// Collective buffering staging area
    pub(crate) io_buf: Vec<u8>,
    pub(crate) log: Option<LogBuffer>,
}

impl FileHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        path: PathBuf,
        fs_kind: FileSystemKind,
        driver: Arc<dyn FsDriver>,
        rank: i32,
        access_mode: AccessMode,
        disp: u64,
        etype: Datatype,
        filetype: Datatype,
        perm: u32,
        info: HintSet,
        hints: Hints,
    ) -> Self {
        Self {
            path,
            fs_kind,
            driver,
            rank,
            fp_ind: disp,
            fp_sys_posn: 0,
            fp_shared: 0,
            disp,
            etype,
            filetype,
            perm,
            orig_access_mode: access_mode,
            access_mode,
            info,
            hints,
            ranklist: Vec::new(),
            membership: Cell::new(AggregatorMembership::Unresolved),
            file: None,
            io_buf: Vec::new(),
            log: None,
        }
    }

    /// Allocate the collective buffer and create this rank's log files
    pub(crate) fn allocate_buffers(&mut self) -> Result<()> {
        let size = self.hints.cb_buffer_size;
        let mut io_buf = Vec::new();
        io_buf
            .try_reserve_exact(size)
            .map_err(|e| Error::NoMemory(format!("collective buffer of {} bytes: {}", size, e)))?;
        io_buf.resize(size, 0);
        self.io_buf = io_buf;

        self.log = Some(LogBuffer::create(
            &self.hints.shared_buffer_folder,
            self.rank,
            self.hints.data_buffer_size,
        )?);
        Ok(())
    }

    pub(crate) fn set_ranklist(&mut self, ranklist: Vec<i32>) {
        self.ranklist = ranklist;
        self.membership.set(AggregatorMembership::Unresolved);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fs_kind(&self) -> FileSystemKind {
        self.fs_kind
    }

    pub fn driver(&self) -> &Arc<dyn FsDriver> {
        &self.driver
    }

    /// Rank of this process in the opening communicator
    pub fn rank(&self) -> i32 {
        self.rank
    }

    pub fn disp(&self) -> u64 {
        self.disp
    }

    pub fn etype(&self) -> Datatype {
        self.etype
    }

    pub fn etype_size(&self) -> usize {
        self.etype.size()
    }

    pub fn filetype(&self) -> Datatype {
        self.filetype
    }

    pub fn perm(&self) -> u32 {
        self.perm
    }

    pub fn fp_ind(&self) -> u64 {
        self.fp_ind
    }

    pub fn fp_sys_posn(&self) -> u64 {
        self.fp_sys_posn
    }

    pub fn fp_shared(&self) -> u64 {
        self.fp_shared
    }

    /// Mode the user asked for
    pub fn orig_access_mode(&self) -> AccessMode {
        self.orig_access_mode
    }

    /// Mode used by a later deferred open
    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    /// Effective hint set
    pub fn info(&self) -> &HintSet {
        &self.info
    }

    pub fn hints(&self) -> &Hints {
        &self.hints
    }

    /// Elected aggregator ranks, in election order
    pub fn ranklist(&self) -> &[i32] {
        &self.ranklist
    }

    pub fn deferred_open(&self) -> bool {
        self.hints.deferred_open
    }

    /// Whether this process has actually opened the file
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn driver_file(&self) -> Option<&DriverFile> {
        self.file.as_ref()
    }

    pub fn io_buffer(&self) -> &[u8] {
        &self.io_buf
    }

    pub fn log_buffer(&self) -> Option<&LogBuffer> {
        self.log.as_ref()
    }

    pub fn log_buffer_mut(&mut self) -> Option<&mut LogBuffer> {
        self.log.as_mut()
    }

    /// Cached membership of this process
    pub fn membership(&self) -> AggregatorMembership {
        self.membership.get()
    }

    /// Whether `rank` is one of the aggregators
    ///
    /// The answer for this process's own rank is computed once and cached.
    pub fn is_aggregator(&self, rank: i32) -> bool {
        if rank != self.rank {
            return AggregatorMembership::resolve(rank, &self.ranklist).is_member();
        }
        let mut membership = self.membership.get();
        if membership == AggregatorMembership::Unresolved {
            membership = AggregatorMembership::resolve(rank, &self.ranklist);
            self.membership.set(membership);
        }
        membership.is_member()
    }

    /// Open the file locally if the collective open deferred it
    ///
    /// Uses the retained access mode, so an exclusive create requested for
    /// the collective open is not attempted again.
    pub fn ensure_open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        debug!(rank = self.rank, path = %self.path.display(), "deferred open");
        let file = self.driver.open(&self.path, self.access_mode, self.perm)?;
        self.file = Some(file);
        Ok(())
    }

    /// Close the local file, if open
    pub(crate) fn close_local(&mut self) -> Result<()> {
        match self.file.take() {
            Some(file) => self.driver.close(file),
            None => Ok(()),
        }
    }

    /// Close the file and release every resource of the handle
    pub fn close(mut self) -> Result<()> {
        self.close_local()?;
        if let Some(log) = self.log.take() {
            log.flush()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("fs", &self.driver.name())
            .field("rank", &self.rank)
            .field("access_mode", &self.access_mode)
            .field("ranklist", &self.ranklist)
            .field("deferred_open", &self.hints.deferred_open)
            .field("is_open", &self.is_open())
            .finish()
    }
}
