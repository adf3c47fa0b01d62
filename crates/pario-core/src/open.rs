//! Collective open
//!
//! Every rank of the working communicator calls [`open`] with the same
//! arguments. The protocol runs these steps in order:
//!
//! 1. negotiate the system hint layer (collective),
//! 2. merge user hints over it and normalise them,
//! 3. allocate the collective buffer and the rank's log files,
//! 4. decide whether the real open may be deferred,
//! 5. elect aggregators (collective),
//! 6. open through the driver's strategy (collective),
//! 7. reduce the status of every rank and roll back together on failure.
//!
//! A rank that fails a local step keeps taking part in the remaining
//! collectives so nobody blocks; the final reduction turns its failure into a
//! group failure.

use crate::access::AccessMode;
use crate::aggregators::elect_aggregators;
use crate::comm::{bcast_status, Communicator, ReduceOp};
use crate::deferred::deferred_open_allowed;
use crate::driver::{FileSystemKind, FsDriver, DEFAULT_PERM};
use crate::dtype::Datatype;
use crate::error::status_code;
use crate::file::FileHandle;
use crate::hints::{self, HintSet, Hints};
use crate::universe::ProcessUniverse;
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Environment toggle: rank 0 logs the effective hints after a successful open
pub const PRINT_HINTS_ENV: &str = "PARIO_PRINT_HINTS";

/// Arguments of a collective open, identical on every rank
#[derive(Clone)]
pub struct OpenRequest {
    pub path: PathBuf,
    pub fs_kind: FileSystemKind,
    pub driver: Arc<dyn FsDriver>,
    pub access_mode: AccessMode,
    pub disp: u64,
    pub etype: Datatype,
    pub filetype: Datatype,
    pub hints: HintSet,
    pub perm: u32,
}

impl OpenRequest {
    /// Request for `path`; a `ufs:`, `nfs:` or `testfs:` prefix selects the driver
    pub fn new(path: &str, access_mode: AccessMode) -> Self {
        let (fs_kind, path) = FileSystemKind::resolve(path);
        Self {
            path: PathBuf::from(path),
            fs_kind,
            driver: fs_kind.driver(),
            access_mode,
            disp: 0,
            etype: Datatype::Byte,
            filetype: Datatype::Byte,
            hints: HintSet::new(),
            perm: DEFAULT_PERM,
        }
    }

    /// Use `driver` for `fs_kind` instead of the built-in one
    pub fn with_driver(mut self, fs_kind: FileSystemKind, driver: Arc<dyn FsDriver>) -> Self {
        self.fs_kind = fs_kind;
        self.driver = driver;
        self
    }

    pub fn with_hints(mut self, hints: HintSet) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_hint(mut self, key: &str, value: impl Into<String>) -> Self {
        self.hints.set(key, value);
        self
    }

    pub fn with_disp(mut self, disp: u64) -> Self {
        self.disp = disp;
        self
    }

    pub fn with_types(mut self, etype: Datatype, filetype: Datatype) -> Self {
        self.etype = etype;
        self.filetype = filetype;
        self
    }

    pub fn with_perm(mut self, perm: u32) -> Self {
        self.perm = perm;
        self
    }
}

/// How the ranks of a group open the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStrategy {
    /// First aggregator creates, then everyone opens
    Generic,
    /// Everyone opens independently
    Failsafe,
    /// First aggregator opens and shares the result
    Scalable,
}

impl OpenStrategy {
    pub fn for_driver(driver: &dyn FsDriver) -> Self {
        let features = driver.features();
        if features.scalable_open {
            OpenStrategy::Scalable
        } else if features.loose_consistency {
            OpenStrategy::Failsafe
        } else {
            OpenStrategy::Generic
        }
    }
}

/// Open `file` on every rank of `comm`
///
/// Collective. The aggregator list must already be elected.
pub fn open_collective(
    file: &mut FileHandle,
    comm: &dyn Communicator,
    access_mode: AccessMode,
) -> Result<()> {
    dispatch(file, comm, access_mode, 0)
}

/// Run the driver's strategy; a rank with a nonzero `local_code` only takes
/// part in the collectives and never opens
fn dispatch(
    file: &mut FileHandle,
    comm: &dyn Communicator,
    access_mode: AccessMode,
    local_code: i32,
) -> Result<()> {
    let root = *file.ranklist.first().ok_or(Error::NoMatchingAggregators)?;
    let strategy = OpenStrategy::for_driver(file.driver.as_ref());
    debug!(rank = file.rank, root, ?strategy, ?access_mode, "collective open");

    match strategy {
        OpenStrategy::Generic => {
            let mut mode = access_mode;
            if mode.contains(AccessMode::CREATE) {
                create_on_root(file, comm, root, mode, local_code)?;
                mode = mode.without(AccessMode::CREATE | AccessMode::EXCL);
            }
            open_local(file, mode, local_code)
        }
        OpenStrategy::Failsafe => {
            let mut mode = access_mode;
            if mode.is_exclusive_create() {
                create_on_root(file, comm, root, mode, local_code)?;
                mode = mode.without(AccessMode::EXCL);
            }
            open_local(file, mode, local_code)
        }
        OpenStrategy::Scalable => {
            let mut opened = Ok(Vec::new());
            if file.rank == root && local_code == 0 {
                opened = file
                    .driver
                    .open(&file.path, access_mode, file.perm)
                    .map(|f| {
                        let token = file.driver.export(&f);
                        file.file = Some(f);
                        token
                    });
            }
            let code = if file.rank == root {
                if local_code != 0 {
                    local_code
                } else {
                    status_code(&opened)
                }
            } else {
                0
            };
            let token = opened.as_deref().unwrap_or_default().to_vec();
            let (code, token) = bcast_status(comm, root, code, &token);

            if file.rank == root {
                return opened.map(|_| ());
            }
            if let Some(err) = Error::from_code(code) {
                return Err(err);
            }
            if local_code == 0 {
                let mode = access_mode.without(AccessMode::CREATE | AccessMode::EXCL);
                file.file = Some(file.driver.attach(&file.path, &token, mode, file.perm)?);
            }
            Ok(())
        }
    }
}

/// The root alone creates the file so ranks do not race on creation, then
/// shares the outcome
fn create_on_root(
    file: &FileHandle,
    comm: &dyn Communicator,
    root: i32,
    mode: AccessMode,
    local_code: i32,
) -> Result<()> {
    let mut created = Ok(());
    let mut code = 0;
    if file.rank == root {
        if local_code == 0 {
            created = file
                .driver
                .open(&file.path, mode, file.perm)
                .and_then(|f| file.driver.close(f));
            code = status_code(&created);
        } else {
            code = local_code;
        }
    }

    let (code, _) = bcast_status(comm, root, code, &[]);
    created?;
    match Error::from_code(code) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn open_local(file: &mut FileHandle, mode: AccessMode, local_code: i32) -> Result<()> {
    if local_code != 0 {
        return Ok(());
    }
    if file.hints.deferred_open && !file.is_aggregator(file.rank) {
        // remembered for a later ensure_open()
        return Ok(());
    }
    file.file = Some(file.driver.open(&file.path, mode, file.perm)?);
    Ok(())
}

/// Collectively open a file
///
/// Every rank of `comm` must call this with the same request. `orig_comm` is
/// the communicator the user passed; `comm` the private one the file works
/// on. On failure of any rank, no rank returns a handle.
pub fn open(
    universe: &ProcessUniverse,
    orig_comm: &dyn Communicator,
    comm: &dyn Communicator,
    request: OpenRequest,
) -> Result<FileHandle> {
    let rank = comm.rank();
    let procs = comm.size();
    let OpenRequest {
        path,
        fs_kind,
        driver,
        access_mode,
        disp,
        etype,
        filetype,
        hints: user_hints,
        perm,
    } = request;

    let system_hints = universe.negotiate_system_hints(comm);
    let mut info = hints::merge(&user_hints, &system_hints, driver.name(), &comm.info());
    let (typed, mut status) = match Hints::from_info(&mut info, procs) {
        Ok(typed) => (typed, Ok(())),
        Err(e) => (Hints::defaults(procs), Err(e)),
    };

    let mut file = FileHandle::new(
        path,
        fs_kind,
        Arc::clone(&driver),
        rank,
        access_mode,
        disp,
        etype,
        filetype,
        perm,
        info,
        typed,
    );

    if status.is_ok() {
        status = file.allocate_buffers();
    }

    if file.hints.deferred_open && !deferred_open_allowed(&file.hints, driver.as_ref()) {
        debug!(rank, fs = driver.name(), "deferred open disabled for this driver");
        file.hints.deferred_open = false;
    }

    let elected = elect_aggregators(&mut file, orig_comm, comm);
    if status.is_ok() {
        status = elected;
    }

    // the rank list is identical everywhere, so either all ranks open or none
    if !file.ranklist.is_empty() {
        let opened = dispatch(&mut file, comm, access_mode, status_code(&status));
        if status.is_ok() {
            status = opened;
        }
    }

    file.orig_access_mode = access_mode;
    file.access_mode = access_mode.without(AccessMode::EXCL);

    let group_code = comm.allreduce_i32(status_code(&status), ReduceOp::Max);
    if group_code != 0 {
        return Err(rollback(file, status));
    }

    if rank == 0 && std::env::var_os(PRINT_HINTS_ENV).is_some() {
        info!(path = %file.path.display(), "effective hints:\n{}", file.info);
    }
    debug!(
        rank,
        path = %file.path.display(),
        aggregators = file.ranklist.len(),
        is_aggregator = file.is_aggregator(rank),
        deferred_open = file.hints.deferred_open,
        is_open = file.is_open(),
        "collective open complete"
    );
    Ok(file)
}

/// Undo the local part of a failed open and pick the error to report
///
/// Only ranks that really opened hold a driver file, so with deferred open
/// only the aggregators close.
fn rollback(mut file: FileHandle, status: Result<()>) -> Error {
    let closed = file.close_local();
    warn!(
        rank = file.rank,
        path = %file.path.display(),
        local_ok = status.is_ok(),
        "open failed in the group, rolling back"
    );
    // releases path, rank list, placement directive, hints, buffers and logs
    drop(file);

    match (status, closed) {
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "close during rollback failed");
            e
        }
        (Err(e), Ok(())) => e,
        (Ok(()), Err(close_err)) => close_err,
        (Ok(()), Ok(())) => Error::RemoteFailure,
    }
}
