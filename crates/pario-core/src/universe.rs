//! Process-wide state shared by every file a process opens

use crate::comm::{Communicator, ReduceOp};
use crate::hints::HintSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Environment variable naming the system hint file
pub const HINTS_ENV: &str = "PARIO_HINTS";

/// Hint file read when [`HINTS_ENV`] is unset
pub const DEFAULT_HINTS_PATH: &str = "/etc/pario-hints";

/// Where system hint defaults come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintSource {
    /// The file named by `PARIO_HINTS`, else `/etc/pario-hints`
    Env,
    File(PathBuf),
    /// Hint file contents given directly
    Inline(String),
    /// Built-in defaults only
    None,
}

impl HintSource {
    /// Raw hint file contents; unreadable sources yield nothing
    fn read(&self) -> Vec<u8> {
        let path = match self {
            HintSource::Env => std::env::var_os(HINTS_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HINTS_PATH)),
            HintSource::File(path) => path.clone(),
            HintSource::Inline(text) => return text.clone().into_bytes(),
            HintSource::None => return Vec::new(),
        };
        std::fs::read(&path).unwrap_or_else(|e| {
            debug!(path = %path.display(), error = %e, "no system hint file");
            Vec::new()
        })
    }
}

/// State living as long as the process takes part in parallel I/O
///
/// Holds the system hint layer. One universe per process; ranks that are
/// threads of one process (as with `LocalComm`) each need their own.
#[derive(Debug)]
pub struct ProcessUniverse {
    source: HintSource,
    system_hints: RwLock<Option<Arc<HintSet>>>,
    constructions: AtomicUsize,
}

impl Default for ProcessUniverse {
    fn default() -> Self {
        Self::new(HintSource::Env)
    }
}

impl ProcessUniverse {
    pub fn new(source: HintSource) -> Self {
        Self {
            source,
            system_hints: RwLock::new(None),
            constructions: AtomicUsize::new(0),
        }
    }

    /// System hint layer, if negotiated already
    pub fn system_hints(&self) -> Option<Arc<HintSet>> {
        self.system_hints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times the system hint layer was built
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Negotiate the system hint layer over `comm`
    ///
    /// Collective. The layer is built only while some member still lacks it,
    /// and then by all members together: rank 0 reads the hint source and
    /// broadcasts it.
    pub fn negotiate_system_hints(&self, comm: &dyn Communicator) -> Arc<HintSet> {
        let current = self.system_hints();
        let have = i32::from(current.is_some());
        let can_skip = comm.allreduce_i32(have, ReduceOp::Min);

        if can_skip != 0 {
            if let Some(hints) = current {
                return hints;
            }
        }

        let contents = if comm.rank() == 0 {
            self.source.read()
        } else {
            Vec::new()
        };
        let contents = comm.bcast(0, contents);
        let hints = Arc::new(HintSet::parse(&String::from_utf8_lossy(&contents)));

        self.constructions.fetch_add(1, Ordering::SeqCst);
        debug!(rank = comm.rank(), count = hints.len(), "built system hints");

        *self
            .system_hints
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&hints));
        hints
    }
}
