//! pario - collective file open for parallel I/O
//!
//! Every rank of a group opens a shared file together through [`open`]: the
//! group agrees on hints, elects aggregators, decides whether the real open
//! may be deferred, opens through the filesystem driver, and either all ranks
//! get a [`FileHandle`] or none does. Each rank also gets a memory-mapped
//! [`LogBuffer`] for staging writes.

pub mod access;
pub mod aggregators;
pub mod chunk;
pub mod comm;
pub mod deferred;
pub mod driver;
pub mod dtype;
pub mod error;
pub mod file;
pub mod hints;
pub mod log_buffer;
pub mod mapped;
pub mod open;
pub mod universe;

pub use access::AccessMode;
pub use aggregators::{elect_aggregators, AggregatorMembership};
pub use chunk::{ChunkRecord, LogItem, M_CHUNK_COUNT};
pub use comm::{Communicator, LocalComm, NameArray, ReduceOp};
pub use deferred::deferred_open_allowed;
pub use driver::{DriverFile, Features, FileSystemKind, FsDriver, NfsDriver, TestfsDriver, UfsDriver};
pub use dtype::Datatype;
pub use error::{Error, ErrorClass, Result};
pub use file::FileHandle;
pub use hints::{HintSet, Hints};
pub use log_buffer::LogBuffer;
pub use open::{open, open_collective, OpenRequest, OpenStrategy};
pub use universe::{HintSource, ProcessUniverse};
