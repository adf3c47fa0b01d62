//! Error types for pario

use thiserror::Error;

/// Stable numeric class of an error, used as the contribution to group
/// reductions. `0` is reserved for success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ErrorClass {
    Io = 1,
    Other = 2,
    NoMemory = 3,
    InvalidHint = 4,
    LogBuffer = 5,
    NoMatchingAggregators = 6,
    RemoteFailure = 7,
}

impl ErrorClass {
    /// Reduction code for this class
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Convert from a reduction code, `None` for success or unknown codes
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ErrorClass::Io),
            2 => Some(ErrorClass::Other),
            3 => Some(ErrorClass::NoMemory),
            4 => Some(ErrorClass::InvalidHint),
            5 => Some(ErrorClass::LogBuffer),
            6 => Some(ErrorClass::NoMatchingAggregators),
            7 => Some(ErrorClass::RemoteFailure),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("invalid value for hint {key}: {value:?}")]
    InvalidHint { key: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log buffer error: {0}")]
    LogBuffer(String),

    #[error("data log exhausted: requested {requested} bytes, {available} available")]
    LogExhausted { requested: usize, available: usize },

    #[error("chunk not found: index {0}")]
    ChunkNotFound(u32),

    #[error("no aggregators match cb_config_list")]
    NoMatchingAggregators,

    #[error("open failed on another process")]
    RemoteFailure,

    #[error("another process reported {0:?}")]
    Collective(ErrorClass),
}

impl Error {
    /// Class of this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::NoMemory(_) => ErrorClass::NoMemory,
            Error::InvalidHint { .. } => ErrorClass::InvalidHint,
            Error::Io(_) => ErrorClass::Io,
            Error::LogBuffer(_) | Error::LogExhausted { .. } | Error::ChunkNotFound(_) => {
                ErrorClass::LogBuffer
            }
            Error::NoMatchingAggregators => ErrorClass::NoMatchingAggregators,
            Error::RemoteFailure => ErrorClass::RemoteFailure,
            Error::Collective(class) => *class,
        }
    }

    /// Reduction code of this error, never `0`
    pub fn code(&self) -> i32 {
        self.class().code()
    }

    /// Rebuild an error from a code broadcast by another rank
    pub fn from_code(code: i32) -> Option<Self> {
        if code == 0 {
            return None;
        }
        Some(Error::Collective(
            ErrorClass::from_code(code).unwrap_or(ErrorClass::Other),
        ))
    }
}

/// Reduction code for a local status, `0` on success
pub fn status_code<T>(status: &Result<T>) -> i32 {
    status.as_ref().err().map_or(0, Error::code)
}

pub type Result<T> = std::result::Result<T, Error>;
