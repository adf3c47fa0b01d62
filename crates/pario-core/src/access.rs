//! File access mode definitions

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Access mode bits requested for a collective open
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccessMode(u32);

impl AccessMode {
    pub const CREATE: AccessMode = AccessMode(1);
    pub const RDONLY: AccessMode = AccessMode(2);
    pub const WRONLY: AccessMode = AccessMode(4);
    pub const RDWR: AccessMode = AccessMode(8);
    pub const DELETE_ON_CLOSE: AccessMode = AccessMode(16);
    pub const UNIQUE_OPEN: AccessMode = AccessMode(32);
    pub const EXCL: AccessMode = AccessMode(64);
    pub const APPEND: AccessMode = AccessMode(128);
    pub const SEQUENTIAL: AccessMode = AccessMode(256);

    /// No bits set
    pub const fn empty() -> Self {
        AccessMode(0)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set
    pub const fn contains(self, other: AccessMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Copy of `self` with the bits of `other` cleared
    pub const fn without(self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 & !other.0)
    }

    /// Whether the mode asks for exclusive creation
    pub const fn is_exclusive_create(self) -> bool {
        self.contains(AccessMode::CREATE) && self.contains(AccessMode::EXCL)
    }
}

impl BitOr for AccessMode {
    type Output = AccessMode;

    fn bitor(self, rhs: AccessMode) -> AccessMode {
        AccessMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMode {
    fn bitor_assign(&mut self, rhs: AccessMode) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(AccessMode, &str); 9] = [
            (AccessMode::CREATE, "CREATE"),
            (AccessMode::RDONLY, "RDONLY"),
            (AccessMode::WRONLY, "WRONLY"),
            (AccessMode::RDWR, "RDWR"),
            (AccessMode::DELETE_ON_CLOSE, "DELETE_ON_CLOSE"),
            (AccessMode::UNIQUE_OPEN, "UNIQUE_OPEN"),
            (AccessMode::EXCL, "EXCL"),
            (AccessMode::APPEND, "APPEND"),
            (AccessMode::SEQUENTIAL, "SEQUENTIAL"),
        ];
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AccessMode({})", names.join("|"))
    }
}
