//! Deferred-open eligibility

use crate::driver::FsDriver;
use crate::hints::Hints;

/// Whether the real open may be left to the aggregators
///
/// Requires the hints to ask for it, both collective paths of the driver to
/// be generic two-phase, and no scalable open: a scalable open must run
/// through the whole communicator at open time.
pub fn deferred_open_allowed(hints: &Hints, driver: &dyn FsDriver) -> bool {
    hints.deferred_open
        && hints.collective_buffering()
        && driver.uses_generic_read()
        && driver.uses_generic_write()
        && !driver.features().scalable_open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMode;
    use crate::driver::{DriverFile, Features, NfsDriver, TestfsDriver, UfsDriver};
    use crate::Result;
    use std::path::Path;

    struct CustomWrite;

    impl FsDriver for CustomWrite {
        fn name(&self) -> &'static str {
            "custom"
        }

        fn features(&self) -> Features {
            Features {
                two_phase: true,
                ..Features::default()
            }
        }

        fn uses_generic_write(&self) -> bool {
            false
        }

        fn open(&self, _path: &Path, _mode: AccessMode, _perm: u32) -> Result<DriverFile> {
            Ok(DriverFile::detached(Vec::new()))
        }

        fn close(&self, _file: DriverFile) -> Result<()> {
            Ok(())
        }
    }

    fn requesting() -> Hints {
        let mut hints = Hints::defaults(4);
        hints.no_indep_rw = true;
        hints.deferred_open = true;
        hints
    }

    #[test]
    fn test_generic_driver_allows_deferral() {
        assert!(deferred_open_allowed(&requesting(), &UfsDriver));
    }

    #[test]
    fn test_not_requested() {
        assert!(!deferred_open_allowed(&Hints::defaults(4), &UfsDriver));
    }

    #[test]
    fn test_non_generic_paths_disable_deferral() {
        assert!(!deferred_open_allowed(&requesting(), &NfsDriver));
        assert!(!deferred_open_allowed(&requesting(), &CustomWrite));
    }

    #[test]
    fn test_scalable_open_disables_deferral() {
        assert!(!deferred_open_allowed(&requesting(), &TestfsDriver::new()));
    }
}
