//! Collective open across ranks running as threads

use pario_core::chunk::METADATA_LOG_SIZE;
use pario_core::driver::{DriverFile, Features, TestfsOp, DEFAULT_PERM};
use pario_core::hints::{
    CB_BUFFER_SIZE, CB_CONFIG_LIST, CB_NODES, DATA_BUFFER_SIZE, MEMORY_ALLOC_KINDS,
    ROMIO_FILESYSTEM_TYPE, ROMIO_NO_INDEP_RW, SHARED_BUFFER_FOLDER,
};
use pario_core::open::PRINT_HINTS_ENV;
use pario_core::{
    open, AccessMode, Communicator, Error, FileHandle, FileSystemKind, FsDriver, HintSet,
    HintSource, LocalComm, LogBuffer, NfsDriver, OpenRequest, ProcessUniverse, Result,
    TestfsDriver, UfsDriver, M_CHUNK_COUNT,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `f` on one thread per rank with an original and a working communicator
fn run_ranks<T, F>(hosts: &[&str], f: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&LocalComm, &LocalComm) -> T + Send + Sync + 'static,
{
    init_tracing();
    let f = Arc::new(f);
    let handles: Vec<_> = LocalComm::on_hosts(hosts)
        .into_iter()
        .zip(LocalComm::on_hosts(hosts))
        .map(|(orig, comm)| {
            let f = Arc::clone(&f);
            thread::spawn(move || f(&orig, &comm))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank panicked"))
        .collect()
}

fn request(dir: &Path, name: &str, mode: AccessMode) -> OpenRequest {
    OpenRequest::new(dir.join(name).to_str().unwrap(), mode)
        .with_hint(SHARED_BUFFER_FOLDER, dir.to_str().unwrap())
        .with_hint(CB_BUFFER_SIZE, "4096")
        .with_hint(DATA_BUFFER_SIZE, "1024")
}

fn rdwr_create() -> AccessMode {
    AccessMode::CREATE | AccessMode::RDWR
}

/// POSIX driver counting successful opens and closes; can be told to fail
#[derive(Default)]
struct CountingDriver {
    fail_open: bool,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

impl CountingDriver {
    fn failing() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }
}

impl FsDriver for CountingDriver {
    fn name(&self) -> &'static str {
        "ufs"
    }

    fn features(&self) -> Features {
        UfsDriver.features()
    }

    fn open(&self, path: &Path, mode: AccessMode, perm: u32) -> Result<DriverFile> {
        if self.fail_open {
            return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)));
        }
        let file = UfsDriver.open(path, mode, perm)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(file)
    }

    fn close(&self, file: DriverFile) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        UfsDriver.close(file)
    }
}

#[test]
fn test_system_hints_built_once_over_many_opens() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["n0", "n0", "n1"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::Inline("cb_buffer_size 8192\n".into()));
        for i in 0..4 {
            let req = request(&folder, &format!("file-{}", i), rdwr_create())
                .with_hints(
                    [
                        (SHARED_BUFFER_FOLDER, folder.to_str().unwrap()),
                        (DATA_BUFFER_SIZE, "1024"),
                    ]
                    .into_iter()
                    .collect(),
                );
            let fh = open(&universe, orig, comm, req).unwrap();
            assert_eq!(fh.hints().cb_buffer_size, 8192);
            assert_eq!(fh.io_buffer().len(), 8192);
            fh.close().unwrap();
        }
        universe.constructions()
    });

    assert_eq!(results, vec![1, 1, 1]);
}

#[test]
fn test_aggregator_membership() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "a", "b", "b", "c"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let fh = open(&universe, orig, comm, request(&folder, "agg", rdwr_create())).unwrap();

        for _ in 0..3 {
            for rank in 0..comm.size() {
                assert_eq!(fh.is_aggregator(rank), fh.ranklist().contains(&rank));
            }
        }
        let ranklist = fh.ranklist().to_vec();
        let own = fh.is_aggregator(comm.rank());
        let cb_nodes = fh.info().get(CB_NODES).map(str::to_string);
        fh.close().unwrap();
        (ranklist, own, cb_nodes)
    });

    for (rank, (ranklist, own, cb_nodes)) in results.into_iter().enumerate() {
        assert_eq!(ranklist, vec![0, 2, 4]);
        assert_eq!(own, rank % 2 == 0);
        assert_eq!(cb_nodes.as_deref(), Some("3"));
    }
}

#[test]
fn test_name_array_cached_on_both_communicators() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "b"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        open(&universe, orig, comm, request(&folder, "cache", rdwr_create()))
            .unwrap()
            .close()
            .unwrap();
        (
            orig.cached_name_array().map(|n| n.names().to_vec()),
            comm.cached_name_array().map(|n| n.names().to_vec()),
        )
    });

    for (on_orig, on_comm) in results {
        let expected = Some(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(on_orig, expected);
        assert_eq!(on_comm, expected);
    }
}

#[test]
fn test_deferred_open_only_aggregators_open() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "a", "b", "b"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let req = request(&folder, "deferred", rdwr_create()).with_hint(ROMIO_NO_INDEP_RW, "true");
        let mut fh = open(&universe, orig, comm, req).unwrap();

        let deferred = fh.deferred_open();
        let opened_collectively = fh.is_open();
        let aggregator = fh.is_aggregator(comm.rank());
        // an independent access later opens on its own
        fh.ensure_open().unwrap();
        let opened_later = fh.is_open();
        fh.close().unwrap();
        (deferred, opened_collectively, aggregator, opened_later)
    });

    for (deferred, opened, aggregator, opened_later) in results {
        assert!(deferred);
        assert_eq!(opened, aggregator);
        assert!(opened_later);
    }
}

#[test]
fn test_deferred_open_disabled_for_non_generic_driver() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "b", "c"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let req = request(&folder, "nfs-file", rdwr_create())
            .with_driver(FileSystemKind::Nfs, Arc::new(NfsDriver))
            .with_hint(ROMIO_NO_INDEP_RW, "true");
        let fh = open(&universe, orig, comm, req).unwrap();
        let state = (
            fh.deferred_open(),
            fh.is_open(),
            fh.info().get(ROMIO_FILESYSTEM_TYPE).map(str::to_string),
        );
        fh.close().unwrap();
        state
    });

    for (deferred, is_open, fs_type) in results {
        assert!(!deferred);
        assert!(is_open);
        assert_eq!(fs_type.as_deref(), Some("nfs"));
    }
}

#[test]
fn test_exclusive_create_cleared_after_open() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();
    let mode = AccessMode::CREATE | AccessMode::EXCL | AccessMode::RDWR;

    let results = run_ranks(&["a", "a", "b"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let fh = open(&universe, orig, comm, request(&folder, "excl", mode)).unwrap();
        let modes = (fh.orig_access_mode(), fh.access_mode(), fh.is_open());
        fh.close().unwrap();
        modes
    });

    for (orig_mode, retained, is_open) in results {
        assert_eq!(orig_mode, mode);
        assert!(!retained.contains(AccessMode::EXCL));
        assert!(retained.contains(AccessMode::CREATE | AccessMode::RDWR));
        assert!(is_open);
    }
    assert!(dir.path().join("excl").exists());
}

#[test]
fn test_exclusive_create_of_existing_file_fails_everywhere() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("taken"), b"").unwrap();
    let folder = dir.path().to_path_buf();
    let mode = AccessMode::CREATE | AccessMode::EXCL | AccessMode::RDWR;

    let results = run_ranks(&["a", "b"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        open(&universe, orig, comm, request(&folder, "taken", mode)).map(|_| ())
    });

    assert!(matches!(&results[0], Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists));
    assert!(matches!(&results[1], Err(Error::Collective(_))));
}

#[test]
fn test_rollback_when_one_rank_fails() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "b", "c"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let driver = Arc::new(if comm.rank() == 1 {
            CountingDriver::failing()
        } else {
            CountingDriver::default()
        });
        let req = request(&folder, "shared", rdwr_create())
            .with_driver(FileSystemKind::Ufs, driver.clone());
        let outcome: Option<FileHandle> = match open(&universe, orig, comm, req) {
            Ok(fh) => Some(fh),
            Err(e) => {
                assert_ne!(e.code(), 0);
                None
            }
        };
        (
            outcome.is_none(),
            driver.opens.load(Ordering::SeqCst),
            driver.closes.load(Ordering::SeqCst),
        )
    });

    for (rank, (no_handle, opens, closes)) in results.into_iter().enumerate() {
        assert!(no_handle, "rank {} kept a handle", rank);
        assert_eq!(opens, closes, "rank {} leaked an open file", rank);
        if rank != 1 {
            assert!(opens > 0);
        }
    }
}

#[test]
fn test_rollback_with_deferred_open_closes_only_aggregators() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    // one aggregator per host: ranks 0 and 2
    let results = run_ranks(&["a", "a", "b", "b"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let driver = Arc::new(CountingDriver::default());
        let mut req = request(&folder, "deferred-rollback", rdwr_create())
            .with_driver(FileSystemKind::Ufs, driver.clone())
            .with_hint(ROMIO_NO_INDEP_RW, "true")
            .with_hint(CB_CONFIG_LIST, "*:1");
        if comm.rank() == 3 {
            // log files cannot be created in a missing folder
            let missing = folder.join("missing");
            req = req.with_hint(SHARED_BUFFER_FOLDER, missing.to_str().unwrap());
        }
        let outcome = open(&universe, orig, comm, req).map(|_| ());
        (
            outcome,
            driver.opens.load(Ordering::SeqCst),
            driver.closes.load(Ordering::SeqCst),
        )
    });

    for (rank, (outcome, opens, closes)) in results.into_iter().enumerate() {
        if rank == 3 {
            assert!(matches!(outcome, Err(Error::LogBuffer(_))));
        } else {
            assert!(matches!(outcome, Err(Error::RemoteFailure)), "rank {}", rank);
        }
        if rank % 2 == 0 {
            assert!(opens > 0, "aggregator {} never opened", rank);
            assert_eq!(opens, closes, "aggregator {} leaked an open file", rank);
        } else {
            assert_eq!((opens, closes), (0, 0), "rank {} touched the file", rank);
        }
    }
}

#[test]
fn test_rollback_error_codes() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "b", "c"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let driver: Arc<dyn FsDriver> = if comm.rank() == 1 {
            Arc::new(CountingDriver::failing())
        } else {
            Arc::new(UfsDriver)
        };
        let req = request(&folder, "codes", rdwr_create()).with_driver(FileSystemKind::Ufs, driver);
        open(&universe, orig, comm, req).map(|_| ())
    });

    assert!(matches!(results[0], Err(Error::RemoteFailure)));
    assert!(matches!(results[1], Err(Error::Io(_))));
    assert!(matches!(results[2], Err(Error::RemoteFailure)));
}

#[test]
fn test_local_hint_failure_keeps_group_in_step() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "a", "a"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let mut req = request(&folder, "bad-hint", rdwr_create());
        if comm.rank() == 2 {
            req = req.with_hint(DATA_BUFFER_SIZE, "0");
        }
        open(&universe, orig, comm, req).map(|_| ())
    });

    assert!(matches!(results[0], Err(Error::RemoteFailure)));
    assert!(matches!(results[1], Err(Error::RemoteFailure)));
    assert!(matches!(results[2], Err(Error::InvalidHint { .. })));
}

#[test]
fn test_no_matching_aggregators() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "b"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let req = request(&folder, "nomatch", rdwr_create()).with_hint(CB_CONFIG_LIST, "elsewhere:1");
        open(&universe, orig, comm, req).map(|_| ())
    });

    for result in results {
        assert!(matches!(result, Err(Error::NoMatchingAggregators)));
    }
    assert!(!dir.path().join("nomatch").exists());
}

#[test]
fn test_scalable_open_broadcasts_root_state() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    let results = run_ranks(&["a", "b", "c"], move |orig, comm| {
        let universe = ProcessUniverse::new(HintSource::None);
        let driver = Arc::new(TestfsDriver::new());
        let req = OpenRequest::new("testfs:/virtual/out", rdwr_create())
            .with_driver(FileSystemKind::Testfs, driver.clone())
            .with_hint(SHARED_BUFFER_FOLDER, folder.to_str().unwrap())
            .with_hint(CB_BUFFER_SIZE, "1024")
            .with_hint(DATA_BUFFER_SIZE, "1024")
            .with_hint(ROMIO_NO_INDEP_RW, "true");
        let fh = open(&universe, orig, comm, req).unwrap();
        assert!(!fh.deferred_open());
        assert!(fh.is_open());
        fh.close().unwrap();
        driver.ops()
    });

    let path = PathBuf::from("/virtual/out");
    assert_eq!(
        results[0],
        vec![TestfsOp::Open(path.clone(), rdwr_create()), TestfsOp::Close]
    );
    for ops in &results[1..] {
        assert_eq!(ops, &vec![TestfsOp::Attach(path.clone()), TestfsOp::Close]);
    }
}

#[test]
fn test_memory_alloc_kinds_copied_from_communicator() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let comm_info: HintSet = [(MEMORY_ALLOC_KINDS, "mpi,system")].into_iter().collect();
    let orig = LocalComm::world(1).pop().unwrap();
    let comm = LocalComm::world(1).pop().unwrap().with_info(comm_info);

    let universe = ProcessUniverse::new(HintSource::None);
    let fh = open(&universe, &orig, &comm, request(dir.path(), "kinds", rdwr_create())).unwrap();
    assert_eq!(fh.info().get(MEMORY_ALLOC_KINDS), Some("mpi,system"));
    assert_eq!(fh.info().get(ROMIO_FILESYSTEM_TYPE), Some("ufs"));
    assert_eq!(fh.perm(), DEFAULT_PERM);
    fh.close().unwrap();
}

#[test]
fn test_log_files_created_per_rank() {
    let dir = TempDir::new().unwrap();
    let folder = dir.path().to_path_buf();

    run_ranks(&["a", "a", "b", "b"], {
        let folder = folder.clone();
        move |orig, comm| {
            let universe = ProcessUniverse::new(HintSource::None);
            let req = request(&folder, "logged", rdwr_create()).with_hint(DATA_BUFFER_SIZE, "4096");
            let fh = open(&universe, orig, comm, req).unwrap();
            let log = fh.log_buffer().unwrap();
            assert_eq!(log.data_capacity(), 4096);
            assert_eq!(log.current_chunk(), 0);
            assert_eq!(log.cur_data_offset(), 0);
            fh.close().unwrap();
        }
    });

    let metadata = std::fs::metadata(folder.join("metadata-log.0003")).unwrap();
    assert_eq!(metadata.len() as usize, METADATA_LOG_SIZE);
    let data = std::fs::metadata(folder.join("data-log.0003")).unwrap();
    assert_eq!(data.len(), 4096);

    let log = LogBuffer::open(&folder, 3).unwrap();
    assert_eq!(log.chunks().len(), M_CHUNK_COUNT);
    assert!(log.chunks().iter().all(|c| c.is_free() && c.item_count == 0));
    assert_eq!(log.chunk_ring().count(), M_CHUNK_COUNT);
}

/// Log sink shared between a test subscriber and the test body
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_print_hints_logs_effective_hints_on_rank_zero() {
    let dir = TempDir::new().unwrap();
    let logs = CapturedLogs::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer({
            let logs = logs.clone();
            move || logs.clone()
        })
        .finish();

    std::env::set_var(PRINT_HINTS_ENV, "1");
    tracing::subscriber::with_default(subscriber, || {
        let orig = LocalComm::world(1).pop().unwrap();
        let comm = LocalComm::world(1).pop().unwrap();
        let universe = ProcessUniverse::new(HintSource::None);
        let fh = open(&universe, &orig, &comm, request(dir.path(), "printed", rdwr_create())).unwrap();
        fh.close().unwrap();
    });

    let output = logs.contents();
    assert!(output.contains("effective hints"), "{}", output);
    assert!(output.contains("cb_buffer_size"), "{}", output);
    assert!(output.contains("romio_filesystem_type"), "{}", output);
}
