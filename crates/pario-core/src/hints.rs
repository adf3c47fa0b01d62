//! Hint sets and typed hint values

use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use tracing::warn;

pub const CB_BUFFER_SIZE: &str = "cb_buffer_size";
pub const CB_NODES: &str = "cb_nodes";
pub const CB_CONFIG_LIST: &str = "cb_config_list";
pub const ROMIO_CB_READ: &str = "romio_cb_read";
pub const ROMIO_CB_WRITE: &str = "romio_cb_write";
pub const ROMIO_NO_INDEP_RW: &str = "romio_no_indep_rw";
pub const ROMIO_FILESYSTEM_TYPE: &str = "romio_filesystem_type";
pub const DATA_BUFFER_SIZE: &str = "data_buffer_size";
pub const SHARED_BUFFER_FOLDER: &str = "shared_buffer_folder";
pub const MEMORY_ALLOC_KINDS: &str = "mpi_memory_alloc_kinds";

pub const DEFAULT_CB_BUFFER_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CB_CONFIG_LIST: &str = "*:1";
pub const DEFAULT_DATA_BUFFER_SIZE: usize = 1024 * 1024;

/// Mapping from hint name to value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintSet {
    entries: BTreeMap<String, String>,
}

impl HintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse hint file contents: one `key value` pair per line
    ///
    /// Blank lines and lines starting with `#` are skipped, as are lines
    /// without a value. Later lines override earlier ones.
    pub fn parse(text: &str) -> Self {
        let mut set = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
                set.set(key, value);
            }
        }
        set
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HintSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (key, value) in iter {
            set.set(key, value);
        }
        set
    }
}

impl fmt::Display for HintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "key = {:<25} value = {}", key, value)?;
        }
        Ok(())
    }
}

/// Build the effective hint set of a file
///
/// User hints win over system hints. The driver name is recorded under
/// `romio_filesystem_type`, and the memory allocation kinds advertised by the
/// communicator are copied in when present.
pub fn merge(
    user_hints: &HintSet,
    system_hints: &HintSet,
    fs_name: &str,
    comm_info: &HintSet,
) -> HintSet {
    let mut merged = system_hints.clone();
    for (key, value) in user_hints.iter() {
        merged.set(key, value);
    }
    merged.set(ROMIO_FILESYSTEM_TYPE, fs_name);
    if let Some(kinds) = comm_info.get(MEMORY_ALLOC_KINDS) {
        merged.set(MEMORY_ALLOC_KINDS, kinds);
    }
    merged
}

/// Collective buffering mode for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbMode {
    Automatic,
    Enable,
    Disable,
}

impl CbMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CbMode::Automatic => "automatic",
            CbMode::Enable => "enable",
            CbMode::Disable => "disable",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "automatic" => Some(CbMode::Automatic),
            "enable" => Some(CbMode::Enable),
            "disable" => Some(CbMode::Disable),
            _ => None,
        }
    }
}

/// Typed view of the hints this core consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hints {
    pub cb_buffer_size: usize,
    /// Aggregator cap before election, elected count after
    pub cb_nodes: i32,
    pub cb_config_list: String,
    pub cb_read: CbMode,
    pub cb_write: CbMode,
    pub no_indep_rw: bool,
    pub deferred_open: bool,
    pub data_buffer_size: usize,
    pub shared_buffer_folder: PathBuf,
}

impl Hints {
    /// Built-in defaults for a group of `procs` processes
    pub fn defaults(procs: i32) -> Self {
        Self {
            cb_buffer_size: DEFAULT_CB_BUFFER_SIZE,
            cb_nodes: procs,
            cb_config_list: DEFAULT_CB_CONFIG_LIST.to_string(),
            cb_read: CbMode::Automatic,
            cb_write: CbMode::Automatic,
            no_indep_rw: false,
            deferred_open: false,
            data_buffer_size: DEFAULT_DATA_BUFFER_SIZE,
            shared_buffer_folder: std::env::temp_dir(),
        }
    }

    /// Parse `info` and write the normalised values back into it
    pub fn from_info(info: &mut HintSet, procs: i32) -> Result<Self> {
        let mut hints = Self::defaults(procs);

        hints.cb_buffer_size = parse_value(info, CB_BUFFER_SIZE, hints.cb_buffer_size);
        if let Some(value) = info.get(CB_NODES) {
            match value.trim().parse::<i32>() {
                Ok(n) if n > 0 => hints.cb_nodes = n.min(procs),
                _ => warn!(key = CB_NODES, value, "ignoring invalid hint"),
            }
        }
        if let Some(value) = info.get(CB_CONFIG_LIST) {
            hints.cb_config_list = value.to_string();
        }
        hints.cb_read = parse_with(info, ROMIO_CB_READ, hints.cb_read, CbMode::parse);
        hints.cb_write = parse_with(info, ROMIO_CB_WRITE, hints.cb_write, CbMode::parse);
        hints.no_indep_rw = parse_with(info, ROMIO_NO_INDEP_RW, false, parse_bool);
        if hints.no_indep_rw {
            hints.cb_read = CbMode::Enable;
            hints.cb_write = CbMode::Enable;
            hints.deferred_open = true;
        }

        if let Some(value) = info.get(DATA_BUFFER_SIZE) {
            match value.trim().parse::<usize>() {
                Ok(0) => {
                    return Err(Error::InvalidHint {
                        key: DATA_BUFFER_SIZE.to_string(),
                        value: value.to_string(),
                    })
                }
                Ok(n) => hints.data_buffer_size = n,
                Err(_) => warn!(key = DATA_BUFFER_SIZE, value, "ignoring invalid hint"),
            }
        }
        if let Some(value) = info.get(SHARED_BUFFER_FOLDER) {
            hints.shared_buffer_folder = PathBuf::from(value);
        }

        hints.install(info);
        Ok(hints)
    }

    /// Write the normalised values into `info`
    pub fn install(&self, info: &mut HintSet) {
        info.set(CB_BUFFER_SIZE, self.cb_buffer_size.to_string());
        info.set(CB_NODES, self.cb_nodes.to_string());
        info.set(CB_CONFIG_LIST, self.cb_config_list.as_str());
        info.set(ROMIO_CB_READ, self.cb_read.as_str());
        info.set(ROMIO_CB_WRITE, self.cb_write.as_str());
        info.set(ROMIO_NO_INDEP_RW, self.no_indep_rw.to_string());
        info.set(DATA_BUFFER_SIZE, self.data_buffer_size.to_string());
        info.set(
            SHARED_BUFFER_FOLDER,
            self.shared_buffer_folder.to_string_lossy().into_owned(),
        );
    }

    /// Whether collective buffering is not disabled in either direction
    pub fn collective_buffering(&self) -> bool {
        self.cb_read != CbMode::Disable && self.cb_write != CbMode::Disable
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "enable" => Some(true),
        "false" | "disable" => Some(false),
        _ => None,
    }
}

fn parse_value<T: std::str::FromStr>(info: &HintSet, key: &str, default: T) -> T {
    parse_with(info, key, default, |v| v.trim().parse().ok())
}

fn parse_with<T>(info: &HintSet, key: &str, default: T, parse: impl Fn(&str) -> Option<T>) -> T {
    match info.get(key) {
        None => default,
        Some(value) => parse(value).unwrap_or_else(|| {
            warn!(key, value, "ignoring invalid hint");
            default
        }),
    }
}
