//! Aggregator election
//!
//! Rank 0 of the working group matches the `cb_config_list` placement
//! directive against the host of every rank and broadcasts the resulting
//! rank list. The directive is a comma-separated list of `name[:count]`
//! entries where `name` is a host or `*` and `count` is a positive number or
//! `*` for every process on the host. Example: `nodeA:2,*:1`.

use crate::comm::{bcast_ranks, Communicator, NameArray};
use crate::file::FileHandle;
use crate::hints::CB_NODES;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Rank that parses the directive
pub const ELECTOR: i32 = 0;

/// Cached answer to "is this rank an aggregator"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregatorMembership {
    #[default]
    Unresolved,
    NotMember,
    /// Position in the aggregator list
    Member(usize),
}

impl AggregatorMembership {
    /// Resolve membership of `rank` by scanning `ranklist`
    pub fn resolve(rank: i32, ranklist: &[i32]) -> Self {
        ranklist
            .iter()
            .position(|&r| r == rank)
            .map_or(AggregatorMembership::NotMember, AggregatorMembership::Member)
    }

    pub fn is_member(&self) -> bool {
        matches!(self, AggregatorMembership::Member(_))
    }
}

/// Host names of every rank, cached on both communicators
///
/// A name array already cached on `orig_comm` is reused without a gather.
/// Both communicators hold identical caches on every rank, so all ranks take
/// the same branch.
pub fn gather_name_array(orig_comm: &dyn Communicator, comm: &dyn Communicator) -> Arc<NameArray> {
    if let Some(names) = orig_comm.cached_name_array() {
        comm.cache_name_array(Arc::clone(&names));
        return names;
    }
    if let Some(names) = comm.cached_name_array() {
        orig_comm.cache_name_array(Arc::clone(&names));
        return names;
    }

    let names = comm
        .allgather(comm.processor_name().into_bytes())
        .into_iter()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .collect();
    let names = Arc::new(NameArray::new(names));
    orig_comm.cache_name_array(Arc::clone(&names));
    comm.cache_name_array(Arc::clone(&names));
    names
}

enum Target<'a> {
    AnyHost,
    Host(&'a str),
}

struct Entry<'a> {
    target: Target<'a>,
    /// `None` takes every process on the host
    per_host: Option<usize>,
}

fn parse_entry(entry: &str) -> Option<Entry<'_>> {
    let (name, count) = match entry.split_once(':') {
        Some((name, count)) => (name.trim(), Some(count.trim())),
        None => (entry.trim(), None),
    };
    if name.is_empty() {
        return None;
    }
    let per_host = match count {
        None => Some(1),
        Some("*") => None,
        Some(count) => match count.parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => return None,
        },
    };
    let target = if name == "*" {
        Target::AnyHost
    } else {
        Target::Host(name)
    };
    Some(Entry { target, per_host })
}

/// Match a placement directive against `names`, electing at most `max` ranks
///
/// A malformed directive elects nobody.
pub fn parse_config_list(list: &str, names: &NameArray, max: i32) -> Vec<i32> {
    let mut entries = Vec::new();
    for raw in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match parse_entry(raw) {
            Some(entry) => entries.push(entry),
            None => {
                warn!(entry = raw, "malformed cb_config_list entry");
                return Vec::new();
            }
        }
    }

    let max = usize::try_from(max).unwrap_or(0);
    let mut hosts: Vec<&str> = Vec::new();
    for name in names.names() {
        if !hosts.contains(&name.as_str()) {
            hosts.push(name);
        }
    }

    let mut used = vec![false; names.len()];
    let mut elected = Vec::new();
    for entry in &entries {
        let targets = match entry.target {
            Target::AnyHost => hosts.clone(),
            Target::Host(host) => vec![host],
        };
        for host in targets {
            let mut taken = 0;
            for (rank, name) in names.names().iter().enumerate() {
                if entry.per_host.is_some_and(|n| taken >= n) {
                    break;
                }
                if used[rank] || name != host {
                    continue;
                }
                if elected.len() >= max {
                    return elected;
                }
                used[rank] = true;
                elected.push(rank as i32);
                taken += 1;
            }
        }
    }
    elected
}

/// Elect the aggregators of `file` and broadcast them to the group
///
/// Collective over `comm`. Every rank, not only the elector, fails with
/// [`Error::NoMatchingAggregators`] when nobody was elected.
pub fn elect_aggregators(
    file: &mut FileHandle,
    orig_comm: &dyn Communicator,
    comm: &dyn Communicator,
) -> Result<()> {
    let names = gather_name_array(orig_comm, comm);

    let mut elected = Vec::new();
    if comm.rank() == ELECTOR {
        elected = parse_config_list(&file.hints.cb_config_list, &names, file.hints.cb_nodes);
        elected.shrink_to_fit();
        debug!(
            cb_config_list = %file.hints.cb_config_list,
            cb_nodes = file.hints.cb_nodes,
            elected = elected.len(),
            "parsed aggregator placement"
        );
    }

    let ranklist = bcast_ranks(comm, ELECTOR, &elected);
    let count = ranklist.len() as i32;
    file.hints.cb_nodes = count;
    file.info.set(CB_NODES, count.to_string());
    file.set_ranklist(ranklist);

    if count <= 0 {
        return Err(Error::NoMatchingAggregators);
    }
    Ok(())
}
