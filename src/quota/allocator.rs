use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::exec::{self, CommandRunner};

use super::{Error, Result};

/// Provides the project quota ids already in use on the host.
pub trait QuotaIdSource: Send + Sync + fmt::Debug {
    fn load(&self) -> Result<HashSet<u32>>;
}

/// Reads used ids from the `#<id>` rows of `repquota -Pan`.
#[derive(Debug, Clone)]
pub struct RepquotaSource {
    runner: Arc<dyn CommandRunner>,
}

impl RepquotaSource {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl QuotaIdSource for RepquotaSource {
    fn load(&self) -> Result<HashSet<u32>> {
        let output =
            exec::run_checked(self.runner.as_ref(), "repquota", &["-Pan"]).map_err(Error::LoadQuotaIDs)?;
        Ok(parse_repquota(&output.stdout))
    }
}

/// Collects the ids of the `#<id>` rows in a `repquota -n` report.
///
/// ```text
/// *** Report for project quotas on device /dev/sdb1
/// Block grace time: 7days; Inode grace time: 7days
/// #0        --       4       0       0              2     0     0
/// #16777217 --      12       0 1048576              3     0     0
/// ```
fn parse_repquota(report: &str) -> HashSet<u32> {
    report
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix('#'))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|id| id.parse().ok())
        .collect()
}

#[derive(Debug, Default)]
struct AllocatorState {
    used: HashSet<u32>,
    last: u32,
    loaded: bool,
}

/// Hands out project quota ids above a reserved minimum.
///
/// The set of ids in use is loaded from the [`QuotaIdSource`] on first use. Ids are
/// allocated in increasing order, skip every id known to be in use and never go
/// backwards.
#[derive(Debug)]
pub struct QuotaIdAllocator {
    min: u32,
    source: Box<dyn QuotaIdSource>,
    state: Mutex<AllocatorState>,
}

impl QuotaIdAllocator {
    pub fn new(min: u32, source: Box<dyn QuotaIdSource>) -> Self {
        Self {
            min,
            source,
            state: Mutex::new(AllocatorState::default()),
        }
    }

    pub fn min_id(&self) -> u32 {
        self.min
    }

    /// Returns the next free id strictly greater than the minimum.
    ///
    /// # Errors
    ///
    /// - [`Error::LoadQuotaIDs`] if the initial load fails. The load is retried on the
    ///   next call.
    /// - [`Error::QuotaIDsExhausted`] if the id space above the last id is used up.
    pub fn next_id(&self) -> Result<u32> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        // The lock is held across the one-time load so concurrent callers wait for it
        // instead of allocating from an incomplete set.
        if !state.loaded {
            let used = self.source.load()?;
            state.last = state.last.max(used.iter().copied().max().unwrap_or(0));
            state.used.extend(used);
            state.loaded = true;
        }

        let mut id = state.last.max(self.min);
        loop {
            id = id
                .checked_add(1)
                .ok_or(Error::QuotaIDsExhausted { last: state.last })?;
            if !state.used.contains(&id) {
                break;
            }
        }

        state.used.insert(id);
        state.last = id;

        log::debug!("get next project quota id: {}", id);
        Ok(id)
    }

    /// Marks an explicitly requested id as used so it is never handed out.
    pub fn reserve(&self, id: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.used.insert(id);
    }
}
