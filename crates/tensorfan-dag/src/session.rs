use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use once_cell::sync::OnceCell;
use tracing::{error, trace};

use crate::error::DagError;

/// Position of one branch within a single fan-out level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subsession {
    pub shard_id: u32,
    pub shard_count: u32,
}

/// Which nested levels a fan-in removes and how many shards each had.
///
/// `collapsed_names` and `collapsed_sizes` are parallel, ordered the way the
/// levels were pushed (outermost first). That order is what makes the
/// consolidated tensor's inserted dimensions line up with the mixed-radix
/// shard ids: outer levels vary slowest.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollapseDetails {
    pub collapsed_names: Vec<String>,
    pub collapsed_sizes: Vec<u32>,
}

impl CollapseDetails {
    /// Total shard count of the collapsed group; 1 for an empty collapse.
    pub fn total_shards(&self) -> u32 {
        self.collapsed_sizes.iter().product()
    }
}

/// Identity of one leaf branch across nested fan-outs.
///
/// A metadata value is never mutated in place. Fan-out and fan-in build
/// fresh copies, so every branch can own its metadata by value and run on
/// its own thread without sharing.
#[derive(Clone, Debug, Default)]
pub struct SessionMetadata {
    /// Subsession name -> (shard id, shard count). Keys match `levels`.
    details: HashMap<String, Subsession>,
    /// Subsession names in push order (outer to inner). The last entry is
    /// the most recently created level and must be the first collapsed.
    levels: Vec<String>,
    /// Lazily rendered full session key. Sound to cache: instances are only
    /// ever constructed, never edited.
    key: OnceCell<String>,
}

impl SessionMetadata {
    /// Root metadata for a freshly accepted pipeline request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan this branch out into `shard_count` subsessions named `name`.
    ///
    /// Returns one independent metadata copy per shard; `shard_count == 0`
    /// yields an empty, valid list.
    pub fn generate_subsessions(
        &self,
        name: &str,
        shard_count: u32,
    ) -> Result<Vec<SessionMetadata>, DagError> {
        if name.is_empty() {
            error!("tried to generate subsessions with an empty name");
            return Err(DagError::EmptyName);
        }
        if self.details.contains_key(name) {
            error!(name, "subsession name already spawned a fan-out");
            return Err(DagError::DuplicateSubsessionName(name.to_string()));
        }
        let mut metas = Vec::with_capacity(shard_count as usize);
        for shard_id in 0..shard_count {
            let mut details = self.details.clone();
            details.insert(
                name.to_string(),
                Subsession {
                    shard_id,
                    shard_count,
                },
            );
            let mut levels = self.levels.clone();
            levels.push(name.to_string());
            metas.push(SessionMetadata {
                details,
                levels,
                key: OnceCell::new(),
            });
        }
        trace!(name, shard_count, depth = self.levels.len() + 1, "generated subsessions");
        Ok(metas)
    }

    /// Deterministic key identifying this branch, used elsewhere as a cache
    /// key. Empty for the root.
    pub fn session_key(&self) -> &str {
        self.key.get_or_init(|| self.render_key(&HashSet::new()))
    }

    /// Session key with the given subsession names filtered out; the key a
    /// branch will have after collapsing those levels.
    pub fn session_key_without(&self, ignored: &HashSet<String>) -> Result<String, DagError> {
        self.ensure_known(ignored)?;
        Ok(self.render_key(ignored))
    }

    /// Fan this branch back in, removing the given levels.
    ///
    /// The names must be exactly the most recently pushed levels; collapsing
    /// anything else would interleave shard groups from different fan-outs.
    pub fn collapse(
        &self,
        names: &HashSet<String>,
    ) -> Result<(SessionMetadata, CollapseDetails), DagError> {
        if names.is_empty() {
            error!("tried to collapse an empty set of subsessions");
            return Err(DagError::EmptyCollapseSet);
        }
        self.ensure_known(names)?;
        self.ensure_lifo_suffix(names)?;

        let mut reduced = SessionMetadata::new();
        let mut collapsed = CollapseDetails::default();
        for level in &self.levels {
            let sub = self.details[level];
            if names.contains(level) {
                collapsed.collapsed_names.push(level.clone());
                collapsed.collapsed_sizes.push(sub.shard_count);
            } else {
                reduced.details.insert(level.clone(), sub);
                reduced.levels.push(level.clone());
            }
        }
        trace!(key = %self.session_key(), collapsed = ?collapsed.collapsed_names, "collapsed session");
        Ok((reduced, collapsed))
    }

    pub fn subsession_size(&self, name: &str) -> Result<u32, DagError> {
        match self.details.get(name) {
            Some(sub) => Ok(sub.shard_count),
            None => {
                error!(name, "asked for the size of a subsession that does not exist");
                Err(DagError::UnknownSubsession(name.to_string()))
            }
        }
    }

    /// Linear index of this branch within the cross product of the collapsed
    /// levels, mixed-radix with the innermost level fastest.
    ///
    /// This is the canonical flattening used to place a shard's bytes inside
    /// the consolidated tensor; an empty set yields 0.
    pub fn shard_id(&self, collapsed: &HashSet<String>) -> Result<u32, DagError> {
        if collapsed.is_empty() {
            return Ok(0);
        }
        self.ensure_known(collapsed)?;
        self.ensure_lifo_suffix(collapsed)?;

        let mut shard_id = 0u32;
        let mut multiplier = 1u32;
        for level in self.levels.iter().rev().take(collapsed.len()) {
            let sub = self.details[level];
            shard_id += multiplier * sub.shard_id;
            multiplier *= sub.shard_count;
            trace!(level = %level, shard_id, multiplier, "shard id accumulation step");
        }
        Ok(shard_id)
    }

    fn render_key(&self, ignored: &HashSet<String>) -> String {
        let mut key = String::new();
        for name in &self.levels {
            if ignored.contains(name) {
                continue;
            }
            if !key.is_empty() {
                key.push('_');
            }
            let _ = write!(key, "{name}_{}", self.details[name].shard_id);
        }
        key
    }

    fn ensure_known(&self, names: &HashSet<String>) -> Result<(), DagError> {
        for name in names {
            if !self.details.contains_key(name) {
                error!(name = %name, "referenced subsession does not exist");
                return Err(DagError::UnknownSubsession(name.clone()));
            }
        }
        Ok(())
    }

    /// The collapsed set must be exactly the last `names.len()` entries of
    /// `levels`. `ensure_known` runs first, so checking that each suffix
    /// entry is in the set is sufficient: both sides have the same size and
    /// no duplicates.
    fn ensure_lifo_suffix(&self, names: &HashSet<String>) -> Result<(), DagError> {
        for level in self.levels.iter().rev().take(names.len()) {
            if !names.contains(level) {
                error!(expected = %level, "collapse attempted out of LIFO order");
                return Err(DagError::CollapseOrderViolation {
                    innermost: level.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Equality over the identity only; the lazily rendered key is derived
/// state and does not participate.
impl PartialEq for SessionMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.details == other.details && self.levels == other.levels
    }
}

impl Eq for SessionMetadata {}
