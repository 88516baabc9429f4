//! Per-part TTL bookkeeping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Observed expiry range for one TTL expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlInfo {
    pub min: u64,
    pub max: u64,
}

impl TtlInfo {
    pub fn observe(expiry: u64) -> Self {
        Self {
            min: expiry,
            max: expiry,
        }
    }

    pub fn update(&mut self, expiry: u64) {
        self.min = self.min.min(expiry);
        self.max = self.max.max(expiry);
    }

    pub fn merge(&mut self, other: &TtlInfo) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// True when every row covered by this range has matured.
    pub fn finished(&self, now: u64) -> bool {
        self.max <= now
    }
}

/// TTL ranges stored with a part.
///
/// `computed` is false for parts written before a TTL was added to the
/// table; such parts force a full TTL recompute during the next merge.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TtlInfos {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_ttl: Option<TtlInfo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub columns_ttl: BTreeMap<String, TtlInfo>,
    #[serde(default)]
    pub computed: bool,
}

impl TtlInfos {
    /// Fold another part's ranges into this one.
    pub fn update(&mut self, other: &TtlInfos) {
        if let Some(theirs) = &other.row_ttl {
            match &mut self.row_ttl {
                Some(ours) => ours.merge(theirs),
                None => self.row_ttl = Some(*theirs),
            }
        }
        for (name, theirs) in &other.columns_ttl {
            match self.columns_ttl.get_mut(name) {
                Some(ours) => ours.merge(theirs),
                None => {
                    self.columns_ttl.insert(name.clone(), *theirs);
                }
            }
        }
    }

    pub fn observe_row(&mut self, expiry: u64) {
        match &mut self.row_ttl {
            Some(info) => info.update(expiry),
            None => self.row_ttl = Some(TtlInfo::observe(expiry)),
        }
    }

    pub fn observe_column(&mut self, name: &str, expiry: u64) {
        match self.columns_ttl.get_mut(name) {
            Some(info) => info.update(expiry),
            None => {
                self.columns_ttl
                    .insert(name.to_string(), TtlInfo::observe(expiry));
            }
        }
    }

    /// Earliest whole-row expiry in the part, if any.
    pub fn part_min_ttl(&self) -> Option<u64> {
        self.row_ttl.map(|t| t.min)
    }
}
