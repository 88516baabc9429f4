//! Collapsing and VersionedCollapsing disciplines.

use crate::error::{Error, Result};
use crate::logging::strata_log;
use crate::merge::transform::{GroupDecision, GroupRow};
use std::collections::VecDeque;

/// Cancels `+1`/`-1` pairs within a group of equal sort keys.
///
/// An arriving `+1` cancels the most recent unpaired `-1`; an arriving
/// `-1` cancels the oldest unpaired `+1`, so the latest states survive.
/// The remainder — exactly `|sum of signs|` rows, all of the majority
/// sign — is emitted. VersionedCollapsing shares the pairing (its version
/// column is part of the sort key, so out-of-order pairs land in their own
/// groups) but does not log imbalance.
pub(crate) struct Collapsing {
    pub sign_pos: usize,
    pub log_imbalance: bool,
}

impl Collapsing {
    pub(crate) fn process_group(&self, rows: &[GroupRow]) -> Result<GroupDecision> {
        let mut positives: VecDeque<usize> = VecDeque::new();
        let mut negatives: Vec<usize> = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            let sign_cell = &row.values[self.sign_pos];
            let sign = sign_cell
                .as_i64()
                .filter(|s| *s == 1 || *s == -1)
                .ok_or_else(|| {
                    Error::corrupted(format!("sign column must hold 1 or -1, got {sign_cell:?}"))
                })?;
            if sign == 1 {
                if negatives.pop().is_none() {
                    positives.push_back(i);
                }
            } else if positives.pop_front().is_none() {
                negatives.push(i);
            }
        }

        let survivors: Vec<usize> = positives.into_iter().chain(negatives).collect();
        if self.log_imbalance && survivors.len() > 1 {
            strata_log!(
                log::Level::Warn,
                "collapsing_sign_imbalance",
                "incorrect data: {} rows of the same sign left uncancelled in one sort-key group",
                survivors.len()
            );
        }

        let mut emit = vec![false; rows.len()];
        let mut outputs = Vec::with_capacity(survivors.len());
        let mut ordered = survivors;
        ordered.sort_unstable();
        for i in ordered {
            emit[i] = true;
            outputs.push(rows[i].values.clone());
        }
        Ok(GroupDecision { emit, outputs })
    }
}
