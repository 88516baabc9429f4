//! Summing and Aggregating disciplines.

use crate::merge::transform::{GroupDecision, GroupRow};
use crate::value::{AggregateFunc, Value};

/// Emits one row per group; configured columns are summed across the
/// group, everything else takes the first row's value.
pub(crate) struct Summing {
    pub sum_positions: Vec<usize>,
}

impl Summing {
    pub(crate) fn process_group(&self, rows: &[GroupRow]) -> GroupDecision {
        let mut out = rows[0].values.clone();
        for &pos in &self.sum_positions {
            let mut acc = Value::Null;
            let mut summable = true;
            for row in rows {
                match acc.plus(&row.values[pos]) {
                    Some(next) => acc = next,
                    None => {
                        summable = false;
                        break;
                    }
                }
            }
            if summable {
                out[pos] = acc;
            }
        }
        one_row_decision(rows, out)
    }
}

/// Emits one row per group, combining partial-aggregate state columns by
/// their declared combine function.
pub(crate) struct Aggregating {
    /// Per header position; `None` columns take the first row's value.
    pub fns: Vec<Option<AggregateFunc>>,
}

impl Aggregating {
    pub(crate) fn process_group(&self, rows: &[GroupRow]) -> GroupDecision {
        let mut out = rows[0].values.clone();
        for (pos, combine) in self.fns.iter().enumerate() {
            if let Some(function) = combine {
                out[pos] = function.combine(rows.iter().map(|row| &row.values[pos]));
            }
        }
        one_row_decision(rows, out)
    }
}

fn one_row_decision(rows: &[GroupRow], out: Vec<Value>) -> GroupDecision {
    let mut emit = vec![false; rows.len()];
    emit[0] = true;
    GroupDecision {
        emit,
        outputs: vec![out],
    }
}
