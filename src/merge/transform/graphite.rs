//! Graphite rollup discipline.

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::{Error, Result};
use crate::merge::transform::{GroupDecision, GroupRow};
use crate::schema::GraphiteRetention;
use crate::value::{AggregateFunc, Value};

pub(crate) struct CompiledPattern {
    pub regexp: Option<Regex>,
    pub function: AggregateFunc,
    /// Sorted by age descending; the first entry with `age <= row age`
    /// supplies the bucket precision.
    pub retentions: Vec<GraphiteRetention>,
}

/// Down-samples older points by time bucket according to the first pattern
/// matching the metric path. Groups arrive keyed on the rollup key (sort
/// key minus the time column); each group covers one path.
pub(crate) struct Graphite {
    pub path_pos: usize,
    pub time_pos: usize,
    pub value_pos: usize,
    pub version_pos: Option<usize>,
    pub patterns: Vec<CompiledPattern>,
    pub time_of_merge: u64,
}

impl Graphite {
    fn select_pattern(&self, path: &Value) -> Option<&CompiledPattern> {
        let path_str = match path {
            Value::String(s) => s.as_str(),
            _ => "",
        };
        self.patterns
            .iter()
            .find(|p| p.regexp.as_ref().map_or(true, |re| re.is_match(path_str)))
    }

    fn bucket_of(&self, pattern: &CompiledPattern, time: u64) -> u64 {
        let age = self.time_of_merge.saturating_sub(time);
        match pattern.retentions.iter().find(|r| age >= r.age) {
            Some(r) if r.precision > 1 => time - time % r.precision,
            _ => time,
        }
    }

    pub(crate) fn process_group(&self, rows: &[GroupRow]) -> Result<GroupDecision> {
        let Some(pattern) = self.select_pattern(&rows[0].values[self.path_pos]) else {
            return Ok(GroupDecision::emit_all(rows));
        };

        let mut buckets: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (i, row) in rows.iter().enumerate() {
            let time_cell = &row.values[self.time_pos];
            let time = time_cell.as_u64().ok_or_else(|| {
                Error::corrupted(format!("graphite time column must be unsigned, got {time_cell:?}"))
            })?;
            buckets.entry(self.bucket_of(pattern, time)).or_default().push(i);
        }

        let mut emit = vec![false; rows.len()];
        let mut outputs = Vec::with_capacity(buckets.len());
        for (bucket, members) in buckets {
            let representative = match self.version_pos {
                Some(pos) => *members
                    .iter()
                    .max_by(|&&a, &&b| rows[a].values[pos].cmp(&rows[b].values[pos]))
                    .expect("bucket is non-empty"),
                None => *members.last().expect("bucket is non-empty"),
            };
            let mut out = rows[representative].values.clone();
            out[self.time_pos] = Value::UInt64(bucket);
            out[self.value_pos] = pattern
                .function
                .combine(members.iter().map(|&i| &rows[i].values[self.value_pos]));
            emit[members[0]] = true;
            outputs.push(out);
        }
        Ok(GroupDecision { emit, outputs })
    }
}
