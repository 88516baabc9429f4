//! Replacing discipline.

use crate::error::{Error, Result};
use crate::merge::transform::{GroupDecision, GroupRow};

/// Keeps one row per group: the one with the greatest version (ties go to
/// the greatest source number, i.e. the latest insert). When the winner is
/// marked deleted and cleanup is in effect, the group emits nothing.
pub(crate) struct Replacing {
    pub version_pos: Option<usize>,
    pub is_deleted_pos: Option<usize>,
    pub cleanup: bool,
}

impl Replacing {
    pub(crate) fn process_group(&self, rows: &[GroupRow]) -> Result<GroupDecision> {
        let mut winner = 0usize;
        for i in 1..rows.len() {
            winner = match self.version_pos {
                Some(pos) => {
                    if rows[i].values[pos] >= rows[winner].values[pos] {
                        i
                    } else {
                        winner
                    }
                }
                None => i,
            };
        }

        let mut drop_winner = false;
        if let Some(pos) = self.is_deleted_pos {
            let cell = &rows[winner].values[pos];
            let is_deleted = cell.as_u64().filter(|v| *v <= 1).ok_or_else(|| {
                Error::corrupted(format!("is_deleted column must hold 0 or 1, got {cell:?}"))
            })?;
            drop_winner = is_deleted == 1 && self.cleanup;
        }

        let mut emit = vec![false; rows.len()];
        let mut outputs = Vec::new();
        if !drop_winner && !rows.is_empty() {
            emit[winner] = true;
            outputs.push(rows[winner].values.clone());
        }
        Ok(GroupDecision { emit, outputs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(version: u64, deleted: u64, payload: &str) -> GroupRow {
        GroupRow {
            source: 0,
            values: vec![
                Value::UInt64(1),
                Value::UInt64(version),
                Value::UInt64(deleted),
                Value::String(payload.into()),
            ],
        }
    }

    #[test]
    fn greatest_version_wins_and_later_rows_win_ties() {
        let mode = Replacing {
            version_pos: Some(1),
            is_deleted_pos: None,
            cleanup: false,
        };
        let decision = mode
            .process_group(&[row(5, 0, "old"), row(7, 0, "new"), row(7, 0, "newer")])
            .unwrap();
        assert_eq!(decision.emit, vec![false, false, true]);
        assert_eq!(decision.outputs[0][3], Value::String("newer".into()));
    }

    #[test]
    fn deleted_winner_is_dropped_only_under_cleanup() {
        let rows = [row(1, 0, "live"), row(2, 1, "dead")];
        let kept = Replacing {
            version_pos: Some(1),
            is_deleted_pos: Some(2),
            cleanup: false,
        };
        assert_eq!(kept.process_group(&rows).unwrap().outputs.len(), 1);

        let cleaned = Replacing {
            version_pos: Some(1),
            is_deleted_pos: Some(2),
            cleanup: true,
        };
        let decision = cleaned.process_group(&rows).unwrap();
        assert!(decision.outputs.is_empty());
        assert_eq!(decision.emit, vec![false, false]);
    }

    #[test]
    fn without_version_the_last_row_wins() {
        let mode = Replacing {
            version_pos: None,
            is_deleted_pos: None,
            cleanup: false,
        };
        let decision = mode
            .process_group(&[row(0, 0, "a"), row(0, 0, "b")])
            .unwrap();
        assert_eq!(decision.outputs[0][3], Value::String("b".into()));
    }
}
