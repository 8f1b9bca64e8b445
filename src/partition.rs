//! Groups enumerated work units by partition key and chunks each group into
//! fixed-size batches.
use crate::model::{Batch, GroupKey, WorkUnit};
use std::collections::HashMap;

/// Partition `units` into batches of at most `batch_size`.
///
/// Units sharing a grouping key never share a batch with another group.
/// Groups keep first-seen order and units keep input order, so batch indexes
/// follow the enumeration order. Ungrouped units form one group of their own.
pub fn partition(units: Vec<WorkUnit>, batch_size: usize) -> Vec<Batch> {
    assert!(batch_size > 0, "batch_size must be > 0");

    let mut order: Vec<Option<GroupKey>> = Vec::new();
    let mut groups: HashMap<Option<GroupKey>, Vec<WorkUnit>> = HashMap::new();
    for unit in units {
        let key = unit.group.clone();
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(unit);
    }

    let mut batches = Vec::new();
    for key in order {
        let Some(members) = groups.remove(&key) else {
            continue;
        };
        let mut members = members.into_iter().peekable();
        while members.peek().is_some() {
            let units: Vec<WorkUnit> = members.by_ref().take(batch_size).collect();
            batches.push(Batch {
                batch_index: batches.len() as u32,
                units,
            });
        }
    }
    batches
}

/// Drop duplicate unit ids, keeping the first occurrence.
pub fn dedupe(units: Vec<WorkUnit>) -> Vec<WorkUnit> {
    let mut seen = std::collections::HashSet::new();
    units
        .into_iter()
        .filter(|u| seen.insert(u.id.clone()))
        .collect()
}
