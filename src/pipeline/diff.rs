use crate::models::ListingRecord;
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct Diff {
    pub new: Vec<ListingRecord>,
    pub known: Vec<ListingRecord>,
}

/// Partition by identifier only. Source order is kept inside each side; a
/// repeated identifier within one batch counts as new at most once.
pub fn diff(records: Vec<ListingRecord>, seen: &HashSet<String>) -> Diff {
    let mut out = Diff::default();
    let mut batch: HashSet<String> = HashSet::new();

    for record in records {
        if seen.contains(&record.identifier) || !batch.insert(record.identifier.clone()) {
            out.known.push(record);
        } else {
            out.new.push(record);
        }
    }

    out
}
