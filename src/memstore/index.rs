//! Per-shard inverted label index.
//!
//! Maps `label -> value -> posting list of part ids`. Lookups reduce
//! conjunctive equality filters to the smallest posting-list intersection
//! and evaluate regex and negation filters against the value map of the
//! affected label. Updates are buffered and folded in under the write lock
//! on [`PartKeyIndex::refresh`], which the store calls before every scan,
//! so new series become visible no later than the next scan request.

use crate::error::QueryError;
use crate::query::filter::{ColumnFilter, CompiledFilter, Filter};
use crate::types::{LabelSet, PartId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Default)]
struct IndexInner {
    /// label -> value -> sorted part ids
    postings: HashMap<String, BTreeMap<String, Vec<PartId>>>,
    /// Every indexed part id, sorted.
    all_parts: Vec<PartId>,
}

enum PendingOp {
    Add(PartId, LabelSet),
    Remove(PartId, LabelSet),
}

/// Reader-many/writer-one inverted index over partition keys.
pub struct PartKeyIndex {
    inner: RwLock<IndexInner>,
    pending: Mutex<Vec<PendingOp>>,
}

impl PartKeyIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a new partition for indexing. Visible after the next
    /// [`PartKeyIndex::refresh`].
    pub fn add_part(&self, part_id: PartId, labels: LabelSet) {
        self.pending.lock().push(PendingOp::Add(part_id, labels));
    }

    /// Queue removal of an evicted partition.
    pub fn remove_part(&self, part_id: PartId, labels: LabelSet) {
        self.pending.lock().push(PendingOp::Remove(part_id, labels));
    }

    /// Fold buffered updates into the index.
    pub fn refresh(&self) {
        let ops: Vec<PendingOp> = std::mem::take(&mut *self.pending.lock());
        if ops.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for op in ops {
            match op {
                PendingOp::Add(part_id, labels) => {
                    for (name, value) in &labels {
                        let list = inner
                            .postings
                            .entry(name.clone())
                            .or_default()
                            .entry(value.clone())
                            .or_default();
                        if let Err(pos) = list.binary_search(&part_id) {
                            list.insert(pos, part_id);
                        }
                    }
                    if let Err(pos) = inner.all_parts.binary_search(&part_id) {
                        inner.all_parts.insert(pos, part_id);
                    }
                }
                PendingOp::Remove(part_id, labels) => {
                    for (name, value) in &labels {
                        if let Some(values) = inner.postings.get_mut(name) {
                            if let Some(list) = values.get_mut(value) {
                                if let Ok(pos) = list.binary_search(&part_id) {
                                    list.remove(pos);
                                }
                                if list.is_empty() {
                                    values.remove(value);
                                }
                            }
                            if values.is_empty() {
                                inner.postings.remove(name);
                            }
                        }
                    }
                    if let Ok(pos) = inner.all_parts.binary_search(&part_id) {
                        inner.all_parts.remove(pos);
                    }
                }
            }
        }
    }

    /// Part ids whose labels satisfy every filter.
    ///
    /// Equality and `In` filters each produce a posting list; the
    /// intersection starts from the smallest. Regex filters union the
    /// postings of matching values. Negations subtract. A filter set with
    /// no positive filter falls back to scanning all parts.
    pub fn lookup(&self, filters: &[ColumnFilter]) -> Result<Vec<PartId>, QueryError> {
        let inner = self.inner.read();

        // Posting list per positive filter, cheapest representation first.
        let mut positive_lists: Vec<Vec<PartId>> = Vec::new();
        let mut negations: Vec<&ColumnFilter> = Vec::new();

        for cf in filters {
            match &cf.filter {
                Filter::Equals(value) => {
                    let list = inner
                        .postings
                        .get(&cf.column)
                        .and_then(|values| values.get(value))
                        .cloned()
                        .unwrap_or_default();
                    positive_lists.push(list);
                }
                Filter::In(values) => {
                    let mut merged: Vec<PartId> = Vec::new();
                    if let Some(value_map) = inner.postings.get(&cf.column) {
                        for v in values {
                            if let Some(list) = value_map.get(v) {
                                merged.extend_from_slice(list);
                            }
                        }
                    }
                    merged.sort_unstable();
                    merged.dedup();
                    positive_lists.push(merged);
                }
                Filter::EqualsRegex(pattern) => {
                    let re = crate::query::filter::compile_anchored(pattern)
                        .map_err(|e| QueryError::bad_query(format!("bad regex: {e}")))?;
                    let mut merged: Vec<PartId> = Vec::new();
                    if let Some(value_map) = inner.postings.get(&cf.column) {
                        for (value, list) in value_map {
                            if re.is_match(value) {
                                merged.extend_from_slice(list);
                            }
                        }
                    }
                    merged.sort_unstable();
                    merged.dedup();
                    positive_lists.push(merged);
                }
                Filter::NotEquals(_) | Filter::NotEqualsRegex(_) => negations.push(cf),
            }
        }

        let mut result: Vec<PartId> = if positive_lists.is_empty() {
            inner.all_parts.clone()
        } else {
            positive_lists.sort_by_key(|l| l.len());
            let mut iter = positive_lists.into_iter();
            let mut acc = iter.next().unwrap_or_default();
            for list in iter {
                let set: HashSet<PartId> = list.into_iter().collect();
                acc.retain(|id| set.contains(id));
                if acc.is_empty() {
                    break;
                }
            }
            acc
        };

        // Negations: a part matches NotEquals when its value for the label
        // differs or the label is absent.
        for cf in negations {
            let compiled = CompiledFilter::compile(&cf.filter)
                .map_err(|e| QueryError::bad_query(format!("bad regex: {e}")))?;
            let mut excluded: HashSet<PartId> = HashSet::new();
            if let Some(value_map) = inner.postings.get(&cf.column) {
                for (value, list) in value_map {
                    if !compiled.matches(value) {
                        excluded.extend(list.iter().copied());
                    }
                }
            }
            result.retain(|id| !excluded.contains(id));
        }

        Ok(result)
    }

    /// Distinct values of `label` among the given parts.
    pub fn values_for_label(&self, label: &str, parts: &[PartId]) -> Vec<String> {
        let inner = self.inner.read();
        let part_set: HashSet<PartId> = parts.iter().copied().collect();
        let mut out = Vec::new();
        if let Some(value_map) = inner.postings.get(label) {
            for (value, list) in value_map {
                if list.iter().any(|id| part_set.contains(id)) {
                    out.push(value.clone());
                }
            }
        }
        out
    }

    /// Number of indexed parts.
    pub fn num_parts(&self) -> usize {
        self.inner.read().all_parts.len()
    }
}

impl Default for PartKeyIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn seeded_index() -> PartKeyIndex {
        let index = PartKeyIndex::new();
        index.add_part(0, labels(&[("_metric_", "cpu"), ("host", "a"), ("dc", "east")]));
        index.add_part(1, labels(&[("_metric_", "cpu"), ("host", "b"), ("dc", "west")]));
        index.add_part(2, labels(&[("_metric_", "mem"), ("host", "a"), ("dc", "east")]));
        index.refresh();
        index
    }

    #[test]
    fn test_updates_invisible_until_refresh() {
        let index = PartKeyIndex::new();
        index.add_part(0, labels(&[("_metric_", "cpu")]));
        assert_eq!(index.num_parts(), 0);
        index.refresh();
        assert_eq!(index.num_parts(), 1);
    }

    #[test]
    fn test_equality_intersection() {
        let index = seeded_index();
        let parts = index
            .lookup(&[
                ColumnFilter::equals("_metric_", "cpu"),
                ColumnFilter::equals("host", "a"),
            ])
            .unwrap();
        assert_eq!(parts, vec![0]);
    }

    #[test]
    fn test_regex_lookup() {
        let index = seeded_index();
        let parts = index
            .lookup(&[ColumnFilter::new(
                "dc",
                Filter::EqualsRegex("e.*".into()),
            )])
            .unwrap();
        assert_eq!(parts, vec![0, 2]);
    }

    #[test]
    fn test_not_equals_keeps_absent_labels() {
        let index = seeded_index();
        index.add_part(3, labels(&[("_metric_", "disk")]));
        index.refresh();
        // Part 3 has no "host" label and must survive host!="a".
        let parts = index
            .lookup(&[ColumnFilter::new("host", Filter::NotEquals("a".into()))])
            .unwrap();
        assert_eq!(parts, vec![1, 3]);
    }

    #[test]
    fn test_remove_part() {
        let index = seeded_index();
        index.remove_part(1, labels(&[("_metric_", "cpu"), ("host", "b"), ("dc", "west")]));
        index.refresh();
        let parts = index
            .lookup(&[ColumnFilter::equals("_metric_", "cpu")])
            .unwrap();
        assert_eq!(parts, vec![0]);
    }

    #[test]
    fn test_bad_regex_is_bad_query() {
        let index = seeded_index();
        let err = index
            .lookup(&[ColumnFilter::new("dc", Filter::EqualsRegex("(".into()))])
            .unwrap_err();
        assert!(matches!(err, QueryError::BadQuery(_)));
    }

    #[test]
    fn test_values_for_label() {
        let index = seeded_index();
        let values = index.values_for_label("host", &[0, 1]);
        assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
    }
}
