use std::collections::{BTreeMap, HashSet};

use bidmerge_adapters::reconcile;
use bidmerge_core::{CanonicalRow, ConsolidatedDataset, ProfileSpec, SourceTable};
use serde::Serialize;

/// A row-level cleanup step applied after concatenation.
pub trait RowCleanup: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, rows: Vec<CanonicalRow>) -> Vec<CanonicalRow>;
}

/// Drops rows where every canonical field is null.
#[derive(Default)]
pub struct DropEmptyRows;

impl RowCleanup for DropEmptyRows {
    fn name(&self) -> &'static str {
        "empty_rows"
    }

    fn apply(&self, rows: Vec<CanonicalRow>) -> Vec<CanonicalRow> {
        rows.into_iter().filter(|row| !row.is_vacuous()).collect()
    }
}

/// Drops exact duplicates, keeping the first occurrence.
#[derive(Default)]
pub struct DropDuplicateRows;

impl RowCleanup for DropDuplicateRows {
    fn name(&self) -> &'static str {
        "duplicate_rows"
    }

    fn apply(&self, rows: Vec<CanonicalRow>) -> Vec<CanonicalRow> {
        let mut seen = HashSet::new();
        rows.into_iter()
            .filter(|row| seen.insert(row.rendered()))
            .collect()
    }
}

pub fn cleanup_rules(profile: &ProfileSpec) -> Vec<Box<dyn RowCleanup>> {
    let mut rules: Vec<Box<dyn RowCleanup>> = vec![Box::new(DropEmptyRows)];
    if profile.drop_duplicate_rows {
        rules.push(Box::new(DropDuplicateRows));
    }
    rules
}

/// Counters for everything the merge discards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStats {
    pub files_read: usize,
    pub files_failed: usize,
    pub rows_in: usize,
    pub rows_out: usize,
    pub headers_dropped: usize,
    pub rows_dropped: BTreeMap<String, usize>,
}

impl ConsolidationStats {
    pub fn dropped_by(&self, rule: &str) -> usize {
        self.rows_dropped.get(rule).copied().unwrap_or(0)
    }
}

/// Reconcile each table in order, concatenate, then run the profile's
/// cleanup rules.
pub fn consolidate(
    tables: &[SourceTable],
    profile: &ProfileSpec,
) -> (ConsolidatedDataset, ConsolidationStats) {
    let mut stats = ConsolidationStats {
        files_read: tables.len(),
        ..Default::default()
    };

    let mut rows = Vec::new();
    for table in tables {
        let reconciled = reconcile(table, profile);
        stats.headers_dropped += reconciled.mapping.dropped();
        rows.extend(reconciled.rows);
    }
    stats.rows_in = rows.len();

    for rule in cleanup_rules(profile) {
        let before = rows.len();
        rows = rule.apply(rows);
        stats
            .rows_dropped
            .insert(rule.name().to_string(), before - rows.len());
    }
    stats.rows_out = rows.len();

    let mut dataset = ConsolidatedDataset::new(profile);
    dataset.rows = rows;
    (dataset, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidmerge_core::{CellValue, ProfileId, SchemaRegistry};

    fn table(name: &str, headers: &[&str], rows: &[&[&str]]) -> SourceTable {
        let mut t = SourceTable::new(name, headers.iter().map(|h| h.to_string()).collect());
        for row in rows {
            t.push_row(row.iter().map(|v| CellValue::text(*v)).collect());
        }
        t
    }

    #[test]
    fn two_files_with_an_empty_row_yield_two_rows() {
        let registry = SchemaRegistry::builtin();
        let profile = registry.get(ProfileId::TenderBid).unwrap();
        let a = table("a.xlsx", &["Bid No", "Quantity"], &[&["T1", "5"]]);
        let b = table("b.xlsx", &["Bid No", "Quantity"], &[&["T2", ""], &[]]);

        let (dataset, stats) = consolidate(&[a, b], profile);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.fields, profile.fields);
        assert_eq!(dataset.value(0, "bid_no"), Some(&CellValue::Text("T1".into())));
        assert_eq!(dataset.value(0, "quantity"), Some(&CellValue::Text("5".into())));
        assert_eq!(dataset.value(1, "bid_no"), Some(&CellValue::Text("T2".into())));
        assert_eq!(dataset.value(1, "quantity"), None);
        assert_eq!(dataset.value(0, "user_name"), None);
        assert_eq!(stats.rows_in, 3);
        assert_eq!(stats.dropped_by("empty_rows"), 1);
    }

    #[test]
    fn row_with_only_unmapped_values_is_vacuous() {
        let registry = SchemaRegistry::builtin();
        let profile = registry.get(ProfileId::TenderBid).unwrap();
        let t = table("a.xlsx", &["Sr", "Bid No"], &[&["1", ""], &["2", "T3"]]);

        let (dataset, stats) = consolidate(&[t], profile);
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.value(0, "bid_no"), Some(&CellValue::Text("T3".into())));
        assert_eq!(stats.headers_dropped, 1);
    }

    #[test]
    fn eproc_profile_collapses_duplicates_in_first_seen_order() {
        let registry = SchemaRegistry::builtin();
        let profile = registry.get(ProfileId::EprocTender).unwrap();
        let a = table("a.xlsx", &["Tender No", "Status"], &[&["X1", "Open"], &["X2", "Open"]]);
        let b = table("b.xlsx", &["Status", "Tender No"], &[&["Open", "X1"], &["Closed", "X3"]]);

        let (dataset, stats) = consolidate(&[a, b], profile);
        let numbers = (0..dataset.len())
            .map(|i| dataset.value(i, "tender_no").map(CellValue::render))
            .collect::<Vec<_>>();
        assert_eq!(
            numbers,
            vec![Some("X1".to_string()), Some("X2".to_string()), Some("X3".to_string())]
        );
        assert_eq!(stats.dropped_by("duplicate_rows"), 1);
    }

    #[test]
    fn tender_bid_profile_keeps_duplicates() {
        let registry = SchemaRegistry::builtin();
        let profile = registry.get(ProfileId::TenderBid).unwrap();
        let a = table("a.xlsx", &["Bid No"], &[&["T1"], &["T1"]]);

        let (dataset, stats) = consolidate(&[a], profile);
        assert_eq!(dataset.len(), 2);
        assert_eq!(stats.dropped_by("duplicate_rows"), 0);
    }

    #[test]
    fn numeric_and_text_cells_with_same_rendering_are_duplicates() {
        let registry = SchemaRegistry::builtin();
        let profile = registry.get(ProfileId::EprocTender).unwrap();
        let mut t = SourceTable::new("a.xlsx", vec!["Tender No".into()]);
        t.push_row(vec![Some(CellValue::Float(42.0))]);
        t.push_row(vec![Some(CellValue::Int(42))]);

        let (dataset, _) = consolidate(&[t], profile);
        assert_eq!(dataset.len(), 1);
    }
}
