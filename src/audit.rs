use std::collections::BTreeMap;

use serde::Serialize;

use crate::normalize;
use crate::records::{AuditItem, AuditRecord, AUDIT_ITEMS};

/// Percent agreement between a planned and an executed value.
///
/// Numbers compare by ratio (both zero counts as full adherence, a single zero
/// as none); anything else must match ignoring case and surrounding spaces.
/// An item with neither value filled in has no score.
pub fn adherence(planned: &str, executed: &str) -> Option<f64> {
    if planned.trim().is_empty() && executed.trim().is_empty() {
        return None;
    }
    let percent = match (number(planned), number(executed)) {
        (Some(planned), Some(executed)) => {
            if planned == 0.0 && executed == 0.0 {
                100.0
            } else if planned == 0.0 || executed == 0.0 {
                0.0
            } else {
                planned.min(executed) / planned.max(executed) * 100.0
            }
        }
        _ => {
            if planned.trim().to_lowercase() == executed.trim().to_lowercase() {
                100.0
            } else {
                0.0
            }
        }
    };
    Some(percent)
}

fn number(value: &str) -> Option<f64> {
    if value.trim().is_empty() {
        return None;
    }
    normalize::float("adherence", value).ok()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemAdherence {
    pub item: &'static str,
    pub planned: String,
    pub executed: String,
    pub percent: Option<f64>,
}

impl AuditItem {
    pub fn adherence(&self) -> Option<f64> {
        adherence(&self.planned, &self.executed)
    }
}

impl AuditRecord {
    pub fn item_adherence(&self) -> Vec<ItemAdherence> {
        self.items
            .iter()
            .map(|item| ItemAdherence {
                item: item.item,
                planned: item.planned.clone(),
                executed: item.executed.clone(),
                percent: item.adherence(),
            })
            .collect()
    }

    /// Mean over the scored items; `None` when no item was filled in.
    pub fn adherence(&self) -> Option<f64> {
        mean(self.items.iter().filter_map(AuditItem::adherence))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdherenceSummary {
    pub audits: usize,
    /// Average per item across audits, in checklist order.
    pub per_item: Vec<(&'static str, f64)>,
    pub overall: Option<f64>,
}

pub fn summarize(audits: &[AuditRecord]) -> AdherenceSummary {
    let mut totals: BTreeMap<&'static str, (f64, usize)> = BTreeMap::new();
    for audit in audits {
        for item in &audit.items {
            if let Some(percent) = item.adherence() {
                let entry = totals.entry(item.item).or_insert((0.0, 0));
                entry.0 += percent;
                entry.1 += 1;
            }
        }
    }

    let per_item: Vec<(&'static str, f64)> = AUDIT_ITEMS
        .iter()
        .filter_map(|item| {
            totals
                .get(item)
                .filter(|(_, count)| *count > 0)
                .map(|(sum, count)| (*item, sum / *count as f64))
        })
        .collect();
    let overall = mean(audits.iter().filter_map(AuditRecord::adherence));

    AdherenceSummary {
        audits: audits.len(),
        per_item,
        overall,
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn audit(pairs: &[(&str, &str)]) -> AuditRecord {
        AuditRecord {
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            auditors: vec!["Ana".into()],
            unit: "Narandiba".into(),
            sector: 7,
            items: AUDIT_ITEMS
                .iter()
                .zip(pairs)
                .map(|(item, (planned, executed))| AuditItem {
                    item: *item,
                    planned: planned.to_string(),
                    executed: executed.to_string(),
                })
                .collect(),
            observation: String::new(),
        }
    }

    #[test]
    fn numeric_adherence_uses_ratio() {
        assert_eq!(adherence("10", "8"), Some(80.0));
        assert_eq!(adherence("8", "10"), Some(80.0));
        assert_eq!(adherence("0", "0"), Some(100.0));
        assert_eq!(adherence("0", "3"), Some(0.0));
        assert_eq!(adherence("2,5", "5"), Some(50.0));
    }

    #[test]
    fn text_adherence_ignores_case_and_spaces() {
        assert_eq!(adherence("Mecanizado", " mecanizado "), Some(100.0));
        assert_eq!(adherence("Mecanizado", "Manual"), Some(0.0));
        assert_eq!(adherence("4", "quatro"), Some(0.0));
    }

    #[test]
    fn record_and_summary_averages() {
        let first = audit(&[("Mecanizado", "mecanizado"), ("10", "5")]);
        let second = audit(&[("Mecanizado", "Manual"), ("4", "4")]);
        assert_eq!(first.adherence(), Some(75.0));

        let summary = summarize(&[first, second]);
        assert_eq!(summary.audits, 2);
        assert_eq!(summary.per_item[0], ("planting_type", 50.0));
        assert_eq!(summary.per_item[1], ("terrace_type", 75.0));
        assert_eq!(summary.overall, Some(62.5));
    }

    #[test]
    fn unfilled_items_are_left_out_of_the_means() {
        assert_eq!(adherence("", ""), None);
        assert_eq!(adherence(" ", ""), None);
        assert_eq!(adherence("4", ""), Some(0.0));

        let partial = audit(&[("Mecanizado", "mecanizado"), ("", ""), ("10", "5")]);
        assert_eq!(partial.adherence(), Some(75.0));
        assert_eq!(partial.item_adherence()[1].percent, None);

        let blank = audit(&[("", "")]);
        assert_eq!(blank.adherence(), None);

        let summary = summarize(&[partial, blank]);
        assert_eq!(summary.audits, 2);
        assert_eq!(
            summary.per_item,
            vec![("planting_type", 100.0), ("terrace_count", 50.0)]
        );
        assert_eq!(summary.overall, Some(75.0));
    }

    #[test]
    fn empty_input_has_no_overall() {
        let summary = summarize(&[]);
        assert_eq!(summary.audits, 0);
        assert!(summary.per_item.is_empty());
        assert_eq!(summary.overall, None);
    }
}
