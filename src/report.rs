//! Projections of a merged finding table: the downloadable CSV report and the
//! grouped JSON payload stored on the submission.
//!
//! Neither projection is a source of truth. Both are capped (the report by
//! row count, the payload per validation group) while the counts they carry
//! always come from the uncapped [`FindingTotals`].

use crate::findings::{
    FIELD_NAME, FIELD_VALUE, FindingTotals, PHASE, Phase, RECORD_NO, SCOPE, Scope, ScopeCounts,
    Severity, VALIDATION_ID, VALIDATION_TYPE,
};
use crate::io::csv::write_csv_table;
use crate::io::parquet::{cell, string_column};
use arrow::array::StringArray;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Annotation record written above the report header.
#[must_use]
pub fn report_annotation(shown: usize, totals: &FindingTotals) -> String {
    format!(
        "Showing {shown} of {} findings ({} errors, {} warnings)",
        totals.total(),
        totals.errors(),
        totals.warnings()
    )
}

/// Render the downloadable report: the first `max_errors` rows of `merged`
/// under an annotation carrying the true totals.
///
/// Returns the CSV bytes and the number of rows shown.
///
/// # Errors
/// Returns an error if the table cannot be rendered as CSV.
pub fn render_report(
    merged: &RecordBatch,
    totals: &FindingTotals,
    max_errors: usize,
) -> anyhow::Result<(Vec<u8>, usize)> {
    let shown = merged.num_rows().min(max_errors);
    let capped = merged.slice(0, shown);
    let bytes = write_csv_table(&capped, Some(&report_annotation(shown, totals)))?;
    Ok((bytes, shown))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDetail {
    pub record_no: Option<u64>,
    pub fields: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationInfo {
    pub id: String,
    pub severity: Severity,
    pub scope: Scope,
    pub phase: Phase,
}

/// Up to `max_group_size` records of one validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationGroup {
    pub validation: ValidationInfo,
    pub records: Vec<RecordDetail>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSection {
    #[serde(flatten)]
    pub counts: ScopeCounts,
    pub details: Vec<ValidationGroup>,
}

/// The `validation_results` payload persisted on a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResults {
    pub syntax_errors: ResultSection,
    pub logic_errors: ResultSection,
    pub logic_warnings: ResultSection,
}

impl ValidationResults {
    /// Combine true totals with grouped details.
    ///
    /// When Syntactical findings exist every group lands in `syntax_errors`;
    /// otherwise groups are split by severity into the two logic sections.
    #[must_use]
    pub fn assemble(totals: &FindingTotals, groups: Vec<ValidationGroup>) -> Self {
        let mut results = Self {
            syntax_errors: ResultSection {
                counts: totals.syntax_errors,
                details: Vec::new(),
            },
            logic_errors: ResultSection {
                counts: totals.logic_errors,
                details: Vec::new(),
            },
            logic_warnings: ResultSection {
                counts: totals.logic_warnings,
                details: Vec::new(),
            },
        };
        if totals.syntax_errors.total_count > 0 {
            results.syntax_errors.details = groups;
        } else {
            for group in groups {
                match group.validation.severity {
                    Severity::Error => results.logic_errors.details.push(group),
                    Severity::Warning => results.logic_warnings.details.push(group),
                }
            }
        }
        results
    }
}

/// Numbered `field_N`/`value_N` column pairs present in `table`, by N.
fn numbered_fields(table: &RecordBatch) -> Vec<(&StringArray, Option<&StringArray>)> {
    let schema = table.schema();
    let mut numbered: Vec<(u32, String)> = schema
        .fields()
        .iter()
        .filter_map(|f| {
            f.name()
                .strip_prefix("field_")
                .and_then(|n| n.parse::<u32>().ok())
                .map(|n| (n, f.name().clone()))
        })
        .collect();
    numbered.sort_unstable();
    numbered
        .into_iter()
        .filter_map(|(n, name)| {
            string_column(table, &name).map(|col| (col, string_column(table, &format!("value_{n}"))))
        })
        .collect()
}

/// Group the findings of `table` by validation id.
///
/// Groups appear in first-seen order and each holds at most `max_group_size`
/// records. When `only` is given, groups whose id is not in it are dropped.
#[must_use]
pub fn group_findings(
    table: &RecordBatch,
    max_group_size: usize,
    only: Option<&[String]>,
) -> Vec<ValidationGroup> {
    let ids = string_column(table, VALIDATION_ID);
    let severities = string_column(table, VALIDATION_TYPE);
    let scopes = string_column(table, SCOPE);
    let phases = string_column(table, PHASE);
    let record_nos = string_column(table, RECORD_NO);
    let names = string_column(table, FIELD_NAME);
    let values = string_column(table, FIELD_VALUE);
    let numbered = numbered_fields(table);

    let allowed: Option<HashSet<&str>> = only.map(|ids| ids.iter().map(String::as_str).collect());
    let mut groups: Vec<ValidationGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in 0..table.num_rows() {
        let Some(id) = cell(ids, row) else { continue };
        if allowed.as_ref().is_some_and(|allowed| !allowed.contains(id)) {
            continue;
        }
        let slot = match index.get(id) {
            Some(&slot) => slot,
            None => {
                groups.push(ValidationGroup {
                    validation: ValidationInfo {
                        id: id.to_string(),
                        severity: cell(severities, row)
                            .and_then(Severity::parse)
                            .unwrap_or(Severity::Error),
                        scope: cell(scopes, row)
                            .and_then(Scope::parse)
                            .unwrap_or(Scope::SingleField),
                        phase: cell(phases, row)
                            .and_then(Phase::parse)
                            .unwrap_or(Phase::Logical),
                    },
                    records: Vec::new(),
                });
                index.insert(id.to_string(), groups.len() - 1);
                groups.len() - 1
            }
        };
        let group = &mut groups[slot];
        if group.records.len() >= max_group_size {
            continue;
        }

        let mut fields = Vec::new();
        if let Some(name) = cell(names, row) {
            fields.push(FieldValue {
                name: name.to_string(),
                value: cell(values, row).unwrap_or_default().to_string(),
            });
        }
        for (name_col, value_col) in &numbered {
            if let Some(name) = cell(Some(*name_col), row) {
                fields.push(FieldValue {
                    name: name.to_string(),
                    value: cell(*value_col, row).unwrap_or_default().to_string(),
                });
            }
        }
        group.records.push(RecordDetail {
            record_no: cell(record_nos, row).and_then(|r| r.parse().ok()),
            fields,
        });
    }
    groups
}

/// Distinct validation ids of `table` in first-seen order.
#[must_use]
pub fn validation_ids(table: &RecordBatch) -> Vec<String> {
    let ids = string_column(table, VALIDATION_ID);
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ordered = Vec::new();
    for row in 0..table.num_rows() {
        if let Some(id) = cell(ids, row)
            && seen.insert(id)
        {
            ordered.push(id.to_string());
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::findings::{Finding, findings_to_batch};

    fn single(id: &str, severity: Severity, record_no: u64) -> Finding {
        Finding {
            validation_id: id.to_string(),
            severity,
            scope: Scope::SingleField,
            record_no,
            fields: vec![("uid".to_string(), format!("U{record_no}"))],
        }
    }

    #[test]
    fn groups_are_capped_in_first_seen_order() -> anyhow::Result<()> {
        let mut findings: Vec<Finding> = (1..=5).map(|n| single("W0003", Severity::Warning, n)).collect();
        findings.insert(1, single("E0001", Severity::Error, 9));
        let table = findings_to_batch(&findings)?;

        let groups = group_findings(&table, 2, None);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].validation.id, "W0003");
        assert_eq!(groups[0].records.len(), 2);
        assert_eq!(groups[0].records[1].record_no, Some(2));
        assert_eq!(groups[1].validation.severity, Severity::Error);
        assert_eq!(
            groups[1].records[0].fields,
            vec![FieldValue { name: "uid".into(), value: "U9".into() }]
        );
        Ok(())
    }

    #[test]
    fn ids_are_distinct_and_filter_groups() -> anyhow::Result<()> {
        let findings: Vec<Finding> = (1..=2_000)
            .map(|n| single(&format!("E{:04}", n % 300), Severity::Error, n))
            .collect();
        let table = findings_to_batch(&findings)?;

        let ids = validation_ids(&table);
        assert_eq!(ids.len(), 300);
        assert_eq!(ids[0], "E0001");
        assert_eq!(ids[299], "E0000");

        let kept = validation_ids(&table.slice(0, 3));
        let groups = group_findings(&table, 100, Some(kept.as_slice()));
        let names: Vec<_> = groups.iter().map(|g| g.validation.id.as_str()).collect();
        assert_eq!(names, vec!["E0001", "E0002", "E0003"]);
        assert!(groups.iter().all(|g| g.records.len() == 7));
        Ok(())
    }

    #[test]
    fn multi_field_records_list_every_pair() -> anyhow::Result<()> {
        let table = findings_to_batch(&[Finding {
            validation_id: "E0300".into(),
            severity: Severity::Error,
            scope: Scope::MultiField,
            record_no: 4,
            fields: vec![("a".into(), "1".into()), ("b".into(), String::new())],
        }])?;
        let groups = group_findings(&table, 10, None);
        let names: Vec<_> = groups[0].records[0].fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(groups[0].validation.scope, Scope::MultiField);
        Ok(())
    }

    #[test]
    fn logic_groups_split_by_severity() {
        let mut totals = FindingTotals::default();
        totals.record(Phase::Logical, Severity::Error, Scope::SingleField);
        totals.record(Phase::Logical, Severity::Warning, Scope::SingleField);
        let group = |id: &str, severity| ValidationGroup {
            validation: ValidationInfo {
                id: id.into(),
                severity,
                scope: Scope::SingleField,
                phase: Phase::Logical,
            },
            records: Vec::new(),
        };
        let results = ValidationResults::assemble(
            &totals,
            vec![group("E1", Severity::Error), group("W1", Severity::Warning)],
        );
        assert_eq!(results.logic_errors.details.len(), 1);
        assert_eq!(results.logic_warnings.details[0].validation.id, "W1");
        assert!(results.syntax_errors.details.is_empty());
        assert_eq!(results.logic_errors.counts.total_count, 1);
    }

    #[test]
    fn payload_serializes_counts_beside_details() -> anyhow::Result<()> {
        let json = serde_json::to_value(ValidationResults::default())?;
        assert_eq!(json["logic_errors"]["total_count"], 0);
        assert!(json["syntax_errors"]["details"].as_array().is_some());
        Ok(())
    }

    #[test]
    fn annotation_reports_true_totals() {
        let mut totals = FindingTotals::default();
        for _ in 0..15 {
            totals.record(Phase::Logical, Severity::Error, Scope::SingleField);
        }
        assert_eq!(report_annotation(10, &totals), "Showing 10 of 15 findings (15 errors, 0 warnings)");
    }
}
