//! Finding rows, their classification enums and the scope counters.
//!
//! A finding set is an Arrow [`RecordBatch`] of string columns. The columns
//! every finding carries are named by the constants below; the field payload
//! is either `field_name`/`field_value` (single-field findings) or the
//! numbered `field_N`/`value_N` pairs (multi-field and register findings), so
//! two finding batches rarely share the exact same column set.

use crate::io::parquet::{cell, string_column};
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const VALIDATION_ID: &str = "validation_id";
pub const VALIDATION_TYPE: &str = "validation_type";
pub const SCOPE: &str = "scope";
pub const RECORD_NO: &str = "record_no";
pub const FIELD_NAME: &str = "field_name";
pub const FIELD_VALUE: &str = "field_value";
pub const PHASE: &str = "phase";
pub const SUBMISSION_ID: &str = "submission_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warning => "Warning",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Error" | "error" | "ERROR" => Some(Self::Error),
            "Warning" | "warning" | "WARNING" => Some(Self::Warning),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many fields a finding spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    #[serde(rename = "single-field")]
    SingleField,
    #[serde(rename = "multi-field")]
    MultiField,
    #[serde(rename = "register")]
    Register,
}

impl Scope {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SingleField => "single-field",
            Self::MultiField => "multi-field",
            Self::Register => "register",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "single-field" => Some(Self::SingleField),
            "multi-field" => Some(Self::MultiField),
            "register" => Some(Self::Register),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation stage. Syntactical checks run first; Logical checks only run
/// when the Syntactical stage found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Syntactical,
    Logical,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Syntactical => "Syntactical",
            Self::Logical => "Logical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Syntactical" => Some(Self::Syntactical),
            "Logical" => Some(Self::Logical),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Findings of one severity, counted by scope.
///
/// `total_count` always equals the sum of the three scope counters; the
/// fields are only mutated through [`ScopeCounts::record`] and
/// [`ScopeCounts::merge`], which keep that true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCounts {
    pub single_field_count: u64,
    pub multi_field_count: u64,
    pub register_count: u64,
    pub total_count: u64,
}

impl ScopeCounts {
    pub fn record(&mut self, scope: Scope) {
        match scope {
            Scope::SingleField => self.single_field_count += 1,
            Scope::MultiField => self.multi_field_count += 1,
            Scope::Register => self.register_count += 1,
        }
        self.total_count += 1;
    }

    pub fn merge(&mut self, other: &Self) {
        self.single_field_count += other.single_field_count;
        self.multi_field_count += other.multi_field_count;
        self.register_count += other.register_count;
        self.total_count += other.total_count;
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total_count == self.single_field_count + self.multi_field_count + self.register_count
    }
}

/// Scope counts for the three buckets a submission's findings fall into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingTotals {
    pub syntax_errors: ScopeCounts,
    pub logic_errors: ScopeCounts,
    pub logic_warnings: ScopeCounts,
}

impl FindingTotals {
    /// Count one finding. Syntactical findings are all errors regardless of
    /// the severity they carry.
    pub fn record(&mut self, phase: Phase, severity: Severity, scope: Scope) {
        match (phase, severity) {
            (Phase::Syntactical, _) => self.syntax_errors.record(scope),
            (Phase::Logical, Severity::Error) => self.logic_errors.record(scope),
            (Phase::Logical, Severity::Warning) => self.logic_warnings.record(scope),
        }
    }

    pub fn merge(&mut self, other: &Self) {
        self.syntax_errors.merge(&other.syntax_errors);
        self.logic_errors.merge(&other.logic_errors);
        self.logic_warnings.merge(&other.logic_warnings);
    }

    /// Count every row of a finding batch produced in `phase`.
    ///
    /// Rows without a recognisable severity count as errors and rows without
    /// a recognisable scope as single-field.
    pub fn record_batch(&mut self, phase: Phase, findings: &RecordBatch) {
        let severities = string_column(findings, VALIDATION_TYPE);
        let scopes = string_column(findings, SCOPE);
        for row in 0..findings.num_rows() {
            let severity = cell(severities, row)
                .and_then(Severity::parse)
                .unwrap_or(Severity::Error);
            let scope = cell(scopes, row)
                .and_then(Scope::parse)
                .unwrap_or(Scope::SingleField);
            self.record(phase, severity, scope);
        }
    }

    /// Count a merged result table whose rows carry their own `phase` column.
    #[must_use]
    pub fn from_table(table: &RecordBatch) -> Self {
        let mut totals = Self::default();
        let phases = string_column(table, PHASE);
        let severities = string_column(table, VALIDATION_TYPE);
        let scopes = string_column(table, SCOPE);
        for row in 0..table.num_rows() {
            let phase = cell(phases, row)
                .and_then(Phase::parse)
                .unwrap_or(Phase::Logical);
            let severity = cell(severities, row)
                .and_then(Severity::parse)
                .unwrap_or(Severity::Error);
            let scope = cell(scopes, row)
                .and_then(Scope::parse)
                .unwrap_or(Scope::SingleField);
            totals.record(phase, severity, scope);
        }
        totals
    }

    /// Error total used for state derivation and the report annotation.
    ///
    /// When any Syntactical finding exists, the syntax total is the error
    /// total; otherwise it is the Logical error total.
    #[must_use]
    pub fn errors(&self) -> u64 {
        if self.syntax_errors.total_count > 0 {
            self.syntax_errors.total_count
        } else {
            self.logic_errors.total_count
        }
    }

    /// Warning total. Always zero when Syntactical findings exist.
    #[must_use]
    pub fn warnings(&self) -> u64 {
        if self.syntax_errors.total_count > 0 {
            0
        } else {
            self.logic_warnings.total_count
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.errors() + self.warnings()
    }
}

/// One validation outcome, before it is laid out as a table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub validation_id: String,
    pub severity: Severity,
    pub scope: Scope,
    /// 1-based data row number in the source table.
    pub record_no: u64,
    /// `(field name, value)` pairs the rule looked at.
    pub fields: Vec<(String, String)>,
}

/// Findings an engine produced for one window of one phase.
#[derive(Debug, Clone)]
pub struct FindingBatch {
    pub phase: Phase,
    pub findings: RecordBatch,
}

impl FindingBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.findings.num_rows() == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.findings.num_rows()
    }
}

/// Lay out findings as a string table.
///
/// Single-field findings use `field_name`/`field_value`; findings spanning
/// several fields use `field_1`/`value_1`, `field_2`/`value_2`, and so on.
/// Columns appear in first-use order and are null where a finding has no
/// value for them.
///
/// # Errors
/// Returns an error only if Arrow rejects the assembled columns.
pub fn findings_to_batch(findings: &[Finding]) -> anyhow::Result<RecordBatch> {
    let mut names: Vec<String> = [VALIDATION_ID, VALIDATION_TYPE, SCOPE, RECORD_NO]
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut index: HashMap<String, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.clone(), i))
        .collect();
    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::with_capacity(findings.len()); names.len()];

    for (row, finding) in findings.iter().enumerate() {
        let mut values: Vec<(String, String)> = vec![
            (VALIDATION_ID.to_string(), finding.validation_id.clone()),
            (VALIDATION_TYPE.to_string(), finding.severity.as_str().to_string()),
            (SCOPE.to_string(), finding.scope.as_str().to_string()),
            (RECORD_NO.to_string(), finding.record_no.to_string()),
        ];
        if finding.scope == Scope::SingleField && finding.fields.len() == 1 {
            let (name, value) = &finding.fields[0];
            values.push((FIELD_NAME.to_string(), name.clone()));
            values.push((FIELD_VALUE.to_string(), value.clone()));
        } else {
            for (n, (name, value)) in finding.fields.iter().enumerate() {
                values.push((format!("field_{}", n + 1), name.clone()));
                values.push((format!("value_{}", n + 1), value.clone()));
            }
        }

        for (name, value) in values {
            let col = *index.entry(name.clone()).or_insert_with(|| {
                names.push(name);
                cells.push(vec![None; row]);
                names.len() - 1
            });
            cells[col].push(Some(value));
        }
        for col in &mut cells {
            col.resize(row + 1, None);
        }
    }

    let fields: Vec<Field> = names
        .iter()
        .map(|n| Field::new(n, DataType::Utf8, true))
        .collect();
    let columns: Vec<ArrayRef> = cells
        .into_iter()
        .map(|c| Arc::new(StringArray::from(c)) as ArrayRef)
        .collect();
    let options = RecordBatchOptions::new().with_row_count(Some(findings.len()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        columns,
        &options,
    )?)
}
