//! A rule engine built from per-row closures.

use crate::engine::{BatchStream, EngineError, FindingStream, RuleEngine, TableSource, ValidationContext};
use crate::findings::{Finding, FindingBatch, Phase, Scope, Severity, findings_to_batch};
use crate::io::parquet::{cell, string_column};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

type RowCheck = Arc<dyn Fn(&[&str], &ValidationContext) -> bool + Send + Sync>;

/// One rule over a fixed list of columns.
///
/// The predicate receives the row's values for those columns, in order, and
/// returns `true` when the row passes.
#[derive(Clone)]
pub struct RowRule {
    pub id: String,
    pub phase: Phase,
    pub severity: Severity,
    pub scope: Scope,
    pub fields: Vec<String>,
    check: RowCheck,
}

impl RowRule {
    /// A rule whose scope follows from its field count.
    pub fn new<F>(id: &str, phase: Phase, severity: Severity, fields: &[&str], check: F) -> Self
    where
        F: Fn(&[&str], &ValidationContext) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            phase,
            severity,
            scope: if fields.len() == 1 {
                Scope::SingleField
            } else {
                Scope::MultiField
            },
            fields: fields.iter().map(ToString::to_string).collect(),
            check: Arc::new(check),
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }
}

/// Reference [`RuleEngine`]: Syntactical rules run over the whole table
/// first, and Logical rules only run if they found nothing.
///
/// A column a rule needs but the table lacks is a malformation, reported
/// before any row is read when the source knows its schema.
#[derive(Clone)]
pub struct RowRuleEngine {
    version: String,
    rules: Vec<RowRule>,
}

impl RowRuleEngine {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            rules: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: RowRule) -> Self {
        self.rules.push(rule);
        self
    }

    fn has_phase(&self, phase: Phase) -> bool {
        self.rules.iter().any(|r| r.phase == phase)
    }
}

impl RuleEngine for RowRuleEngine {
    fn ruleset_version(&self) -> String {
        self.version.clone()
    }

    fn validate<'a>(
        &'a self,
        source: &'a dyn TableSource,
        context: &'a ValidationContext,
        batch_size: usize,
        _max_errors: u64,
    ) -> Result<FindingStream<'a>, EngineError> {
        if let Some(schema) = source.schema()
            && let Some(missing) = self
                .rules
                .iter()
                .flat_map(|r| &r.fields)
                .find(|f| schema.field_with_name(f).is_err())
        {
            return Err(EngineError::Malformed(format!("missing column {missing}")));
        }
        Ok(Box::new(RowRuleStream {
            engine: self,
            source,
            context,
            batch_size: batch_size.max(1),
            phase: Some(Phase::Syntactical),
            scan: None,
            row_offset: 0,
            syntax_found: 0,
        }))
    }
}

struct RowRuleStream<'a> {
    engine: &'a RowRuleEngine,
    source: &'a dyn TableSource,
    context: &'a ValidationContext,
    batch_size: usize,
    phase: Option<Phase>,
    scan: Option<BatchStream<'a>>,
    row_offset: u64,
    syntax_found: u64,
}

impl RowRuleStream<'_> {
    fn advance_phase(&mut self) {
        self.scan = None;
        self.phase = match self.phase {
            Some(Phase::Syntactical) if self.syntax_found == 0 => Some(Phase::Logical),
            _ => None,
        };
    }

    fn evaluate(&mut self, phase: Phase, window: &RecordBatch) -> Result<FindingBatch, EngineError> {
        let mut findings = Vec::new();
        for rule in self.engine.rules.iter().filter(|r| r.phase == phase) {
            let columns = rule
                .fields
                .iter()
                .map(|f| string_column(window, f).ok_or_else(|| EngineError::Malformed(format!("missing column {f}"))))
                .collect::<Result<Vec<_>, _>>()?;
            for row in 0..window.num_rows() {
                let values: Vec<&str> = columns
                    .iter()
                    .map(|c| cell(Some(*c), row).unwrap_or_default())
                    .collect();
                if (rule.check)(&values, self.context) {
                    continue;
                }
                findings.push(Finding {
                    validation_id: rule.id.clone(),
                    severity: rule.severity,
                    scope: rule.scope,
                    record_no: self.row_offset + row as u64 + 1,
                    fields: rule
                        .fields
                        .iter()
                        .cloned()
                        .zip(values.iter().map(ToString::to_string))
                        .collect(),
                });
            }
        }
        self.row_offset += window.num_rows() as u64;
        if phase == Phase::Syntactical {
            self.syntax_found += findings.len() as u64;
        }
        let batch = findings_to_batch(&findings).map_err(|e| EngineError::Failed(format!("{e:#}")))?;
        Ok(FindingBatch { phase, findings: batch })
    }
}

impl Iterator for RowRuleStream<'_> {
    type Item = Result<FindingBatch, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let phase = self.phase?;
            if self.scan.is_none() {
                if !self.engine.has_phase(phase) {
                    self.advance_phase();
                    continue;
                }
                match self.source.scan(self.batch_size) {
                    Ok(scan) => {
                        self.scan = Some(scan);
                        self.row_offset = 0;
                    }
                    Err(e) => {
                        self.phase = None;
                        return Some(Err(EngineError::Failed(format!("{e:#}"))));
                    }
                }
            }

            let next = self.scan.as_mut().and_then(Iterator::next);
            match next {
                Some(Ok(window)) => {
                    let result = self.evaluate(phase, &window);
                    if result.is_err() {
                        self.phase = None;
                        self.scan = None;
                    }
                    return Some(result);
                }
                Some(Err(e)) => {
                    self.phase = None;
                    self.scan = None;
                    return Some(Err(EngineError::Failed(format!("{e:#}"))));
                }
                None => self.advance_phase(),
            }
        }
    }
}

/// A [`TableSource`] over batches already in memory.
///
/// Each scan re-slices the batches into windows of the requested size.
#[derive(Clone)]
pub struct MemoryTable {
    batches: Vec<RecordBatch>,
}

impl MemoryTable {
    #[must_use]
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self { batches }
    }
}

impl TableSource for MemoryTable {
    fn schema(&self) -> Option<SchemaRef> {
        self.batches.first().map(RecordBatch::schema)
    }

    fn scan(&self, batch_size: usize) -> anyhow::Result<BatchStream<'_>> {
        let size = batch_size.max(1);
        Ok(Box::new(self.batches.iter().flat_map(move |batch| {
            (0..batch.num_rows())
                .step_by(size)
                .map(move |offset| Ok::<_, anyhow::Error>(batch.slice(offset, size.min(batch.num_rows() - offset))))
        })))
    }
}
