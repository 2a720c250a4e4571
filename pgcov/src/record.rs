//! Harvested coverage records.
//!
//! Records are validated once when they are built from the instrumentation
//! facility's answers and are read-only afterwards.

use std::collections::HashSet;

use crate::error::{CoverageError, CoverageResult};

/// Observed invocation count for one physical source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSample {
    /// 1-based line number within the function source
    pub line: u32,
    pub count: u64,
}

impl LineSample {
    pub fn new(line: u32, count: u64) -> Self {
        Self { line, count }
    }
}

/// Coverage information for one stored function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    signature: String,
    calls: u64,
    source: Option<String>,
    samples: Vec<LineSample>,
}

impl FunctionRecord {
    /// Build a record, rejecting samples that are not strictly ascending by
    /// line number or that reference line 0.
    pub fn new(
        signature: impl Into<String>,
        calls: u64,
        source: Option<String>,
        samples: Vec<LineSample>,
    ) -> CoverageResult<Self> {
        let signature = signature.into();

        if let Some(first) = samples.first() {
            if first.line == 0 {
                return Err(CoverageError::malformed(signature, "line numbers start at 1"));
            }
        }
        for pair in samples.windows(2) {
            if pair[1].line <= pair[0].line {
                return Err(CoverageError::malformed(
                    signature,
                    format!(
                        "line samples out of order: {} follows {}",
                        pair[1].line, pair[0].line
                    ),
                ));
            }
        }

        Ok(Self {
            signature,
            calls,
            source,
            samples,
        })
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Total number of invocations observed while listening
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn samples(&self) -> &[LineSample] {
        &self.samples
    }
}

/// The complete set of records harvested from one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    records: Vec<FunctionRecord>,
}

impl RecordSet {
    pub fn new(records: Vec<FunctionRecord>) -> CoverageResult<Self> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.signature()) {
                return Err(CoverageError::DuplicateSignature(
                    record.signature().to_string(),
                ));
            }
        }
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FunctionRecord> {
        self.records.iter()
    }

    pub fn get(&self, signature: &str) -> Option<&FunctionRecord> {
        self.records.iter().find(|r| r.signature() == signature)
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a FunctionRecord;
    type IntoIter = std::slice::Iter<'a, FunctionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
