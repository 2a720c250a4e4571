//! Functions whose source must not appear in the report.

use std::fs;
use std::path::Path;

use crate::error::{CoverageError, CoverageResult};

/// Sorted set of function signatures, one per line in the input file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HideList {
    signatures: Vec<String>,
}

impl HideList {
    pub fn load(path: &Path) -> CoverageResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| CoverageError::io(path, err))?;
        Ok(Self::parse(&content))
    }

    /// Blank lines are skipped; `\r\n` line endings are accepted.
    pub fn parse(content: &str) -> Self {
        Self::from_signatures(
            content
                .split('\n')
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        )
    }

    pub fn from_signatures<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut signatures: Vec<String> = signatures.into_iter().map(Into::into).collect();
        signatures.sort();
        signatures.dedup();
        Self { signatures }
    }

    pub fn contains(&self, signature: &str) -> bool {
        self.signatures
            .binary_search_by(|entry| entry.as_str().cmp(signature))
            .is_ok()
    }

    /// Signatures in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.signatures.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
