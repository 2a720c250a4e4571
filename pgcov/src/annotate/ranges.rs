//! Line range inference.
//!
//! The instrumentation facility reports a count only for the first line of
//! each statement. A statement's range runs from its sample up to the line
//! before the next sample, minus any trailing lines that carry no code of
//! their own (blank lines, comment-only lines, and the `END IF;` / `END LOOP;`
//! terminators PL/pgSQL never attributes to a line).

use std::fmt;

use crate::record::LineSample;

const LINE_COMMENT: &str = "--";
const UNATTRIBUTED_TERMINATORS: [&str; 2] = ["end if;", "end loop;"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Whitespace,
    Hit,
    Miss,
}

impl LineClass {
    pub fn as_str(self) -> &'static str {
        match self {
            LineClass::Whitespace => "whitespace",
            LineClass::Hit => "hit",
            LineClass::Miss => "miss",
        }
    }
}

impl fmt::Display for LineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contiguous block of physical lines attributed to one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub first: u32,
    pub last: u32,
    pub count: u64,
}

impl LineRange {
    pub fn contains(&self, line: u32) -> bool {
        self.first <= line && line <= self.last
    }

    pub fn class(&self) -> LineClass {
        if self.count > 0 {
            LineClass::Hit
        } else {
            LineClass::Miss
        }
    }
}

/// The view of `lines` used to find range boundaries: comments cut off and
/// unattributed terminators blanked. Only used for boundary detection; the
/// report always shows the original text.
pub fn boundary_view<'a>(lines: &[&'a str]) -> Vec<&'a str> {
    lines
        .iter()
        .map(|line| {
            let code = strip_line_comment(line);
            if is_unattributed_terminator(code) {
                ""
            } else {
                code
            }
        })
        .collect()
}

fn strip_line_comment(line: &str) -> &str {
    match line.find(LINE_COMMENT) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn is_unattributed_terminator(code: &str) -> bool {
    let folded = code.trim().to_lowercase();
    UNATTRIBUTED_TERMINATORS.contains(&folded.as_str())
}

/// Derive one range per sample. Samples must be strictly ascending by line.
///
/// Samples that point past the end of the source produce no range.
pub fn infer_ranges(lines: &[&str], samples: &[LineSample]) -> Vec<LineRange> {
    let view = boundary_view(lines);
    let line_count = u32::try_from(lines.len()).unwrap_or(u32::MAX);

    let mut ranges = Vec::with_capacity(samples.len());
    for (idx, sample) in samples.iter().enumerate() {
        if sample.line == 0 || sample.line > line_count {
            continue;
        }

        let mut last = match samples.get(idx + 1) {
            Some(next) => (next.line - 1).min(line_count),
            None => line_count,
        };
        while last > sample.line && view[(last - 1) as usize].trim().is_empty() {
            last -= 1;
        }

        ranges.push(LineRange {
            first: sample.line,
            last,
            count: sample.count,
        });
    }
    ranges
}

/// Class of every physical line, index 0 being line 1.
///
/// `ranges` must be ordered and disjoint, as [`infer_ranges`] returns them.
pub fn classify_lines(line_count: usize, ranges: &[LineRange]) -> Vec<LineClass> {
    let line_count = u32::try_from(line_count).unwrap_or(u32::MAX);
    let mut pending = ranges.iter().peekable();
    (1..=line_count)
        .map(|line| {
            while pending.next_if(|range| range.last < line).is_some() {}
            match pending.peek() {
                Some(range) if range.contains(line) => range.class(),
                _ => LineClass::Whitespace,
            }
        })
        .collect()
}

/// Per-function summary shown under the signature header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionCoverage {
    pub lines_hit: usize,
    pub lines_missed: usize,
}

impl FunctionCoverage {
    pub fn from_classes(classes: &[LineClass]) -> Self {
        classes
            .iter()
            .fold(FunctionCoverage::default(), |mut acc, class| {
                match class {
                    LineClass::Hit => acc.lines_hit += 1,
                    LineClass::Miss => acc.lines_missed += 1,
                    LineClass::Whitespace => {}
                }
                acc
            })
    }

    pub fn lines_instrumented(&self) -> usize {
        self.lines_hit + self.lines_missed
    }

    /// Share of instrumented lines that were hit, `None` without instrumented lines
    pub fn ratio(&self) -> Option<f64> {
        let total = self.lines_instrumented();
        (total > 0).then(|| self.lines_hit as f64 / total as f64)
    }
}
