//! HTML coverage report.
//!
//! Rendering is a pure function of the harvested records and the policy; the
//! only side effect is writing to the supplied sink.

pub mod html;
pub mod ranges;

use std::cmp::Ordering;
use std::io::{self, Write};

use regex::Regex;

use crate::hide_list::HideList;
use crate::record::{FunctionRecord, RecordSet};

pub use ranges::{classify_lines, infer_ranges, FunctionCoverage, LineClass, LineRange};

const HIDDEN_PLACEHOLDER: &str = "<p>(source code hidden)</p><br />\n";
const NO_SOURCE_PLACEHOLDER: &str = "<p>(no source code information)</p><br />\n";

/// Which functions to include and which to redact.
#[derive(Debug, Clone, Default)]
pub struct RenderPolicy {
    pub hide_list: HideList,
    /// Keep only functions whose signature matches
    pub filter: Option<Regex>,
}

impl RenderPolicy {
    pub fn new(hide_list: HideList, filter: Option<Regex>) -> Self {
        Self { hide_list, filter }
    }

    fn includes(&self, record: &FunctionRecord) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.is_match(record.signature()))
    }
}

/// Functions with source first, then by signature.
pub fn report_order(a: &FunctionRecord, b: &FunctionRecord) -> Ordering {
    b.has_source()
        .cmp(&a.has_source())
        .then_with(|| a.signature().cmp(b.signature()))
}

/// Write the complete report document for `records` to `out`.
pub fn render<W: Write>(out: &mut W, records: &RecordSet, policy: &RenderPolicy) -> io::Result<()> {
    let mut selected: Vec<&FunctionRecord> =
        records.iter().filter(|r| policy.includes(r)).collect();
    selected.sort_by(|a, b| report_order(a, b));

    let template = &*html::TEMPLATE;
    out.write_all(template.header.as_bytes())?;
    for record in selected {
        render_function(out, record, policy)?;
    }
    out.write_all(template.footer.as_bytes())?;
    out.flush()
}

fn render_function<W: Write>(
    out: &mut W,
    record: &FunctionRecord,
    policy: &RenderPolicy,
) -> io::Result<()> {
    write!(
        out,
        "function {}:\n<br /><br />\n",
        html::escape(record.signature())
    )?;

    if policy.hide_list.contains(record.signature()) {
        write_calls_summary(out, record, None)?;
        return out.write_all(HIDDEN_PLACEHOLDER.as_bytes());
    }

    let Some(source) = record.source() else {
        write_calls_summary(out, record, None)?;
        return out.write_all(NO_SOURCE_PLACEHOLDER.as_bytes());
    };

    let lines: Vec<&str> = source.split('\n').collect();
    let ranges = infer_ranges(&lines, record.samples());
    let classes = classify_lines(lines.len(), &ranges);
    write_calls_summary(out, record, Some(FunctionCoverage::from_classes(&classes)))?;

    out.write_all(br#"<table class="listing">"#)?;
    for (idx, (line, class)) in lines.iter().zip(&classes).enumerate() {
        writeln!(
            out,
            r#"<tr class="{}"><td>{}</td><td><code><pre>{}</pre></code></td></tr>"#,
            class,
            idx + 1,
            html::listing_text(line)
        )?;
    }
    out.write_all(b"</table><br />\n")
}

fn write_calls_summary<W: Write>(
    out: &mut W,
    record: &FunctionRecord,
    coverage: Option<FunctionCoverage>,
) -> io::Result<()> {
    let Some(coverage) = coverage else {
        return writeln!(out, r#"<p class="summary">{} calls</p>"#, record.calls());
    };

    write!(
        out,
        r#"<p class="summary">{} calls, {} of {} lines hit"#,
        record.calls(),
        coverage.lines_hit,
        coverage.lines_instrumented()
    )?;
    if let Some(ratio) = coverage.ratio() {
        write!(out, " ({:.1}%)", ratio * 100.0)?;
    }
    writeln!(out, "</p>")
}
