//! HTML helpers and the bundled report template.

use once_cell::sync::Lazy;

const TEMPLATE_SOURCE: &str = include_str!("../../assets/report_template.html");
const FUNCTIONS_PLACEHOLDER: &str = "{{FUNCTIONS}}\n";
const TAB_EXPANSION: &str = "    ";

/// Document chrome around the per-function blocks.
pub(crate) struct ReportTemplate {
    pub header: &'static str,
    pub footer: &'static str,
}

pub(crate) static TEMPLATE: Lazy<ReportTemplate> = Lazy::new(|| split_template(TEMPLATE_SOURCE));

fn split_template(source: &'static str) -> ReportTemplate {
    match source.split_once(FUNCTIONS_PLACEHOLDER) {
        Some((header, footer)) => ReportTemplate { header, footer },
        None => ReportTemplate {
            header: source,
            footer: "",
        },
    }
}

/// Escape HTML special characters
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Source line as shown in the listing: tabs expanded, then escaped.
pub fn listing_text(line: &str) -> String {
    escape(&line.replace('\t', TAB_EXPANSION))
}
