//! Prometheus text exposition of gathered families, as served by the local
//! scrape endpoint.

use std::fmt::Write;
use vigil_common::MetricFamily;

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Render families in the text exposition format, one `# HELP`/`# TYPE`
/// header per family and millisecond timestamps on stamped samples.
pub fn render_families(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        if !family.help.is_empty() {
            let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(&family.help));
        }
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.as_str());
        for sample in &family.samples {
            out.push_str(&family.name);
            if !sample.labels.is_empty() {
                out.push('{');
                for (i, label) in sample.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}=\"{}\"", label.name, escape_label_value(&label.value));
                }
                out.push('}');
            }
            let _ = write!(out, " {}", sample.value);
            if let Some(timestamp) = sample.timestamp {
                let _ = write!(out, " {}", timestamp.timestamp_millis());
            }
            out.push('\n');
        }
    }
    out
}
