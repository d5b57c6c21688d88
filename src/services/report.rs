//! Turns an upload response into display-ready metric cards.
//!
//! Results have been delivered nested under `data`, under `analysis`, or at
//! the top level; all of them are accepted here.

use serde::Serialize;
use serde_json::{Map, Value};

const TOP_LEVEL_GROUP: &str = "Key Metrics";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricGroup {
    pub title: String,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportView {
    pub question: Option<String>,
    pub groups: Vec<MetricGroup>,
    pub reasoning: Option<String>,
    pub plot_file: Option<String>,
    pub warnings: Vec<String>,
}

/// Locates the analysis inside any known envelope shape
pub fn normalize_envelope(envelope: &Value) -> Option<ReportView> {
    let candidates = [
        envelope.get("data").and_then(|d| d.get("analysis")),
        envelope.get("data"),
        envelope.get("analysis"),
        Some(envelope),
    ];

    let (analysis, answer) = candidates
        .into_iter()
        .flatten()
        .filter_map(|candidate| answer_of(candidate).map(|answer| (candidate, answer)))
        .next()?;

    let text = |value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let results = analysis.get("analysis_results");

    Some(ReportView {
        question: text(analysis.get("question"))
            .or_else(|| text(results.and_then(|r| r.get("question")))),
        groups: metric_groups(answer),
        reasoning: text(analysis.get("reasoning"))
            .or_else(|| text(analysis.get("interpretation")))
            .or_else(|| text(results.and_then(|r| r.get("llm_explanation")))),
        plot_file: text(analysis.get("plot").and_then(|p| p.get("fileName"))),
        warnings: envelope
            .get("warnings")
            .and_then(Value::as_array)
            .map(|w| w.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

fn answer_of(candidate: &Value) -> Option<&Map<String, Value>> {
    candidate
        .get("answer")
        .or_else(|| {
            candidate
                .get("analysis_results")
                .and_then(|r| r.get("computed_answer"))
        })
        .and_then(Value::as_object)
}

/// `burn_rate_monthly` -> `Burn Rate Monthly`
pub fn humanize_key(key: &str) -> String {
    key.split(['_', '-', ' '])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Large values get `k`/`M` suffixes, small ones at most two decimals
pub fn format_number(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }

    // The suffix is picked after rounding so 999_990 reads "1M", not "1000k"
    let plain = format!("{:.2}", value);
    if !exceeds(&plain, 1_000.0) {
        return trim_decimals(plain);
    }
    let thousands = format!("{:.1}", value / 1_000.0);
    if !exceeds(&thousands, 1_000.0) {
        return format!("{}k", trim_decimals(thousands));
    }
    format!("{}M", trim_decimals(format!("{:.1}", value / 1_000_000.0)))
}

fn exceeds(formatted: &str, limit: f64) -> bool {
    formatted.parse::<f64>().map(|v| v.abs() >= limit).unwrap_or(false)
}

fn trim_decimals(formatted: String) -> String {
    if !formatted.contains('.') {
        return formatted;
    }
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

pub fn format_value(value: &Value) -> String {
    match value {
        Value::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        Value::String(s) => s.clone(),
        Value::Bool(true) => "Yes".to_string(),
        Value::Bool(false) => "No".to_string(),
        Value::Null => "n/a".to_string(),
        Value::Array(items) => items.iter().map(format_value).collect::<Vec<_>>().join(", "),
        Value::Object(map) => format!("{} fields", map.len()),
    }
}

/// Scalars of an object form one group; every nested object becomes its
/// own group, titled by its humanized path, at any depth.
pub fn metric_groups(answer: &Map<String, Value>) -> Vec<MetricGroup> {
    let mut groups = Vec::new();
    collect_groups(TOP_LEVEL_GROUP.to_string(), answer, &mut groups);
    groups
}

fn collect_groups(title: String, map: &Map<String, Value>, groups: &mut Vec<MetricGroup>) {
    let metrics: Vec<Metric> = map
        .iter()
        .filter(|(_, value)| !value.is_object())
        .map(|(key, value)| Metric {
            label: humanize_key(key),
            value: format_value(value),
        })
        .collect();

    if !metrics.is_empty() {
        groups.push(MetricGroup {
            title: title.clone(),
            metrics,
        });
    }

    for (key, value) in map {
        if let Value::Object(nested) = value {
            let nested_title = if title == TOP_LEVEL_GROUP {
                humanize_key(key)
            } else {
                format!("{} / {}", title, humanize_key(key))
            };
            collect_groups(nested_title, nested, groups);
        }
    }
}

/// Plain-text rendering used by the `render_report` binary
pub fn render_text(view: &ReportView) -> String {
    let mut out = String::new();

    if let Some(question) = &view.question {
        out.push_str(&format!("Question: {}\n\n", question));
    }

    for group in &view.groups {
        out.push_str(&format!("== {} ==\n", group.title));
        let width = group
            .metrics
            .iter()
            .map(|m| m.label.chars().count())
            .max()
            .unwrap_or(0);
        for metric in &group.metrics {
            out.push_str(&format!("  {:<width$}  {}\n", metric.label, metric.value));
        }
        out.push('\n');
    }

    if let Some(reasoning) = &view.reasoning {
        out.push_str("== Interpretation ==\n");
        out.push_str(reasoning);
        out.push_str("\n\n");
    }

    if let Some(plot) = &view.plot_file {
        out.push_str(&format!("Plot attached: {}\n", plot));
    }

    for warning in &view.warnings {
        out.push_str(&format!("Warning: {}\n", warning));
    }

    out
}
