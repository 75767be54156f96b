// Scan reports for the terminal and for machines

use crate::persist::SaveReport;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use sinkwatch_scanner::origin::{Category, group_paths};
use sinkwatch_scanner::{PageScan, SinkFinding};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";
const THIN_RULE: &str = "────────────────────────────────────────────────────────────────────────────────";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Text,
    Json,
}

impl ReportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

fn section(report: &mut String, title: &str) {
    report.push_str(RULE);
    report.push('\n');
    report.push_str(&title.bold().to_string());
    report.push('\n');
    report.push_str(RULE);
    report.push_str("\n\n");
}

fn sink_line(finding: &SinkFinding) -> String {
    let location = format!("{}:{}:{}", finding.source_url, finding.line, finding.col);
    let func = finding
        .func
        .as_deref()
        .map(|f| format!(" in {}", f))
        .unwrap_or_default();
    format!(
        "  [{}] {} ({}){}\n",
        finding.kind.to_string().red().bold(),
        location,
        finding.source_type.as_str(),
        func
    )
}

/// Groups findings by kind, most frequent kind first.
fn sinks_by_kind(sinks: &[SinkFinding]) -> Vec<(String, Vec<&SinkFinding>)> {
    let mut groups: BTreeMap<String, Vec<&SinkFinding>> = BTreeMap::new();
    for s in sinks {
        groups.entry(s.kind.to_string()).or_default().push(s);
    }
    let mut ordered: Vec<_> = groups.into_iter().collect();
    ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
    ordered
}

pub fn generate_text_report(scan: &PageScan, saved: Option<&SaveReport>) -> String {
    let mut report = String::new();

    report.push_str(RULE);
    report.push('\n');
    report.push_str("                          SINKWATCH PAGE SCAN REPORT\n");
    report.push_str(RULE);
    report.push_str("\n\n");

    report.push_str(&format!("URL:          {}\n", scan.url_norm().cyan()));
    if scan.final_url != scan.target.raw {
        report.push_str(&format!("Final URL:    {}\n", scan.final_url));
    }
    report.push_str(&format!("Site:         {}\n", scan.site_id()));
    report.push_str(&format!("Scanned:      {}\n", scan.scanned_at.to_rfc3339()));
    report.push_str(&format!("Duration:     {:.2}s\n", scan.duration.as_secs_f64()));
    report.push_str(&format!("Endpoints:    {}\n", scan.endpoints.len()));
    report.push_str(&format!("Resources:    {}\n", scan.resources.len()));
    report.push_str(&format!("Scripts:      {}\n", scan.script_urls.len()));
    report.push_str(&format!("Sinks:        {}\n", scan.sinks.len()));
    report.push('\n');

    if !scan.endpoints.is_empty() {
        section(&mut report, "ENDPOINTS");
        let groups = group_paths(&scan.endpoints, &scan.target.host);
        for (category, items) in groups.iter().filter(|(_, items)| !items.is_empty()) {
            report.push_str(&format!("{} ({})\n", category.to_string().green().bold(), items.len()));
            for item in items {
                report.push_str(&format!("  {}\n", item));
            }
            report.push('\n');
        }
    }

    if !scan.sinks.is_empty() {
        section(&mut report, "SINKS");
        for (kind, findings) in sinks_by_kind(&scan.sinks) {
            report.push_str(&format!("{} x{}\n", kind.yellow().bold(), findings.len()));
            for finding in findings {
                report.push_str(&sink_line(finding));
                report.push_str(&format!("      {}\n", finding.snippet.replace('\n', " ").dimmed()));
            }
            report.push_str(THIN_RULE);
            report.push_str("\n\n");
        }
    }

    if !scan.errors.is_empty() {
        section(&mut report, "ERRORS");
        for err in &scan.errors {
            report.push_str(&format!("  {}\n", err.red()));
        }
        report.push('\n');
    }

    if let Some(saved) = saved {
        section(&mut report, "STORED");
        report.push_str(&format!(
            "Endpoints:    {} new, {} seen before\n",
            saved.endpoints_inserted, saved.endpoints_updated
        ));
        report.push_str(&format!(
            "Sinks:        {} new, {} repeated\n",
            saved.sinks_inserted, saved.sinks_updated
        ));
        report.push_str(&format!("External:     {} sites\n", saved.external_sites));
        for failure in &saved.failures {
            report.push_str(&format!("  not saved: {}\n", failure));
        }
        report.push('\n');
    }

    report.push_str("For authorized security testing only.\n");
    report
}

pub fn generate_json_report(scan: &PageScan, saved: Option<&SaveReport>) -> Result<String, serde_json::Error> {
    let endpoint_groups: BTreeMap<Category, Vec<String>> = group_paths(&scan.endpoints, &scan.target.host);
    let json_report = serde_json::json!({
        "report": {
            "metadata": {
                "generator": "sinkwatch",
                "version": env!("CARGO_PKG_VERSION"),
                "generated_at": chrono::Utc::now().to_rfc3339(),
            },
            "page": {
                "url": scan.target.raw,
                "url_norm": scan.url_norm(),
                "final_url": scan.final_url,
                "site_id": scan.site_id(),
                "scanned_at": scan.scanned_at.to_rfc3339(),
                "duration_ms": scan.duration.as_millis() as u64,
            },
            "endpoints": scan.endpoints,
            "endpoint_groups": endpoint_groups,
            "resources": scan.resources,
            "script_urls": scan.script_urls,
            "sinks": scan.sinks,
            "errors": scan.errors,
            "stored": saved,
        }
    });

    serde_json::to_string_pretty(&json_report)
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}
