// Persisting page scans into the store

use crate::data::Database;
use crate::error::Result;
use crate::model::{BulkReport, EndpointObservation, PageRecord, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sinkwatch_scanner::PageScan;
use sinkwatch_scanner::origin::{build_externals, categorize, group_paths, split_internal_external};
use tracing::{info, warn};

/// What one `save_scan` call wrote.
#[derive(Debug, Clone, Serialize)]
pub struct SaveReport {
    pub site_id: String,
    pub url_norm: String,
    pub page: UpsertOutcome,
    pub endpoints_inserted: usize,
    pub endpoints_updated: usize,
    pub sinks_inserted: usize,
    pub sinks_updated: usize,
    pub external_sites: usize,
    /// `"<key> -> <reason>"` for each item the store rejected.
    pub failures: Vec<String>,
}

fn failures(report: &BulkReport) -> impl Iterator<Item = String> + '_ {
    report.failed().into_iter().map(|item| match &item.outcome {
        Err(reason) => format!("{} -> {}", item.key, reason),
        Ok(_) => item.key.clone(),
    })
}

/// Writes the site, page, internal endpoints and sink findings of one scan.
///
/// Site and page failures abort with the store error. Endpoint and sink
/// writes are best effort and their per-item failures land in
/// [`SaveReport::failures`].
pub fn save_scan(db: &Database, scan: &PageScan, now: DateTime<Utc>) -> Result<SaveReport> {
    let target = &scan.target;
    let host = target.host.as_str();

    let (endpoints, ext_endpoints) = split_internal_external(&scan.endpoints, host);
    let (resources, ext_resources) = split_internal_external(&scan.resources, host);
    let (script_urls, ext_scripts) = split_internal_external(&scan.script_urls, host);
    let externals = build_externals(&ext_endpoints, &ext_resources, &ext_scripts);

    let display_url = format!("{}://{}", target.scheme, target.site_id);
    db.upsert_site(&target.site_id, &display_url, host, now)
        .inspect_err(|e| warn!("Failed to save site {}: {}", target.site_id, e))?;

    let page = PageRecord {
        site_id: target.site_id.clone(),
        url_norm: target.url_norm.clone(),
        url: target.raw.clone(),
        scheme: target.scheme.clone(),
        host: host.to_string(),
        path: target.path.clone(),
        endpoint_groups: group_paths(&endpoints, host),
        resource_groups: group_paths(&resources, host),
        endpoints,
        resources,
        script_urls,
        externals,
        scanned_at: scan.scanned_at,
        created_at: now,
    };
    let page_outcome = db
        .upsert_page(&page)
        .inspect_err(|e| warn!("Failed to save page {}: {}", page.url_norm, e))?;

    let observations: Vec<EndpointObservation> = page
        .endpoints
        .iter()
        .map(|endpoint| EndpointObservation {
            site_id: page.site_id.clone(),
            endpoint: endpoint.clone(),
            host: host.to_string(),
            page_url: page.url_norm.clone(),
            category: categorize(host, endpoint),
        })
        .collect();
    let endpoint_report = db.upsert_endpoints(&observations, now);
    let sink_report = db.upsert_sinks(&scan.sinks);

    let report = SaveReport {
        site_id: page.site_id.clone(),
        url_norm: page.url_norm.clone(),
        page: page_outcome,
        endpoints_inserted: endpoint_report.inserted(),
        endpoints_updated: endpoint_report.updated(),
        sinks_inserted: sink_report.inserted(),
        sinks_updated: sink_report.updated(),
        external_sites: page.externals.len(),
        failures: failures(&endpoint_report).chain(failures(&sink_report)).collect(),
    };

    info!(
        "Saved {}: {} new / {} seen endpoints, {} new / {} repeated sinks, {} external sites",
        report.url_norm,
        report.endpoints_inserted,
        report.endpoints_updated,
        report.sinks_inserted,
        report.sinks_updated,
        report.external_sites
    );
    if !report.failures.is_empty() {
        warn!("{} items of {} were not saved", report.failures.len(), report.url_norm);
    }

    Ok(report)
}
