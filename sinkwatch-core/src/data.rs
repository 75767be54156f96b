use crate::error::{CoreError, Result};
use crate::model::{
    BulkReport, EndpointFilter, EndpointObservation, EndpointRecord, EndpointStats, Listing,
    MAX_SOURCE_URLS, PageRecord, SinkFilter, SinkRecord, SinkStats, SiteRecord, UpsertOutcome,
    WatchFilter, WatchRun, WatchState, WatchSummary,
};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sinkwatch_scanner::sinks::{MAX_SNIPPET_CHARS, truncate_chars};
use sinkwatch_scanner::{Category, SinkFinding, SinkKind, SourceType};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// SQLite-backed document store.
///
/// The connection sits behind a mutex so one `Database` can be shared
/// between the scheduler and interactive commands through an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn json_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_millis(row.get(idx)?))
}

fn opt_time_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

fn category_col(row: &Row, idx: usize) -> rusqlite::Result<Category> {
    let raw: String = row.get(idx)?;
    Category::parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown category {}", raw)))
}

/// Contains-filter that treats `%` and `_` literally.
fn contains_clause(column: &str, param: usize) -> String {
    format!("instr(lower({}), lower(?{})) > 0", column, param)
}

const SITE_COLUMNS: &str = "s.site_id, s.display_url,
    (SELECT json_group_array(host) FROM (SELECT host FROM site_hosts h WHERE h.site_id = s.site_id ORDER BY host)),
    s.created_at, s.updated_at, s.last_scan_at";

fn site_from_row(row: &Row) -> rusqlite::Result<SiteRecord> {
    Ok(SiteRecord {
        site_id: row.get(0)?,
        display_url: row.get(1)?,
        hosts: json_col(row, 2)?,
        created_at: time_col(row, 3)?,
        updated_at: time_col(row, 4)?,
        last_scan_at: opt_time_col(row, 5)?,
    })
}

const PAGE_COLUMNS: &str = "site_id, url_norm, url, scheme, host, path, endpoints, resources,
    script_urls, endpoint_groups, resource_groups, externals, scanned_at, created_at";

fn page_from_row(row: &Row) -> rusqlite::Result<PageRecord> {
    Ok(PageRecord {
        site_id: row.get(0)?,
        url_norm: row.get(1)?,
        url: row.get(2)?,
        scheme: row.get(3)?,
        host: row.get(4)?,
        path: row.get(5)?,
        endpoints: json_col(row, 6)?,
        resources: json_col(row, 7)?,
        script_urls: json_col(row, 8)?,
        endpoint_groups: json_col(row, 9)?,
        resource_groups: json_col(row, 10)?,
        externals: json_col(row, 11)?,
        scanned_at: time_col(row, 12)?,
        created_at: time_col(row, 13)?,
    })
}

const ENDPOINT_COLUMNS: &str =
    "site_id, endpoint, category, first_seen, last_seen, seen_count, hosts, source_urls";

fn endpoint_from_row(row: &Row) -> rusqlite::Result<EndpointRecord> {
    Ok(EndpointRecord {
        site_id: row.get(0)?,
        endpoint: row.get(1)?,
        category: category_col(row, 2)?,
        first_seen: time_col(row, 3)?,
        last_seen: time_col(row, 4)?,
        seen_count: row.get(5)?,
        hosts: json_col(row, 6)?,
        source_urls: json_col(row, 7)?,
    })
}

const SINK_COLUMNS: &str = "sig, site_id, page_url, source_type, source_url, kind, line, col, func,
    snippet, first_detected_at, last_detected_at, hits";

fn sink_from_row(row: &Row) -> rusqlite::Result<SinkRecord> {
    let source_type: String = row.get(3)?;
    let kind: String = row.get(5)?;
    Ok(SinkRecord {
        sig: row.get(0)?,
        site_id: row.get(1)?,
        page_url: row.get(2)?,
        source_type: SourceType::parse(&source_type)
            .ok_or_else(|| conversion_error(3, format!("unknown source type {}", source_type)))?,
        source_url: row.get(4)?,
        kind: SinkKind::parse(&kind).ok_or_else(|| conversion_error(5, format!("unknown sink kind {}", kind)))?,
        line: row.get(6)?,
        col: row.get(7)?,
        func: row.get(8)?,
        snippet: row.get(9)?,
        first_detected_at: time_col(row, 10)?,
        last_detected_at: time_col(row, 11)?,
        hits: row.get(12)?,
    })
}

const WATCH_COLUMNS: &str = "site_id, url_norm, url, enabled, freq_min, next_run_at, last_run_at,
    last_change_at, last_summary, created_at, updated_at";

fn watch_from_row(row: &Row) -> rusqlite::Result<WatchState> {
    Ok(WatchState {
        site_id: row.get(0)?,
        url_norm: row.get(1)?,
        url: row.get(2)?,
        enabled: row.get(3)?,
        freq_min: row.get(4)?,
        next_run_at: time_col(row, 5)?,
        last_run_at: opt_time_col(row, 6)?,
        last_change_at: opt_time_col(row, 7)?,
        last_summary: json_col(row, 8)?,
        created_at: time_col(row, 9)?,
        updated_at: time_col(row, 10)?,
    })
}

impl Database {
    pub fn drop(path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Database {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        self.conn().execute_batch(
            "
            -- One row per registrable domain
            CREATE TABLE IF NOT EXISTS sites (
    site_id TEXT PRIMARY KEY,
    display_url TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_scan_at INTEGER
);

CREATE TABLE IF NOT EXISTS site_hosts (
    site_id TEXT NOT NULL,
    host TEXT NOT NULL,
    PRIMARY KEY(site_id, host),
    FOREIGN KEY(site_id) REFERENCES sites(site_id) ON DELETE CASCADE
);

-- Latest observation per page
CREATE TABLE IF NOT EXISTS pages (
    url_norm TEXT PRIMARY KEY,
    site_id TEXT NOT NULL,
    url TEXT NOT NULL,
    scheme TEXT NOT NULL,
    host TEXT NOT NULL,
    path TEXT NOT NULL,
    endpoints TEXT NOT NULL,         -- JSON array, internal only
    resources TEXT NOT NULL,         -- JSON array, internal only
    script_urls TEXT NOT NULL,       -- JSON array, internal only
    endpoint_groups TEXT NOT NULL,   -- JSON object category -> paths
    resource_groups TEXT NOT NULL,   -- JSON object category -> paths
    externals TEXT NOT NULL,         -- JSON object site id -> group
    scanned_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pages_site ON pages(site_id);

-- Endpoints aggregated across pages of a site
CREATE TABLE IF NOT EXISTS endpoints (
    site_id TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    category TEXT NOT NULL CHECK(category IN (
        'api', 'javascript', 'html', 'asp', 'aspx', 'php', 'jsp', 'others', 'routes'
    )),
    first_seen INTEGER NOT NULL,
    last_seen INTEGER NOT NULL,
    seen_count INTEGER NOT NULL DEFAULT 1,
    hosts TEXT NOT NULL,             -- JSON array used as a set
    source_urls TEXT NOT NULL,       -- JSON array, most recent first, capped
    PRIMARY KEY(site_id, endpoint)
);

CREATE INDEX IF NOT EXISTS idx_endpoints_last_seen ON endpoints(site_id, last_seen);

-- Sink findings keyed by content signature
CREATE TABLE IF NOT EXISTS sinks (
    sig TEXT PRIMARY KEY,
    site_id TEXT NOT NULL,
    page_url TEXT NOT NULL,
    source_type TEXT NOT NULL CHECK(source_type IN (
        'html', 'script', 'inline', 'runtime', 'blob', 'data', 'dynamic'
    )),
    source_url TEXT NOT NULL,
    kind TEXT NOT NULL,
    line INTEGER NOT NULL,
    col INTEGER NOT NULL,
    func TEXT,
    snippet TEXT NOT NULL,
    first_detected_at INTEGER NOT NULL,
    last_detected_at INTEGER NOT NULL,
    hits INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_sinks_page ON sinks(site_id, page_url);
CREATE INDEX IF NOT EXISTS idx_sinks_kind ON sinks(site_id, kind);
CREATE INDEX IF NOT EXISTS idx_sinks_detected ON sinks(last_detected_at);

-- Scheduled re-scans
CREATE TABLE IF NOT EXISTS watches (
    site_id TEXT NOT NULL,
    url_norm TEXT NOT NULL,
    url TEXT NOT NULL,
    enabled BOOLEAN NOT NULL DEFAULT 1,
    freq_min INTEGER NOT NULL,
    next_run_at INTEGER NOT NULL,
    last_run_at INTEGER,
    last_change_at INTEGER,
    last_summary TEXT NOT NULL,      -- JSON WatchSummary
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY(site_id, url_norm)
);

CREATE INDEX IF NOT EXISTS idx_watches_due ON watches(enabled, next_run_at);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,             -- JSON document
    updated_at INTEGER NOT NULL
);
            ",
        )?;
        Ok(())
    }

    // Sites

    pub fn upsert_site(
        &self,
        site_id: &str,
        display_url: &str,
        host: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ts = to_millis(now);
        tx.execute(
            "INSERT INTO sites (site_id, display_url, created_at, updated_at, last_scan_at)
             VALUES (?1, ?2, ?3, ?3, ?3)
             ON CONFLICT(site_id) DO UPDATE SET
                display_url = excluded.display_url,
                updated_at = excluded.updated_at,
                last_scan_at = excluded.last_scan_at",
            params![site_id, display_url, ts],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO site_hosts (site_id, host) VALUES (?1, ?2)",
            params![site_id, host],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_site(&self, site_id: &str) -> Result<Option<SiteRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM sites s WHERE s.site_id = ?1", SITE_COLUMNS);
        Ok(conn.query_row(&sql, params![site_id], site_from_row).optional()?)
    }

    /// Most recently scanned first.
    pub fn list_sites(&self) -> Result<Vec<SiteRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM sites s ORDER BY s.last_scan_at DESC, s.site_id",
            SITE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sites)
    }

    // Pages

    pub fn upsert_page(&self, page: &PageRecord) -> Result<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM pages WHERE url_norm = ?1",
                params![&page.url_norm],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        tx.execute(
            "INSERT INTO pages (
                site_id, url_norm, url, scheme, host, path, endpoints, resources,
                script_urls, endpoint_groups, resource_groups, externals, scanned_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(url_norm) DO UPDATE SET
                site_id = excluded.site_id,
                url = excluded.url,
                scheme = excluded.scheme,
                host = excluded.host,
                path = excluded.path,
                endpoints = excluded.endpoints,
                resources = excluded.resources,
                script_urls = excluded.script_urls,
                endpoint_groups = excluded.endpoint_groups,
                resource_groups = excluded.resource_groups,
                externals = excluded.externals,
                scanned_at = excluded.scanned_at",
            params![
                &page.site_id,
                &page.url_norm,
                &page.url,
                &page.scheme,
                &page.host,
                &page.path,
                serde_json::to_string(&page.endpoints)?,
                serde_json::to_string(&page.resources)?,
                serde_json::to_string(&page.script_urls)?,
                serde_json::to_string(&page.endpoint_groups)?,
                serde_json::to_string(&page.resource_groups)?,
                serde_json::to_string(&page.externals)?,
                to_millis(page.scanned_at),
                to_millis(page.created_at),
            ],
        )?;
        tx.commit()?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub fn get_page(&self, url_norm: &str) -> Result<Option<PageRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM pages WHERE url_norm = ?1", PAGE_COLUMNS);
        Ok(conn.query_row(&sql, params![url_norm], page_from_row).optional()?)
    }

    /// Most recently scanned first.
    pub fn list_pages(&self, site_id: Option<&str>, limit: usize, skip: usize) -> Result<Listing<PageRecord>> {
        let conn = self.conn();
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pages WHERE ?1 IS NULL OR site_id = ?1",
            params![site_id],
            |row| row.get(0),
        )?;
        let sql = format!(
            "SELECT {} FROM pages WHERE ?1 IS NULL OR site_id = ?1
             ORDER BY scanned_at DESC, url_norm LIMIT ?2 OFFSET ?3",
            PAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![site_id, limit as i64, skip as i64], page_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Listing { items, total })
    }

    pub fn search_pages(&self, query: &str, limit: usize) -> Result<Vec<PageRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM pages WHERE {} ORDER BY scanned_at DESC LIMIT ?2",
            PAGE_COLUMNS,
            contains_clause("url_norm", 1)
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![query, limit as i64], page_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    // Endpoints

    /// Records one sighting. Runs as an immediate transaction so concurrent
    /// writers never lose a `seen_count` increment or a source URL.
    pub fn upsert_endpoint(&self, obs: &EndpointObservation, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT hosts, source_urls FROM endpoints WHERE site_id = ?1 AND endpoint = ?2",
                params![&obs.site_id, &obs.endpoint],
                |row| Ok((json_col::<Vec<String>>(row, 0)?, json_col::<Vec<String>>(row, 1)?)),
            )
            .optional()?;

        let ts = to_millis(now);
        let outcome = match existing {
            Some((hosts, source_urls)) => {
                let mut host_set: BTreeSet<String> = hosts.into_iter().collect();
                host_set.insert(obs.host.clone());
                let hosts: Vec<String> = host_set.into_iter().collect();
                let sources = merge_source_urls(&obs.page_url, source_urls);

                tx.execute(
                    "UPDATE endpoints SET
                        last_seen = ?3,
                        seen_count = seen_count + 1,
                        hosts = ?4,
                        source_urls = ?5,
                        category = ?6
                     WHERE site_id = ?1 AND endpoint = ?2",
                    params![
                        &obs.site_id,
                        &obs.endpoint,
                        ts,
                        serde_json::to_string(&hosts)?,
                        serde_json::to_string(&sources)?,
                        obs.category.as_str(),
                    ],
                )?;
                UpsertOutcome::Updated
            }
            None => {
                tx.execute(
                    "INSERT INTO endpoints (
                        site_id, endpoint, category, first_seen, last_seen, seen_count, hosts, source_urls
                    ) VALUES (?1, ?2, ?3, ?4, ?4, 1, ?5, ?6)",
                    params![
                        &obs.site_id,
                        &obs.endpoint,
                        obs.category.as_str(),
                        ts,
                        serde_json::to_string(&[&obs.host])?,
                        serde_json::to_string(&[&obs.page_url])?,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Best-effort: one failing item does not stop the rest.
    pub fn upsert_endpoints(&self, observations: &[EndpointObservation], now: DateTime<Utc>) -> BulkReport {
        let mut report = BulkReport::default();
        for obs in observations {
            let outcome = self.upsert_endpoint(obs, now).map_err(|e| {
                warn!("Endpoint upsert failed for {}: {}", obs.endpoint, e);
                e.to_string()
            });
            report.push(obs.endpoint.clone(), outcome);
        }
        report
    }

    pub fn get_endpoint(&self, site_id: &str, endpoint: &str) -> Result<Option<EndpointRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM endpoints WHERE site_id = ?1 AND endpoint = ?2",
            ENDPOINT_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![site_id, endpoint], endpoint_from_row)
            .optional()?)
    }

    /// Filtered, most recently seen first, with the unpaged total.
    pub fn list_endpoints(&self, filter: &EndpointFilter) -> Result<Listing<EndpointRecord>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(site) = &filter.site_id {
            values.push(Value::Text(site.clone()));
            clauses.push(format!("site_id = ?{}", values.len()));
        }
        if let Some(category) = filter.category {
            values.push(Value::Text(category.as_str().to_string()));
            clauses.push(format!("category = ?{}", values.len()));
        }
        if let Some(needle) = filter.contains.as_ref().filter(|s| !s.is_empty()) {
            values.push(Value::Text(needle.clone()));
            clauses.push(contains_clause("endpoint", values.len()));
        }
        if let Some(min) = filter.min_seen {
            values.push(Value::Integer(min));
            clauses.push(format!("seen_count >= ?{}", values.len()));
        }
        let where_sql = where_clause(&clauses);

        let conn = self.conn();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM endpoints{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(filter.limit as i64));
        values.push(Value::Integer(filter.skip as i64));
        let sql = format!(
            "SELECT {} FROM endpoints{} ORDER BY last_seen DESC, endpoint LIMIT ?{} OFFSET ?{}",
            ENDPOINT_COLUMNS,
            where_sql,
            values.len() - 1,
            values.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), endpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Listing { items, total })
    }

    /// Count per category and the 20 most frequently seen endpoints.
    pub fn endpoint_stats(&self, site_id: Option<&str>) -> Result<EndpointStats> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM endpoints WHERE ?1 IS NULL OR site_id = ?1 GROUP BY category",
        )?;
        let by_category = stmt
            .query_map(params![site_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        let sql = format!(
            "SELECT {} FROM endpoints WHERE ?1 IS NULL OR site_id = ?1
             ORDER BY seen_count DESC, last_seen DESC LIMIT 20",
            ENDPOINT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let top = stmt
            .query_map(params![site_id], endpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(EndpointStats { by_category, top })
    }

    pub fn search_endpoints(&self, query: &str, limit: usize) -> Result<Vec<EndpointRecord>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM endpoints WHERE {} ORDER BY last_seen DESC LIMIT ?2",
            ENDPOINT_COLUMNS,
            contains_clause("endpoint", 1)
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params![query, limit as i64], endpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Number of endpoints attributed to a page and the latest `last_seen` among them.
    pub fn page_endpoint_aggregate(
        &self,
        site_id: &str,
        url_norm: &str,
    ) -> Result<(i64, Option<DateTime<Utc>>)> {
        let conn = self.conn();
        let (count, last): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(e.last_seen) FROM endpoints e
             WHERE e.site_id = ?1
               AND EXISTS (SELECT 1 FROM json_each(e.source_urls) WHERE json_each.value = ?2)",
            params![site_id, url_norm],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count, last.map(from_millis)))
    }

    // Sinks

    /// Single-statement upsert: a repeated signature only bumps `hits` and
    /// `last_detected_at`.
    pub fn upsert_sink(&self, finding: &SinkFinding) -> Result<UpsertOutcome> {
        let sig = finding.signature();
        let snippet = truncate_chars(&finding.snippet, MAX_SNIPPET_CHARS);
        let ts = to_millis(finding.detected_at);

        let conn = self.conn();
        let hits: i64 = conn.query_row(
            "INSERT INTO sinks (
                sig, site_id, page_url, source_type, source_url, kind, line, col, func,
                snippet, first_detected_at, last_detected_at, hits
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 1)
            ON CONFLICT(sig) DO UPDATE SET
                hits = hits + 1,
                last_detected_at = excluded.last_detected_at,
                source_type = excluded.source_type,
                func = COALESCE(excluded.func, sinks.func)
            RETURNING hits",
            params![
                &sig,
                &finding.site_id,
                &finding.page_url,
                finding.source_type.as_str(),
                &finding.source_url,
                finding.kind.as_str(),
                finding.line,
                finding.col,
                &finding.func,
                snippet,
                ts,
            ],
            |row| row.get(0),
        )?;

        debug!("Sink {} {} now has {} hits", finding.kind, &sig[..12], hits);
        Ok(if hits == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    pub fn upsert_sinks(&self, findings: &[SinkFinding]) -> BulkReport {
        let mut report = BulkReport::default();
        for finding in findings {
            let outcome = self.upsert_sink(finding).map_err(|e| {
                warn!("Sink upsert failed for {} in {}: {}", finding.kind, finding.source_url, e);
                e.to_string()
            });
            report.push(finding.signature(), outcome);
        }
        report
    }

    pub fn get_sink(&self, sig: &str) -> Result<Option<SinkRecord>> {
        let conn = self.conn();
        let sql = format!("SELECT {} FROM sinks WHERE sig = ?1", SINK_COLUMNS);
        Ok(conn.query_row(&sql, params![sig], sink_from_row).optional()?)
    }

    /// Filtered, most recently detected first, with the unpaged total.
    pub fn list_sinks(&self, filter: &SinkFilter) -> Result<Listing<SinkRecord>> {
        let mut clauses = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(site) = &filter.site_id {
            values.push(Value::Text(site.clone()));
            clauses.push(format!("site_id = ?{}", values.len()));
        }
        if !filter.kinds.is_empty() {
            let mut slots = Vec::with_capacity(filter.kinds.len());
            for kind in &filter.kinds {
                values.push(Value::Text(kind.as_str().to_string()));
                slots.push(format!("?{}", values.len()));
            }
            clauses.push(format!("kind IN ({})", slots.join(", ")));
        }
        if let Some(page) = &filter.page_url {
            values.push(Value::Text(page.clone()));
            clauses.push(format!("page_url = ?{}", values.len()));
        }
        if let Some(needle) = filter.source_contains.as_ref().filter(|s| !s.is_empty()) {
            values.push(Value::Text(needle.clone()));
            clauses.push(contains_clause("source_url", values.len()));
        }
        let where_sql = where_clause(&clauses);

        let conn = self.conn();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sinks{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(filter.limit as i64));
        values.push(Value::Integer(filter.skip as i64));
        let sql = format!(
            "SELECT {} FROM sinks{} ORDER BY last_detected_at DESC, sig LIMIT ?{} OFFSET ?{}",
            SINK_COLUMNS,
            where_sql,
            values.len() - 1,
            values.len()
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params_from_iter(values.iter()), sink_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Listing { items, total })
    }

    /// Count per kind and the 20 most recently detected sinks.
    pub fn sink_stats(&self, site_id: Option<&str>) -> Result<SinkStats> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT kind, COUNT(*) FROM sinks WHERE ?1 IS NULL OR site_id = ?1 GROUP BY kind",
        )?;
        let by_kind = stmt
            .query_map(params![site_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;

        let sql = format!(
            "SELECT {} FROM sinks WHERE ?1 IS NULL OR site_id = ?1
             ORDER BY last_detected_at DESC LIMIT 20",
            SINK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let recent = stmt
            .query_map(params![site_id], sink_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(SinkStats { by_kind, recent })
    }

    /// Number of sinks on a page and the latest `last_detected_at` among them.
    pub fn page_sink_aggregate(
        &self,
        site_id: &str,
        url_norm: &str,
    ) -> Result<(i64, Option<DateTime<Utc>>)> {
        let conn = self.conn();
        let (count, last): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(last_detected_at) FROM sinks WHERE site_id = ?1 AND page_url = ?2",
            params![site_id, url_norm],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count, last.map(from_millis)))
    }

    // Watches

    /// Inserts a watch or updates its schedule fields. Run history,
    /// `last_summary` and `created_at` of an existing watch are kept.
    pub fn upsert_watch(&self, watch: &WatchState) -> Result<UpsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existed = tx
            .query_row(
                "SELECT 1 FROM watches WHERE site_id = ?1 AND url_norm = ?2",
                params![&watch.site_id, &watch.url_norm],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        tx.execute(
            "INSERT INTO watches (
                site_id, url_norm, url, enabled, freq_min, next_run_at, last_run_at,
                last_change_at, last_summary, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(site_id, url_norm) DO UPDATE SET
                url = excluded.url,
                enabled = excluded.enabled,
                freq_min = excluded.freq_min,
                next_run_at = excluded.next_run_at,
                updated_at = excluded.updated_at",
            params![
                &watch.site_id,
                &watch.url_norm,
                &watch.url,
                watch.enabled,
                watch.freq_min,
                to_millis(watch.next_run_at),
                watch.last_run_at.map(to_millis),
                watch.last_change_at.map(to_millis),
                serde_json::to_string(&watch.last_summary)?,
                to_millis(watch.created_at),
                to_millis(watch.updated_at),
            ],
        )?;
        tx.commit()?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub fn get_watch(&self, site_id: &str, url_norm: &str) -> Result<Option<WatchState>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM watches WHERE site_id = ?1 AND url_norm = ?2",
            WATCH_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![site_id, url_norm], watch_from_row)
            .optional()?)
    }

    pub fn delete_watch(&self, site_id: &str, url_norm: &str) -> Result<bool> {
        let deleted = self.conn().execute(
            "DELETE FROM watches WHERE site_id = ?1 AND url_norm = ?2",
            params![site_id, url_norm],
        )?;
        Ok(deleted > 0)
    }

    /// Soonest next run first.
    pub fn list_watches(&self, filter: &WatchFilter) -> Result<Vec<WatchState>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM watches
             WHERE (?1 IS NULL OR site_id = ?1) AND (?2 IS NULL OR url_norm = ?2)
             ORDER BY next_run_at ASC, url_norm",
            WATCH_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let watches = stmt
            .query_map(params![&filter.site_id, &filter.url_norm], watch_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(watches)
    }

    /// Enabled watches whose next run is at or before `now`, oldest due first.
    pub fn due_watches(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WatchState>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM watches WHERE enabled = 1 AND next_run_at <= ?1
             ORDER BY next_run_at ASC LIMIT ?2",
            WATCH_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let watches = stmt
            .query_map(params![to_millis(now), limit as i64], watch_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(watches)
    }

    pub fn record_watch_run(&self, site_id: &str, url_norm: &str, run: &WatchRun) -> Result<()> {
        let summary = run
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let changed_at = run.changed.then(|| to_millis(run.ran_at));

        let updated = self.conn().execute(
            "UPDATE watches SET
                last_run_at = ?3,
                next_run_at = ?4,
                last_summary = COALESCE(?5, last_summary),
                last_change_at = COALESCE(?6, last_change_at),
                updated_at = ?3
             WHERE site_id = ?1 AND url_norm = ?2",
            params![
                site_id,
                url_norm,
                to_millis(run.ran_at),
                to_millis(run.next_run_at),
                summary,
                changed_at,
            ],
        )?;
        if updated == 0 {
            return Err(CoreError::NotFound(format!("watch {} {}", site_id, url_norm)));
        }
        Ok(())
    }

    // Settings

    pub fn get_setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let conn = self.conn();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM settings WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn put_setting<T: Serialize>(&self, key: &str, value: &T, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, serde_json::to_string(value)?, to_millis(now)],
        )?;
        Ok(())
    }
}

fn where_clause(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

/// New page first, previous entries after it without duplicates, capped.
pub fn merge_source_urls(page_url: &str, previous: Vec<String>) -> Vec<String> {
    std::iter::once(page_url.to_string())
        .chain(previous.into_iter().filter(|u| u != page_url))
        .take(MAX_SOURCE_URLS)
        .collect()
}
