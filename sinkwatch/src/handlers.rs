use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use sinkwatch_core::data::Database;
use sinkwatch_core::model::{
    EndpointFilter, EndpointRecord, Listing, SinkFilter, SinkRecord, SiteRecord, WatchFilter,
    WatchState,
};
use sinkwatch_core::notify::{
    DiscordNotifier, discord_settings, mask_webhook, send_test, set_discord_settings,
};
use sinkwatch_core::report::{ReportFormat, generate_json_report, generate_text_report, save_report};
use sinkwatch_core::watch::{RunStatus, WatchRequest, list_watches, subscribe, unsubscribe_url};
use sinkwatch_core::{SchedulerConfig, WatchScheduler, save_scan};
use sinkwatch_scanner::origin::normalize_url;
use sinkwatch_scanner::{Category, HttpRenderer, Renderer, ScanConfig, Scanner, SinkKind};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_DIR: &str = "~/.config/sinkwatch/";
pub const DB_FILE_NAME: &str = "sinkwatch.db";
pub const DB_ENV: &str = "SINKWATCH_DB";

const BANNER: &str = r#"
     _       _                 _       _
 ___(_)_ __ | | ____      ____ _| |_ ___| |__
/ __| | '_ \| |/ /\ \ /\ / / _` | __/ __| '_ \
\__ \ | | | |   <  \ V  V / (_| | || (__| | | |
|___/_|_| |_|_|\_\  \_/\_/ \__,_|\__\___|_| |_|
"#;

pub fn print_banner() {
    println!("{}", BANNER.bright_cyan().bold());
    println!(
        "  {} {}\n",
        "client-side attack surface watcher".bright_white(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> Result<String> {
    print!("{} ", msg.bright_cyan().bold());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim().to_lowercase())
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);
    pb
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M").to_string()
}

fn opt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(short_time).unwrap_or_else(|| "-".to_string())
}

// Database location

pub fn expand_dir(dir: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(dir).as_ref())
}

/// `--db` wins over `$SINKWATCH_DB`, which wins over the default location.
pub fn resolve_db_path(explicit: Option<&PathBuf>, env_value: Option<String>) -> PathBuf {
    if let Some(path) = explicit {
        return expand_dir(&path.to_string_lossy());
    }
    match env_value.filter(|v| !v.trim().is_empty()) {
        Some(value) => expand_dir(value.trim()),
        None => expand_dir(DEFAULT_CONFIG_DIR).join(DB_FILE_NAME),
    }
}

pub fn db_path_from_args(args: &ArgMatches) -> PathBuf {
    resolve_db_path(args.get_one::<PathBuf>("db"), std::env::var(DB_ENV).ok())
}

pub fn open_database(path: &Path) -> Result<Database> {
    if !Database::exists(path) {
        bail!(
            "No database at {}. Run `sinkwatch init` first or pass --db.",
            path.display()
        );
    }
    Database::new(path).with_context(|| format!("Failed to open database {}", path.display()))
}

// Target lists

/// Load URLs from either a file or a single URL argument
pub fn load_urls_from_source(
    url: Option<&String>,
    hosts_file: Option<&PathBuf>,
) -> Result<Vec<String>, String> {
    if let Some(hosts_file_path) = hosts_file {
        load_urls_from_file(hosts_file_path)
    } else if let Some(url) = url {
        parse_url_line(url)
            .map(|u| vec![u])
            .ok_or_else(|| format!("Invalid URL '{}'", url))
    } else {
        Err("Either --url or --hosts-file must be provided".to_string())
    }
}

/// Load and parse URLs from a file, skipping blank lines and `#` comments
pub fn load_urls_from_file(path: &Path) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read hosts file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_url_line)
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a page URL, defaulting the scheme to https
pub fn parse_url_line(line: &str) -> Option<String> {
    match normalize_url(line) {
        Ok(target) => Some(target.raw),
        Err(e) => {
            eprintln!("⚠️  Skipping invalid URL '{}': {}", line, e);
            None
        }
    }
}

pub fn parse_kinds(raw: &str) -> Result<Vec<SinkKind>> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| SinkKind::parse(k).ok_or_else(|| anyhow!("Unknown sink kind '{}'", k)))
        .collect()
}

pub fn parse_category(raw: &str) -> Result<Category> {
    Category::parse(&raw.trim().to_lowercase()).ok_or_else(|| anyhow!("Unknown category '{}'", raw))
}

// Table rendering

pub fn format_sites(sites: &[SiteRecord]) -> String {
    let mut out = String::new();
    for site in sites {
        out.push_str(&format!(
            "{:<32} {:<17} {}\n",
            site.site_id,
            opt_time(site.last_scan_at),
            site.hosts.join(", ")
        ));
    }
    out
}

pub fn format_watches(watches: &[WatchState]) -> String {
    let mut out = String::new();
    for w in watches {
        let state = if w.enabled { "on " } else { "off" };
        out.push_str(&format!(
            "{} {:>5}m next {} last {} | {} endpoints, {} sinks | {}\n",
            state,
            w.freq_min,
            short_time(w.next_run_at),
            opt_time(w.last_run_at),
            w.last_summary.endpoints,
            w.last_summary.sinks,
            w.url_norm
        ));
    }
    out
}

pub fn format_endpoints(listing: &Listing<EndpointRecord>) -> String {
    let mut out = String::new();
    for e in &listing.items {
        out.push_str(&format!(
            "{:<10} {:>5}x {}  {}\n",
            e.category.as_str(),
            e.seen_count,
            short_time(e.last_seen),
            e.endpoint
        ));
    }
    out.push_str(&format!("{} of {} endpoints\n", listing.items.len(), listing.total));
    out
}

pub fn format_sinks(listing: &Listing<SinkRecord>) -> String {
    let mut out = String::new();
    for s in &listing.items {
        out.push_str(&format!(
            "{:<22} {:>4}x {}:{}:{} ({})\n",
            s.kind.as_str(),
            s.hits,
            s.source_url,
            s.line,
            s.col,
            s.source_type.as_str()
        ));
    }
    out.push_str(&format!("{} of {} sinks\n", listing.items.len(), listing.total));
    out
}

// Init

pub fn handle_init(args: &ArgMatches) -> Result<()> {
    print_divider();
    println!("{}", "  SINKWATCH INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let dir_arg = args
        .get_one::<String>("PATH")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_DIR);
    let force = args.get_flag("force");
    let config_dir = expand_dir(dir_arg);
    let db_loc = config_dir.join(DB_FILE_NAME);
    let db_path = db_loc.as_path();

    println!(
        "{} Target: {}",
        "→".blue(),
        config_dir.display().to_string().bright_white()
    );
    println!();

    if Database::exists(db_path) {
        let overwrite = if force {
            true
        } else {
            println!("{}", "⚠ WARNING".yellow().bold());
            println!("Database already exists at:");
            println!(
                "  {} {}",
                "•".yellow(),
                db_path.display().to_string().bright_white()
            );
            println!();
            let response = print_prompt("Would you like to overwrite it? [y/N]:")?;
            println!();
            response == "y" || response == "yes"
        };

        if !overwrite {
            println!("{} Keeping existing database", "→".blue());
            return Ok(());
        }
        Database::drop(db_path)
            .with_context(|| format!("Failed to remove {}", db_path.display()))?;
        println!("{} Existing database removed", "✓".green().bold());
    }

    fs::create_dir_all(&config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;
    Database::new(db_path).with_context(|| format!("Failed to create {}", db_path.display()))?;

    println!();
    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    println!(
        "{} Database: {}",
        "✓".green().bold(),
        db_path.display().to_string().bright_white()
    );
    println!();
    Ok(())
}

// Scanning

#[cfg(feature = "browser")]
fn use_browser(args: &ArgMatches) -> bool {
    args.get_flag("browser")
}

#[cfg(not(feature = "browser"))]
fn use_browser(_args: &ArgMatches) -> bool {
    false
}

pub async fn build_scanner(config: ScanConfig, browser: bool) -> Result<Scanner> {
    let renderer: Arc<dyn Renderer> = if browser {
        launch_browser(&config).await?
    } else {
        Arc::new(HttpRenderer::new(&config.user_agent, config.max_script_bytes)?)
    };
    Ok(Scanner::new(renderer, config))
}

#[cfg(feature = "browser")]
async fn launch_browser(config: &ScanConfig) -> Result<Arc<dyn Renderer>> {
    let renderer = sinkwatch_scanner::ChromiumRenderer::launch(&config.user_agent, config.max_script_bytes)
        .await
        .context("Failed to launch Chromium (set SINKWATCH_CHROMIUM to the executable)")?;
    Ok(Arc::new(renderer))
}

#[cfg(not(feature = "browser"))]
async fn launch_browser(_config: &ScanConfig) -> Result<Arc<dyn Renderer>> {
    bail!("this build has no browser support; rebuild with --features browser")
}

pub fn scan_config_from_args(args: &ArgMatches) -> ScanConfig {
    let mut config = ScanConfig::default();
    if let Some(wait) = args.get_one::<u64>("wait") {
        config = config.with_wait(*wait);
    }
    if let Some(timeout) = args.get_one::<u64>("script-timeout") {
        config = config.with_script_timeout(*timeout);
    }
    config.with_dynamic_hooks(!args.get_flag("no-hooks"))
}

pub async fn handle_scan(args: &ArgMatches) -> Result<()> {
    let urls = load_urls_from_source(
        args.get_one::<String>("url"),
        args.get_one::<PathBuf>("hosts-file"),
    )
    .map_err(anyhow::Error::msg)?;
    let format = args
        .get_one::<String>("format")
        .and_then(|f| ReportFormat::parse(f))
        .unwrap_or(ReportFormat::Text);
    let output = args.get_one::<PathBuf>("output");

    let db = if args.get_flag("no-save") {
        None
    } else {
        Some(open_database(&db_path_from_args(args))?)
    };
    let scanner = build_scanner(scan_config_from_args(args), use_browser(args)).await?;

    let mut reports = Vec::new();
    let mut failed = 0;
    for url in &urls {
        let pb = spinner(format!("Scanning {}", url));
        match scanner.scan(url).await {
            Ok(scan) => {
                pb.finish_and_clear();
                let saved = match &db {
                    Some(db) => match save_scan(db, &scan, Utc::now()) {
                        Ok(report) => Some(report),
                        Err(e) => {
                            eprintln!("{} Could not save {}: {}", "✗".red().bold(), url, e);
                            failed += 1;
                            None
                        }
                    },
                    None => None,
                };
                let rendered = match format {
                    ReportFormat::Json => generate_json_report(&scan, saved.as_ref())?,
                    ReportFormat::Text => generate_text_report(&scan, saved.as_ref()),
                };
                reports.push(rendered);
            }
            Err(e) => {
                pb.finish_and_clear();
                eprintln!("{} Scan of {} failed: {}", "✗".red().bold(), url, e);
                failed += 1;
            }
        }
    }

    if let Err(e) = scanner.shutdown().await {
        warn!("Renderer shutdown failed: {}", e);
    }

    let combined = reports.join("\n");
    match output {
        Some(path) => {
            save_report(&combined, path)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            println!(
                "{} Report saved to {}",
                "✓".green().bold(),
                path.display().to_string().bright_white()
            );
        }
        None => print!("{}", combined),
    }

    if failed > 0 && reports.is_empty() {
        bail!("all {} scans failed", failed);
    }
    Ok(())
}

// Watches

pub fn handle_watch_add(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let url = args.get_one::<String>("URL").ok_or_else(|| anyhow!("URL is required"))?;
    let request = WatchRequest {
        url: url.clone(),
        freq_min: args.get_one::<i64>("every").copied().unwrap_or(1440),
        enabled: !args.get_flag("disabled"),
    };
    let watch = subscribe(&db, &request, Utc::now())?;
    println!(
        "{} Watching {} every {} min, next run {}",
        "✓".green().bold(),
        watch.url_norm.bright_white(),
        watch.freq_min,
        short_time(watch.next_run_at)
    );
    Ok(())
}

pub fn handle_watch_remove(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let url = args.get_one::<String>("URL").ok_or_else(|| anyhow!("URL is required"))?;
    if unsubscribe_url(&db, url)? {
        println!("{} Removed watch for {}", "✓".green().bold(), url);
    } else {
        println!("{} No watch for {}", "→".yellow(), url);
    }
    Ok(())
}

pub fn handle_watch_list(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let filter = WatchFilter {
        site_id: args.get_one::<String>("site").cloned(),
        url_norm: None,
    };
    let watches = list_watches(&db, &filter)?;
    if args.get_flag("json") {
        return print_json(&watches);
    }
    if watches.is_empty() {
        println!("No watches.");
    } else {
        print!("{}", format_watches(&watches));
    }
    Ok(())
}

fn scheduler(db: Arc<Database>, scanner: &Scanner, config: SchedulerConfig) -> Result<WatchScheduler> {
    let notifier = Arc::new(DiscordNotifier::new()?);
    Ok(WatchScheduler::new(db, scanner, notifier, config))
}

pub async fn handle_watch_scan_now(args: &ArgMatches) -> Result<()> {
    let db = Arc::new(open_database(&db_path_from_args(args))?);
    let url = args.get_one::<String>("URL").ok_or_else(|| anyhow!("URL is required"))?;
    let target = normalize_url(url)?;

    let scanner = build_scanner(ScanConfig::default(), use_browser(args)).await?;
    let scheduler = scheduler(db, &scanner, SchedulerConfig::default())?;

    let pb = spinner(format!("Running watch for {}", target.url_norm));
    let status = scheduler.scan_now(&target.site_id, &target.url_norm).await;
    pb.finish_and_clear();
    if let Err(e) = scanner.shutdown().await {
        warn!("Renderer shutdown failed: {}", e);
    }

    match status? {
        RunStatus::Unchanged => println!("{} No change on {}", "✓".green().bold(), target.url_norm),
        RunStatus::Changed { notified } => println!(
            "{} Change detected on {}{}",
            "!".yellow().bold(),
            target.url_norm,
            if notified { " (notified)" } else { "" }
        ),
        RunStatus::Failed(reason) => bail!("watch run failed: {}", reason),
    }
    Ok(())
}

pub async fn handle_daemon(args: &ArgMatches) -> Result<()> {
    let db = Arc::new(open_database(&db_path_from_args(args))?);
    let config = SchedulerConfig {
        tick_secs: args.get_one::<u64>("tick").copied().unwrap_or(60),
        batch_size: args.get_one::<usize>("batch").copied().unwrap_or(50),
    };
    let scanner = build_scanner(ScanConfig::default(), use_browser(args)).await?;
    let scheduler = scheduler(db, &scanner, config)?;

    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping");
                let _ = tx.send(true);
            }
            Err(e) => {
                // Without a signal handler the daemon runs until killed.
                warn!("Could not listen for ctrl-c: {}", e);
                tx.closed().await;
            }
        }
    });

    scheduler.run(rx).await;
    scanner.shutdown().await?;
    Ok(())
}

// Queries

pub fn handle_sites(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let sites = db.list_sites()?;
    if sites.is_empty() {
        println!("No sites scanned yet.");
    } else {
        print!("{}", format_sites(&sites));
    }
    Ok(())
}

fn paging(args: &ArgMatches) -> (usize, usize) {
    (
        args.get_one::<usize>("limit").copied().unwrap_or(100),
        args.get_one::<usize>("skip").copied().unwrap_or(0),
    )
}

pub fn handle_pages(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;

    if let Some(url) = args.get_one::<String>("url") {
        let target = normalize_url(url)?;
        let page = db
            .get_page(&target.url_norm)?
            .ok_or_else(|| anyhow!("No stored page for {}", target.url_norm))?;
        return print_json(&page);
    }

    let (limit, skip) = paging(args);
    let listing = db.list_pages(args.get_one::<String>("site").map(String::as_str), limit, skip)?;
    if args.get_flag("json") {
        return print_json(&listing);
    }
    for page in &listing.items {
        println!(
            "{} {:>4} endpoints {:>3} scripts {:>3} external  {}",
            short_time(page.scanned_at),
            page.endpoints.len(),
            page.script_urls.len(),
            page.externals.len(),
            page.url_norm
        );
    }
    println!("{} of {} pages", listing.items.len(), listing.total);
    Ok(())
}

pub fn handle_endpoints(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let site = args.get_one::<String>("site").cloned();

    if args.get_flag("stats") {
        let stats = db.endpoint_stats(site.as_deref())?;
        if args.get_flag("json") {
            return print_json(&stats);
        }
        for (category, count) in &stats.by_category {
            println!("{:<10} {}", category.green().bold(), count);
        }
        println!();
        print!(
            "{}",
            format_endpoints(&Listing {
                total: stats.top.len() as i64,
                items: stats.top,
            })
        );
        return Ok(());
    }

    let (limit, skip) = paging(args);
    let filter = EndpointFilter {
        site_id: site,
        category: args
            .get_one::<String>("category")
            .map(|c| parse_category(c))
            .transpose()?,
        contains: args.get_one::<String>("contains").cloned(),
        min_seen: args.get_one::<i64>("min-seen").copied(),
        limit,
        skip,
    };
    let listing = db.list_endpoints(&filter)?;
    if args.get_flag("json") {
        return print_json(&listing);
    }
    print!("{}", format_endpoints(&listing));
    Ok(())
}

pub fn handle_sinks(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let site = args.get_one::<String>("site").cloned();

    if args.get_flag("stats") {
        let stats = db.sink_stats(site.as_deref())?;
        if args.get_flag("json") {
            return print_json(&stats);
        }
        for (kind, count) in &stats.by_kind {
            println!("{:<24} {}", kind.yellow().bold(), count);
        }
        println!();
        print!(
            "{}",
            format_sinks(&Listing {
                total: stats.recent.len() as i64,
                items: stats.recent,
            })
        );
        return Ok(());
    }

    let (limit, skip) = paging(args);
    let filter = SinkFilter {
        site_id: site,
        kinds: match args.get_one::<String>("kind") {
            Some(raw) => parse_kinds(raw)?,
            None => Vec::new(),
        },
        page_url: args
            .get_one::<String>("page")
            .map(|p| normalize_url(p).map(|t| t.url_norm))
            .transpose()?,
        source_contains: args.get_one::<String>("source").cloned(),
        limit,
        skip,
    };
    let listing = db.list_sinks(&filter)?;
    if args.get_flag("json") {
        return print_json(&listing);
    }
    print!("{}", format_sinks(&listing));
    Ok(())
}

pub fn handle_search(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let query = args.get_one::<String>("QUERY").ok_or_else(|| anyhow!("QUERY is required"))?;
    let limit = args.get_one::<usize>("limit").copied().unwrap_or(20);

    let pages = db.search_pages(query, limit)?;
    let endpoints = db.search_endpoints(query, limit)?;

    println!("{}", format!("Pages ({})", pages.len()).bold());
    for page in &pages {
        println!("  {}", page.url_norm);
    }
    println!("{}", format!("Endpoints ({})", endpoints.len()).bold());
    for e in &endpoints {
        println!("  {:<10} {} ({})", e.category.as_str(), e.endpoint, e.site_id);
    }
    Ok(())
}

// Settings

pub fn handle_discord_get(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let settings = discord_settings(&db)?;
    println!(
        "Enabled:  {}",
        if settings.enabled { "yes".green() } else { "no".red() }
    );
    println!("Webhook:  {}", mask_webhook(&settings.webhook_url));
    println!("Updated:  {}", opt_time(settings.updated_at));
    Ok(())
}

pub fn handle_discord_set(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let current = discord_settings(&db)?;

    let webhook = args
        .get_one::<String>("webhook")
        .cloned()
        .unwrap_or(current.webhook_url);
    let enabled = if args.get_flag("enable") {
        true
    } else if args.get_flag("disable") {
        false
    } else {
        current.enabled
    };

    let saved = set_discord_settings(&db, &webhook, enabled, Utc::now())?;
    println!(
        "{} Discord notifications {} ({})",
        "✓".green().bold(),
        if saved.enabled { "enabled" } else { "disabled" },
        mask_webhook(&saved.webhook_url)
    );
    Ok(())
}

pub async fn handle_discord_test(args: &ArgMatches) -> Result<()> {
    let db = open_database(&db_path_from_args(args))?;
    let notifier = DiscordNotifier::new()?;
    if send_test(&db, &notifier).await? {
        println!("{} Test message sent", "✓".green().bold());
    } else {
        println!(
            "{} Notifications are disabled; enable them with `sinkwatch settings discord set --enable`",
            "→".yellow()
        );
    }
    Ok(())
}
