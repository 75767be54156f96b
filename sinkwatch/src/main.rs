use clap::ArgMatches;
use commands::command_argument_builder;
use sinkwatch::handlers::*;
use tracing_subscriber::EnvFilter;

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    init_tracing(quiet);

    // Show banner unless --quiet flag is set
    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        // No subcommand provided, just show the banner
        return;
    }

    if let Err(e) = dispatch(&chosen_command).await {
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(matches: &ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command),
        Some(("scan", primary_command)) => handle_scan(primary_command).await,
        Some(("watch", primary_command)) => match primary_command.subcommand() {
            Some(("add", secondary_command)) => handle_watch_add(secondary_command),
            Some(("remove", secondary_command)) => handle_watch_remove(secondary_command),
            Some(("list", secondary_command)) => handle_watch_list(secondary_command),
            Some(("scan-now", secondary_command)) => handle_watch_scan_now(secondary_command).await,
            _ => unreachable!("clap should ensure we don't get here"),
        },
        Some(("daemon", primary_command)) => handle_daemon(primary_command).await,
        Some(("sites", primary_command)) => handle_sites(primary_command),
        Some(("pages", primary_command)) => handle_pages(primary_command),
        Some(("endpoints", primary_command)) => handle_endpoints(primary_command),
        Some(("sinks", primary_command)) => handle_sinks(primary_command),
        Some(("search", primary_command)) => handle_search(primary_command),
        Some(("settings", primary_command)) => match primary_command.subcommand() {
            Some(("discord", discord)) => match discord.subcommand() {
                Some(("get", args)) => handle_discord_get(args),
                Some(("set", args)) => handle_discord_set(args),
                Some(("test", args)) => handle_discord_test(args).await,
                _ => unreachable!("clap should ensure we don't get here"),
            },
            _ => unreachable!("clap should ensure we don't get here"),
        },
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
