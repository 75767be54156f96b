use crate::CLAP_STYLING;
use clap::{arg, command};
use std::path::PathBuf;

fn browser_arg(cmd: clap::Command) -> clap::Command {
    #[cfg(feature = "browser")]
    let cmd = cmd.arg(
        arg!(--"browser")
            .required(false)
            .help("Render with headless Chromium and install runtime sink hooks")
            .action(clap::ArgAction::SetTrue),
    );
    cmd
}

fn paging_args(cmd: clap::Command) -> clap::Command {
    cmd.arg(
        arg!(--"limit" <N>)
            .required(false)
            .help("Maximum number of rows")
            .value_parser(clap::value_parser!(usize))
            .default_value("100"),
    )
    .arg(
        arg!(--"skip" <N>)
            .required(false)
            .help("Number of rows to skip")
            .value_parser(clap::value_parser!(usize))
            .default_value("0"),
    )
    .arg(
        arg!(--"json")
            .required(false)
            .help("Print JSON instead of a table")
            .action(clap::ArgAction::SetTrue),
    )
}

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("sinkwatch")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("sinkwatch")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .arg(
            arg!(--"db" <PATH>)
                .required(false)
                .global(true)
                .help("Database file (default: $SINKWATCH_DB or ~/.config/sinkwatch/sinkwatch.db)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Initializes the sinkwatch database on your filesystem")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Directory to store the sinkwatch database")
                        .default_value("~/.config/sinkwatch/"),
                )
                .arg(
                    arg!(-f --"force")
                        .help("Overwrites any existing database at the specified location.")
                        .required(false),
                ),
        )
        .subcommand(browser_arg(
            command!("scan")
                .about("Render a page, extract endpoints and detect JavaScript sinks")
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("The page to scan (scheme defaults to https)")
                        .conflicts_with("hosts-file"),
                )
                .arg(
                    arg!(-H --"hosts-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of pages to scan")
                        .value_parser(clap::value_parser!(PathBuf))
                        .conflicts_with("url"),
                )
                .arg(
                    arg!(-w --"wait" <SECONDS>)
                        .required(false)
                        .help("Settle time after load before collecting results")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("6"),
                )
                .arg(
                    arg!(--"script-timeout" <SECONDS>)
                        .required(false)
                        .help("Per-script download timeout")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("8"),
                )
                .arg(
                    arg!(--"no-hooks")
                        .required(false)
                        .help("Do not install runtime sink hooks")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(--"no-save")
                        .required(false)
                        .help("Print the report without writing to the database")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save report to file (default: display to screen)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Report format: text, json")
                        .value_parser(["text", "json"])
                        .default_value("text"),
                ),
        ))
        .subcommand(
            command!("watch")
                .about("Manage scheduled re-scans of pages")
                .subcommand_required(true)
                .subcommand(
                    command!("add")
                        .about("Watches a page, or updates an existing watch")
                        .arg(arg!(<URL>).required(true).help("The page to watch"))
                        .arg(
                            arg!(-e --"every" <MINUTES>)
                                .required(false)
                                .help("Re-scan interval in minutes (minimum 5)")
                                .value_parser(clap::value_parser!(i64))
                                .default_value("1440"),
                        )
                        .arg(
                            arg!(--"disabled")
                                .required(false)
                                .help("Store the watch without scheduling it")
                                .action(clap::ArgAction::SetTrue),
                        ),
                )
                .subcommand(
                    command!("remove")
                        .about("Stops watching a page")
                        .arg(arg!(<URL>).required(true).help("The watched page")),
                )
                .subcommand(
                    command!("list")
                        .about("List watches, soonest run first")
                        .arg(arg!(-s --"site" <SITE>).required(false).help("Only this site"))
                        .arg(
                            arg!(--"json")
                                .required(false)
                                .help("Print JSON instead of a table")
                                .action(clap::ArgAction::SetTrue),
                        ),
                )
                .subcommand(browser_arg(
                    command!("scan-now")
                        .about("Runs a watch immediately")
                        .arg(arg!(<URL>).required(true).help("The watched page")),
                )),
        )
        .subcommand(browser_arg(
            command!("daemon")
                .about("Runs the watch scheduler until interrupted")
                .arg(
                    arg!(--"tick" <SECONDS>)
                        .required(false)
                        .help("Seconds between scheduler ticks")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("60"),
                )
                .arg(
                    arg!(--"batch" <N>)
                        .required(false)
                        .help("Maximum watches run per tick")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("50"),
                ),
        ))
        .subcommand(command!("sites").about("List scanned sites"))
        .subcommand(paging_args(
            command!("pages")
                .about("List stored pages, or show one")
                .arg(arg!(-s --"site" <SITE>).required(false).help("Only this site"))
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("Show the stored observation of this page")
                        .conflicts_with("site"),
                ),
        ))
        .subcommand(paging_args(
            command!("endpoints")
                .about("Query discovered endpoints")
                .arg(arg!(-s --"site" <SITE>).required(false).help("Only this site"))
                .arg(
                    arg!(-c --"category" <CATEGORY>)
                        .required(false)
                        .help("api, javascript, html, asp, aspx, php, jsp, others or routes"),
                )
                .arg(arg!(--"contains" <TEXT>).required(false).help("Case-insensitive substring"))
                .arg(
                    arg!(--"min-seen" <N>)
                        .required(false)
                        .help("Only endpoints seen at least N times")
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    arg!(--"stats")
                        .required(false)
                        .help("Show counts per category and the most seen endpoints")
                        .action(clap::ArgAction::SetTrue),
                ),
        ))
        .subcommand(paging_args(
            command!("sinks")
                .about("Query detected sinks")
                .arg(arg!(-s --"site" <SITE>).required(false).help("Only this site"))
                .arg(
                    arg!(-k --"kind" <KINDS>)
                        .required(false)
                        .help("Comma-separated sink kinds, e.g. eval,innerHTML"),
                )
                .arg(arg!(-p --"page" <URL>).required(false).help("Only sinks on this page"))
                .arg(arg!(--"source" <TEXT>).required(false).help("Case-insensitive source URL substring"))
                .arg(
                    arg!(--"stats")
                        .required(false)
                        .help("Show counts per kind and the latest sinks")
                        .action(clap::ArgAction::SetTrue),
                ),
        ))
        .subcommand(
            command!("search")
                .about("Search pages and endpoints by substring")
                .arg(arg!(<QUERY>).required(true))
                .arg(
                    arg!(--"limit" <N>)
                        .required(false)
                        .value_parser(clap::value_parser!(usize))
                        .default_value("20"),
                ),
        )
        .subcommand(
            command!("settings")
                .about("Manage notification settings")
                .subcommand_required(true)
                .subcommand(
                    command!("discord")
                        .about("Discord webhook notifications")
                        .subcommand_required(true)
                        .subcommand(command!("get").about("Show the current settings"))
                        .subcommand(
                            command!("set")
                                .about("Store the webhook and toggle notifications")
                                .arg(
                                    arg!(--"webhook" <URL>)
                                        .required(false)
                                        .help("https://discord.com/api/webhooks/... URL"),
                                )
                                .arg(
                                    arg!(--"enable")
                                        .required(false)
                                        .action(clap::ArgAction::SetTrue)
                                        .conflicts_with("disable"),
                                )
                                .arg(
                                    arg!(--"disable")
                                        .required(false)
                                        .action(clap::ArgAction::SetTrue)
                                        .conflicts_with("enable"),
                                ),
                        )
                        .subcommand(command!("test").about("Send a test message")),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_definition_is_valid() {
        command_argument_builder().debug_assert();
    }

    #[test]
    fn test_scan_arguments() {
        let matches = command_argument_builder()
            .try_get_matches_from(["sinkwatch", "scan", "-u", "example.com", "--no-hooks", "-f", "json"])
            .unwrap();
        let (name, scan) = matches.subcommand().unwrap();
        assert_eq!(name, "scan");
        assert_eq!(scan.get_one::<String>("url").unwrap(), "example.com");
        assert!(scan.get_flag("no-hooks"));
        assert_eq!(*scan.get_one::<u64>("wait").unwrap(), 6);
        assert_eq!(scan.get_one::<String>("format").unwrap(), "json");
    }

    #[test]
    fn test_watch_add_defaults() {
        let matches = command_argument_builder()
            .try_get_matches_from(["sinkwatch", "watch", "add", "https://example.com/"])
            .unwrap();
        let (_, watch) = matches.subcommand().unwrap();
        let (name, add) = watch.subcommand().unwrap();
        assert_eq!(name, "add");
        assert_eq!(*add.get_one::<i64>("every").unwrap(), 1440);
        assert!(!add.get_flag("disabled"));
    }

    #[test]
    fn test_conflicting_toggles_rejected() {
        let result = command_argument_builder().try_get_matches_from([
            "sinkwatch", "settings", "discord", "set", "--enable", "--disable",
        ]);
        assert!(result.is_err());
    }
}
