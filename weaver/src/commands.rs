use crate::CLAP_STYLING;
use clap::{arg, command};

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("weaver")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("weaver")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .subcommand_required(false)
        .subcommand(
            command!("crawl")
                .about(
                    "Crawl outward from a seed URL, recording the link graph between domains. \
                Resumes automatically when the database holds unfinished work.",
                )
                .arg(
                    arg!(-c --"config" <PATH>)
                        .required(false)
                        .help("JSON config file (default: ./config.json when present)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-u --"url" <URL>)
                        .required(false)
                        .help("Seed URL, overrides seed_url from the config"),
                )
                .arg(
                    arg!(-d --"db" <PATH>)
                        .required(false)
                        .help("SQLite database path, overrides db_path from the config"),
                )
                .arg(
                    arg!(-t --"threads" <NUM_WORKERS>)
                        .required(false)
                        .help("Number of crawl workers, overrides concurrent_workers")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--"max-depth" <DEPTH>)
                        .required(false)
                        .help("Maximum BFS depth from the seed, overrides max_depth")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    arg!(--"metrics" <PATH>)
                        .required(false)
                        .help("Where to write the metrics JSON, overrides metrics_path"),
                )
                .arg(
                    arg!(--"progress")
                        .required(false)
                        .help("Show a live progress spinner instead of periodic log lines")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("export")
                .about("Dump the persisted graph as JSON")
                .arg(
                    arg!(-d --"db" <PATH>)
                        .required(false)
                        .help("SQLite database path")
                        .default_value("crawler.db"),
                )
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Output file (default: stdout)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                ),
        )
}
