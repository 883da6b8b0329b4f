use crate::config::Overrides;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub overrides: Overrides,
    /// Run a single cycle and exit
    pub once: bool,
}

pub fn build_cli() -> Command {
    Command::new("conn-sentinel")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Alerts on network connections this host has not made before")
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("SECONDS")
                .help("Seconds between polls")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("PATH")
                .help("Baseline file of known connections")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Log at debug level")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("TARGET")
                .help("'console', or a file that receives one JSON line per alert"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("YAML configuration file")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("grace-polls")
                .long("grace-polls")
                .value_name("N")
                .help("Polls a connection may be missing before it is forgotten")
                .value_parser(value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("abort-on-corrupt")
                .long("abort-on-corrupt")
                .help("Refuse to start when the baseline file cannot be parsed")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("include-listening")
                .long("include-listening")
                .help("Also track listening sockets")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("once")
                .long("once")
                .help("Poll once, save the baseline and exit")
                .action(ArgAction::SetTrue),
        )
}

impl CliArgs {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        CliArgs {
            config_path: matches.get_one::<PathBuf>("config").cloned(),
            overrides: Overrides {
                interval_seconds: matches.get_one::<u64>("interval").copied(),
                baseline_file: matches.get_one::<PathBuf>("file").cloned(),
                debug: matches.get_flag("debug"),
                output: matches.get_one::<String>("output").cloned(),
                grace_polls: matches.get_one::<u32>("grace-polls").copied(),
                abort_on_corrupt: matches.get_flag("abort-on-corrupt"),
                include_listening: matches.get_flag("include-listening"),
            },
            once: matches.get_flag("once"),
        }
    }
}
