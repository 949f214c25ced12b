//! `uptrack` command-line entry point

mod commands;
mod telemetry;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use telemetry::Verbosity;

fn cli() -> Command {
    Command::new("uptrack")
        .version(uptrack_core::VERSION)
        .about("Store-and-forward run-time session sync")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log every enqueue and delivery"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Only log warnings and errors"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand(simulate_command())
        .subcommand(
            Command::new("serve")
                .about("Run the reference ingestion endpoint")
                .arg(path_arg("config", "TOML server configuration"))
                .arg(
                    Arg::new("listen")
                        .long("listen")
                        .help("Bind address, host:port [default: 127.0.0.1:8080]"),
                )
                .arg(path_arg("journal", "Durable JSON-lines journal"))
                .arg(
                    Arg::new("register")
                        .long("register")
                        .action(ArgAction::Append)
                        .help("Pre-register a device id (repeatable)"),
                ),
        )
        .subcommand(
            Command::new("outbox")
                .about("Inspect a durable outbox journal")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Journal file"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn simulate_command() -> Command {
    Command::new("simulate")
        .about("Simulate a device producing sessions over a flaky link")
        .arg(path_arg("config", "TOML device configuration"))
        .arg(
            Arg::new("url")
                .long("url")
                .help("Ingest endpoint (env INGEST_URL)"),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .help("Device id (env DEVICE_ID)"),
        )
        .arg(number::<u32>("sessions", "Sessions to simulate [default: 5]"))
        .arg(number::<u32>("min-session-min", "Minimum session minutes [default: 5]"))
        .arg(number::<u32>("max-session-min", "Maximum session minutes [default: 60]"))
        .arg(number::<u64>("tick-ms", "Real milliseconds per tick [default: 200]"))
        .arg(number::<u64>("tick-seconds", "Device seconds per tick [default: 60]"))
        .arg(number::<u32>("update-every", "Emit an update every N ticks [default: 1]"))
        .arg(number::<f64>("offline-prob", "Offline probability [default: 0.2]"))
        .arg(number::<f64>("server-err-prob", "Server error probability [default: 0.1]"))
        .arg(number::<usize>("batch", "Records per flush cycle [default: 8]"))
        .arg(number::<u64>("flush-every-ms", "Flush period in ms [default: 400]"))
        .arg(number::<u64>("jitter-ms", "Tick jitter bound in ms [default: 75]"))
        .arg(number::<u64>("timeout-ms", "Request timeout in ms [default: 8000]"))
        .arg(number::<u64>("seed", "RNG seed [default: random]"))
        .arg(path_arg("outbox", "Durable outbox journal"))
        .arg(number::<usize>("outbox-capacity", "Bound the outbox"))
        .arg(
            Arg::new("overflow")
                .long("overflow")
                .value_parser(["reject", "evict-oldest"])
                .help("Full-outbox policy [default: reject]"),
        )
        .arg(path_arg("checkpoint", "Session checkpoint for power-loss recovery"))
}

fn number<T>(name: &'static str, help: &'static str) -> Arg
where
    T: Clone + Send + Sync + std::str::FromStr + 'static,
    <T as std::str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    Arg::new(name)
        .long(name)
        .value_parser(|raw: &str| raw.parse::<T>())
        .help(help)
}

fn path_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .value_parser(value_parser!(PathBuf))
        .help(help)
}

fn verbosity(matches: &ArgMatches, default_verbose: bool) -> Verbosity {
    let verbose = matches.get_flag("verbose") || default_verbose;
    Verbosity::from_flags(verbose, matches.get_flag("quiet"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let json = matches.get_flag("log-json");

    match matches.subcommand() {
        Some(("simulate", args)) => {
            let config = commands::device_config(args)?;
            telemetry::init(verbosity(args, config.verbose), json);
            commands::simulate(config).await
        }
        Some(("serve", args)) => {
            let config = commands::ingest_config(args)?;
            telemetry::init(verbosity(args, false), json);
            commands::serve(config).await
        }
        Some(("outbox", args)) => {
            telemetry::init(verbosity(args, false), json);
            match args.get_one::<PathBuf>("path") {
                Some(path) => commands::inspect_outbox(path, args.get_flag("json")),
                None => anyhow::bail!("missing outbox path"),
            }
        }
        _ => Ok(()),
    }
}
