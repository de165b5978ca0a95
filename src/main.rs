use anyhow::Result;
use clap::{Arg, Command};

use bedside::commands;

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("Config file to use instead of the default location")
        .global(true)
}

fn steady_arg() -> Arg {
    Arg::new("steady")
        .long("steady")
        .help("Produce steady baseline vitals without the scripted excursions")
        .action(clap::ArgAction::SetTrue)
}

fn main() -> Result<()> {
    bedside::init_logging();

    let matches = Command::new("bedside")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Real-time vitals ingestion and alarm monitoring")
        .disable_version_flag(true)
        .arg(
            Arg::new("version")
                .short('v')
                .short_alias('V')
                .long("version")
                .help("Print version information")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(config_arg())
        .subcommand(Command::new("version").about("Shows version information"))
        .subcommand(
            Command::new("run")
                .about("Attach to a frame producer and monitor it")
                .arg(
                    Arg::new("socket")
                        .short('s')
                        .long("socket")
                        .value_name("PATH")
                        .help("Control socket of the producer (defaults to transport.socket_path)"),
                )
                .arg(
                    Arg::new("duration")
                        .short('d')
                        .long("duration")
                        .value_name("SECS")
                        .help("Stop after this many seconds")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Monitor a simulated patient in-process")
                .arg(
                    Arg::new("duration")
                        .short('d')
                        .long("duration")
                        .value_name("SECS")
                        .help("Stop after this many seconds")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("90"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .value_name("SEED")
                        .help("Seed for the signal noise")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("silence")
                        .long("silence")
                        .value_name("SECS")
                        .help("Silence each new alarm for this many seconds (clamped per priority)")
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    Arg::new("acknowledge")
                        .short('a')
                        .long("acknowledge")
                        .help("Acknowledge each new alarm")
                        .action(clap::ArgAction::SetTrue),
                )
                .arg(steady_arg()),
        )
        .subcommand(
            Command::new("produce")
                .about("Serve simulated frames over a control socket (Linux)")
                .arg(
                    Arg::new("socket")
                        .short('s')
                        .long("socket")
                        .value_name("PATH")
                        .help("Control socket to bind (defaults to transport.socket_path)"),
                )
                .arg(steady_arg()),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the monitor configuration (use 'bedside config --help' for subcommands)")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(Command::new("show").about("Print the effective configuration"))
                .subcommand(Command::new("path").about("Print the config file path"))
                .subcommand(Command::new("reset").about("Reset the configuration to defaults"))
                .subcommand(
                    Command::new("socket")
                        .about("Set or clear the producer control socket")
                        .arg(
                            Arg::new("path")
                                .help("Socket path; omit to use the built-in simulator")
                                .index(1),
                        ),
                ),
        )
        .get_matches();

    if matches.get_flag("version") {
        return commands::version();
    }

    match matches.subcommand() {
        Some(("version", _)) => commands::version()?,
        Some(("run", sub_matches)) => commands::run::execute(sub_matches)?,
        Some(("simulate", sub_matches)) => commands::simulate::execute(sub_matches)?,
        #[cfg(target_os = "linux")]
        Some(("produce", sub_matches)) => commands::produce::execute(sub_matches)?,
        #[cfg(not(target_os = "linux"))]
        Some(("produce", _)) => {
            anyhow::bail!("The producer needs Linux shared memory support");
        }
        Some(("config", sub_matches)) => commands::config::handle_config(sub_matches)?,
        _ => {
            println!("Welcome to bedside!");
            println!("Use 'bedside --help' for more information.");
        }
    }

    Ok(())
}
