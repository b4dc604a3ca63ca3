use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod completion;
mod config;
mod dispatch;
mod render;

#[derive(Parser, Debug)]
#[command(name = "pkgswap", version)]
#[command(
    about = "Replace an installed Android package across a signature change, keeping its data",
    long_about = None
)]
struct Cli {
    /// Config file; defaults to $PKGSWAP_CONFIG or ~/.config/pkgswap/config.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Privileged shell prefix, e.g. "su -c" or "adb shell su -c".
    #[arg(long, global = true)]
    shell: Option<String>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Print machine-readable JSON instead of status lines.
    #[arg(long, global = true)]
    json: bool,
    /// Raise log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install an archive, replacing a conflicting package and keeping its data.
    Install {
        archive: PathBuf,
        /// Replace without asking for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
    /// Show what the host reports about an installed package.
    Facts { identity: String },
    /// Check the privileged shell and archive tools.
    Doctor,
    /// List runs that are in flight or left saved data behind.
    Status,
    /// Restore saved data left by an interrupted run.
    Restore {
        identity: String,
        /// Owner uid to hand the data to; resolved from the host when omitted.
        #[arg(long)]
        owner: Option<u32>,
        /// User profile the data belongs to; defaults to the one recorded
        /// by the interrupted run.
        #[arg(long)]
        user: Option<u32>,
    },
    /// Delete saved data left by an interrupted run.
    Discard { identity: String },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

fn log_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    })
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .with_writer(std::io::stderr)
        .init();

    dispatch::run_cli(cli)
}
