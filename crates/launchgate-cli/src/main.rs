mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    attribution::AttributionSubcommand, config::ConfigSubcommand, launch::LaunchArgs,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "launchgate",
    about = "Cold-start gating: decide between the native app and the remote surface",
    version,
    propagate_version = true
)]
struct Cli {
    /// App root (default: auto-detect from .launchgate/)
    #[arg(long, global = true, env = "LAUNCHGATE_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default config and create the defaults store
    Init,

    /// Show persisted gating state
    State,

    /// Forget the cached remote config and the fetch lockout
    Reset,

    /// Write or clear the attribution payload (stands in for the attribution SDK)
    Attribution {
        #[command(subcommand)]
        subcommand: AttributionSubcommand,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Simulate one cold start
    Launch(LaunchArgs),
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::State => cmd::state::run(&root, cli.json),
        Commands::Reset => cmd::reset::run(&root, cli.json),
        Commands::Attribution { subcommand } => cmd::attribution::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Launch(args) => cmd::launch::run(&root, args, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
