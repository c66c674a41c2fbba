use anyhow::Result;
use clap::{Parser, Subcommand};
use craft_code::config::Config;
use craft_code::session::{self, SessionOptions};
use craft_code::setup;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "craft-code",
    about = "A terminal coding agent that works on your codebase through sandboxed tools",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Directory the agent may read and write (defaults to current directory)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Maximum model requests per message (overrides the config file)
    #[arg(long)]
    max_turns: Option<usize>,

    /// Log dispatch and request details to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Choose a provider, endpoint, model and API key
    Configure,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "craft_code=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Some(Command::Configure) = args.command {
        return setup::run_configure();
    }

    let config = Config::load();
    session::run_interactive(
        config,
        SessionOptions {
            workspace: args.workspace,
            max_turns: args.max_turns,
        },
    )
    .await
}
