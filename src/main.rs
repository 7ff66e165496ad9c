use anyhow::Result;
use clap::Parser;
use slave_env::commands::{self, ProvisionOptions};
use slave_env::process::ProcessRunner;
use slave_env::runtime::RealRuntime;
use std::path::PathBuf;

/// slave-env - Worker environment bootstrap
///
/// Create an isolated Python environment, install the worker dependencies
/// into it and make it relocatable so it can be copied to other machines.
///
/// Examples:
///   slave-env                                # ./slave-env with beanstalkc and boto
///   slave-env provision --config env.toml    # Use a configuration file
///   slave-env config --generate > env.toml   # Start a configuration file
#[derive(Parser, Debug)]
#[command(author, version = env!("SLAVE_ENV_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Show debug output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Create, populate and relocate the environment (the default)
    Provision(ProvisionArgs),

    /// Print a configuration file
    Config(ConfigArgs),
}

#[derive(clap::Args, Debug, Default)]
pub struct ProvisionArgs {
    /// TOML configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Environment root (overrides the configuration)
    #[arg(long, short = 'r', value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// Also pack the relocatable environment into a .tar.gz
    #[arg(long, value_name = "FILE")]
    pub archive: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ConfigArgs {
    /// Print the built-in defaults
    #[arg(long)]
    pub generate: bool,

    /// Configuration file to load and print
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let runtime = RealRuntime;

    match cli.command.unwrap_or(Commands::Provision(ProvisionArgs::default())) {
        Commands::Provision(args) => {
            let options = ProvisionOptions {
                config: args.config,
                root: args.root,
                archive: args.archive,
            };
            commands::provision(&runtime, &ProcessRunner, options).await?;
        }
        Commands::Config(args) => {
            commands::config(&runtime, args.generate, args.config.as_deref())?;
        }
    }
    Ok(())
}
