use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error};

use bitrise::cli::{self, ConfigParams, OutputFormat};

/// Workflow execution engine for CI builds
#[derive(Parser)]
#[command(name = "bitrise")]
#[command(about = "bitrise - run declarative CI workflows", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone, Default)]
struct ConfigArgs {
    /// Path to the build configuration (default: ./bitrise.yml)
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Build configuration as a base64 encoded document
    #[arg(long, value_name = "B64", conflicts_with = "config")]
    config_base64: Option<String>,

    /// Path to the secrets inventory (default: ./.bitrise.secrets.yml)
    #[arg(short = 'i', long, value_name = "PATH")]
    inventory: Option<PathBuf>,

    /// Secrets inventory as a base64 encoded document
    #[arg(long, value_name = "B64", conflicts_with = "inventory")]
    inventory_base64: Option<String>,
}

impl From<ConfigArgs> for ConfigParams {
    fn from(args: ConfigArgs) -> Self {
        ConfigParams {
            config: args.config,
            config_base64: args.config_base64,
            inventory: args.inventory,
            inventory_base64: args.inventory_base64,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow from the configuration
    Run {
        /// Workflow to run; omit to list the available workflows
        #[arg(value_name = "WORKFLOW")]
        workflow: Option<String>,

        /// Workflow to run, as a flag
        #[arg(long = "workflow", value_name = "ID", conflicts_with = "workflow")]
        workflow_flag: Option<String>,

        #[command(flatten)]
        config: ConfigArgs,

        /// Run in pull request mode
        #[arg(long)]
        pr: bool,

        /// Run in CI mode
        #[arg(long)]
        ci: bool,
    },
    /// Resolve a trigger pattern and run the matched workflow
    Trigger {
        /// Trigger pattern (push branch, or PR target branch in PR mode)
        #[arg(value_name = "PATTERN")]
        pattern: String,

        #[command(flatten)]
        config: ConfigArgs,

        /// Run in pull request mode
        #[arg(long)]
        pr: bool,

        /// Run in CI mode
        #[arg(long)]
        ci: bool,
    },
    /// Resolve a trigger pattern and print the workflows it would run
    TriggerCheck {
        /// Trigger pattern to check
        #[arg(value_name = "PATTERN")]
        pattern: String,

        #[command(flatten)]
        config: ConfigArgs,

        /// Output format (raw or json)
        #[arg(long, value_name = "FORMAT", default_value = "raw")]
        format: String,

        /// Check in pull request mode
        #[arg(long)]
        pr: bool,

        /// Check in CI mode
        #[arg(long)]
        ci: bool,
    },
    /// Validate the configuration and secrets inventory
    Validate {
        #[command(flatten)]
        config: ConfigArgs,

        /// Output format (raw or json)
        #[arg(long, value_name = "FORMAT", default_value = "raw")]
        format: String,
    },
    /// Verify host prerequisites and record a successful setup
    Setup,
}

fn get_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(get_log_level(verbose))
        .with_target(verbose >= 2)
        .init();

    debug!("bitrise started with verbosity level: {}", verbose);
}

async fn execute_command(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Run {
            workflow,
            workflow_flag,
            config,
            pr,
            ci,
        } => Ok(cli::run(&config.into(), workflow.or(workflow_flag), pr, ci).await?),
        Commands::Trigger {
            pattern,
            config,
            pr,
            ci,
        } => Ok(cli::trigger(&config.into(), &pattern, pr, ci).await?),
        Commands::TriggerCheck {
            pattern,
            config,
            format,
            pr,
            ci,
        } => {
            let format: OutputFormat = format.parse()?;
            cli::trigger_check(&config.into(), &pattern, format, pr, ci)?;
            Ok(0)
        }
        Commands::Validate { config, format } => {
            let format: OutputFormat = format.parse()?;
            Ok(cli::validate(&config.into(), format))
        }
        Commands::Setup => {
            cli::setup().await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match execute_command(cli.command).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            error!("{err:#}");
            std::process::exit(1);
        }
    }
}
