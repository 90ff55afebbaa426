// Pipeline CLI
// Expand, validate and run templated YAML pipelines

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::{exit, expand, run, validate};

/// Run templated YAML pipelines locally
#[derive(Parser, Debug)]
#[command(name = "pipeline", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// More logging (-v for info, -vv for debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Expand, schedule and execute a pipeline
    Run(run::RunArgs),
    /// Check that a pipeline resolves without running it
    Validate(validate::ValidateArgs),
    /// Print the expanded pipeline as YAML
    Expand(expand::ExpandArgs),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => run::execute(args).await,
        Command::Validate(args) => validate::execute(args),
        Command::Expand(args) => expand::execute(args),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(report) => {
            output::error(&format!("{:?}", report));
            exit::USAGE
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "pipeline",
            "-vv",
            "run",
            "ci/pipeline.yml",
            "-p",
            "BuildDocs=false",
            "--var",
            "target=prod",
            "--max-agents",
            "2",
            "--format",
            "json",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.pipeline.params, vec!["BuildDocs=false"]);
        assert_eq!(args.variables, vec!["target=prod"]);
        assert_eq!(args.max_agents, 2);
        assert_eq!(args.format, run::Format::Json);
        assert!(args.dry_run);
    }

    #[test]
    fn test_validate_takes_repo_root() {
        let cli =
            Cli::try_parse_from(["pipeline", "validate", "p.yml", "--repo-root", "/src"]).unwrap();
        let Command::Validate(args) = cli.command else {
            panic!("expected validate");
        };
        assert_eq!(
            args.pipeline.repo_root.as_deref(),
            Some(std::path::Path::new("/src"))
        );
    }
}
