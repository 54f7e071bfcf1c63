use anyhow::Result;
use clap::Parser as ClapParser;
use colored::Colorize;
use ecotest::cli::{self, Cli, Commands};
use ecotest::runner::CancelFlag;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "ECOTEST_LOG";

fn init_tracing(verbose: bool) {
    let filter = match std::env::var(LOG_ENV) {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_env(LOG_ENV),
        _ if verbose => EnvFilter::new("ecotest=debug"),
        _ => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli_args = Cli::parse();
    init_tracing(cli_args.verbose);

    match cli_args.command {
        Commands::Run(args) => {
            println!("{}", "Running ecosystem comparison...".green().bold());
            let cancel = CancelFlag::install_ctrlc()?;
            cli::run(args, &cancel)?;
        }
        Commands::Resolve(args) => {
            let cancel = CancelFlag::install_ctrlc()?;
            cli::resolve(args, &cancel)?;
        }
        Commands::Report {
            root,
            base,
            branch,
            mode,
            format,
            output,
        } => {
            cli::report(
                root.as_deref(),
                &base,
                &branch,
                mode,
                format,
                output.as_deref(),
            )?;
        }
        Commands::Fetch {
            root,
            input,
            output,
        } => {
            cli::fetch(root.as_deref(), input, output)?;
        }
        Commands::Completions { shell } => {
            cli::completions(shell);
        }
    }

    Ok(())
}
