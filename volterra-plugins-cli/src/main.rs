use clap::CommandFactory;
use std::process;
use volterra_plugins_cli::cli::{Cli, Commands};
use volterra_plugins_cli::commands::{compile, run, validate};
use volterra_plugins_cli::error::handle_cli_result;
use volterra_plugins_cli::exit_codes::{EXIT_ERROR, EXIT_SUCCESS};
use volterra_plugins_cli::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    let Some(command) = cli.command else {
        if let Err(e) = Cli::command().print_help() {
            eprintln!("Failed to print help: {}", e);
            process::exit(EXIT_ERROR);
        }
        process::exit(EXIT_SUCCESS);
    };

    logging::init(cli.verbose, cli.debug, cli.quiet);

    let result = match command {
        Commands::Validate { workflow } => {
            tracing::debug!("Running validate command");
            validate::run_validate(&workflow)
        }
        Commands::Compile {
            workflow,
            frame,
            plugins_dir,
            strict,
        } => {
            tracing::debug!("Running compile command");
            compile::run_compile(&workflow, &frame, plugins_dir, strict)
        }
        Commands::Run {
            workflow,
            frame,
            timeout,
            config,
            plugins_dir,
        } => {
            tracing::debug!("Running run command");
            run::run_job(&workflow, &frame, timeout, config, plugins_dir).await
        }
    };

    process::exit(handle_cli_result(result));
}
