mod cli;
mod commands;
mod output;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command, LogFormat};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    let filter = cli.label_filter.unwrap_or_default();
    let ok = match cli.command {
        Command::List { suite, output } => {
            commands::list(&filter, suite.as_deref(), output)?;
            true
        }
        Command::RunTest { name } => commands::run_test(&name).await?,
        Command::RunSuite { name, junit, parallelism } => {
            commands::run_suite(&name, &filter, junit, parallelism).await?
        }
        Command::Cleanup(args) => commands::cleanup(args).await?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
