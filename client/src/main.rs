mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use common::brokers;
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::RmSelection;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout es para la salida de los comandos.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dagq_client=info,common=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let broker = brokers::connect(cli.broker.as_deref()).await?;

    match cli.command {
        Commands::Submit { options, command } => {
            commands::submit(broker, &options, &command).await?;
        }
        Commands::Xargs {
            lines,
            words,
            verbose,
            options,
            command,
        } => {
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            commands::xargs(broker, &options, &command, &input, lines, words, verbose).await?;
        }
        Commands::Status {
            depth,
            flat,
            all_users,
            tids,
        } => {
            commands::status(broker, &tids, all_users, depth, flat).await?;
        }
        Commands::Output { watch, tids } => {
            commands::output(broker, &tids, watch).await?;
        }
        Commands::Kill { signal, tids } => {
            commands::kill(broker, &signal, &tids).await?;
        }
        Commands::Retry {
            success,
            priority,
            tids,
        } => {
            commands::retry(broker, &tids, success, priority).await?;
        }
        Commands::Rm {
            error,
            success,
            killed,
            pending,
            complete,
            all,
            all_users,
            verbose,
            tids,
        } => {
            let selection = RmSelection {
                error,
                success,
                killed,
                pending,
                complete,
                all,
            };
            commands::rm(broker, selection, all_users, verbose, &tids).await?;
        }
        Commands::Pause { tids } => {
            commands::pause(broker, &tids).await?;
        }
    }

    Ok(())
}
