use clap::Parser;
use dotenv::dotenv;

use ordersentinel::cli::{Cli, Commands, RunOverrides};
use ordersentinel::commands;
use ordersentinel::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from the .env file
    dotenv().ok();

    let cli = Cli::parse();
    logging::init(&cli.verbose);

    match cli.command {
        Commands::Run {
            poll_interval,
            no_push,
            health_port,
            signal_file,
        } => {
            commands::run_engine(
                cli.config.as_deref(),
                RunOverrides {
                    poll_interval_secs: poll_interval,
                    no_push,
                    health_port,
                    signal_file,
                },
            )
            .await?;
        }
        Commands::Protect => commands::run_protect(cli.config.as_deref()).await?,
        Commands::Flatten { yes } => commands::run_flatten(cli.config.as_deref(), yes).await?,
        Commands::Status => commands::run_status(cli.config.as_deref()).await?,
    }

    Ok(())
}
