use anyhow::Result;
use clap::Parser;
use cocoon::cli::{Cli, Commands};
use cocoon::commands;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let conf = cli.global.to_config();

    let result = match cli.cmd {
        Commands::Create(args) => commands::cmd_create(&conf, args).await,
        Commands::Run(args) => commands::cmd_run(&conf, args).await,
        Commands::Start(args) => commands::cmd_start(&conf, args).await,
        Commands::Stop(args) => commands::cmd_stop(&conf, args).await,
        Commands::Rm(args) => commands::cmd_rm(&conf, args).await,
        Commands::Ps => commands::cmd_ps(&conf).await,
        Commands::Inspect(args) => commands::cmd_inspect(&conf, args).await,
        Commands::Console(args) => commands::cmd_console(&conf, args).await,
        Commands::Pull(args) => commands::cmd_pull(&conf, args).await,
        Commands::Images => commands::cmd_images(&conf).await,
        Commands::Rmi(args) => commands::cmd_rmi(&conf, args).await,
        Commands::Gc => commands::cmd_gc(&conf).await,
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
    result
}
