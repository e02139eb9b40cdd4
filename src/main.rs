use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vmhub::{cli, commands, ui};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = cli::Cli::parse();

    let result = match cli.command {
        cli::Commands::Auth {
            token,
            username,
            password,
            api_url,
        } => commands::auth::execute(token, username, password, api_url).await,
        cli::Commands::Push {
            image,
            force,
            format,
            os_type,
            os_distrib,
            os_version,
            arch,
            private,
            description,
            url,
            chunk_size,
            threshold,
        } => {
            commands::push::execute(commands::push::PushArgs {
                image,
                force,
                format,
                os_type,
                os_distrib,
                os_version,
                arch,
                private,
                description,
                url,
                chunk_size,
                threshold,
            })
            .await
        }
        cli::Commands::Pull {
            image,
            policy,
            chunk_size,
            threshold,
        } => commands::pull::execute(image, policy, chunk_size, threshold).await,
        cli::Commands::Info { image } => commands::info::execute(image).await,
        cli::Commands::Ls {
            username,
            page,
            page_size,
        } => commands::ls::execute(username, page, page_size).await,
        cli::Commands::LsLocal => commands::ls::execute_local().await,
        cli::Commands::Rm { image } => commands::rm::execute(image, false).await,
        cli::Commands::RmLocal { image } => commands::rm::execute(image, true).await,
        cli::Commands::Serve { config } => commands::serve::execute(config).await,
    };

    if let Err(err) = result {
        ui::error(&format!("{err:#}"));
        std::process::exit(1);
    }
    Ok(())
}
