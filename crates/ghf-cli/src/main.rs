use anyhow::Result;
use clap::{Parser, Subcommand};
use ghf_storage::CatalogStore;
use ghf_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ghf-cli")]
#[command(about = "Ghibli film catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and print the inserted counts as JSON.
    Sync,
    /// Apply the store migrations.
    Migrate,
    /// Run sync cycles on the SYNC_CRON schedule until Ctrl-C.
    Schedule,
    /// Print every stored film with the names of its people.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let counts = ghf_sync::sync_catalog_from_env().await;
            println!("{}", serde_json::to_string(&counts)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = CatalogStore::connect(&config.database_url).await?;
            store.migrate().await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Schedule => {
            ghf_sync::run_scheduler_until_shutdown(SyncConfig::from_env()).await?;
        }
        Commands::List => {
            let config = SyncConfig::from_env();
            let store = CatalogStore::connect(&config.database_url).await?;
            store.migrate().await?;
            for listing in store.films_with_people().await? {
                let film = &listing.film;
                println!(
                    "{} ({}) dir. {} | rt {} | {}",
                    film.title,
                    film.release_date,
                    film.director,
                    film.rt_score,
                    if listing.people.is_empty() {
                        "-".to_string()
                    } else {
                        listing.people.join(", ")
                    }
                );
            }
        }
    }

    Ok(())
}
