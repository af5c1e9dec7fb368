use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geometry::FourCircleSolver;
use server_api::{ApiContext, ServiceConfig};
use shared::error::ApiException;
use storage::FileStore;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Manage stored diffractometer calculations without the server")]
struct Cli {
    #[arg(long, default_value = "./data/calculations")]
    store_root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty calculation.
    Create { name: String },
    /// Delete a calculation and its stored state.
    Delete { name: String },
    /// List stored calculation names.
    List,
    /// Print a calculation as JSON.
    Show { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    for line in run(cli).await? {
        println!("{line}");
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<Vec<String>> {
    let store = FileStore::new(&cli.store_root)
        .with_context(|| format!("failed to open store at '{}'", cli.store_root.display()))?;
    let ctx = ApiContext::new(
        Arc::new(store),
        Arc::new(FourCircleSolver),
        ServiceConfig::default(),
    );

    let lines = match cli.command {
        Command::Create { name } => {
            let location = server_api::create_entity(&ctx, &name)
                .await
                .map_err(ApiException::from)?;
            vec![format!("created {name} at {location}")]
        }
        Command::Delete { name } => {
            let location = server_api::delete_entity(&ctx, &name)
                .await
                .map_err(ApiException::from)?;
            vec![format!("deleted {name} from {location}")]
        }
        Command::List => server_api::list_entities(&ctx)
            .await
            .map_err(ApiException::from)?,
        Command::Show { name } => {
            let summary = server_api::describe(&ctx, &name)
                .await
                .map_err(ApiException::from)?;
            vec![serde_json::to_string_pretty(&summary)?]
        }
    };
    Ok(lines)
}
