use std::sync::Arc;

use clap::Parser;
use miette::Result;
use tracing_subscriber::{fmt, EnvFilter};

use docguard::errors::AppError;
use docguard::rules::loader;
use docguard::settings::Settings;
use docguard::web;

#[derive(Parser, Debug)]
#[command(
    name = "docguard",
    version,
    about = "Access decisions for document stores"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Compile the policies, print a summary and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    let table = loader::load_policies(&settings.policy.path).map_err(AppError::from)?;

    if cli.check {
        for entry in table.entries() {
            let ops: Vec<&str> = entry.operations().iter().map(|op| op.as_str()).collect();
            println!("{} [{}]", entry.id, ops.join(", "));
        }
        println!(
            "{} rules, {} predicates OK",
            table.entries().len(),
            table.predicates().len()
        );
        return Ok(());
    }

    web::serve(&settings, Arc::new(table)).await
}
