//! dsomm: command line access to DevSecOps maturity assessment data
//!
//! Loads `meta.yaml` with its activity and team progress files, reports
//! validation errors, and records progress and evidence in a local state
//! directory that later runs merge back in.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use dsomm_model::{DataLoader, FileStorage};

#[derive(Parser)]
#[command(name = "dsomm")]
#[command(about = "Inspect and update DevSecOps maturity assessment data")]
struct Cli {
    /// Path to meta.yaml
    #[arg(short, long, env = "DSOMM_META", default_value = "yaml/meta.yaml")]
    meta: PathBuf,

    /// Directory for progress, evidence and team changes
    #[arg(short, long, env = "DSOMM_STATE_DIR", default_value = ".dsomm")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: commands::Commands,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dsomm_model=warn".parse()?)
                .add_directive("dsomm=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let storage = Arc::new(FileStorage::new(&cli.state_dir));

    let output = match cli.command {
        commands::Commands::Reset => commands::reset(&*storage)?,
        command => {
            info!(meta = %cli.meta.display(), state = %cli.state_dir.display(), "Loading");
            let mut data = DataLoader::new(storage).load(&cli.meta)?;
            commands::execute(&mut data, command)?
        }
    };
    if !output.is_empty() {
        println!("{}", output);
    }
    Ok(())
}
