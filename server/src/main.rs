use anyhow::Result;
use clap::{Parser, Subcommand};

use panotile::compute_levels;
use panotile::ingest::{self, BuildArgs};
use panotile::serve::{self, ServeArgs};

#[derive(Parser, Debug)]
#[command(name = "panotile", about = "Cubemap tile-pyramid generator and tile server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a tile pyramid from six face images on disk
    Build(BuildArgs),
    /// Print the level list a face size produces
    Levels {
        /// Face edge in pixels
        size: u32,
    },
    /// Serve tiles and accept panorama uploads over HTTP
    Serve(ServeArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Command::Build(args) => ingest::run(args),
        Command::Levels { size } => {
            let levels = compute_levels(size);
            if levels.is_empty() {
                anyhow::bail!("face size {} is too small for a pyramid (minimum 256)", size);
            }
            println!("{}", serde_json::to_string_pretty(&levels)?);
            Ok(())
        }
        Command::Serve(args) => serve::run(args),
    }
}
