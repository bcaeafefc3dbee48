use std::path::PathBuf;

use clap::{Parser, Subcommand};
use neuroscan_core::{CoreConfig, Label};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "neuroscan", version = env!("NEUROSCAN_VERSION"), about = "Brain scan triage with feedback capture")]
struct Cli {
    /// TOML config file; built-in defaults when omitted.
    #[arg(long, global = true, env = "NEUROSCAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Classify an image, optionally cropping to marked points first.
    Classify {
        image: PathBuf,
        /// Marker point `x,y`; two or more crop the image to their bounding box.
        #[arg(long = "point", value_parser = commands::parse_point)]
        points: Vec<(f32, f32)>,
        /// Cancel the job after this many milliseconds.
        #[arg(long)]
        cancel_after_ms: Option<u64>,
        /// Correct label ("Tumor" / "No Tumor"); recorded if it differs from the result.
        #[arg(long)]
        correct: Option<Label>,
    },
    /// Write the letterboxed model input for an image.
    Normalize { image: PathBuf, output: PathBuf },
    /// Crop an image to the bounding box of the given points.
    Crop {
        image: PathBuf,
        output: PathBuf,
        #[arg(long = "point", value_parser = commands::parse_point, required = true)]
        points: Vec<(f32, f32)>,
    },
    /// Print correction statistics from the feedback ledger.
    Stats,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("neuroscan: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CoreConfig::load_or_default(cli.config.as_deref())?;
    match cli.command {
        Command::Classify {
            image,
            points,
            cancel_after_ms,
            correct,
        } => commands::classify(&config, image, points, cancel_after_ms, correct),
        Command::Normalize { image, output } => commands::normalize(&config, &image, &output),
        Command::Crop {
            image,
            output,
            points,
        } => commands::crop(&image, &output, points),
        Command::Stats => commands::stats(&config),
    }
}
